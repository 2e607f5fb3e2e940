//! 연결별 청크 전송 테이블
//!
//! - 송신/수신 청크 상태를 chunk_id 로 관리
//! - 청크 ID 할당 (256개 공간, 재사용은 이전 청크가 끝난 뒤에만)
//! - 모든 변경은 한 소유자(연결 태스크)에서만 일어남

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::ack::AckMessage;
use crate::message::Packet;
use crate::slice::{self, ChunkId, Slice, SliceId};
use crate::stats::TransferStats;
use crate::transfer::{IncomingChunk, OutgoingChunk, Retransmit, SendState, SliceOutcome};
use crate::{Config, Error, Result, MAX_SLICES_PER_CHUNK};

/// 청크 ID 할당기
///
/// 256 모듈러 단조 증가 카운터 + 사용 중 표시.
/// 반납된 ID는 `cooldown` 동안 다시 할당하지 않음 (수신측이 아직
/// 같은 ID를 전달 완료로 기억하고 있을 수 있음).
#[derive(Debug, Clone)]
pub struct ChunkIdAllocator {
    next: ChunkId,
    live: [bool; MAX_SLICES_PER_CHUNK],
    released_at: [Option<Instant>; MAX_SLICES_PER_CHUNK],
    live_count: usize,
    cooldown: Duration,
}

impl ChunkIdAllocator {
    pub fn new() -> Self {
        Self::with_start(0)
    }

    /// 지정한 ID부터 할당
    pub fn with_start(start: ChunkId) -> Self {
        Self {
            next: start,
            live: [false; MAX_SLICES_PER_CHUNK],
            released_at: [None; MAX_SLICES_PER_CHUNK],
            live_count: 0,
            cooldown: Duration::ZERO,
        }
    }

    /// 임의의 시작 ID (연결 시도마다 다르게)
    pub fn random() -> Self {
        Self::with_start(rand::random::<ChunkId>())
    }

    /// 반납 후 재사용까지 대기 시간 설정
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    fn is_cooling(&self, id: ChunkId, now: Instant) -> bool {
        match self.released_at[id as usize] {
            Some(released) => now.saturating_duration_since(released) < self.cooldown,
            None => false,
        }
    }

    /// 사용 중도 대기 중도 아닌 다음 ID 할당
    pub fn allocate(&mut self, now: Instant) -> Option<ChunkId> {
        if self.live_count >= self.live.len() {
            return None;
        }

        for _ in 0..MAX_SLICES_PER_CHUNK {
            let id = self.next;
            self.next = self.next.wrapping_add(1);
            if !self.live[id as usize] && !self.is_cooling(id, now) {
                self.live[id as usize] = true;
                self.released_at[id as usize] = None;
                self.live_count += 1;
                return Some(id);
            }
        }

        None
    }

    /// ID 반납
    pub fn release(&mut self, id: ChunkId, now: Instant) {
        if self.live[id as usize] {
            self.live[id as usize] = false;
            self.released_at[id as usize] = Some(now);
            self.live_count -= 1;
        }
    }

    pub fn is_live(&self, id: ChunkId) -> bool {
        self.live[id as usize]
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }
}

impl Default for ChunkIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// 상위 계층으로 올리는 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// 수신 청크 조립 완료
    Delivered { chunk_id: ChunkId, payload: Bytes },

    /// 송신 청크의 모든 슬라이스가 확인됨
    SendComplete { chunk_id: ChunkId },

    /// 재전송 한도 초과
    SendFailed { chunk_id: ChunkId, attempts: u32 },
}

/// 이벤트 처리 결과: 보낼 데이터그램 + 상위 이벤트
#[derive(Debug, Default)]
pub struct Output {
    pub datagrams: Vec<Bytes>,
    pub events: Vec<TransferEvent>,
}

impl Output {
    pub fn is_empty(&self) -> bool {
        self.datagrams.is_empty() && self.events.is_empty()
    }
}

/// 전달 완료된 청크 기록 (늦은 중복 슬라이스에 응답용)
#[derive(Debug)]
struct DeliveredChunk {
    slice_count: usize,
    ack: Bytes,
    delivered_at: Instant,
}

/// 연결 하나의 청크 전송 테이블
pub struct ChunkTransfers {
    config: Config,
    outgoing: HashMap<ChunkId, OutgoingChunk>,
    incoming: HashMap<ChunkId, IncomingChunk>,
    delivered: HashMap<ChunkId, DeliveredChunk>,
    ids: ChunkIdAllocator,
    stats: TransferStats,
}

impl ChunkTransfers {
    /// 새 테이블 생성
    ///
    /// 청크 ID는 임의 위치에서 시작하고, 반납된 ID는 `delivered_linger` 동안 쉼
    pub fn new(config: Config) -> Self {
        let ids = ChunkIdAllocator::random().with_cooldown(config.delivered_linger());
        Self::with_allocator(config, ids)
    }

    pub fn with_allocator(config: Config, ids: ChunkIdAllocator) -> Self {
        Self {
            config,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            delivered: HashMap::new(),
            ids,
            stats: TransferStats::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// 송신 중인 청크 수
    pub fn pending_sends(&self) -> usize {
        self.outgoing.len()
    }

    /// 수신 중인 청크 수
    pub fn pending_receives(&self) -> usize {
        self.incoming.len()
    }

    pub fn send_state(&self, chunk_id: ChunkId) -> Option<SendState> {
        self.outgoing.get(&chunk_id).map(|c| c.state())
    }

    /// 송신 청크의 미확인 슬라이스
    pub fn unacked_slices(&self, chunk_id: ChunkId) -> Option<Vec<SliceId>> {
        self.outgoing.get(&chunk_id).map(|c| c.missing())
    }

    /// 청크 전송 시작
    ///
    /// 슬라이스 수/크기 검증은 ID 할당 전에 하므로 실패 시 아무것도 전송되지 않음.
    /// 반환된 데이터그램을 모두 보내야 함.
    ///
    /// 256개 ID가 모두 전송 중이거나 재사용 대기 중이면 `ChunkIdsExhausted`.
    pub fn send_chunk(
        &mut self,
        payload: Bytes,
        now: Instant,
    ) -> Result<(ChunkId, Vec<Bytes>)> {
        let max_slice_size = self.config.max_slice_size;
        slice::slice_count(payload.len(), max_slice_size)?;

        let chunk_id = self.ids.allocate(now).ok_or(Error::ChunkIdsExhausted)?;
        let chunk = match OutgoingChunk::new(chunk_id, &payload, max_slice_size, now) {
            Ok(chunk) => chunk,
            Err(e) => {
                // 전송된 적 없는 ID라서 바로 재사용 가능
                self.ids.release(chunk_id, now);
                return Err(e);
            }
        };

        let datagrams = chunk.datagrams().to_vec();

        self.stats.chunks_sent += 1;
        self.stats.slices_sent += datagrams.len() as u64;
        self.stats.bytes_sent += datagrams.iter().map(|d| d.len() as u64).sum::<u64>();

        debug!(
            "청크 {} 전송 시작: {} bytes, {} 슬라이스",
            chunk_id,
            payload.len(),
            datagrams.len()
        );

        self.outgoing.insert(chunk_id, chunk);
        Ok((chunk_id, datagrams))
    }

    /// 수신 데이터그램 처리
    ///
    /// 손상된 데이터그램은 로그만 남기고 버림
    pub fn handle_datagram(&mut self, datagram: &[u8], now: Instant) -> Output {
        let mut out = Output::default();

        match Packet::from_bytes(datagram, self.config.max_slice_size) {
            Ok(Packet::Slice(slice)) => self.handle_slice(slice, now, &mut out),
            Ok(Packet::Ack(ack)) => self.handle_ack(ack, now, &mut out),
            Err(e) => {
                self.stats.malformed_dropped += 1;
                warn!("손상된 데이터그램 폐기 ({} bytes): {}", datagram.len(), e);
            }
        }

        out
    }

    fn handle_slice(&mut self, slice: Slice, now: Instant, out: &mut Output) {
        let chunk_id = slice.chunk_id;
        let slice_count = slice.slice_count;

        // 이미 전달한 청크: 완료 ACK 재전송
        let linger = self.config.delivered_linger();
        if let Some(done) = self.delivered.get(&chunk_id) {
            if done.slice_count == slice_count && now.duration_since(done.delivered_at) < linger {
                self.stats.duplicate_slices += 1;
                self.stats.acks_sent += 1;
                out.datagrams.push(done.ack.clone());
                return;
            }
            // 슬라이스 수가 다르거나 기억 기간이 지났으면 ID를 재사용한 새 청크
            self.delivered.remove(&chunk_id);
        }

        let chunk = self
            .incoming
            .entry(chunk_id)
            .or_insert_with(|| IncomingChunk::new(chunk_id, slice_count, now));

        match chunk.apply_slice(slice) {
            Ok(SliceOutcome::Inserted) => self.stats.slices_received += 1,
            Ok(SliceOutcome::Duplicate) => self.stats.duplicate_slices += 1,
            Err(e) => {
                self.stats.malformed_dropped += 1;
                warn!("슬라이스 폐기: chunk={}, {}", chunk_id, e);
                return;
            }
        }

        let ack = chunk.ack();
        let delivered = if chunk.is_complete() {
            Some(chunk.take_payload())
        } else {
            None
        };

        let ack = match self.encode_ack(ack) {
            Some(ack) => ack,
            None => return,
        };
        self.stats.acks_sent += 1;
        out.datagrams.push(ack.clone());

        match delivered {
            Some(Ok(payload)) => {
                self.incoming.remove(&chunk_id);
                self.delivered.insert(
                    chunk_id,
                    DeliveredChunk {
                        slice_count,
                        ack,
                        delivered_at: now,
                    },
                );

                self.stats.chunks_delivered += 1;
                self.stats.bytes_delivered += payload.len() as u64;
                debug!(
                    "청크 {} 수신 완료: {} bytes, {} 슬라이스",
                    chunk_id,
                    payload.len(),
                    slice_count
                );

                out.events.push(TransferEvent::Delivered { chunk_id, payload });
            }
            Some(Err(e)) => {
                self.incoming.remove(&chunk_id);
                warn!("청크 {} 조립 실패: {}", chunk_id, e);
            }
            None => {}
        }
    }

    fn handle_ack(&mut self, ack: AckMessage, now: Instant, out: &mut Output) {
        self.stats.acks_received += 1;
        self.stats.last_ack_time = Some(now);

        let chunk_id = ack.chunk_id;
        let chunk = match self.outgoing.get_mut(&chunk_id) {
            Some(chunk) => chunk,
            None => {
                debug!("알 수 없는 청크 {} ACK 무시", chunk_id);
                return;
            }
        };

        match chunk.apply_ack(&ack) {
            Ok(newly) if newly > 0 => {
                debug!(
                    "청크 {} ACK: +{} 슬라이스, 남은 {}",
                    chunk_id,
                    newly,
                    chunk.missing().len()
                );
            }
            Ok(_) => {}
            Err(e) => {
                self.stats.malformed_dropped += 1;
                warn!("ACK 폐기: {}", e);
                return;
            }
        }

        if chunk.state() == SendState::Complete {
            self.outgoing.remove(&chunk_id);
            self.ids.release(chunk_id, now);
            self.stats.chunks_completed += 1;
            debug!("청크 {} 전송 완료", chunk_id);
            out.events.push(TransferEvent::SendComplete { chunk_id });
        }
    }

    /// 타이머 처리: 재전송, 실패 판정, 오래된 수신 상태 정리
    pub fn poll_timers(&mut self, now: Instant) -> Output {
        let mut out = Output::default();
        let interval = self.config.retransmit_interval();
        let max_retries = self.config.max_retries;

        let mut failed = Vec::new();
        for (&chunk_id, chunk) in self.outgoing.iter_mut() {
            match chunk.poll_retransmit(now, interval, max_retries) {
                Retransmit::Idle => {}
                Retransmit::Resend(datagrams) => {
                    debug!(
                        "청크 {} 재전송 #{}: {} 슬라이스",
                        chunk_id,
                        chunk.retries(),
                        datagrams.len()
                    );
                    self.stats.slices_retransmitted += datagrams.len() as u64;
                    self.stats.slices_sent += datagrams.len() as u64;
                    self.stats.bytes_sent += datagrams.iter().map(|d| d.len() as u64).sum::<u64>();
                    out.datagrams.extend(datagrams);
                }
                Retransmit::Exhausted { attempts } => {
                    warn!(
                        "청크 {} 전송 실패: {}회 시도, 미확인 {} 슬라이스",
                        chunk_id,
                        attempts,
                        chunk.missing().len()
                    );
                    failed.push(chunk_id);
                    out.events.push(TransferEvent::SendFailed { chunk_id, attempts });
                }
            }
        }

        for chunk_id in failed {
            self.outgoing.remove(&chunk_id);
            self.ids.release(chunk_id, now);
            self.stats.chunks_failed += 1;
        }

        let receive_timeout = self.config.receive_timeout();
        let stats = &mut self.stats;
        self.incoming.retain(|chunk_id, chunk| {
            if now.duration_since(chunk.created_at()) > receive_timeout {
                warn!(
                    "청크 {} 수신 타임아웃: {}/{} 슬라이스",
                    chunk_id,
                    chunk.slice_count() - chunk.missing().len(),
                    chunk.slice_count()
                );
                stats.chunks_abandoned += 1;
                false
            } else {
                true
            }
        });

        let linger = self.config.delivered_linger();
        self.delivered
            .retain(|_, done| now.duration_since(done.delivered_at) < linger);

        out
    }

    /// 송신 청크 하나를 중단 (이후 패킷 없음)
    pub fn abandon(&mut self, chunk_id: ChunkId, now: Instant) -> bool {
        match self.outgoing.remove(&chunk_id) {
            Some(mut chunk) => {
                chunk.abandon();
                self.ids.release(chunk_id, now);
                self.stats.chunks_abandoned += 1;
                debug!("청크 {} 전송 중단", chunk_id);
                true
            }
            None => false,
        }
    }

    /// 연결 종료: 모든 상태 해제, 중단된 송신 청크 ID 반환
    pub fn abandon_all(&mut self, now: Instant) -> Vec<ChunkId> {
        let abandoned: Vec<ChunkId> = self.outgoing.keys().copied().collect();
        for &chunk_id in &abandoned {
            self.abandon(chunk_id, now);
        }

        self.stats.chunks_abandoned += self.incoming.len() as u64;
        self.incoming.clear();
        self.delivered.clear();
        abandoned
    }

    fn encode_ack(&self, ack: AckMessage) -> Option<Bytes> {
        match Packet::Ack(ack).to_bytes(self.config.max_slice_size) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("ACK 인코딩 실패: {}", e);
                None
            }
        }
    }
}
