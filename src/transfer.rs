//! 청크 단위 송수신 상태 머신
//!
//! 송신: Sending → Complete | Failed | Abandoned
//! 수신: Receiving → Delivered
//!
//! I/O 없이 시각(`Instant`)만 받아서 동작함

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::ack::{AckMessage, AckSet};
use crate::message::Packet;
use crate::slice::{self, ChunkId, Slice, SliceId};
use crate::{Error, Result};

/// 송신 청크 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// 전송 중 (미확인 슬라이스 있음)
    Sending,

    /// 모든 슬라이스 확인됨
    Complete,

    /// 재전송 한도 초과
    Failed,

    /// 외부 요청으로 중단
    Abandoned,
}

/// 재전송 타이머 처리 결과
#[derive(Debug)]
pub enum Retransmit {
    /// 아직 재전송 시점 아님
    Idle,

    /// 미확인 슬라이스 데이터그램
    Resend(Vec<Bytes>),

    /// 재전송 한도 초과 (첫 전송 포함 시도 횟수)
    Exhausted { attempts: u32 },
}

/// 송신 중인 청크
#[derive(Debug)]
pub struct OutgoingChunk {
    chunk_id: ChunkId,

    /// 슬라이스별 인코딩된 데이터그램
    datagrams: Vec<Bytes>,

    /// 상대가 확인한 슬라이스
    acked: AckSet,

    state: SendState,

    /// 마지막 (재)전송 시간
    last_sent: Instant,

    /// 재전송 횟수
    retries: u32,
}

impl OutgoingChunk {
    /// 페이로드를 분할해서 송신 청크 생성
    pub fn new(
        chunk_id: ChunkId,
        payload: &Bytes,
        max_slice_size: usize,
        now: Instant,
    ) -> Result<Self> {
        let slices = slice::split(chunk_id, payload, max_slice_size)?;
        let slice_count = slices.len();

        let datagrams = slices
            .into_iter()
            .map(|s| Packet::Slice(s).to_bytes(max_slice_size))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            chunk_id,
            datagrams,
            acked: AckSet::new(slice_count),
            state: SendState::Sending,
            last_sent: now,
            retries: 0,
        })
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    pub fn state(&self) -> SendState {
        self.state
    }

    pub fn slice_count(&self) -> usize {
        self.acked.slice_count()
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// 전체 슬라이스 데이터그램 (첫 전송용)
    pub fn datagrams(&self) -> &[Bytes] {
        &self.datagrams
    }

    /// 미확인 슬라이스 ID
    pub fn missing(&self) -> Vec<SliceId> {
        self.acked.missing()
    }

    /// ACK 적용, 새로 확인된 슬라이스 수 반환
    ///
    /// 슬라이스 수가 다른 ACK는 손상으로 간주
    pub fn apply_ack(&mut self, ack: &AckMessage) -> Result<usize> {
        if self.state != SendState::Sending {
            return Ok(0);
        }

        if ack.slice_count != self.acked.slice_count() {
            return Err(Error::MalformedAck(format!(
                "chunk {} has {} slices, ack declares {}",
                self.chunk_id,
                self.acked.slice_count(),
                ack.slice_count
            )));
        }

        let newly = self.acked.merge(ack);
        if self.acked.is_complete() {
            self.state = SendState::Complete;
            self.datagrams.clear();
        }
        Ok(newly)
    }

    /// 재전송 타이머 처리
    ///
    /// 마지막 전송 후 `interval` 이 지났으면 미확인 슬라이스 전체를 다시 보냄
    pub fn poll_retransmit(
        &mut self,
        now: Instant,
        interval: Duration,
        max_retries: u32,
    ) -> Retransmit {
        if self.state != SendState::Sending {
            return Retransmit::Idle;
        }

        if now.duration_since(self.last_sent) < interval {
            return Retransmit::Idle;
        }

        if self.retries >= max_retries {
            self.state = SendState::Failed;
            self.datagrams.clear();
            return Retransmit::Exhausted {
                attempts: self.retries + 1,
            };
        }

        self.retries += 1;
        self.last_sent = now;

        let resend = self
            .acked
            .missing()
            .into_iter()
            .filter_map(|id| self.datagrams.get(id as usize).cloned())
            .collect();
        Retransmit::Resend(resend)
    }

    /// 전송 중단, 버퍼 해제
    pub fn abandon(&mut self) {
        if self.state == SendState::Sending {
            self.state = SendState::Abandoned;
        }
        self.datagrams.clear();
    }
}

/// 수신 청크 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    Receiving,
    Delivered,
}

/// 슬라이스 적용 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOutcome {
    /// 새 슬라이스 저장됨
    Inserted,

    /// 이미 받은 슬라이스
    Duplicate,
}

/// 수신 중인 청크
#[derive(Debug)]
pub struct IncomingChunk {
    chunk_id: ChunkId,

    /// 받은 슬라이스 데이터 (slice_id 순)
    slices: BTreeMap<SliceId, Bytes>,

    /// 수신 비트맵
    received: AckSet,

    /// 종단 슬라이스가 알려준 전체 길이
    total_length: Option<usize>,

    state: RecvState,

    /// 첫 슬라이스 도착 시간
    created_at: Instant,
}

impl IncomingChunk {
    /// 첫 슬라이스 도착 시 생성
    pub fn new(chunk_id: ChunkId, slice_count: usize, now: Instant) -> Self {
        Self {
            chunk_id,
            slices: BTreeMap::new(),
            received: AckSet::new(slice_count),
            total_length: None,
            state: RecvState::Receiving,
            created_at: now,
        }
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    pub fn state(&self) -> RecvState {
        self.state
    }

    pub fn slice_count(&self) -> usize {
        self.received.slice_count()
    }

    pub fn total_length(&self) -> Option<usize> {
        self.total_length
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn missing(&self) -> Vec<SliceId> {
        self.received.missing()
    }

    /// 슬라이스 적용
    ///
    /// 같은 슬라이스를 여러 번 적용해도 결과는 한 번과 같음
    pub fn apply_slice(&mut self, slice: Slice) -> Result<SliceOutcome> {
        if slice.chunk_id != self.chunk_id || slice.slice_count != self.slice_count() {
            return Err(Error::MalformedSlice(format!(
                "chunk {} expects {} slices, got chunk {} with {}",
                self.chunk_id,
                self.slice_count(),
                slice.chunk_id,
                slice.slice_count
            )));
        }

        if self.state == RecvState::Delivered || self.received.is_acked(slice.slice_id) {
            return Ok(SliceOutcome::Duplicate);
        }

        if let Some(total_length) = slice.total_length {
            match self.total_length {
                Some(known) if known != total_length => {
                    return Err(Error::MalformedSlice(format!(
                        "total length changed from {} to {}",
                        known, total_length
                    )));
                }
                _ => self.total_length = Some(total_length),
            }
        }

        self.received.mark(slice.slice_id);
        self.slices.insert(slice.slice_id, slice.data);
        Ok(SliceOutcome::Inserted)
    }

    /// 모든 슬라이스와 전체 길이가 확보되었는지
    pub fn is_complete(&self) -> bool {
        self.state == RecvState::Receiving
            && self.received.is_complete()
            && self.total_length.is_some()
    }

    /// 페이로드 조립 후 Delivered로 전환
    pub fn take_payload(&mut self) -> Result<Bytes> {
        let total_length = match self.total_length {
            Some(len) if self.received.is_complete() => len,
            _ => {
                return Err(Error::IncompleteChunk {
                    missing: self.received.missing().len().max(1),
                })
            }
        };

        let payload = slice::reassemble(&self.slices, self.slice_count(), total_length)?;
        self.slices.clear();
        self.state = RecvState::Delivered;
        Ok(payload)
    }

    /// 현재 수신 상태로 ACK 생성
    pub fn ack(&self) -> AckMessage {
        self.received.to_ack(self.chunk_id)
    }
}
