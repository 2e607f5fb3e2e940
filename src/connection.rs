//! 연결 단위 비동기 드라이버
//!
//! - 연결마다 태스크 하나가 `ChunkTransfers` 를 단독 소유
//! - 데이터그램 수신, 전송 요청, 타이머가 모두 명령 채널로 직렬화됨
//! - 종료 시 타이머도 태스크와 함께 즉시 해제

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::registry::{ChunkTransfers, Output, TransferEvent};
use crate::slice::{self, ChunkId};
use crate::stats::TransferStats;
use crate::{Config, Error, Result};

/// 완성된 청크 채널 수신기 타입
pub type ChunkReceiver = mpsc::Receiver<Bytes>;

/// 하위 데이터그램 전송 계층
///
/// 비신뢰 전송이므로 보내기 실패는 손실과 같게 취급됨
pub trait DatagramSink: Send + Sync + 'static {
    fn send_datagram(&self, datagram: &[u8]) -> std::io::Result<()>;
}

/// UDP 소켓 기반 전송 (여러 피어가 소켓 하나를 공유 가능)
pub struct UdpSink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpSink {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }
}

impl DatagramSink for UdpSink {
    fn send_datagram(&self, datagram: &[u8]) -> std::io::Result<()> {
        self.socket.try_send_to(datagram, self.peer).map(|_| ())
    }
}

/// 내부 명령
enum ConnectionCmd {
    Datagram(Bytes),
    Send {
        payload: Bytes,
        reply: oneshot::Sender<Result<SendHandle>>,
    },
    Abandon(ChunkId),
    Close,
}

/// 청크 전송 완료 대기 핸들
#[derive(Debug)]
pub struct SendHandle {
    chunk_id: ChunkId,
    done: oneshot::Receiver<Result<()>>,
}

impl SendHandle {
    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    /// 모든 슬라이스가 확인될 때까지 대기
    pub async fn wait(self) -> Result<()> {
        match self.done.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed),
        }
    }
}

/// 연결 내부 상태 (단일 태스크에서만 접근)
struct ConnectionInner<S> {
    transfers: ChunkTransfers,
    sink: Arc<S>,
    completions: HashMap<ChunkId, oneshot::Sender<Result<()>>>,
    delivered_tx: mpsc::Sender<Bytes>,
    /// 상위 채널이 가득 차서 아직 못 올린 청크 (순서 유지)
    backlog: VecDeque<Bytes>,
    stats: Arc<RwLock<TransferStats>>,
}

impl<S: DatagramSink> ConnectionInner<S> {
    fn transmit(&self, datagrams: &[Bytes]) {
        for datagram in datagrams {
            if let Err(e) = self.sink.send_datagram(datagram) {
                // 손실로 간주, 재전송 타이머가 복구
                debug!("데이터그램 전송 실패: {}", e);
            }
        }
    }

    fn handle_send(&mut self, payload: Bytes) -> Result<SendHandle> {
        let (chunk_id, datagrams) = self.transfers.send_chunk(payload, Instant::now())?;
        self.transmit(&datagrams);

        let (done_tx, done_rx) = oneshot::channel();
        self.completions.insert(chunk_id, done_tx);

        Ok(SendHandle {
            chunk_id,
            done: done_rx,
        })
    }

    /// 상위로 전달 (채널이 가득 차면 backlog 에 보관, 대기하지 않음)
    fn deliver(&mut self, chunk_id: ChunkId, payload: Bytes) {
        if !self.backlog.is_empty() {
            self.backlog.push_back(payload);
            return;
        }

        match self.delivered_tx.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(payload)) => {
                debug!("청크 수신기가 가득 참, 청크 {} 보관", chunk_id);
                self.backlog.push_back(payload);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("청크 수신기가 닫힘, 청크 {} 버림", chunk_id);
            }
        }
    }

    /// 보관 중인 청크를 채널 여유만큼 올림
    fn flush_backlog(&mut self) {
        while let Some(payload) = self.backlog.pop_front() {
            match self.delivered_tx.try_send(payload) {
                Ok(()) => {}
                Err(TrySendError::Full(payload)) => {
                    self.backlog.push_front(payload);
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    self.backlog.clear();
                    return;
                }
            }
        }
    }

    fn handle_output(&mut self, output: Output) {
        self.transmit(&output.datagrams);

        for event in output.events {
            match event {
                TransferEvent::Delivered { chunk_id, payload } => {
                    debug!("청크 {} 상위 전달: {} bytes", chunk_id, payload.len());
                    self.deliver(chunk_id, payload);
                }
                TransferEvent::SendComplete { chunk_id } => {
                    if let Some(done) = self.completions.remove(&chunk_id) {
                        let _ = done.send(Ok(()));
                    }
                }
                TransferEvent::SendFailed { chunk_id, attempts } => {
                    if let Some(done) = self.completions.remove(&chunk_id) {
                        let _ = done.send(Err(Error::TransferFailed { chunk_id, attempts }));
                    }
                }
            }
        }
    }

    fn handle_abandon(&mut self, chunk_id: ChunkId) {
        if self.transfers.abandon(chunk_id, Instant::now()) {
            if let Some(done) = self.completions.remove(&chunk_id) {
                let _ = done.send(Err(Error::TransferAbandoned { chunk_id }));
            }
        }
    }

    fn close(&mut self) {
        let abandoned = self.transfers.abandon_all(Instant::now());
        for (_, done) in self.completions.drain() {
            let _ = done.send(Err(Error::ConnectionClosed));
        }
        if !abandoned.is_empty() {
            info!("연결 종료: 전송 중이던 청크 {}개 중단", abandoned.len());
        }

        self.flush_backlog();
        if !self.backlog.is_empty() {
            warn!("연결 종료: 상위로 못 올린 청크 {}개 버림", self.backlog.len());
            self.backlog.clear();
        }
    }

    fn publish_stats(&self) {
        *self.stats.write() = self.transfers.stats().clone();
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ConnectionCmd>, tick: Duration) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let delivered_tx = self.delivered_tx.clone();

        loop {
            let backlogged = !self.backlog.is_empty();

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ConnectionCmd::Datagram(datagram)) => {
                            let output = self.transfers.handle_datagram(&datagram, Instant::now());
                            self.handle_output(output);
                        }
                        Some(ConnectionCmd::Send { payload, reply }) => {
                            let result = self.handle_send(payload);
                            let _ = reply.send(result);
                        }
                        Some(ConnectionCmd::Abandon(chunk_id)) => {
                            self.handle_abandon(chunk_id);
                        }
                        Some(ConnectionCmd::Close) | None => {
                            self.close();
                            self.publish_stats();
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let output = self.transfers.poll_timers(Instant::now());
                    if !output.is_empty() {
                        self.handle_output(output);
                    }
                }
                // 수신기에 자리가 나면 보관 청크를 올림
                permit = delivered_tx.reserve(), if backlogged => {
                    match permit {
                        Ok(permit) => {
                            if let Some(payload) = self.backlog.pop_front() {
                                permit.send(payload);
                            }
                            self.flush_backlog();
                        }
                        Err(_) => self.backlog.clear(),
                    }
                }
            }

            self.publish_stats();
        }
    }
}

/// 연결 핸들 (외부에서 제어용)
#[derive(Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::Sender<ConnectionCmd>,
    stats: Arc<RwLock<TransferStats>>,
    running: Arc<AtomicBool>,
    max_slice_size: usize,
}

impl ConnectionHandle {
    /// 청크 전송 요청
    ///
    /// 슬라이스 수 초과 같은 호출자 오류는 즉시 반환되고 아무것도 전송되지 않음
    pub async fn send_chunk(&self, payload: impl Into<Bytes>) -> Result<SendHandle> {
        let payload = payload.into();
        slice::slice_count(payload.len(), self.max_slice_size)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ConnectionCmd::Send {
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        reply_rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// 수신 데이터그램 전달
    pub async fn on_datagram(&self, datagram: Bytes) -> Result<()> {
        self.cmd_tx
            .send(ConnectionCmd::Datagram(datagram))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// 송신 청크 중단
    pub async fn abandon(&self, chunk_id: ChunkId) -> Result<()> {
        self.cmd_tx
            .send(ConnectionCmd::Abandon(chunk_id))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// 연결 종료
    pub async fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.cmd_tx.send(ConnectionCmd::Close).await;
    }

    /// 통계 반환
    pub fn stats(&self) -> TransferStats {
        self.stats.read().clone()
    }

    /// 실행 중 여부
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// 연결 생성
pub struct Connection;

impl Connection {
    /// 연결 태스크 시작
    pub fn spawn<S: DatagramSink>(
        config: Config,
        sink: S,
    ) -> Result<(ConnectionHandle, ChunkReceiver)> {
        config.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::channel::<ConnectionCmd>(config.command_queue_size);
        let (delivered_tx, delivered_rx) = mpsc::channel::<Bytes>(config.delivered_queue_size);

        let stats = Arc::new(RwLock::new(TransferStats::new()));
        let running = Arc::new(AtomicBool::new(true));

        let inner = ConnectionInner {
            transfers: ChunkTransfers::new(config.clone()),
            sink: Arc::new(sink),
            completions: HashMap::new(),
            delivered_tx,
            backlog: VecDeque::new(),
            stats: stats.clone(),
        };

        let tick = config.tick_interval();
        let running_main = running.clone();
        tokio::spawn(async move {
            inner.run(cmd_rx, tick).await;
            running_main.store(false, Ordering::SeqCst);
        });

        let handle = ConnectionHandle {
            cmd_tx,
            stats,
            running,
            max_slice_size: config.max_slice_size,
        };

        Ok((handle, delivered_rx))
    }

    /// UDP 소켓을 바인딩하고 한 피어와의 연결 시작
    ///
    /// 다른 주소에서 온 데이터그램은 무시
    pub async fn connect_udp(
        config: Config,
        bind_addr: SocketAddr,
        peer: SocketAddr,
    ) -> Result<(ConnectionHandle, ChunkReceiver)> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!("UDP connection bound on {}, peer: {}", socket.local_addr()?, peer);

        let recv_buffer_size = config.recv_buffer_size;
        let (handle, delivered_rx) = Self::spawn(config, UdpSink::new(socket.clone(), peer))?;

        // 수신 태스크 (약한 참조만 보유, 사용자 핸들이 모두 사라지면 연결도 끝남)
        let weak_tx = handle.cmd_tx.downgrade();
        let running = handle.running.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; recv_buffer_size];
            let poll = Duration::from_millis(10);

            while running.load(Ordering::SeqCst) {
                match tokio::time::timeout(poll, socket.recv_from(&mut buf)).await {
                    Ok(Ok((len, addr))) => {
                        if addr != peer {
                            debug!("알 수 없는 주소의 데이터그램 무시: {}", addr);
                            continue;
                        }
                        let cmd_tx = match weak_tx.upgrade() {
                            Some(cmd_tx) => cmd_tx,
                            None => break,
                        };
                        let datagram = Bytes::copy_from_slice(&buf[..len]);
                        if cmd_tx.send(ConnectionCmd::Datagram(datagram)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        warn!("수신 에러: {}", e);
                    }
                    Err(_) => {
                        // 타임아웃, 계속
                    }
                }
            }
            debug!("수신 태스크 종료: peer={}", peer);
        });

        Ok((handle, delivered_rx))
    }
}
