//! 두 연결을 메모리 링크로 이어서 손실/중복/순서 뒤바뀜 상황을 검증

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use chunknet::{
    ChunkReceiver, Config, Connection, ConnectionHandle, DatagramSink, Error, JoinRequest,
    JoinResponse,
};

const WAIT: Duration = Duration::from_secs(10);

/// 링크 동작
#[derive(Clone, Copy, Default)]
struct Link {
    /// n번째 데이터그램마다 하나씩 버림
    drop_every: Option<usize>,
    /// 임의 손실 확률
    loss: f64,
    /// 모두 버림
    blackhole: bool,
    /// 모든 데이터그램을 두 번 보냄
    duplicate: bool,
    /// 한 번에 쌓인 데이터그램을 역순으로 전달
    reorder: bool,
}

struct LossySink {
    tx: mpsc::UnboundedSender<Bytes>,
    link: Link,
    counter: AtomicUsize,
    rng: Mutex<StdRng>,
}

impl DatagramSink for LossySink {
    fn send_datagram(&self, datagram: &[u8]) -> std::io::Result<()> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);

        if self.link.blackhole {
            return Ok(());
        }
        if let Some(k) = self.link.drop_every {
            if n % k == k - 1 {
                return Ok(());
            }
        }
        if self.link.loss > 0.0 && self.rng.lock().gen_bool(self.link.loss) {
            return Ok(());
        }

        let datagram = Bytes::copy_from_slice(datagram);
        if self.link.duplicate {
            let _ = self.tx.send(datagram.clone());
        }
        let _ = self.tx.send(datagram);
        Ok(())
    }
}

fn sink(link: Link, seed: u64) -> (LossySink, mpsc::UnboundedReceiver<Bytes>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = LossySink {
        tx,
        link,
        counter: AtomicUsize::new(0),
        rng: Mutex::new(StdRng::seed_from_u64(seed)),
    };
    (sink, rx)
}

async fn pump(mut rx: mpsc::UnboundedReceiver<Bytes>, target: ConnectionHandle, reorder: bool) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(more) = rx.try_recv() {
            batch.push(more);
        }
        if reorder {
            batch.reverse();
        }
        for datagram in batch {
            if target.on_datagram(datagram).await.is_err() {
                return;
            }
        }
    }
}

fn test_config() -> Config {
    Config {
        max_slice_size: 256,
        retransmit_interval_ms: 30,
        max_retries: 100,
        tick_interval_ms: 5,
        ..Config::default()
    }
}

struct Pair {
    a: ConnectionHandle,
    a_rx: ChunkReceiver,
    b: ConnectionHandle,
    b_rx: ChunkReceiver,
}

/// a → b 방향은 `forward`, b → a 방향은 `backward` 링크 사용
fn pair(config: Config, forward: Link, backward: Link) -> Pair {
    let (a_sink, a_out) = sink(forward, 1);
    let (b_sink, b_out) = sink(backward, 2);

    let (a, a_rx) = Connection::spawn(config.clone(), a_sink).unwrap();
    let (b, b_rx) = Connection::spawn(config, b_sink).unwrap();

    tokio::spawn(pump(a_out, b.clone(), forward.reorder));
    tokio::spawn(pump(b_out, a.clone(), backward.reorder));

    Pair { a, a_rx, b, b_rx }
}

fn payload(len: usize) -> Bytes {
    (0..len).map(|i| (i * 31 % 256) as u8).collect::<Vec<u8>>().into()
}

#[tokio::test]
async fn test_clean_transfer() {
    let mut pair = pair(test_config(), Link::default(), Link::default());
    let data = payload(40_000);

    let send = pair.a.send_chunk(data.clone()).await.unwrap();
    let received = tokio::time::timeout(WAIT, pair.b_rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, data);

    tokio::time::timeout(WAIT, send.wait()).await.unwrap().unwrap();

    let stats = pair.a.stats();
    assert_eq!(stats.chunks_sent, 1);
    assert_eq!(stats.chunks_completed, 1);
}

#[tokio::test]
async fn test_both_directions() {
    let mut pair = pair(test_config(), Link::default(), Link::default());

    let from_a = payload(3000);
    let from_b = payload(700);
    let send_a = pair.a.send_chunk(from_a.clone()).await.unwrap();
    let send_b = pair.b.send_chunk(from_b.clone()).await.unwrap();

    assert_eq!(tokio::time::timeout(WAIT, pair.b_rx.recv()).await.unwrap().unwrap(), from_a);
    assert_eq!(tokio::time::timeout(WAIT, pair.a_rx.recv()).await.unwrap().unwrap(), from_b);

    tokio::time::timeout(WAIT, send_a.wait()).await.unwrap().unwrap();
    tokio::time::timeout(WAIT, send_b.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_lost_slices_are_retransmitted() {
    let forward = Link {
        drop_every: Some(3),
        ..Link::default()
    };
    let mut pair = pair(test_config(), forward, Link::default());
    let data = payload(5000);

    let send = pair.a.send_chunk(data.clone()).await.unwrap();
    let received = tokio::time::timeout(WAIT, pair.b_rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, data);
    tokio::time::timeout(WAIT, send.wait()).await.unwrap().unwrap();

    assert!(pair.a.stats().slices_retransmitted > 0);
}

#[tokio::test]
async fn test_lossy_link_both_ways() {
    let lossy = Link {
        loss: 0.3,
        ..Link::default()
    };
    let mut pair = pair(test_config(), lossy, lossy);

    for len in [0, 1, 256, 10_000, 65_000] {
        let data = payload(len);
        let send = pair.a.send_chunk(data.clone()).await.unwrap();
        let received = tokio::time::timeout(WAIT, pair.b_rx.recv()).await.unwrap().unwrap();
        assert_eq!(received, data, "len={}", len);
        tokio::time::timeout(WAIT, send.wait()).await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_duplicated_and_reordered_delivered_once() {
    let messy = Link {
        duplicate: true,
        reorder: true,
        ..Link::default()
    };
    let mut pair = pair(test_config(), messy, messy);
    let data = payload(8000);

    let send = pair.a.send_chunk(data.clone()).await.unwrap();
    let received = tokio::time::timeout(WAIT, pair.b_rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, data);
    tokio::time::timeout(WAIT, send.wait()).await.unwrap().unwrap();

    // 두 번 전달되지 않음
    assert!(tokio::time::timeout(Duration::from_millis(200), pair.b_rx.recv())
        .await
        .is_err());
    assert_eq!(pair.b.stats().chunks_delivered, 1);
    assert!(pair.b.stats().duplicate_slices > 0);
}

#[tokio::test]
async fn test_slow_consumer_does_not_stall_acks() {
    let config = Config {
        delivered_queue_size: 1,
        max_retries: 5,
        ..test_config()
    };
    let mut pair = pair(config, Link::default(), Link::default());
    let chunks: Vec<Bytes> = (1..=3).map(|n| payload(n * 700)).collect();

    // b 의 수신기를 읽지 않는 동안에도 ACK는 계속 나가야 함
    let mut sends = Vec::new();
    for data in &chunks {
        sends.push(pair.a.send_chunk(data.clone()).await.unwrap());
    }
    for send in sends {
        tokio::time::timeout(WAIT, send.wait()).await.unwrap().unwrap();
    }

    for data in &chunks {
        let received = tokio::time::timeout(WAIT, pair.b_rx.recv()).await.unwrap().unwrap();
        assert_eq!(&received, data);
    }
    assert_eq!(pair.a.stats().chunks_failed, 0);
}

#[tokio::test]
async fn test_invalid_slice_count_is_synchronous() {
    let config = Config {
        max_slice_size: 10,
        recv_buffer_size: 1500,
        ..test_config()
    };
    let pair = pair(config, Link::default(), Link::default());

    let result = pair.a.send_chunk(payload(2570)).await;
    assert!(matches!(result, Err(Error::InvalidSliceCount { count: 257 })));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pair.a.stats().slices_sent, 0);
    assert_eq!(pair.b.stats().slices_received, 0);
}

#[tokio::test]
async fn test_transfer_fails_after_max_retries() {
    let config = Config {
        retransmit_interval_ms: 10,
        max_retries: 3,
        ..test_config()
    };
    let blackhole = Link {
        blackhole: true,
        ..Link::default()
    };
    let pair = pair(config, blackhole, Link::default());

    let send = pair.a.send_chunk(payload(1000)).await.unwrap();
    let chunk_id = send.chunk_id();
    let result = tokio::time::timeout(WAIT, send.wait()).await.unwrap();

    match result {
        Err(Error::TransferFailed {
            chunk_id: failed,
            attempts,
        }) => {
            assert_eq!(failed, chunk_id);
            assert_eq!(attempts, 4);
        }
        other => panic!("expected TransferFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_abandon_resolves_handle() {
    let blackhole = Link {
        blackhole: true,
        ..Link::default()
    };
    let pair = pair(test_config(), blackhole, Link::default());

    let send = pair.a.send_chunk(payload(1000)).await.unwrap();
    pair.a.abandon(send.chunk_id()).await.unwrap();

    let result = tokio::time::timeout(WAIT, send.wait()).await.unwrap();
    assert!(matches!(result, Err(Error::TransferAbandoned { .. })));
}

#[tokio::test]
async fn test_close_resolves_pending_sends() {
    let blackhole = Link {
        blackhole: true,
        ..Link::default()
    };
    let pair = pair(test_config(), blackhole, Link::default());

    let send = pair.a.send_chunk(payload(1000)).await.unwrap();
    pair.a.close().await;

    let result = tokio::time::timeout(WAIT, send.wait()).await.unwrap();
    assert!(matches!(result, Err(Error::ConnectionClosed)));
    assert!(!pair.a.is_running());

    // 종료 후 전송 요청은 거부됨
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(pair.a.send_chunk(payload(10)).await.is_err());
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let config = Config {
        max_slice_size: 0,
        ..Config::default()
    };
    let (sink, _rx) = sink(Link::default(), 0);
    assert!(matches!(
        Connection::spawn(config, sink),
        Err(Error::InvalidConfig(_))
    ));
}

/// 비어 있는 로컬 주소 두 개 (동시에 바인딩해서 겹치지 않게)
fn free_local_addrs() -> (SocketAddr, SocketAddr) {
    let first = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let second = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    (first.local_addr().unwrap(), second.local_addr().unwrap())
}

#[tokio::test]
async fn test_join_handshake_over_udp() {
    let (server_addr, client_addr) = free_local_addrs();
    let config = test_config();

    let (server, mut server_rx) =
        Connection::connect_udp(config.clone(), server_addr, client_addr)
            .await
            .unwrap();
    let (client, mut client_rx) = Connection::connect_udp(config, client_addr, server_addr)
        .await
        .unwrap();

    let request = JoinRequest::new("alex", "0.1.0");
    let send = client.send_chunk(request.to_bytes().unwrap()).await.unwrap();

    let received = tokio::time::timeout(WAIT, server_rx.recv()).await.unwrap().unwrap();
    assert_eq!(JoinRequest::from_bytes(&received).unwrap(), request);
    tokio::time::timeout(WAIT, send.wait()).await.unwrap().unwrap();

    let world: Vec<u8> = (0..20_000).map(|i| (i % 199) as u8).collect();
    let response = JoinResponse::accept(1, world);
    let send = server.send_chunk(response.to_bytes().unwrap()).await.unwrap();

    let received = tokio::time::timeout(WAIT, client_rx.recv()).await.unwrap().unwrap();
    let restored = JoinResponse::from_bytes(&received).unwrap();
    assert!(restored.verify());
    assert_eq!(restored, response);
    tokio::time::timeout(WAIT, send.wait()).await.unwrap().unwrap();

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_dropping_udp_handle_stops_connection() {
    let (local_addr, peer_addr) = free_local_addrs();
    let (handle, mut chunks) = Connection::connect_udp(test_config(), local_addr, peer_addr)
        .await
        .unwrap();

    // close() 없이 핸들만 버려도 연결 태스크가 끝나서 수신 채널이 닫힘
    drop(handle);
    let closed = tokio::time::timeout(WAIT, chunks.recv()).await.unwrap();
    assert!(closed.is_none());
}
