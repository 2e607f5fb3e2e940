//! chunknet 서버 - 참가 핸드쉐이크 데모
//!
//! 클라이언트의 참가 요청 청크를 받아서 월드 상태를 청크로 응답
//! - 피어마다 연결 태스크 하나 (소켓은 공유)
//! - 슬라이스 손실 시 미확인 슬라이스만 재전송
//!
//! 사용법:
//!   cargo run --release --bin chunknet-server -- [OPTIONS]
//!
//! 예시:
//!   # 기본 실행 (테스트용 월드 데이터)
//!   cargo run --release --bin chunknet-server -- --bind 0.0.0.0:9100
//!
//!   # 파일을 월드 상태로 전송
//!   cargo run --release --bin chunknet-server -- -f world.bin --slice-size 512

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use chunknet::{
    ChunkReceiver, Config, Connection, ConnectionHandle, JoinRequest, JoinResponse, UdpSink,
    PROTOCOL_VERSION,
};

/// 서버 설정
struct ServerConfig {
    bind_addr: SocketAddr,
    file_path: Option<PathBuf>,
    max_players: u8,
    config: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9100)),
            file_path: None,
            max_players: 8,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ServerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--file" | "-f" => {
                if i + 1 < args.len() {
                    config.file_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--max-players" => {
                if i + 1 < args.len() {
                    config.max_players = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--slice-size" => {
                if i + 1 < args.len() {
                    config.config.max_slice_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--retransmit-ms" => {
                if i + 1 < args.len() {
                    config.config.retransmit_interval_ms =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--max-retries" => {
                if i + 1 < args.len() {
                    config.config.max_retries = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"chunknet server - 참가 핸드쉐이크 데모 서버

참가 요청 청크를 받으면 월드 상태를 청크로 응답

사용법:
  cargo run --release --bin chunknet-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>        바인드 주소 (기본: 0.0.0.0:9100)
  -f, --file <PATH>        월드 상태로 보낼 파일 (최대 약 64KB)
  --max-players <N>        최대 플레이어 수 (기본: 8)
  --slice-size <SIZE>      슬라이스 크기 바이트 (기본: 1024)
  --retransmit-ms <MS>     재전송 간격 (기본: 200)
  --max-retries <N>        최대 재전송 횟수 (기본: 10)
  -h, --help               이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

/// 피어 하나의 핸드쉐이크 처리
async fn serve_peer(
    peer: SocketAddr,
    handle: ConnectionHandle,
    mut chunks: ChunkReceiver,
    world: Arc<Vec<u8>>,
    next_slot: Arc<AtomicU8>,
    max_players: u8,
    linger: std::time::Duration,
) {
    while let Some(payload) = chunks.recv().await {
        let request = match JoinRequest::from_bytes(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("잘못된 참가 요청 ({}): {}", peer, e);
                continue;
            }
        };

        info!(
            "Join request from {}: player={}, mod={}",
            peer, request.player_name, request.mod_version
        );

        let response = if request.protocol_version != PROTOCOL_VERSION {
            JoinResponse::reject(format!(
                "protocol version mismatch: server {}, client {}",
                PROTOCOL_VERSION, request.protocol_version
            ))
        } else {
            let slot = next_slot.fetch_add(1, Ordering::SeqCst);
            if slot >= max_players {
                JoinResponse::reject("server full")
            } else {
                JoinResponse::accept(slot, world.as_ref().clone())
            }
        };

        let bytes = match response.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("응답 직렬화 실패: {}", e);
                continue;
            }
        };

        let send = match handle.send_chunk(bytes).await {
            Ok(send) => send,
            Err(e) => {
                warn!("응답 전송 실패 ({}): {}", peer, e);
                break;
            }
        };

        match send.wait().await {
            Ok(()) => {
                info!("Join response delivered to {} (accepted={})", peer, response.accepted);
                info!("{}", handle.stats().summary());
                break;
            }
            Err(e) => {
                warn!("Join response to {} failed: {}", peer, e);
                break;
            }
        }
    }

    // 늦은 중복 슬라이스에 응답할 수 있도록 잠시 유지
    tokio::time::sleep(linger).await;
    handle.close().await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(Level::INFO.as_str())),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let server_config = parse_args();
    let config = server_config.config.clone();
    config.validate()?;

    info!("chunknet server starting...");
    info!("Bind address: {}", server_config.bind_addr);
    info!("Slice size: {} bytes", config.max_slice_size);
    info!(
        "Retransmit: every {}ms, up to {} times",
        config.retransmit_interval_ms, config.max_retries
    );

    // 월드 상태 준비
    let world = if let Some(path) = &server_config.file_path {
        info!("Loading world state: {:?}", path);
        std::fs::read(path)?
    } else {
        // 테스트용 더미 데이터 (48KB)
        info!("Using test world state (48KB)");
        (0..48 * 1024).map(|i| (i % 253) as u8).collect()
    };

    let response_size = JoinResponse::accept(0, world.clone()).to_bytes()?.len();
    if response_size > config.max_payload_size() {
        return Err(format!(
            "world state too large: response {} bytes, chunk limit {} bytes",
            response_size,
            config.max_payload_size()
        )
        .into());
    }
    info!("World state: {} bytes", world.len());

    let world = Arc::new(world);
    let next_slot = Arc::new(AtomicU8::new(0));
    let peers: Arc<DashMap<SocketAddr, ConnectionHandle>> = Arc::new(DashMap::new());

    // 소켓 바인딩
    let socket = Arc::new(UdpSocket::bind(server_config.bind_addr).await?);
    info!("Server listening on {}", server_config.bind_addr);

    let mut buf = vec![0u8; config.recv_buffer_size];

    loop {
        let (len, addr) = socket.recv_from(&mut buf).await?;

        let existing = peers
            .get(&addr)
            .map(|entry| entry.value().clone())
            .filter(|handle| handle.is_running());

        let handle = match existing {
            Some(handle) => handle,
            None => {
                let (handle, chunks) =
                    Connection::spawn(config.clone(), UdpSink::new(socket.clone(), addr))?;
                peers.insert(addr, handle.clone());
                info!("New peer: {} ({} connected)", addr, peers.len());

                let peers_clone = peers.clone();
                let handle_clone = handle.clone();
                let world_clone = world.clone();
                let next_slot_clone = next_slot.clone();
                let max_players = server_config.max_players;
                let linger = config.delivered_linger();

                tokio::spawn(async move {
                    serve_peer(
                        addr,
                        handle_clone,
                        chunks,
                        world_clone,
                        next_slot_clone,
                        max_players,
                        linger,
                    )
                    .await;
                    peers_clone.remove(&addr);
                    info!("Peer closed: {}", addr);
                });

                handle
            }
        };

        if handle
            .on_datagram(Bytes::copy_from_slice(&buf[..len]))
            .await
            .is_err()
        {
            peers.remove(&addr);
        }
    }
}
