//! chunknet 클라이언트 - 참가 핸드쉐이크 데모
//!
//! 참가 요청을 청크로 보내고 서버의 월드 상태 청크를 받음
//!
//! 사용법:
//!   cargo run --release --bin chunknet-client -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin chunknet-client -- --server 127.0.0.1:9100 --name alex
//!
//!   # 월드 상태를 파일로 저장
//!   cargo run --release --bin chunknet-client -- -s 127.0.0.1:9100 -o world.bin

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use chunknet::{Config, Connection, Error, JoinRequest, JoinResponse};

/// 클라이언트 설정
struct ClientConfig {
    bind_addr: SocketAddr,
    server_addr: SocketAddr,
    player_name: String,
    output_path: Option<PathBuf>,
    timeout_secs: u64,
    config: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            server_addr: SocketAddr::from(([127, 0, 0, 1], 9100)),
            player_name: "player".into(),
            output_path: None,
            timeout_secs: 30,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ClientConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ClientConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    config.server_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--name" | "-n" => {
                if i + 1 < args.len() {
                    config.player_name = args[i + 1].clone();
                    i += 1;
                }
            }
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    config.output_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--timeout" => {
                if i + 1 < args.len() {
                    config.timeout_secs = args[i + 1].parse().expect("유효한 숫자 필요");
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
                    r#"chunknet client - 참가 핸드쉐이크 데모 클라이언트

참가 요청을 보내고 서버가 보낸 월드 상태를 받음

사용법:
  cargo run --release --bin chunknet-client -- [OPTIONS]

옵션:
  -b, --bind <ADDR>        로컬 바인드 주소 (기본: 0.0.0.0:0 = 자동 할당)
  -s, --server <ADDR>      서버 주소 (기본: 127.0.0.1:9100)
  -n, --name <NAME>        플레이어 이름 (기본: player)
  -o, --output <PATH>      월드 상태 저장 경로
  --timeout <SECS>         응답 대기 시간 (기본: 30)
  --slice-size <SIZE>      슬라이스 크기 바이트 (서버와 같아야 함, 기본: 1024)
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

    let client_config = parse_args();
    let config = client_config.config.clone();

    info!("chunknet client starting...");
    info!("Server: {}", client_config.server_addr);
    info!("Slice size: {} bytes", config.max_slice_size);

    let (handle, mut chunks) = Connection::connect_udp(
        config.clone(),
        client_config.bind_addr,
        client_config.server_addr,
    )
    .await?;

    let start = Instant::now();

    // 참가 요청 전송
    let request = JoinRequest::new(client_config.player_name.clone(), env!("CARGO_PKG_VERSION"));
    let send = handle.send_chunk(request.to_bytes()?).await?;
    info!("Join request sent (chunk {})", send.chunk_id());
    send.wait().await?;
    info!("Join request acknowledged in {:.1}ms", start.elapsed().as_secs_f64() * 1000.0);

    // 월드 상태 수신
    let timeout = Duration::from_secs(client_config.timeout_secs);
    let payload = match tokio::time::timeout(timeout, chunks.recv()).await {
        Ok(Some(payload)) => payload,
        Ok(None) => return Err(Error::ConnectionClosed.into()),
        Err(_) => {
            let message = format!("no join response within {}s", client_config.timeout_secs);
            return Err(message.into());
        }
    };

    let response = JoinResponse::from_bytes(&payload)?;
    if !response.accepted {
        warn!(
            "Join rejected: {}",
            response.reason.as_deref().unwrap_or("unknown reason")
        );
    } else if !response.verify() {
        warn!("World state CRC mismatch, discarding");
    } else {
        info!("Joined as slot {}", response.player_slot);
        info!(
            "World state: {} bytes in {:.1}ms",
            response.world_state.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );

        if let Some(path) = &client_config.output_path {
            std::fs::write(path, &response.world_state)?;
            info!("Saved to {:?}", path);
        }
    }

    // 마지막 ACK가 손실되었을 경우 재전송에 다시 응답
    tokio::time::sleep(config.retransmit_interval() * 3).await;
    handle.close().await;

    info!("{}", handle.stats().summary());
    Ok(())
}
