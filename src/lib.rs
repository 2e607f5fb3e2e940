//! # chunknet
//!
//! UDP 데이터그램 위의 청크 분할 신뢰 전송 프로토콜
//!
//! ## 핵심 특징
//! - **슬라이스 분할**: 데이터그램보다 큰 페이로드를 최대 256개 슬라이스로 분할
//! - **비트맵 ACK**: 받은 슬라이스를 8개 단위 플래그 바이트로 응답
//! - **선택 재전송**: 타이머 만료 시 미확인 슬라이스만 다시 전송
//! - **순서/중복 무관**: 슬라이스와 ACK는 어떤 순서로 몇 번 와도 같은 결과
//! - **연결 단위 상태**: 청크 테이블은 연결마다 하나, 단일 태스크가 소유

pub mod ack;
pub mod bitflag;
pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod message;
pub mod registry;
pub mod slice;
pub mod stats;
pub mod transfer;

pub use ack::{AckMessage, AckSet};
pub use config::Config;
pub use connection::{
    ChunkReceiver, Connection, ConnectionHandle, DatagramSink, SendHandle, UdpSink,
};
pub use error::{Error, Result};
pub use handshake::{JoinRequest, JoinResponse};
pub use message::{Packet, PacketKind};
pub use registry::{ChunkIdAllocator, ChunkTransfers, Output, TransferEvent};
pub use slice::{ChunkId, Slice, SliceId};
pub use stats::TransferStats;
pub use transfer::{IncomingChunk, OutgoingChunk, RecvState, SendState};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 기본 슬라이스 크기 (바이트)
pub const DEFAULT_MAX_SLICE_SIZE: usize = 1024;

/// 청크당 최대 슬라이스 수 (slice_id 가 1바이트)
pub const MAX_SLICES_PER_CHUNK: usize = 256;

/// 슬라이스 데이터그램의 최대 오버헤드 (패킷 종류 + 헤더 + 길이 필드)
pub const MAX_DATAGRAM_OVERHEAD: usize = 1 + slice::SLICE_HEADER_SIZE + slice::TOTAL_LENGTH_SIZE;
