//! 에러 타입 정의

use thiserror::Error;

use crate::slice::ChunkId;

/// 청크 전송 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    /// 호출자 오류: 슬라이스 데이터가 max_slice_size 보다 큼
    #[error("슬라이스 크기 초과: len={len}, max={max}")]
    SliceTooLarge { len: usize, max: usize },

    /// 256개 슬라이스로 표현할 수 없는 페이로드
    #[error("유효하지 않은 슬라이스 수: {count} (1 ~ 256)")]
    InvalidSliceCount { count: usize },

    /// 종단 슬라이스의 길이 필드(u16)로 표현할 수 없는 페이로드
    #[error("페이로드 크기 초과: len={len}, max={max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("손상된 슬라이스: {0}")]
    MalformedSlice(String),

    #[error("손상된 ACK: {0}")]
    MalformedAck(String),

    #[error("알 수 없는 패킷 종류: {0}")]
    UnknownPacketKind(u8),

    /// 모든 슬라이스가 도착하기 전에 재조립 시도
    #[error("불완전한 청크: missing_slices={missing}")]
    IncompleteChunk { missing: usize },

    #[error("사용 가능한 청크 ID 없음 (256개 모두 전송 중)")]
    ChunkIdsExhausted,

    #[error("청크 전송 실패: chunk_id={chunk_id}, attempts={attempts}")]
    TransferFailed { chunk_id: ChunkId, attempts: u32 },

    #[error("청크 전송 중단: chunk_id={chunk_id}")]
    TransferAbandoned { chunk_id: ChunkId },

    #[error("연결 종료")]
    ConnectionClosed,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
