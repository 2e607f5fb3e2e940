//! 접속 핸드쉐이크 메시지
//!
//! 청크 전송 위에서 오가는 상위 페이로드 예시.
//! 클라이언트가 참가 요청을 보내면 서버가 월드 상태를 담아 응답함.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Result, PROTOCOL_VERSION};

/// 참가 요청 (클라이언트 → 서버)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// 프로토콜 버전
    pub protocol_version: u8,

    /// 플레이어 이름
    pub player_name: String,

    /// 클라이언트 모드 버전
    pub mod_version: String,
}

impl JoinRequest {
    pub fn new(player_name: impl Into<String>, mod_version: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            player_name: player_name.into(),
            mod_version: mod_version.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(bincode::serialize(self)?.into())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// 참가 응답 (서버 → 클라이언트)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    /// 프로토콜 버전
    pub protocol_version: u8,

    /// 참가 허용 여부
    pub accepted: bool,

    /// 거절 사유
    pub reason: Option<String>,

    /// 배정된 플레이어 슬롯
    pub player_slot: u8,

    /// 직렬화된 월드 상태
    pub world_state: Vec<u8>,

    /// world_state 의 CRC32
    pub world_crc32: u32,
}

impl JoinResponse {
    /// 참가 허용 응답
    pub fn accept(player_slot: u8, world_state: Vec<u8>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            accepted: true,
            reason: None,
            player_slot,
            world_crc32: crc32fast::hash(&world_state),
            world_state,
        }
    }

    /// 참가 거절 응답
    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            accepted: false,
            reason: Some(reason.into()),
            player_slot: 0,
            world_state: Vec::new(),
            world_crc32: crc32fast::hash(&[]),
        }
    }

    /// CRC 검증
    pub fn verify(&self) -> bool {
        crc32fast::hash(&self.world_state) == self.world_crc32
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(bincode::serialize(self)?.into())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
