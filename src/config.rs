//! 프로토콜 설정
//!
//! 양쪽 피어가 같은 `max_slice_size` 를 사용해야 함

use std::time::Duration;

use crate::{Error, Result, DEFAULT_MAX_SLICE_SIZE};

/// 청크 전송 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 종단이 아닌 슬라이스의 데이터 크기 (바이트)
    pub max_slice_size: usize,

    /// 미확인 슬라이스 재전송 간격 (밀리초)
    pub retransmit_interval_ms: u64,

    /// 최대 재전송 횟수
    /// 초과하면 전송 실패로 보고
    pub max_retries: u32,

    /// 타이머 처리 주기 (밀리초)
    pub tick_interval_ms: u64,

    /// 미완성 수신 청크 유지 시간 (밀리초)
    pub receive_timeout_ms: u64,

    /// 전달 완료된 청크 ID를 기억하는 시간 (밀리초)
    /// 늦게 도착한 중복 슬라이스에 완료 ACK로 응답하기 위함
    pub delivered_linger_ms: u64,

    /// 연결 명령 큐 크기
    pub command_queue_size: usize,

    /// 상위로 전달되는 완성 청크 큐 크기
    pub delivered_queue_size: usize,

    /// 데이터그램 수신 버퍼 크기
    pub recv_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_slice_size: DEFAULT_MAX_SLICE_SIZE,
            retransmit_interval_ms: 200,
            max_retries: 10,
            tick_interval_ms: 20,
            receive_timeout_ms: 10_000,   // 10초
            delivered_linger_ms: 5_000,   // 5초
            command_queue_size: 1024,
            delivered_queue_size: 64,
            recv_buffer_size: 65535,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 재전송 간격
    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms)
    }

    /// 타이머 주기
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn delivered_linger(&self) -> Duration {
        Duration::from_millis(self.delivered_linger_ms)
    }

    /// 한 청크로 보낼 수 있는 최대 페이로드 크기
    pub fn max_payload_size(&self) -> usize {
        (self.max_slice_size * crate::MAX_SLICES_PER_CHUNK).min(u16::MAX as usize)
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.max_slice_size == 0 || self.max_slice_size > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "max_slice_size must be 1..=65535, got {}",
                self.max_slice_size
            )));
        }
        if self.retransmit_interval_ms == 0 {
            return Err(Error::InvalidConfig("retransmit_interval_ms must be > 0".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::InvalidConfig("tick_interval_ms must be > 0".into()));
        }
        if self.command_queue_size == 0 || self.delivered_queue_size == 0 {
            return Err(Error::InvalidConfig("queue sizes must be > 0".into()));
        }
        if self.recv_buffer_size < self.max_slice_size + crate::MAX_DATAGRAM_OVERHEAD {
            return Err(Error::InvalidConfig(format!(
                "recv_buffer_size {} cannot hold a full slice datagram",
                self.recv_buffer_size
            )));
        }
        Ok(())
    }

    /// 저지연 LAN용 설정
    pub fn low_latency() -> Self {
        Self {
            max_slice_size: 1200,
            retransmit_interval_ms: 50,
            max_retries: 20,
            tick_interval_ms: 5,
            receive_timeout_ms: 5_000,
            delivered_linger_ms: 2_000,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            max_slice_size: 512,              // 작은 슬라이스
            retransmit_interval_ms: 400,
            max_retries: 30,
            tick_interval_ms: 50,
            receive_timeout_ms: 30_000,
            delivered_linger_ms: 15_000,
            ..Self::default()
        }
    }
}
