//! 전송 통계

use std::time::{Duration, Instant};

/// 연결별 청크 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 전송 요청된 청크 수
    pub chunks_sent: u64,

    /// 모든 슬라이스가 확인된 청크 수
    pub chunks_completed: u64,

    /// 재전송 한도를 넘겨 실패한 청크 수
    pub chunks_failed: u64,

    /// 중단된 청크 수 (송신 + 수신)
    pub chunks_abandoned: u64,

    /// 전송한 슬라이스 수 (재전송 포함)
    pub slices_sent: u64,

    /// 재전송 슬라이스 수
    pub slices_retransmitted: u64,

    /// 전송 바이트 (데이터그램 기준)
    pub bytes_sent: u64,

    /// 수신한 새 슬라이스 수
    pub slices_received: u64,

    /// 중복 수신 슬라이스 수
    pub duplicate_slices: u64,

    /// 보낸 ACK 수
    pub acks_sent: u64,

    /// 받은 ACK 수
    pub acks_received: u64,

    /// 상위로 전달된 청크 수
    pub chunks_delivered: u64,

    /// 상위로 전달된 바이트
    pub bytes_delivered: u64,

    /// 버려진 손상 패킷 수
    pub malformed_dropped: u64,

    /// 마지막 ACK 수신 시간
    pub last_ack_time: Option<Instant>,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            chunks_sent: 0,
            chunks_completed: 0,
            chunks_failed: 0,
            chunks_abandoned: 0,
            slices_sent: 0,
            slices_retransmitted: 0,
            bytes_sent: 0,
            slices_received: 0,
            duplicate_slices: 0,
            acks_sent: 0,
            acks_received: 0,
            chunks_delivered: 0,
            bytes_delivered: 0,
            malformed_dropped: 0,
            last_ack_time: None,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 재전송 비율 (재전송 슬라이스 / 전체 슬라이스)
    pub fn retransmit_ratio(&self) -> f64 {
        if self.slices_sent == 0 {
            return 0.0;
        }
        self.slices_retransmitted as f64 / self.slices_sent as f64
    }

    /// 중복 수신 비율
    pub fn duplicate_ratio(&self) -> f64 {
        let total = self.slices_received + self.duplicate_slices;
        if total == 0 {
            return 0.0;
        }
        self.duplicate_slices as f64 / total as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Chunks: {}/{} sent ({} failed) | Delivered: {} ({} bytes) | Slices: {} sent, {} retx ({:.1}%) | Acks: {}/{} | Malformed: {}",
            self.elapsed().as_secs_f64(),
            self.chunks_completed,
            self.chunks_sent,
            self.chunks_failed,
            self.chunks_delivered,
            self.bytes_delivered,
            self.slices_sent,
            self.slices_retransmitted,
            self.retransmit_ratio() * 100.0,
            self.acks_sent,
            self.acks_received,
            self.malformed_dropped,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}
