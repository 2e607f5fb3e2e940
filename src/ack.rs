//! 슬라이스 ACK 추적
//!
//! 와이어 형식: `chunk_id:u8, num_slices_minus_one:u8, flags:[u8; ceil(n/8)]`

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::bitflag::{self, FLAG_BITS};
use crate::slice::{ChunkId, SliceId};
use crate::{Error, Result, MAX_SLICES_PER_CHUNK};

/// ACK 헤더 크기: chunk_id + num_slices_minus_one
pub const ACK_HEADER_SIZE: usize = 2;

/// 슬라이스 ACK 메시지
///
/// 수신측이 현재까지 받은 슬라이스를 비트맵으로 알려줌
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMessage {
    /// 청크 ID
    pub chunk_id: ChunkId,

    /// 청크의 총 슬라이스 수 (1 ~ 256)
    pub slice_count: usize,

    /// 슬라이스별 수신 여부
    /// 항상 MAX_SLICES_PER_CHUNK 길이
    received: Vec<bool>,
}

impl AckMessage {
    /// 수신 여부 목록으로 ACK 생성
    pub fn build(chunk_id: ChunkId, slice_count: usize, acked: &[bool]) -> Self {
        let mut received = vec![false; MAX_SLICES_PER_CHUNK];
        for (slot, &flag) in received.iter_mut().zip(acked.iter().take(slice_count)) {
            *slot = flag;
        }

        Self {
            chunk_id,
            slice_count,
            received,
        }
    }

    /// 슬라이스 수신 여부
    pub fn is_received(&self, slice_id: SliceId) -> bool {
        (slice_id as usize) < self.slice_count && self.received[slice_id as usize]
    }

    /// 수신 비트맵 (`0..slice_count` 범위)
    pub fn received(&self) -> &[bool] {
        &self.received[..self.slice_count.min(MAX_SLICES_PER_CHUNK)]
    }

    /// 모든 슬라이스가 수신되었는지
    pub fn is_complete(&self) -> bool {
        self.received().iter().all(|&r| r)
    }

    /// 플래그 바이트 수
    pub fn flag_len(&self) -> usize {
        bitflag::flag_bytes(self.slice_count)
    }

    /// 버퍼에 와이어 형식으로 기록
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        if self.slice_count == 0 || self.slice_count > MAX_SLICES_PER_CHUNK {
            return Err(Error::InvalidSliceCount {
                count: self.slice_count,
            });
        }

        let last_index = self.slice_count - 1;
        buf.reserve(ACK_HEADER_SIZE + self.flag_len());
        buf.put_u8(self.chunk_id);
        buf.put_u8(last_index as u8);

        // 최소 한 바이트는 항상 기록됨
        let mut window_start = 0;
        while window_start <= last_index {
            buf.put_u8(bitflag::encode(
                self.received(),
                window_start,
                window_start + FLAG_BITS,
            ));
            window_start += FLAG_BITS;
        }

        Ok(())
    }

    /// ACK를 바이트로 직렬화
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(ACK_HEADER_SIZE + self.flag_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// 바이트에서 ACK 역직렬화
    ///
    /// 비트맵은 선언된 슬라이스 수가 아니라 최대치로 할당함.
    /// 플래그 뒤에 남는 바이트는 무시.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ACK_HEADER_SIZE {
            return Err(Error::MalformedAck(format!(
                "truncated header: {} bytes",
                bytes.len()
            )));
        }

        let mut buf = bytes;
        let chunk_id = buf.get_u8();
        let last_index = buf.get_u8() as usize;
        let slice_count = last_index + 1;

        let mut received = vec![false; MAX_SLICES_PER_CHUNK];
        let mut window_start = 0;
        while window_start <= last_index {
            if !buf.has_remaining() {
                return Err(Error::MalformedAck(format!(
                    "truncated flags at slice {} of {}",
                    window_start, slice_count
                )));
            }
            let flag = buf.get_u8();
            bitflag::decode(flag, window_start, window_start + FLAG_BITS, &mut received);
            window_start += FLAG_BITS;
        }

        // 선언된 범위 밖 비트는 버림
        for slot in received.iter_mut().skip(slice_count) {
            *slot = false;
        }

        Ok(Self {
            chunk_id,
            slice_count,
            received,
        })
    }
}

/// 슬라이스별 확인 집합
///
/// 수신측에서는 "받음", 송신측에서는 "상대가 확인함" 을 의미
#[derive(Debug, Clone)]
pub struct AckSet {
    flags: Vec<bool>,
    count: usize,
}

impl AckSet {
    pub fn new(slice_count: usize) -> Self {
        Self {
            flags: vec![false; slice_count],
            count: 0,
        }
    }

    /// 총 슬라이스 수
    pub fn slice_count(&self) -> usize {
        self.flags.len()
    }

    /// 확인된 슬라이스 수
    pub fn acked_count(&self) -> usize {
        self.count
    }

    pub fn is_acked(&self, slice_id: SliceId) -> bool {
        self.flags.get(slice_id as usize).copied().unwrap_or(false)
    }

    /// 슬라이스 확인 표시, 새로 표시되었으면 true
    pub fn mark(&mut self, slice_id: SliceId) -> bool {
        match self.flags.get_mut(slice_id as usize) {
            Some(flag) if !*flag => {
                *flag = true;
                self.count += 1;
                true
            }
            _ => false,
        }
    }

    /// ACK 메시지를 누적 적용, 새로 확인된 슬라이스 수 반환
    ///
    /// 이미 true인 비트는 절대 지우지 않음
    pub fn merge(&mut self, ack: &AckMessage) -> usize {
        let mut newly = 0;
        for (idx, &received) in ack.received().iter().enumerate() {
            if received && self.mark(idx as SliceId) {
                newly += 1;
            }
        }
        newly
    }

    /// 모든 슬라이스가 확인되었는지
    pub fn is_complete(&self) -> bool {
        self.count == self.flags.len()
    }

    /// 미확인 슬라이스 ID 목록
    pub fn missing(&self) -> Vec<SliceId> {
        self.flags
            .iter()
            .enumerate()
            .filter(|(_, &acked)| !acked)
            .map(|(id, _)| id as SliceId)
            .collect()
    }

    /// 현재 상태로 ACK 메시지 생성
    pub fn to_ack(&self, chunk_id: ChunkId) -> AckMessage {
        AckMessage::build(chunk_id, self.flags.len(), &self.flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_slice_ack_has_one_flag_byte() {
        let ack = AckMessage::build(4, 1, &[true]);
        let bytes = ack.to_bytes().unwrap();
        assert_eq!(bytes.as_ref(), &[4, 0, 0b0000_0001]);
    }

    #[test]
    fn test_ten_slices_use_two_flag_bytes() {
        let mut acked = vec![false; 10];
        acked[0] = true;
        acked[9] = true;
        let ack = AckMessage::build(1, 10, &acked);
        let bytes = ack.to_bytes().unwrap();

        assert_eq!(bytes.len(), ACK_HEADER_SIZE + 2);
        assert_eq!(bytes[1], 9);
        assert_eq!(bytes[2], 0b0000_0001);
        assert_eq!(bytes[3], 0b0000_0010);
    }

    #[test]
    fn test_parse_ack() {
        let ack = AckMessage::from_bytes(&[9, 2, 0b0000_0101]).unwrap();
        assert_eq!(ack.chunk_id, 9);
        assert_eq!(ack.slice_count, 3);
        assert_eq!(ack.received(), &[true, false, true]);
        assert!(!ack.is_complete());
    }

    #[test]
    fn test_parse_ignores_bits_past_slice_count() {
        let ack = AckMessage::from_bytes(&[0, 1, 0xFF]).unwrap();
        assert_eq!(ack.received(), &[true, true]);
        assert!(ack.is_complete());
        assert!(!ack.is_received(2));
    }

    #[test]
    fn test_truncated_ack() {
        assert!(matches!(
            AckMessage::from_bytes(&[0]),
            Err(Error::MalformedAck(_))
        ));
        // 10개 슬라이스인데 플래그 1바이트만 있음
        assert!(matches!(
            AckMessage::from_bytes(&[0, 9, 0xFF]),
            Err(Error::MalformedAck(_))
        ));
    }

    #[test]
    fn test_full_range_ack() {
        let acked: Vec<bool> = (0..256).map(|i| i % 3 == 0).collect();
        let ack = AckMessage::build(2, 256, &acked);
        let bytes = ack.to_bytes().unwrap();
        assert_eq!(bytes.len(), ACK_HEADER_SIZE + 32);

        let parsed = AckMessage::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.received(), acked.as_slice());
    }

    #[test]
    fn test_ack_set_merge_accumulates() {
        let mut set = AckSet::new(3);
        assert_eq!(set.merge(&AckMessage::build(0, 3, &[true, false, false])), 1);
        assert_eq!(set.merge(&AckMessage::build(0, 3, &[false, false, true])), 1);
        // 이전 ACK의 비트가 지워지지 않음
        assert!(set.is_acked(0));
        assert_eq!(set.missing(), vec![1]);
        assert!(!set.is_complete());

        // 같은 ACK 재적용은 변화 없음
        assert_eq!(set.merge(&AckMessage::build(0, 3, &[true, false, true])), 0);

        set.mark(1);
        assert!(set.is_complete());
    }

    #[test]
    fn test_ack_set_mark_idempotent() {
        let mut set = AckSet::new(2);
        assert!(set.mark(1));
        assert!(!set.mark(1));
        assert!(!set.mark(5));
        assert_eq!(set.acked_count(), 1);
    }
}
