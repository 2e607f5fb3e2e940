//! 슬라이스 정의와 분할/조립
//!
//! - Chunk: 데이터그램 하나에 담기지 않는 논리 데이터
//! - Slice: 데이터그램 하나 크기의 조각 (최대 256개)
//!
//! 와이어 형식 (big-endian):
//! `chunk_id:u8, slice_id:u8, num_slices:u8, [total_length:u16], data`
//!
//! `num_slices` 는 "슬라이스 수 - 1" 로 기록되고, `slice_id == num_slices` 인
//! 종단 슬라이스만 전체 길이를 가짐. 내부에서는 일반 개수(`slice_count`)를
//! 쓰고 변환은 이 모듈의 인코딩/디코딩에서만 함.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result, MAX_SLICES_PER_CHUNK};

/// 청크 ID (연결 내에서만 유효, 8비트)
pub type ChunkId = u8;

/// 슬라이스 ID (청크 내 인덱스, 8비트)
pub type SliceId = u8;

/// 슬라이스 헤더 크기: chunk_id + slice_id + num_slices
pub const SLICE_HEADER_SIZE: usize = 3;

/// 종단 슬라이스의 전체 길이 필드 크기
pub const TOTAL_LENGTH_SIZE: usize = 2;

/// 페이로드 길이에 필요한 슬라이스 수 계산
///
/// 빈 페이로드도 길이 0의 종단 슬라이스 하나를 가짐.
pub fn slice_count(payload_len: usize, max_slice_size: usize) -> Result<usize> {
    if max_slice_size == 0 {
        return Err(Error::InvalidConfig("max_slice_size must be > 0".into()));
    }

    let count = ((payload_len + max_slice_size - 1) / max_slice_size).max(1);
    if count > MAX_SLICES_PER_CHUNK {
        return Err(Error::InvalidSliceCount { count });
    }

    if payload_len > u16::MAX as usize {
        return Err(Error::PayloadTooLarge {
            len: payload_len,
            max: u16::MAX as usize,
        });
    }

    Ok(count)
}

/// 슬라이스 (송신 데이터그램 단위)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice {
    /// 청크 ID
    pub chunk_id: ChunkId,

    /// 청크 내 인덱스 (0부터)
    pub slice_id: SliceId,

    /// 청크의 총 슬라이스 수 (1 ~ 256)
    pub slice_count: usize,

    /// 전체 페이로드 길이 (종단 슬라이스만)
    pub total_length: Option<usize>,

    /// 실제 데이터
    pub data: Bytes,
}

impl Slice {
    /// 종단 슬라이스 여부
    pub fn is_terminal(&self) -> bool {
        self.slice_id as usize + 1 == self.slice_count
    }

    /// 와이어 크기 (바이트)
    pub fn wire_len(&self) -> usize {
        let length_field = if self.is_terminal() { TOTAL_LENGTH_SIZE } else { 0 };
        SLICE_HEADER_SIZE + length_field + self.data.len()
    }

    /// 버퍼에 와이어 형식으로 기록
    pub fn encode_into(&self, buf: &mut BytesMut, max_slice_size: usize) -> Result<()> {
        if self.data.len() > max_slice_size {
            return Err(Error::SliceTooLarge {
                len: self.data.len(),
                max: max_slice_size,
            });
        }
        if self.slice_count == 0 || self.slice_count > MAX_SLICES_PER_CHUNK {
            return Err(Error::InvalidSliceCount {
                count: self.slice_count,
            });
        }
        if self.slice_id as usize >= self.slice_count {
            return Err(Error::MalformedSlice(format!(
                "slice_id {} out of range for {} slices",
                self.slice_id, self.slice_count
            )));
        }

        let num_slices = (self.slice_count - 1) as u8;
        buf.reserve(self.wire_len());
        buf.put_u8(self.chunk_id);
        buf.put_u8(self.slice_id);
        buf.put_u8(num_slices);

        if self.is_terminal() {
            let total_length = self.total_length.ok_or_else(|| {
                Error::MalformedSlice("terminal slice without total length".into())
            })?;
            let total_length = u16::try_from(total_length).map_err(|_| Error::PayloadTooLarge {
                len: total_length,
                max: u16::MAX as usize,
            })?;
            buf.put_u16(total_length);
        } else if self.data.len() != max_slice_size {
            return Err(Error::MalformedSlice(format!(
                "non-terminal slice must carry exactly {} bytes, got {}",
                max_slice_size,
                self.data.len()
            )));
        }

        buf.put_slice(&self.data);
        Ok(())
    }

    /// 슬라이스를 바이트로 직렬화
    pub fn to_bytes(&self, max_slice_size: usize) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.encode_into(&mut buf, max_slice_size)?;
        Ok(buf.freeze())
    }

    /// 바이트에서 슬라이스 역직렬화
    ///
    /// 데이터 길이는 헤더에서 유도된 값과 정확히 같아야 함.
    pub fn from_bytes(bytes: &[u8], max_slice_size: usize) -> Result<Self> {
        if bytes.len() < SLICE_HEADER_SIZE {
            return Err(Error::MalformedSlice(format!(
                "truncated header: {} bytes",
                bytes.len()
            )));
        }

        let mut buf = bytes;
        let chunk_id = buf.get_u8();
        let slice_id = buf.get_u8();
        let num_slices = buf.get_u8();

        if slice_id > num_slices {
            return Err(Error::MalformedSlice(format!(
                "slice_id {} beyond num_slices {}",
                slice_id, num_slices
            )));
        }

        let slice_count = num_slices as usize + 1;
        let terminal = slice_id == num_slices;

        let (total_length, expected_len) = if terminal {
            if buf.remaining() < TOTAL_LENGTH_SIZE {
                return Err(Error::MalformedSlice("truncated total length".into()));
            }
            let total_length = buf.get_u16() as usize;
            let preceding = num_slices as usize * max_slice_size;
            if total_length < preceding || total_length - preceding > max_slice_size {
                return Err(Error::MalformedSlice(format!(
                    "total length {} inconsistent with {} slices",
                    total_length, slice_count
                )));
            }
            let expected_len = total_length - preceding;
            if expected_len == 0 && slice_count > 1 {
                return Err(Error::MalformedSlice("empty terminal slice".into()));
            }
            (Some(total_length), expected_len)
        } else {
            (None, max_slice_size)
        };

        if buf.remaining() != expected_len {
            return Err(Error::MalformedSlice(format!(
                "data length {} != expected {}",
                buf.remaining(),
                expected_len
            )));
        }

        Ok(Self {
            chunk_id,
            slice_id,
            slice_count,
            total_length,
            data: Bytes::copy_from_slice(buf),
        })
    }
}

/// 페이로드를 슬라이스들로 분할
pub fn split(chunk_id: ChunkId, payload: &Bytes, max_slice_size: usize) -> Result<Vec<Slice>> {
    let count = slice_count(payload.len(), max_slice_size)?;

    let slices = (0..count)
        .map(|idx| {
            let start = idx * max_slice_size;
            let end = (start + max_slice_size).min(payload.len());
            let terminal = idx + 1 == count;
            Slice {
                chunk_id,
                slice_id: idx as SliceId,
                slice_count: count,
                total_length: terminal.then_some(payload.len()),
                data: payload.slice(start..end),
            }
        })
        .collect();

    Ok(slices)
}

/// 슬라이스들을 원래 페이로드로 조립
///
/// `0..slice_count` 가 모두 있어야 하며 결과 길이는 `total_length` 와 같아야 함.
pub fn reassemble(
    slices: &BTreeMap<SliceId, Bytes>,
    slice_count: usize,
    total_length: usize,
) -> Result<Bytes> {
    let missing = (0..slice_count)
        .filter(|&id| !slices.contains_key(&(id as SliceId)))
        .count();
    if missing > 0 || slice_count == 0 {
        return Err(Error::IncompleteChunk {
            missing: missing.max(1),
        });
    }

    let mut buf = BytesMut::with_capacity(total_length);
    for (_, data) in slices.range(..=((slice_count - 1) as SliceId)) {
        buf.extend_from_slice(data);
    }

    if buf.len() != total_length {
        return Err(Error::MalformedSlice(format!(
            "reassembled {} bytes, expected {}",
            buf.len(),
            total_length
        )));
    }

    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
    }

    fn collect(slices: &[Slice]) -> BTreeMap<SliceId, Bytes> {
        slices.iter().map(|s| (s.slice_id, s.data.clone())).collect()
    }

    #[test]
    fn test_split_two_full_slices() {
        let data = payload(2048);
        let slices = split(7, &data, 1024).unwrap();

        assert_eq!(slices.len(), 2);

        let first = slices[0].to_bytes(1024).unwrap();
        assert_eq!(first.len(), 3 + 1024);
        assert_eq!(&first[..3], &[7, 0, 1]);
        assert_eq!(&first[3..], &data[..1024]);

        let last = slices[1].to_bytes(1024).unwrap();
        assert_eq!(last.len(), 3 + 2 + 1024);
        assert_eq!(&last[..3], &[7, 1, 1]);
        assert_eq!(u16::from_be_bytes([last[3], last[4]]), 2048);
        assert_eq!(&last[5..], &data[1024..]);
    }

    #[test]
    fn test_empty_payload_has_one_terminal_slice() {
        let slices = split(0, &Bytes::new(), 1024).unwrap();
        assert_eq!(slices.len(), 1);
        assert!(slices[0].is_terminal());

        let bytes = slices[0].to_bytes(1024).unwrap();
        assert_eq!(bytes.as_ref(), &[0, 0, 0, 0, 0]);

        let restored = Slice::from_bytes(&bytes, 1024).unwrap();
        assert_eq!(restored.total_length, Some(0));
        assert!(restored.data.is_empty());
    }

    #[test]
    fn test_too_many_slices() {
        let data = payload(257 * 10);
        assert!(matches!(
            split(0, &data, 10),
            Err(Error::InvalidSliceCount { count: 257 })
        ));

        // 정확히 256개는 허용
        let data = payload(256 * 10);
        assert_eq!(split(0, &data, 10).unwrap().len(), 256);
    }

    #[test]
    fn test_payload_exceeds_length_field() {
        let data = payload(u16::MAX as usize + 1);
        assert!(matches!(
            split(0, &data, 1024),
            Err(Error::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_slice_too_large_is_rejected() {
        let slice = Slice {
            chunk_id: 1,
            slice_id: 0,
            slice_count: 1,
            total_length: Some(20),
            data: payload(20),
        };
        assert!(matches!(
            slice.to_bytes(10),
            Err(Error::SliceTooLarge { len: 20, max: 10 })
        ));
    }

    #[test]
    fn test_roundtrip_various_lengths() {
        let max = 64;
        for len in [0, 1, 63, 64, 65, 128, 1000, 256 * 64] {
            let data = payload(len);
            let slices = split(3, &data, max).unwrap();

            let decoded: Vec<Slice> = slices
                .iter()
                .map(|s| Slice::from_bytes(&s.to_bytes(max).unwrap(), max).unwrap())
                .collect();
            assert_eq!(decoded, slices);

            let total = decoded.last().unwrap().total_length.unwrap();
            let out = reassemble(&collect(&decoded), decoded.len(), total).unwrap();
            assert_eq!(out, data, "len={}", len);
        }
    }

    #[test]
    fn test_reassemble_missing_slice() {
        let data = payload(300);
        let slices = split(0, &data, 100).unwrap();
        let mut map = collect(&slices);
        map.remove(&1);

        assert!(matches!(
            reassemble(&map, 3, 300),
            Err(Error::IncompleteChunk { missing: 1 })
        ));
    }

    #[test]
    fn test_malformed_slices() {
        // 헤더 부족
        assert!(Slice::from_bytes(&[1, 0], 100).is_err());

        // slice_id > num_slices
        assert!(Slice::from_bytes(&[1, 3, 2], 100).is_err());

        // 비종단 슬라이스 데이터 길이 불일치
        let mut short = vec![1, 0, 1];
        short.extend_from_slice(&[0u8; 50]);
        assert!(matches!(
            Slice::from_bytes(&short, 100),
            Err(Error::MalformedSlice(_))
        ));

        // 종단 슬라이스 길이 필드 누락
        assert!(Slice::from_bytes(&[1, 1, 1, 0], 100).is_err());

        // 전체 길이가 앞선 슬라이스들보다 작음
        assert!(Slice::from_bytes(&[1, 1, 1, 0, 50], 100).is_err());
    }
}
