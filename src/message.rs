//! 데이터그램 메시지 정의
//!
//! 슬라이스와 ACK가 같은 데이터그램 흐름을 공유하므로
//! 앞에 1바이트 패킷 종류를 붙임

use bytes::{BufMut, Bytes, BytesMut};

use crate::ack::{AckMessage, ACK_HEADER_SIZE};
use crate::slice::Slice;
use crate::{Error, Result};

/// 패킷 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// 데이터 슬라이스
    Slice = 1,

    /// 슬라이스 ACK
    SliceAck = 2,
}

impl TryFrom<u8> for PacketKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PacketKind::Slice),
            2 => Ok(PacketKind::SliceAck),
            other => Err(Error::UnknownPacketKind(other)),
        }
    }
}

/// 통합 패킷 enum
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Slice(Slice),
    Ack(AckMessage),
}

impl Packet {
    /// 패킷 종류 반환
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Slice(_) => PacketKind::Slice,
            Packet::Ack(_) => PacketKind::SliceAck,
        }
    }

    /// 데이터그램으로 직렬화
    pub fn to_bytes(&self, max_slice_size: usize) -> Result<Bytes> {
        let capacity = match self {
            Packet::Slice(slice) => 1 + slice.wire_len(),
            Packet::Ack(ack) => 1 + ACK_HEADER_SIZE + ack.flag_len(),
        };

        let mut buf = BytesMut::with_capacity(capacity);
        buf.put_u8(self.kind() as u8);
        match self {
            Packet::Slice(slice) => slice.encode_into(&mut buf, max_slice_size)?,
            Packet::Ack(ack) => ack.encode_into(&mut buf)?,
        }
        Ok(buf.freeze())
    }

    /// 데이터그램에서 역직렬화
    pub fn from_bytes(bytes: &[u8], max_slice_size: usize) -> Result<Self> {
        let (&kind, body) = bytes
            .split_first()
            .ok_or_else(|| Error::MalformedSlice("empty datagram".into()))?;

        match PacketKind::try_from(kind)? {
            PacketKind::Slice => Ok(Packet::Slice(Slice::from_bytes(body, max_slice_size)?)),
            PacketKind::SliceAck => Ok(Packet::Ack(AckMessage::from_bytes(body)?)),
        }
    }
}
