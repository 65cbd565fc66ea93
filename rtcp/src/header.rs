//! RTCP common header (RFC 3550 §6.4.1).

use bytes::Buf;

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

/// Size of the common header.
pub const HEADER_LENGTH: usize = 4;
/// Size of one SSRC field.
pub const SSRC_LENGTH: usize = 4;

pub const RTP_VERSION: u8 = 2;

/// Transport-layer NACK (RFC 4585 §6.2.1), FMT under RTPFB.
pub const FORMAT_TLN: u8 = 1;
/// Rapid resynchronisation request (RFC 6051 §3), FMT under RTPFB.
pub const FORMAT_RRR: u8 = 5;

const VERSION_SHIFT: u8 = 6;
const VERSION_MASK: u8 = 0x3;
const PADDING_SHIFT: u8 = 5;
const COUNT_MASK: u8 = 0x1F;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketType {
    #[default]
    Unsupported = 0,
    /// RTPFB
    TransportSpecificFeedback = 205,
    /// PSFB
    PayloadSpecificFeedback = 206,
}

impl From<u8> for PacketType {
    fn from(b: u8) -> Self {
        match b {
            205 => PacketType::TransportSpecificFeedback,
            206 => PacketType::PayloadSpecificFeedback,
            _ => PacketType::Unsupported,
        }
    }
}

/// The common first four bytes of every RTCP packet.
///
/// For feedback packets the count field carries the feedback message type
/// (FMT). The length is the packet size in 32-bit words minus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub padding: bool,
    pub count: u8,
    pub packet_type: PacketType,
    pub length: u16,
}

impl MarshalSize for Header {
    fn marshal_size(&self) -> usize {
        HEADER_LENGTH
    }
}

impl Marshal for Header {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < HEADER_LENGTH {
            return Err(Error::ErrBufferTooSmall);
        }
        buf[0] = (RTP_VERSION << VERSION_SHIFT)
            | ((self.padding as u8) << PADDING_SHIFT)
            | (self.count & COUNT_MASK);
        buf[1] = self.packet_type as u8;
        buf[2..4].copy_from_slice(&self.length.to_be_bytes());
        Ok(HEADER_LENGTH)
    }
}

impl Unmarshal for Header {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if raw_packet.remaining() < HEADER_LENGTH {
            return Err(Error::PacketTooShort);
        }
        let b0 = raw_packet.get_u8();
        let version = (b0 >> VERSION_SHIFT) & VERSION_MASK;
        if version != RTP_VERSION {
            return Err(Error::ErrBadVersion);
        }
        let padding = (b0 >> PADDING_SHIFT) & 0x1 == 1;
        let count = b0 & COUNT_MASK;
        let packet_type = PacketType::from(raw_packet.get_u8());
        let length = raw_packet.get_u16();
        Ok(Header {
            padding,
            count,
            packet_type,
            length,
        })
    }
}
