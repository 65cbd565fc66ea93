//! Rapid resynchronisation request (RFC 6051 §3): asks the media sender to
//! emit a Sender Report immediately. Header-only RTPFB feedback, FMT 5.

use std::fmt;

use bytes::Buf;

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{Header, PacketType, FORMAT_RRR, HEADER_LENGTH, SSRC_LENGTH};

/// Fixed length field value: two SSRC words after the common header.
pub const RRR_LENGTH: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RapidResynchronizationRequest {
    /// SSRC of the sender of this feedback packet.
    pub sender_ssrc: u32,
    /// SSRC of the media source the request is addressed to.
    pub media_ssrc: u32,
}

impl RapidResynchronizationRequest {
    fn header(&self) -> Header {
        Header {
            padding: false,
            count: FORMAT_RRR,
            packet_type: PacketType::TransportSpecificFeedback,
            length: RRR_LENGTH,
        }
    }
}

impl fmt::Display for RapidResynchronizationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RapidResynchronizationRequest from {:#x} for {:#x}",
            self.sender_ssrc, self.media_ssrc,
        )
    }
}

impl MarshalSize for RapidResynchronizationRequest {
    fn marshal_size(&self) -> usize {
        HEADER_LENGTH + SSRC_LENGTH * 2
    }
}

impl Marshal for RapidResynchronizationRequest {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < self.marshal_size() {
            return Err(Error::ErrBufferTooSmall);
        }
        let n = self.header().marshal_to(buf)?;
        buf[n..n + 4].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        buf[n + 4..n + 8].copy_from_slice(&self.media_ssrc.to_be_bytes());
        Ok(n + 8)
    }
}

impl Unmarshal for RapidResynchronizationRequest {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = Header::unmarshal(raw_packet)?;
        if header.packet_type != PacketType::TransportSpecificFeedback {
            return Err(Error::WrongType);
        }
        if header.count != FORMAT_RRR {
            return Err(Error::WrongFeedbackType);
        }
        if raw_packet.remaining() < SSRC_LENGTH * 2 {
            return Err(Error::PacketTooShort);
        }
        Ok(RapidResynchronizationRequest {
            sender_ssrc: raw_packet.get_u32(),
            media_ssrc: raw_packet.get_u32(),
        })
    }
}
