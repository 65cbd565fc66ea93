//! RTP packet: parsed header plus payload view.

use std::fmt;

use bytes::{Buf, Bytes};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::Header;

/// A parsed RTP packet. The payload is a view into the arrival buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RTP PACKET [ssrc:{:#x}, pt:{}, seq:{}, ts:{}, size:{}]",
            self.header.ssrc,
            self.header.payload_type,
            self.header.sequence_number,
            self.header.timestamp,
            self.payload.len(),
        )
    }
}

impl MarshalSize for Packet {
    fn marshal_size(&self) -> usize {
        self.header.marshal_size() + self.payload.len()
    }
}

impl Marshal for Packet {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < self.marshal_size() {
            return Err(Error::ErrBufferTooSmall);
        }
        let n = self.header.marshal_to(buf)?;
        buf[n..n + self.payload.len()].copy_from_slice(&self.payload);
        Ok(n + self.payload.len())
    }
}

impl Unmarshal for Packet {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = Header::unmarshal(raw_packet)?;
        let mut payload = raw_packet.copy_to_bytes(raw_packet.remaining());
        if header.padding {
            if payload.is_empty() {
                return Err(Error::ErrShortPacket);
            }
            let padding_len = payload[payload.len() - 1] as usize;
            if padding_len == 0 || padding_len > payload.len() {
                return Err(Error::ErrShortPacket);
            }
            payload = payload.slice(..payload.len() - padding_len);
        }
        Ok(Packet { header, payload })
    }
}
