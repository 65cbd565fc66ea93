//! RTP fixed header and RFC 8285 one-byte header extensions (RFC 3550 §5.1).

use bytes::{Buf, Bytes};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

/// Size of the fixed part of the RTP header.
pub const FIXED_HEADER_SIZE: usize = 12;
/// Size of one CSRC entry.
pub const CSRC_LENGTH: usize = 4;
/// Profile identifying RFC 8285 one-byte extension headers.
pub const EXTENSION_PROFILE_ONE_BYTE: u16 = 0xBEDE;

const VERSION_SHIFT: u8 = 6;
const VERSION_MASK: u8 = 0x3;
const PADDING_SHIFT: u8 = 5;
const EXTENSION_SHIFT: u8 = 4;
const CC_MASK: u8 = 0xF;
const MARKER_SHIFT: u8 = 7;
const PT_MASK: u8 = 0x7F;
const EXTENSION_ID_RESERVED: u8 = 0xF;

/// One parsed header extension element.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Extension {
    pub id: u8,
    pub payload: Bytes,
}

/// Parsed RTP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    pub extension_profile: u16,
    pub extensions: Vec<Extension>,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            version: 2,
            padding: false,
            extension: false,
            marker: false,
            payload_type: 0,
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0,
            csrc: vec![],
            extension_profile: 0,
            extensions: vec![],
        }
    }
}

impl Header {
    /// Returns the payload of the extension with the given id, if present.
    pub fn get_extension(&self, id: u8) -> Option<Bytes> {
        if !self.extension {
            return None;
        }
        self.extensions
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.payload.clone())
    }

    /// Sets (or replaces) a one-byte profile extension element.
    pub fn set_extension(&mut self, id: u8, payload: Bytes) -> Result<()> {
        if !(1..=14).contains(&id) {
            return Err(Error::ErrRfc8285OneByteHeaderIdRange);
        }
        if payload.is_empty() || payload.len() > 16 {
            return Err(Error::ErrRfc8285OneByteHeaderSize);
        }

        self.extension = true;
        self.extension_profile = EXTENSION_PROFILE_ONE_BYTE;
        if let Some(e) = self.extensions.iter_mut().find(|e| e.id == id) {
            e.payload = payload;
        } else {
            self.extensions.push(Extension { id, payload });
        }
        Ok(())
    }

    fn extension_payload_size(&self) -> usize {
        match self.extension_profile {
            EXTENSION_PROFILE_ONE_BYTE => {
                let raw: usize = self
                    .extensions
                    .iter()
                    .map(|e| 1 + e.payload.len())
                    .sum();
                (raw + 3) / 4 * 4
            }
            _ => self
                .extensions
                .first()
                .map_or(0, |e| (e.payload.len() + 3) / 4 * 4),
        }
    }
}

impl MarshalSize for Header {
    fn marshal_size(&self) -> usize {
        let mut size = FIXED_HEADER_SIZE + self.csrc.len() * CSRC_LENGTH;
        if self.extension {
            size += 4 + self.extension_payload_size();
        }
        size
    }
}

impl Marshal for Header {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.len() < size {
            return Err(Error::ErrBufferTooSmall);
        }

        buf[0] = (self.version << VERSION_SHIFT)
            | ((self.padding as u8) << PADDING_SHIFT)
            | ((self.extension as u8) << EXTENSION_SHIFT)
            | self.csrc.len() as u8;
        buf[1] = ((self.marker as u8) << MARKER_SHIFT) | (self.payload_type & PT_MASK);
        buf[2..4].copy_from_slice(&self.sequence_number.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        let mut n = FIXED_HEADER_SIZE;
        for csrc in &self.csrc {
            buf[n..n + 4].copy_from_slice(&csrc.to_be_bytes());
            n += 4;
        }

        if self.extension {
            let payload_size = self.extension_payload_size();
            buf[n..n + 2].copy_from_slice(&self.extension_profile.to_be_bytes());
            buf[n + 2..n + 4].copy_from_slice(&((payload_size / 4) as u16).to_be_bytes());
            n += 4;

            let start = n;
            match self.extension_profile {
                EXTENSION_PROFILE_ONE_BYTE => {
                    for e in &self.extensions {
                        buf[n] = (e.id << 4) | (e.payload.len() as u8 - 1);
                        n += 1;
                        buf[n..n + e.payload.len()].copy_from_slice(&e.payload);
                        n += e.payload.len();
                    }
                }
                _ => {
                    if let Some(e) = self.extensions.first() {
                        buf[n..n + e.payload.len()].copy_from_slice(&e.payload);
                        n += e.payload.len();
                    }
                }
            }
            while n < start + payload_size {
                buf[n] = 0;
                n += 1;
            }
        }

        Ok(n)
    }
}

impl Unmarshal for Header {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if raw_packet.remaining() < FIXED_HEADER_SIZE {
            return Err(Error::ErrShortPacket);
        }

        let b0 = raw_packet.get_u8();
        let version = (b0 >> VERSION_SHIFT) & VERSION_MASK;
        if version != 2 {
            return Err(Error::ErrBadVersion);
        }
        let padding = (b0 >> PADDING_SHIFT) & 0x1 == 1;
        let extension = (b0 >> EXTENSION_SHIFT) & 0x1 == 1;
        let cc = (b0 & CC_MASK) as usize;

        let b1 = raw_packet.get_u8();
        let marker = (b1 >> MARKER_SHIFT) & 0x1 == 1;
        let payload_type = b1 & PT_MASK;

        let sequence_number = raw_packet.get_u16();
        let timestamp = raw_packet.get_u32();
        let ssrc = raw_packet.get_u32();

        if raw_packet.remaining() < cc * CSRC_LENGTH {
            return Err(Error::ErrShortPacket);
        }
        let csrc: Vec<u32> = (0..cc).map(|_| raw_packet.get_u32()).collect();

        let mut extension_profile = 0u16;
        let mut extensions = vec![];
        if extension {
            if raw_packet.remaining() < 4 {
                return Err(Error::ErrHeaderSizeInsufficientForExtension);
            }
            extension_profile = raw_packet.get_u16();
            let extension_length = raw_packet.get_u16() as usize * 4;
            if raw_packet.remaining() < extension_length {
                return Err(Error::ErrHeaderSizeInsufficientForExtension);
            }

            match extension_profile {
                EXTENSION_PROFILE_ONE_BYTE => {
                    let mut remaining = extension_length;
                    while remaining > 0 {
                        let b = raw_packet.get_u8();
                        remaining -= 1;
                        if b == 0 {
                            // Alignment padding.
                            continue;
                        }
                        let id = b >> 4;
                        let len = (b & 0xF) as usize + 1;
                        if id == EXTENSION_ID_RESERVED {
                            raw_packet.advance(remaining);
                            break;
                        }
                        if remaining < len {
                            return Err(Error::ErrHeaderSizeInsufficientForExtension);
                        }
                        let payload = raw_packet.copy_to_bytes(len);
                        remaining -= len;
                        extensions.push(Extension { id, payload });
                    }
                }
                _ => {
                    // Legacy RFC 3550 profile-specific extension, kept opaque.
                    let payload = raw_packet.copy_to_bytes(extension_length);
                    extensions.push(Extension { id: 0, payload });
                }
            }
        }

        Ok(Header {
            version,
            padding,
            extension,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension_profile,
            extensions,
        })
    }
}
