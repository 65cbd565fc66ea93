//! Absolute send time header extension
//! (<http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time>).
//!
//! The value is a 24-bit fixed-point timestamp with 18 fractional bits,
//! i.e. 1 << 18 ticks per second, wrapping every 64 seconds.

use bytes::Buf;

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

/// Wire size of the extension value.
pub const ABS_SEND_TIME_EXTENSION_SIZE: usize = 3;
/// Number of fractional bits in the 6.18 fixed-point timestamp.
pub const ABS_SEND_TIME_FRACTION: u32 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AbsSendTimeExtension {
    /// 24-bit 6.18 fixed-point send time.
    pub timestamp: u32,
}

impl AbsSendTimeExtension {
    /// Converts a millisecond clock reading to the 24-bit wire value.
    pub fn from_ms(time_ms: i64) -> Self {
        let timestamp =
            ((((time_ms as u64) << ABS_SEND_TIME_FRACTION) + 500) / 1000) as u32 & 0x00FF_FFFF;
        Self { timestamp }
    }
}

impl MarshalSize for AbsSendTimeExtension {
    fn marshal_size(&self) -> usize {
        ABS_SEND_TIME_EXTENSION_SIZE
    }
}

impl Marshal for AbsSendTimeExtension {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < ABS_SEND_TIME_EXTENSION_SIZE {
            return Err(Error::ErrBufferTooSmall);
        }
        buf[0] = (self.timestamp >> 16) as u8;
        buf[1] = (self.timestamp >> 8) as u8;
        buf[2] = self.timestamp as u8;
        Ok(ABS_SEND_TIME_EXTENSION_SIZE)
    }
}

impl Unmarshal for AbsSendTimeExtension {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if raw_packet.remaining() < ABS_SEND_TIME_EXTENSION_SIZE {
            return Err(Error::ErrShortPacket);
        }
        let b0 = raw_packet.get_u8() as u32;
        let b1 = raw_packet.get_u8() as u32;
        let b2 = raw_packet.get_u8() as u32;
        Ok(AbsSendTimeExtension {
            timestamp: (b0 << 16) | (b1 << 8) | b2,
        })
    }
}
