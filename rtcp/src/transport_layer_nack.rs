//! Transport-layer NACK feedback packet (RFC 4585 §6.2.1).

use std::fmt;

use bytes::Buf;

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{Header, PacketType, FORMAT_TLN, HEADER_LENGTH, SSRC_LENGTH};

/// Wire size of one NACK item: packet id + lost packet bitmask.
pub const NACK_PAIR_LENGTH: usize = 4;

/// One generic NACK item: a packet id and a bitmask of the 16 sequence
/// numbers immediately following it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NackPair {
    pub packet_id: u16,
    pub lost_packets: u16,
}

impl NackPair {
    pub fn new(packet_id: u16, lost_packets: u16) -> Self {
        Self {
            packet_id,
            lost_packets,
        }
    }

    /// Expands the pair into the list of missing sequence numbers.
    pub fn packet_list(&self) -> Vec<u16> {
        let mut seqs = vec![self.packet_id];
        for i in 0..16u16 {
            if (self.lost_packets >> i) & 0x1 == 1 {
                seqs.push(self.packet_id.wrapping_add(i + 1));
            }
        }
        seqs
    }
}

/// Builds a compact list of [`NackPair`]s from missing sequence numbers.
///
/// The input is expected in ascending (wrapping) order, as produced by a
/// receive log.
pub fn nack_pairs_from_sequence_numbers(seqs: &[u16]) -> Vec<NackPair> {
    let mut pairs: Vec<NackPair> = vec![];
    for &seq in seqs {
        match pairs.last_mut() {
            Some(pair) if seq.wrapping_sub(pair.packet_id) <= 16 && seq != pair.packet_id => {
                pair.lost_packets |= 1 << (seq.wrapping_sub(pair.packet_id) - 1);
            }
            _ => pairs.push(NackPair::new(seq, 0)),
        }
    }
    pairs
}

/// RTCP transport-layer NACK carrying one or more [`NackPair`] items.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportLayerNack {
    /// SSRC of the sender of this feedback packet.
    pub sender_ssrc: u32,
    /// SSRC of the media source the feedback relates to.
    pub media_ssrc: u32,
    pub nacks: Vec<NackPair>,
}

impl TransportLayerNack {
    fn header(&self) -> Header {
        Header {
            padding: false,
            count: FORMAT_TLN,
            packet_type: PacketType::TransportSpecificFeedback,
            length: ((self.marshal_size() / 4) - 1) as u16,
        }
    }
}

impl fmt::Display for TransportLayerNack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TransportLayerNack from {:#x} for {:#x}: {} item(s)",
            self.sender_ssrc,
            self.media_ssrc,
            self.nacks.len(),
        )
    }
}

impl MarshalSize for TransportLayerNack {
    fn marshal_size(&self) -> usize {
        HEADER_LENGTH + SSRC_LENGTH * 2 + self.nacks.len() * NACK_PAIR_LENGTH
    }
}

impl Marshal for TransportLayerNack {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < self.marshal_size() {
            return Err(Error::ErrBufferTooSmall);
        }
        let mut n = self.header().marshal_to(buf)?;
        buf[n..n + 4].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        buf[n + 4..n + 8].copy_from_slice(&self.media_ssrc.to_be_bytes());
        n += 8;
        for nack in &self.nacks {
            buf[n..n + 2].copy_from_slice(&nack.packet_id.to_be_bytes());
            buf[n + 2..n + 4].copy_from_slice(&nack.lost_packets.to_be_bytes());
            n += NACK_PAIR_LENGTH;
        }
        Ok(n)
    }
}

impl Unmarshal for TransportLayerNack {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = Header::unmarshal(raw_packet)?;
        if header.packet_type != PacketType::TransportSpecificFeedback {
            return Err(Error::WrongType);
        }
        if header.count != FORMAT_TLN {
            return Err(Error::WrongFeedbackType);
        }
        if raw_packet.remaining() < SSRC_LENGTH * 2 {
            return Err(Error::PacketTooShort);
        }
        let sender_ssrc = raw_packet.get_u32();
        let media_ssrc = raw_packet.get_u32();

        let mut nacks = vec![];
        while raw_packet.remaining() >= NACK_PAIR_LENGTH {
            nacks.push(NackPair {
                packet_id: raw_packet.get_u16(),
                lost_packets: raw_packet.get_u16(),
            });
        }
        Ok(TransportLayerNack {
            sender_ssrc,
            media_ssrc,
            nacks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_nack_item_bitmask() {
        // pid=100, bitmask=0b101: BLP bit i marks pid+i+1 (RFC 4585
        // §6.2.1), so packets 100, 101 and 103 are missing.
        let pair = NackPair::new(0x0064, 0x0005);
        assert_eq!(pair.packet_list(), vec![100, 101, 103]);
    }

    #[test]
    fn test_unmarshal() {
        let raw = Bytes::from_static(&[
            0x81, 0xcd, 0x00, 0x03, 0x90, 0x2f, 0x9e, 0x2e, 0x90, 0x2f, 0x9e, 0x2e, 0x00, 0x64,
            0x00, 0x05,
        ]);
        let mut buf = raw.clone();
        let nack = TransportLayerNack::unmarshal(&mut buf).unwrap();

        assert_eq!(nack.sender_ssrc, 0x902f9e2e);
        assert_eq!(nack.media_ssrc, 0x902f9e2e);
        assert_eq!(nack.nacks, vec![NackPair::new(100, 0b101)]);
    }

    #[test]
    fn test_roundtrip() {
        let nack = TransportLayerNack {
            sender_ssrc: 0x902f9e2e,
            media_ssrc: 0xCAFEBABE,
            nacks: vec![NackPair::new(1, 0xAA), NackPair::new(1034, 0x05)],
        };

        let raw = nack.marshal().unwrap();
        assert_eq!(raw.len(), nack.marshal_size());
        // Length field is the word count minus one.
        assert_eq!(u16::from_be_bytes([raw[2], raw[3]]), (raw.len() / 4 - 1) as u16);

        let mut buf = raw.freeze();
        assert_eq!(TransportLayerNack::unmarshal(&mut buf).unwrap(), nack);
    }

    #[test]
    fn test_unmarshal_wrong_type() {
        // PSFB instead of RTPFB.
        let raw = Bytes::from_static(&[
            0x81, 0xce, 0x00, 0x02, 0x90, 0x2f, 0x9e, 0x2e, 0x90, 0x2f, 0x9e, 0x2e,
        ]);
        let mut buf = raw.clone();
        assert_eq!(TransportLayerNack::unmarshal(&mut buf), Err(Error::WrongType));
    }

    #[test]
    fn test_unmarshal_item_requires_four_bytes() {
        // Truncated trailing item is ignored; valid prefix still parses.
        let raw = Bytes::from_static(&[
            0x81, 0xcd, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x64,
        ]);
        let mut buf = raw.clone();
        let nack = TransportLayerNack::unmarshal(&mut buf).unwrap();
        assert!(nack.nacks.is_empty());
    }

    #[test]
    fn test_pairs_from_sequence_numbers() {
        let pairs = nack_pairs_from_sequence_numbers(&[42, 43, 44, 60, 62]);
        assert_eq!(
            pairs,
            vec![NackPair::new(42, 0b11), NackPair::new(60, 0b10)]
        );

        let expanded: Vec<u16> = pairs.iter().flat_map(|p| p.packet_list()).collect();
        assert_eq!(expanded, vec![42, 43, 44, 60, 62]);
    }

    #[test]
    fn test_pairs_from_sequence_numbers_wraparound() {
        let pairs = nack_pairs_from_sequence_numbers(&[65534, 65535, 0, 1]);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].packet_list(), vec![65534, 65535, 0, 1]);
    }
}
