//! Worker-side receiver object for one inbound RTP stream.

use serde_json::{json, Value};

use rtcp::{nack_pairs_from_sequence_numbers, RapidResynchronizationRequest, TransportLayerNack};

use crate::rtp_parameters::RtpParameters;

pub struct RtpReceiver {
    pub id: u32,
    pub parameters: RtpParameters,
}

impl RtpReceiver {
    pub fn new(id: u32, parameters: RtpParameters) -> Self {
        Self { id, parameters }
    }

    /// Builds a NACK feedback packet for the given missing sequence numbers.
    /// Returns `None` when the stream has no declared media SSRC to address
    /// or nothing is missing.
    pub fn nack_feedback(
        &self,
        sender_ssrc: u32,
        missing_seq_numbers: &[u16],
    ) -> Option<TransportLayerNack> {
        if missing_seq_numbers.is_empty() {
            return None;
        }
        let media_ssrc = self.parameters.media_ssrc()?;
        Some(TransportLayerNack {
            sender_ssrc,
            media_ssrc,
            nacks: nack_pairs_from_sequence_numbers(missing_seq_numbers),
        })
    }

    /// Builds a request for an immediate Sender Report from the remote.
    pub fn sr_request(&self, sender_ssrc: u32) -> Option<RapidResynchronizationRequest> {
        let media_ssrc = self.parameters.media_ssrc()?;
        Some(RapidResynchronizationRequest {
            sender_ssrc,
            media_ssrc,
        })
    }

    pub fn to_json(&self) -> Value {
        json!({
            "rtpReceiverId": self.id,
            "rtpParameters": serde_json::to_value(&self.parameters).unwrap_or(Value::Null),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp_parameters::{RtpCodecParameters, RtpEncodingParameters};

    fn receiver_with_ssrc(ssrc: u32) -> RtpReceiver {
        RtpReceiver::new(
            1,
            RtpParameters {
                codecs: vec![RtpCodecParameters {
                    name: "VP8".into(),
                    payload_type: 96,
                    clock_rate: 90000,
                }],
                encodings: vec![RtpEncodingParameters {
                    ssrc,
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_nack_feedback_addresses_media_ssrc() {
        let receiver = receiver_with_ssrc(0xCAFEBABE);
        let nack = receiver.nack_feedback(7, &[100, 102, 104]).unwrap();
        assert_eq!(nack.sender_ssrc, 7);
        assert_eq!(nack.media_ssrc, 0xCAFEBABE);
        assert_eq!(nack.nacks.len(), 1);
        assert_eq!(nack.nacks[0].packet_list(), vec![100, 102, 104]);
    }

    #[test]
    fn test_nack_feedback_requires_missing_packets() {
        let receiver = receiver_with_ssrc(1);
        assert!(receiver.nack_feedback(7, &[]).is_none());
    }

    #[test]
    fn test_feedback_requires_declared_ssrc() {
        let receiver = receiver_with_ssrc(0);
        assert!(receiver.nack_feedback(7, &[1]).is_none());
        assert!(receiver.sr_request(7).is_none());
    }

    #[test]
    fn test_sr_request() {
        let receiver = receiver_with_ssrc(42);
        let sr_req = receiver.sr_request(7).unwrap();
        assert_eq!(sr_req.sender_ssrc, 7);
        assert_eq!(sr_req.media_ssrc, 42);
    }
}
