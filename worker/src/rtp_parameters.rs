//! Receiver RTP parameters as negotiated by the signalling layer.

use serde::{Deserialize, Serialize};

use shared::error::{Error, Result};

/// A receiver's declared configuration. Immutable while the receiver lives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtpParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mux_id: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    pub encodings: Vec<RtpEncodingParameters>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtpCodecParameters {
    pub name: String,
    pub payload_type: u8,
    pub clock_rate: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtpEncodingParameters {
    /// 0 when the SSRC is not declared and must be learnt from traffic.
    pub ssrc: u32,
    pub has_rtx: bool,
    pub rtx: RtxParameters,
    pub has_fec: bool,
    pub fec: FecParameters,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtxParameters {
    pub ssrc: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FecParameters {
    pub ssrc: u32,
    pub mechanism: String,
}

impl RtpParameters {
    pub fn validate(&self) -> Result<()> {
        if self.codecs.is_empty() {
            return Err(Error::InvalidRtpParameters("empty codecs list".into()));
        }
        for codec in &self.codecs {
            if codec.payload_type > 127 {
                return Err(Error::InvalidRtpParameters(format!(
                    "invalid payloadType {}",
                    codec.payload_type
                )));
            }
        }
        Ok(())
    }

    pub fn has_payload_type(&self, payload_type: u8) -> bool {
        self.codecs.iter().any(|c| c.payload_type == payload_type)
    }

    /// The primary media SSRC, if one is declared.
    pub fn media_ssrc(&self) -> Option<u32> {
        self.encodings.iter().map(|e| e.ssrc).find(|&ssrc| ssrc != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_camel_case() {
        let json = r#"{
            "muxId": "audio-1",
            "codecs": [{"name": "opus", "payloadType": 111, "clockRate": 48000}],
            "encodings": [{"ssrc": 1111, "hasRtx": true, "rtx": {"ssrc": 2222}}]
        }"#;
        let params: RtpParameters = serde_json::from_str(json).unwrap();

        assert_eq!(params.mux_id.as_deref(), Some("audio-1"));
        assert_eq!(params.codecs[0].payload_type, 111);
        assert_eq!(params.codecs[0].clock_rate, 48000);
        assert!(params.encodings[0].has_rtx);
        assert_eq!(params.encodings[0].rtx.ssrc, 2222);
        assert!(!params.encodings[0].has_fec);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_codecs() {
        let params = RtpParameters::default();
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_payload_type() {
        let params = RtpParameters {
            codecs: vec![RtpCodecParameters {
                name: "opus".into(),
                payload_type: 128,
                clock_rate: 48000,
            }],
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_media_ssrc_skips_undeclared() {
        let params = RtpParameters {
            encodings: vec![
                RtpEncodingParameters::default(),
                RtpEncodingParameters {
                    ssrc: 42,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(params.media_ssrc(), Some(42));
    }
}
