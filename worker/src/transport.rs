//! A transport: the RTP ingest point owning the listener, the receivers
//! registered on it and the receive-side bandwidth estimator.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use log::{debug, warn};
use serde_json::{json, Value};

use bwe::{RemoteBitrateEstimatorAbsSendTime, RemoteBitrateUpdate};
use rtp::extension::AbsSendTimeExtension;
use rtp::Packet;
use shared::error::{Error, Result};
use shared::marshal::Unmarshal;
use shared::TimeBase;

use crate::rtp_listener::RtpListener;
use crate::rtp_parameters::RtpParameters;
use crate::rtp_receiver::RtpReceiver;

/// Extension id the absolute-send-time extension is negotiated on unless
/// the signalling layer says otherwise.
pub const DEFAULT_ABS_SEND_TIME_EXT_ID: u8 = 3;

pub struct Transport {
    pub id: u32,
    abs_send_time_ext_id: u8,
    time_base: TimeBase,
    listener: RtpListener,
    receivers: HashMap<u32, RtpReceiver>,
    estimator: RemoteBitrateEstimatorAbsSendTime,
}

impl Transport {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            abs_send_time_ext_id: DEFAULT_ABS_SEND_TIME_EXT_ID,
            time_base: TimeBase::new(),
            listener: RtpListener::new(),
            receivers: HashMap::new(),
            estimator: RemoteBitrateEstimatorAbsSendTime::new(),
        }
    }

    /// [`receive_rtp`](Self::receive_rtp) with the arrival time taken from a
    /// monotonic clock reading, as handed over by the socket layer.
    pub fn receive_rtp_at(
        &mut self,
        data: &Bytes,
        arrival: Instant,
    ) -> Option<RemoteBitrateUpdate> {
        let arrival_time_ms = self.time_base.elapsed_ms(arrival);
        self.receive_rtp(data, arrival_time_ms, arrival_time_ms)
    }

    pub fn set_abs_send_time_ext_id(&mut self, ext_id: u8) {
        self.abs_send_time_ext_id = ext_id;
    }

    pub fn has_receiver(&self, receiver_id: u32) -> bool {
        self.receivers.contains_key(&receiver_id)
    }

    /// Creates or reconfigures a receiver with the given parameters and
    /// registers its listener entries.
    pub fn receive_rtp_receiver(
        &mut self,
        receiver_id: u32,
        parameters: RtpParameters,
    ) -> Result<()> {
        parameters.validate()?;
        self.listener.add_receiver(receiver_id, &parameters)?;
        self.receivers
            .insert(receiver_id, RtpReceiver::new(receiver_id, parameters));
        Ok(())
    }

    /// Drops a receiver; its listener entries are removed first so no packet
    /// can resolve to a receiver that is going away.
    pub fn close_rtp_receiver(&mut self, receiver_id: u32) -> Result<()> {
        if !self.receivers.contains_key(&receiver_id) {
            return Err(Error::RtpReceiverNotFound);
        }
        self.listener.remove_receiver(receiver_id);
        self.receivers.remove(&receiver_id);
        Ok(())
    }

    /// Handles one incoming RTP datagram. Malformed packets and packets that
    /// do not resolve to a receiver are logged and dropped. Returns a target
    /// bitrate update when the estimator produced one.
    pub fn receive_rtp(
        &mut self,
        data: &Bytes,
        arrival_time_ms: i64,
        now_ms: i64,
    ) -> Option<RemoteBitrateUpdate> {
        let mut buf = data.clone();
        let packet = match Packet::unmarshal(&mut buf) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("received an invalid RTP packet: {err}");
                return None;
            }
        };

        let receiver_id = match self.listener.get_receiver(
            packet.header.ssrc,
            packet.header.payload_type,
            &self.receivers,
        ) {
            Some(receiver_id) => receiver_id,
            None => {
                warn!("no RtpReceiver found for {packet}");
                return None;
            }
        };
        debug!("{packet} routed to rtpReceiver {receiver_id}");

        if let Some(ext_data) = packet.header.get_extension(self.abs_send_time_ext_id) {
            let mut ext_buf = ext_data;
            match AbsSendTimeExtension::unmarshal(&mut ext_buf) {
                Ok(abs_send_time) => {
                    return self.estimator.incoming_packet(
                        arrival_time_ms,
                        packet.payload.len(),
                        packet.header.ssrc,
                        abs_send_time.timestamp,
                        now_ms,
                    );
                }
                Err(err) => warn!("invalid abs-send-time extension: {err}"),
            }
        }
        None
    }

    /// Latest committed bitrate estimate, if any.
    pub fn latest_bitrate_estimate(&self) -> Option<RemoteBitrateUpdate> {
        self.estimator.latest_estimate()
    }

    pub fn close(&mut self) {
        let receiver_ids: Vec<u32> = self.receivers.keys().copied().collect();
        for receiver_id in receiver_ids {
            self.listener.remove_receiver(receiver_id);
        }
        self.receivers.clear();
    }

    pub fn to_json(&self) -> Value {
        let mut receivers: Vec<Value> = self.receivers.values().map(|r| r.to_json()).collect();
        receivers.sort_by_key(|v| v["rtpReceiverId"].as_u64());
        json!({
            "transportId": self.id,
            "rtpListener": self.listener.to_json(),
            "rtpReceivers": receivers,
        })
    }
}
