//! Demultiplexes incoming RTP packets to receivers by SSRC, muxId or
//! payload type.
//!
//! The tables hold receiver ids, never owning references; the transport
//! owning both the listener and the receivers passes the receiver map in
//! when resolution needs the receivers' parameters.

use std::collections::HashMap;

use log::warn;
use serde_json::{json, Value};

use shared::error::{Error, Result};

use crate::rtp_parameters::RtpParameters;
use crate::rtp_receiver::RtpReceiver;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtpListener {
    /// SSRC -> receiver id. Grown on demand when a packet resolves through
    /// the payload type table.
    ssrc_table: HashMap<u32, u32>,
    mux_id_table: HashMap<String, u32>,
    pt_table: HashMap<u8, u32>,
}

impl RtpListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or re-registers) the entries derived from the receiver's
    /// parameters. Transactional: on a collision with a different receiver
    /// the error is returned and the tables are left exactly as before.
    pub fn add_receiver(&mut self, receiver_id: u32, params: &RtpParameters) -> Result<()> {
        // Build the new tables on scratch copies and swap on success.
        let mut ssrc_table = self.ssrc_table.clone();
        let mut mux_id_table = self.mux_id_table.clone();
        let mut pt_table = self.pt_table.clone();

        ssrc_table.retain(|_, id| *id != receiver_id);
        mux_id_table.retain(|_, id| *id != receiver_id);
        pt_table.retain(|_, id| *id != receiver_id);

        for encoding in &params.encodings {
            for ssrc in [encoding.ssrc, encoding.rtx.ssrc, encoding.fec.ssrc] {
                if ssrc == 0 {
                    continue;
                }
                match ssrc_table.get(&ssrc) {
                    Some(id) if *id != receiver_id => return Err(Error::DuplicatedSsrc(ssrc)),
                    _ => {
                        ssrc_table.insert(ssrc, receiver_id);
                    }
                }
            }
        }

        if let Some(mux_id) = params.mux_id.as_ref().filter(|m| !m.is_empty()) {
            match mux_id_table.get(mux_id.as_str()) {
                Some(id) if *id != receiver_id => {
                    return Err(Error::DuplicatedMuxId(mux_id.clone()))
                }
                _ => {
                    mux_id_table.insert(mux_id.clone(), receiver_id);
                }
            }
        }

        // Payload type entries are only needed when some encoding does not
        // declare all of its SSRCs.
        let missing_ssrcs = params.encodings.iter().any(|e| {
            e.ssrc == 0 || (e.has_rtx && e.rtx.ssrc == 0) || (e.has_fec && e.fec.ssrc == 0)
        });
        if missing_ssrcs {
            for codec in &params.codecs {
                match pt_table.get(&codec.payload_type) {
                    Some(id) if *id != receiver_id => {
                        return Err(Error::DuplicatedPayloadType(codec.payload_type))
                    }
                    _ => {
                        pt_table.insert(codec.payload_type, receiver_id);
                    }
                }
            }
        }

        self.ssrc_table = ssrc_table;
        self.mux_id_table = mux_id_table;
        self.pt_table = pt_table;
        Ok(())
    }

    /// Erases every entry pointing to the receiver, in all tables.
    pub fn remove_receiver(&mut self, receiver_id: u32) {
        self.ssrc_table.retain(|_, id| *id != receiver_id);
        self.mux_id_table.retain(|_, id| *id != receiver_id);
        self.pt_table.retain(|_, id| *id != receiver_id);
    }

    /// Resolves the receiver for an incoming packet.
    ///
    /// SSRC table first (the hit must also carry a payload type the receiver
    /// declared), then the payload type table, promoting the packet's SSRC
    /// into the SSRC table on a hit. muxId-based resolution from header
    /// extensions is reserved and not consulted.
    pub fn get_receiver(
        &mut self,
        ssrc: u32,
        payload_type: u8,
        receivers: &HashMap<u32, RtpReceiver>,
    ) -> Option<u32> {
        if let Some(&receiver_id) = self.ssrc_table.get(&ssrc) {
            let pt_declared = receivers
                .get(&receiver_id)
                .is_some_and(|r| r.parameters.has_payload_type(payload_type));
            if pt_declared {
                return Some(receiver_id);
            }
            warn!("unknown RTP payloadType [payloadType:{payload_type}]");
            return None;
        }

        if let Some(&receiver_id) = self.pt_table.get(&payload_type) {
            self.ssrc_table.insert(ssrc, receiver_id);
            return Some(receiver_id);
        }

        None
    }

    /// Direct SSRC table lookup.
    pub fn get_receiver_by_ssrc(&self, ssrc: u32) -> Option<u32> {
        self.ssrc_table.get(&ssrc).copied()
    }

    pub fn to_json(&self) -> Value {
        let ssrc_table: HashMap<String, String> = self
            .ssrc_table
            .iter()
            .map(|(ssrc, id)| (ssrc.to_string(), id.to_string()))
            .collect();
        let mux_id_table: HashMap<String, String> = self
            .mux_id_table
            .iter()
            .map(|(mux_id, id)| (mux_id.clone(), id.to_string()))
            .collect();
        let pt_table: HashMap<String, String> = self
            .pt_table
            .iter()
            .map(|(pt, id)| (pt.to_string(), id.to_string()))
            .collect();

        json!({
            "ssrcTable": ssrc_table,
            "muxIdTable": mux_id_table,
            "ptTable": pt_table,
        })
    }
}
