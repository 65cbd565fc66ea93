//! A peer groups the transports created for one participant.

use std::collections::HashMap;

use serde_json::{json, Value};

use shared::error::{Error, Result};

use crate::transport::Transport;

pub struct Peer {
    pub name: String,
    transports: HashMap<u32, Transport>,
}

impl Peer {
    pub fn new(name: String) -> Self {
        Self {
            name,
            transports: HashMap::new(),
        }
    }

    pub fn create_transport(&mut self, transport_id: u32) -> Result<&mut Transport> {
        if self.transports.contains_key(&transport_id) {
            return Err(Error::Internal(format!(
                "transport already exists [transportId:{transport_id}]"
            )));
        }
        Ok(self
            .transports
            .entry(transport_id)
            .or_insert_with(|| Transport::new(transport_id)))
    }

    pub fn get_transport_mut(&mut self, transport_id: u32) -> Result<&mut Transport> {
        self.transports
            .get_mut(&transport_id)
            .ok_or(Error::TransportNotFound)
    }

    pub fn close(&mut self) {
        for transport in self.transports.values_mut() {
            transport.close();
        }
        self.transports.clear();
    }

    pub fn to_json(&self) -> Value {
        let mut transports: Vec<Value> = self.transports.values().map(|t| t.to_json()).collect();
        transports.sort_by_key(|v| v["transportId"].as_u64());
        json!({
            "peerName": self.name,
            "transports": transports,
        })
    }
}
