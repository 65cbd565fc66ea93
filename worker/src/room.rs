//! A room owns the peers (and through them transports and receivers)
//! participating in one media session.

use std::collections::HashMap;

use serde_json::{json, Value};

use shared::error::{Error, Result};

use crate::peer::Peer;

pub struct Room {
    pub id: u32,
    peers: HashMap<String, Peer>,
}

impl Room {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            peers: HashMap::new(),
        }
    }

    /// Returns the peer with the given name, creating it on first use.
    pub fn peer_entry(&mut self, name: &str) -> &mut Peer {
        self.peers
            .entry(name.to_string())
            .or_insert_with(|| Peer::new(name.to_string()))
    }

    pub fn get_peer_mut(&mut self, name: &str) -> Result<&mut Peer> {
        self.peers.get_mut(name).ok_or(Error::PeerNotFound)
    }

    pub fn close_peer(&mut self, name: &str) -> Result<()> {
        match self.peers.remove(name) {
            Some(mut peer) => {
                peer.close();
                Ok(())
            }
            None => Err(Error::PeerNotFound),
        }
    }

    /// Tears the room down: peers first, which in turn close their
    /// transports and remove all listener entries before receivers drop.
    pub fn close(&mut self) {
        for peer in self.peers.values_mut() {
            peer.close();
        }
        self.peers.clear();
    }

    pub fn to_json(&self) -> Value {
        let mut peers: Vec<Value> = self.peers.values().map(|p| p.to_json()).collect();
        peers.sort_by(|a, b| a["peerName"].as_str().cmp(&b["peerName"].as_str()));
        json!({
            "roomId": self.id,
            "peers": peers,
        })
    }
}
