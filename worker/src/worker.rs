//! The worker: owns rooms and dispatches control requests to them.

use std::collections::HashMap;

use log::{debug, info, LevelFilter};
use serde_json::{json, Value};

use shared::error::{Error, Result};

use crate::channel::{Notification, Request};
use crate::room::Room;
use crate::rtp_parameters::RtpParameters;

pub struct Worker {
    pub id: String,
    rooms: HashMap<u32, Room>,
    pending_notifications: Vec<Notification>,
    closed: bool,
}

impl Worker {
    pub fn new(id: String) -> Self {
        Self {
            id,
            rooms: HashMap::new(),
            pending_notifications: Vec::new(),
            closed: false,
        }
    }

    pub fn closed(&self) -> bool {
        self.closed
    }

    /// Notifications produced while handling requests, drained by the event
    /// loop after each completed handler invocation.
    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.pending_notifications)
    }

    /// Dispatches one control request. Errors become request rejections at
    /// the channel layer; they never terminate the worker.
    pub fn handle_request(&mut self, request: &Request) -> Result<Value> {
        debug!("request [method:{}, id:{}]", request.method, request.id);

        match request.method.as_str() {
            "worker.dump" => Ok(self.dump()),
            "worker.updateSettings" => self.update_settings(&request.data),
            "room.createRoom" => {
                let room_id = request
                    .internal_u32("roomId")
                    .ok_or_else(|| Error::Internal("missing internal.roomId".into()))?;
                if self.rooms.contains_key(&room_id) {
                    return Err(Error::Internal(format!(
                        "room already exists [roomId:{room_id}]"
                    )));
                }
                self.rooms.insert(room_id, Room::new(room_id));
                info!("room created [roomId:{room_id}]");
                Ok(Value::Null)
            }
            "room.close" => {
                let room_id = request.internal_u32("roomId").ok_or(Error::RoomNotFound)?;
                let mut room = self.rooms.remove(&room_id).ok_or(Error::RoomNotFound)?;
                room.close();
                info!("room closed [roomId:{room_id}]");
                self.pending_notifications
                    .push(Notification::new("room.close", json!({ "roomId": room_id })));
                Ok(Value::Null)
            }
            "room.dump" => {
                let room = self.room_mut(request)?;
                Ok(room.to_json())
            }
            "peer.createTransport" => {
                let transport_id = request
                    .internal_u32("transportId")
                    .ok_or_else(|| Error::Internal("missing internal.transportId".into()))?;
                let peer_name = request
                    .internal_str("peerName")
                    .map(str::to_string)
                    .ok_or_else(|| Error::Internal("missing internal.peerName".into()))?;
                let room = self.room_mut(request)?;
                room.peer_entry(&peer_name).create_transport(transport_id)?;
                Ok(Value::Null)
            }
            "peer.close" => {
                let peer_name = request
                    .internal_str("peerName")
                    .map(str::to_string)
                    .ok_or(Error::PeerNotFound)?;
                let room = self.room_mut(request)?;
                room.close_peer(&peer_name)?;
                Ok(Value::Null)
            }
            "rtpReceiver.receive" => {
                let receiver_id = request
                    .internal_u32("rtpReceiverId")
                    .ok_or(Error::RtpReceiverNotFound)?;
                let parameters: RtpParameters = serde_json::from_value(request.data.clone())
                    .map_err(|err| Error::InvalidRtpParameters(err.to_string()))?;
                let transport = self.transport_mut(request)?;
                transport.receive_rtp_receiver(receiver_id, parameters)?;
                Ok(Value::Null)
            }
            "rtpReceiver.close" => {
                let receiver_id = request
                    .internal_u32("rtpReceiverId")
                    .ok_or(Error::RtpReceiverNotFound)?;
                let transport = self.transport_mut(request)?;
                transport.close_rtp_receiver(receiver_id)?;
                Ok(Value::Null)
            }
            method => Err(Error::UnknownMethod(method.to_string())),
        }
    }

    /// Closes every room and stops accepting work. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!("closing worker [workerId:{}]", self.id);
        for (_, mut room) in self.rooms.drain() {
            room.close();
        }
    }

    pub fn dump(&self) -> Value {
        let mut rooms: Vec<Value> = self.rooms.values().map(|r| r.to_json()).collect();
        rooms.sort_by_key(|v| v["roomId"].as_u64());
        json!({
            "workerId": self.id,
            "rooms": rooms,
        })
    }

    fn update_settings(&mut self, data: &Value) -> Result<Value> {
        if let Some(level) = data.get("logLevel").and_then(Value::as_str) {
            let filter = parse_log_level(level)?;
            log::set_max_level(filter);
            info!("log level set to {level}");
        }
        Ok(Value::Null)
    }

    fn room_mut(&mut self, request: &Request) -> Result<&mut Room> {
        let room_id = request.internal_u32("roomId").ok_or(Error::RoomNotFound)?;
        self.rooms.get_mut(&room_id).ok_or(Error::RoomNotFound)
    }

    fn transport_mut(&mut self, request: &Request) -> Result<&mut crate::transport::Transport> {
        let peer_name = request
            .internal_str("peerName")
            .map(str::to_string)
            .ok_or(Error::PeerNotFound)?;
        let transport_id = request
            .internal_u32("transportId")
            .ok_or(Error::TransportNotFound)?;
        let room = self.room_mut(request)?;
        room.get_peer_mut(&peer_name)?.get_transport_mut(transport_id)
    }
}

/// Accepted levels, as also read from `MEDIASOUP_LOG_LEVEL`.
pub fn parse_log_level(level: &str) -> Result<LevelFilter> {
    match level {
        "debug" => Ok(LevelFilter::Debug),
        "warn" => Ok(LevelFilter::Warn),
        "error" => Ok(LevelFilter::Error),
        other => Err(Error::Internal(format!("invalid logLevel '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, internal: Value, data: Value) -> Request {
        serde_json::from_value(json!({
            "id": 1,
            "method": method,
            "internal": internal,
            "data": data,
        }))
        .unwrap()
    }

    #[test]
    fn test_create_and_dump_room() {
        let mut worker = Worker::new("w1".into());
        worker
            .handle_request(&request("room.createRoom", json!({"roomId": 7}), Value::Null))
            .unwrap();

        let dump = worker.dump();
        assert_eq!(dump["workerId"], "w1");
        assert_eq!(dump["rooms"][0]["roomId"], 7);

        let room_dump = worker
            .handle_request(&request("room.dump", json!({"roomId": 7}), Value::Null))
            .unwrap();
        assert_eq!(room_dump["roomId"], 7);
    }

    #[test]
    fn test_room_not_found() {
        let mut worker = Worker::new("w1".into());
        assert_eq!(
            worker
                .handle_request(&request("room.dump", json!({"roomId": 1}), Value::Null))
                .err(),
            Some(Error::RoomNotFound)
        );
    }

    #[test]
    fn test_unknown_method() {
        let mut worker = Worker::new("w1".into());
        assert_eq!(
            worker
                .handle_request(&request("worker.nope", Value::Null, Value::Null))
                .err(),
            Some(Error::UnknownMethod("worker.nope".into()))
        );
    }

    #[test]
    fn test_room_close_emits_notification() {
        let mut worker = Worker::new("w1".into());
        worker
            .handle_request(&request("room.createRoom", json!({"roomId": 7}), Value::Null))
            .unwrap();
        worker
            .handle_request(&request("room.close", json!({"roomId": 7}), Value::Null))
            .unwrap();

        let notifications = worker.take_notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].event, "room.close");
        assert_eq!(notifications[0].data, Some(json!({"roomId": 7})));
        // Drained.
        assert!(worker.take_notifications().is_empty());
        // The room is gone.
        assert_eq!(
            worker
                .handle_request(&request("room.dump", json!({"roomId": 7}), Value::Null))
                .err(),
            Some(Error::RoomNotFound)
        );
    }

    #[test]
    fn test_full_receiver_lifecycle() {
        let mut worker = Worker::new("w1".into());
        let internal = json!({
            "roomId": 7,
            "peerName": "alice",
            "transportId": 2,
            "rtpReceiverId": 3,
        });
        worker
            .handle_request(&request("room.createRoom", json!({"roomId": 7}), Value::Null))
            .unwrap();
        worker
            .handle_request(&request("peer.createTransport", internal.clone(), Value::Null))
            .unwrap();
        worker
            .handle_request(&request(
                "rtpReceiver.receive",
                internal.clone(),
                json!({
                    "codecs": [{"name": "VP8", "payloadType": 96, "clockRate": 90000}],
                    "encodings": [{"ssrc": 1111}],
                }),
            ))
            .unwrap();

        let dump = worker
            .handle_request(&request("room.dump", json!({"roomId": 7}), Value::Null))
            .unwrap();
        assert_eq!(
            dump["peers"][0]["transports"][0]["rtpListener"]["ssrcTable"]["1111"],
            "3"
        );

        worker
            .handle_request(&request("rtpReceiver.close", internal.clone(), Value::Null))
            .unwrap();
        assert_eq!(
            worker
                .handle_request(&request("rtpReceiver.close", internal, Value::Null))
                .err(),
            Some(Error::RtpReceiverNotFound)
        );
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let mut worker = Worker::new("w1".into());
        let internal = json!({
            "roomId": 7,
            "peerName": "alice",
            "transportId": 2,
            "rtpReceiverId": 3,
        });
        worker
            .handle_request(&request("room.createRoom", json!({"roomId": 7}), Value::Null))
            .unwrap();
        worker
            .handle_request(&request("peer.createTransport", internal.clone(), Value::Null))
            .unwrap();
        // No codecs.
        let err = worker
            .handle_request(&request("rtpReceiver.receive", internal, json!({})))
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidRtpParameters(_)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut worker = Worker::new("w1".into());
        worker
            .handle_request(&request("room.createRoom", json!({"roomId": 7}), Value::Null))
            .unwrap();
        worker.close();
        assert!(worker.closed());
        worker.close();
        assert!(worker.closed());
        assert_eq!(worker.dump()["rooms"], json!([]));
    }

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), LevelFilter::Debug);
        assert_eq!(parse_log_level("warn").unwrap(), LevelFilter::Warn);
        assert_eq!(parse_log_level("error").unwrap(), LevelFilter::Error);
        assert!(parse_log_level("info").is_err());
    }
}
