//! Drives the control channel end to end over a socketpair: framed JSON
//! requests in, framed responses and notifications out.

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use sfu_worker::channel::{frame_message, Channel, Response};
use sfu_worker::Worker;

async fn send_request(client: &mut UnixStream, request: Value) {
    let payload = serde_json::to_vec(&request).unwrap();
    let framed = frame_message(&payload).unwrap();
    client.write_all(&framed).await.unwrap();
}

async fn read_frame(client: &mut UnixStream) -> Value {
    let mut header = [0u8; 2];
    client.read_exact(&mut header).await.unwrap();
    let len = u16::from_be_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    client.read_exact(&mut payload).await.unwrap();
    serde_json::from_slice(&payload).unwrap()
}

/// Receives one request on the worker side, dispatches it and sends the
/// response plus any pending notifications back.
async fn serve_one(channel: &mut Channel, worker: &mut Worker) {
    let request = channel.recv().await.unwrap().expect("request");
    let response = match worker.handle_request(&request) {
        Ok(data) => request.accept(data),
        Err(err) => request.reject(err.to_string()),
    };
    channel.send_response(&response).await.unwrap();
    for notification in worker.take_notifications() {
        channel.send_notification(&notification).await.unwrap();
    }
}

#[tokio::test]
async fn test_request_response_roundtrip() {
    let (mut client, server) = UnixStream::pair().unwrap();
    let mut channel = Channel::new(server);
    let mut worker = Worker::new("w1".into());

    send_request(
        &mut client,
        json!({"id": 1, "method": "room.createRoom", "internal": {"roomId": 7}}),
    )
    .await;
    serve_one(&mut channel, &mut worker).await;

    let response: Response = serde_json::from_value(read_frame(&mut client).await).unwrap();
    assert_eq!(response.id, 1);
    assert!(response.accepted);

    send_request(
        &mut client,
        json!({"id": 2, "method": "worker.dump"}),
    )
    .await;
    serve_one(&mut channel, &mut worker).await;

    let response = read_frame(&mut client).await;
    assert_eq!(response["id"], 2);
    assert_eq!(response["accepted"], true);
    assert_eq!(response["data"]["rooms"][0]["roomId"], 7);
}

#[tokio::test]
async fn test_rejection_for_unknown_room() {
    let (mut client, server) = UnixStream::pair().unwrap();
    let mut channel = Channel::new(server);
    let mut worker = Worker::new("w1".into());

    send_request(
        &mut client,
        json!({"id": 1, "method": "room.dump", "internal": {"roomId": 99}}),
    )
    .await;
    serve_one(&mut channel, &mut worker).await;

    let response = read_frame(&mut client).await;
    assert_eq!(response["accepted"], false);
    assert_eq!(response["error"], "room not found");
}

#[tokio::test]
async fn test_room_close_notification_follows_response() {
    let (mut client, server) = UnixStream::pair().unwrap();
    let mut channel = Channel::new(server);
    let mut worker = Worker::new("w1".into());

    send_request(
        &mut client,
        json!({"id": 1, "method": "room.createRoom", "internal": {"roomId": 7}}),
    )
    .await;
    serve_one(&mut channel, &mut worker).await;
    read_frame(&mut client).await;

    send_request(
        &mut client,
        json!({"id": 2, "method": "room.close", "internal": {"roomId": 7}}),
    )
    .await;
    serve_one(&mut channel, &mut worker).await;

    let response = read_frame(&mut client).await;
    assert_eq!(response["id"], 2);
    assert_eq!(response["accepted"], true);

    // The unsolicited room.close event carries no id.
    let notification = read_frame(&mut client).await;
    assert!(notification.get("id").is_none());
    assert_eq!(notification["event"], "room.close");
    assert_eq!(notification["data"]["roomId"], 7);
}

#[tokio::test]
async fn test_remote_closure_reported_as_none() {
    let (client, server) = UnixStream::pair().unwrap();
    let mut channel = Channel::new(server);
    drop(client);
    assert!(channel.recv().await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_frame_is_skipped() {
    let (mut client, server) = UnixStream::pair().unwrap();
    let mut channel = Channel::new(server);

    // Garbage first, then a valid request: the worker must survive.
    client
        .write_all(&frame_message(b"this is not json").unwrap())
        .await
        .unwrap();
    send_request(&mut client, json!({"id": 5, "method": "worker.dump"})).await;

    let request = channel.recv().await.unwrap().expect("request");
    assert_eq!(request.id, 5);
    assert_eq!(request.method, "worker.dump");
}
