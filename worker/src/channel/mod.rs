//! Framed control channel between the worker and its parent process.
//!
//! Every message is a UTF-8 JSON payload behind a 2-byte big-endian length
//! prefix. Requests flow in, responses and unsolicited notifications flow
//! out over the same stream.

pub mod request;

use log::warn;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use shared::error::{Error, Result};

pub use request::{Notification, Request, Response};

/// Length of the framing header.
pub const FRAMING_HEADER_LEN: usize = 2;
/// Maximum payload carried by one frame.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Adds the length prefix to a payload.
pub fn frame_message(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::ErrMessageTooBig);
    }
    let mut framed = Vec::with_capacity(FRAMING_HEADER_LEN + payload.len());
    framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    framed.extend_from_slice(payload);
    Ok(framed)
}

/// Stateful decoder extracting complete frames from a byte stream. Partial
/// reads of any chunk size are handled.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete payload, without the length prefix.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.buffer.len() < FRAMING_HEADER_LEN {
            return None;
        }
        let length = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
        let total_len = FRAMING_HEADER_LEN + length;
        if self.buffer.len() < total_len {
            return None;
        }
        let payload = self.buffer[FRAMING_HEADER_LEN..total_len].to_vec();
        self.buffer.drain(..total_len);
        Some(payload)
    }
}

/// The worker end of the control channel.
pub struct Channel {
    stream: UnixStream,
    decoder: FrameDecoder,
}

impl Channel {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
        }
    }

    /// Receives the next request. Returns `Ok(None)` on clean remote
    /// closure. Frames that do not parse as a request are logged and
    /// skipped; they never take the worker down.
    pub async fn recv(&mut self) -> Result<Option<Request>> {
        loop {
            while let Some(frame) = self.decoder.next_frame() {
                match serde_json::from_slice::<Request>(&frame) {
                    Ok(request) => return Ok(Some(request)),
                    Err(err) => warn!("discarding invalid channel request: {err}"),
                }
            }
            let mut buf = [0u8; 4096];
            let n = self
                .stream
                .read(&mut buf)
                .await
                .map_err(|_| Error::ErrChannelClosed)?;
            if n == 0 {
                return Ok(None);
            }
            self.decoder.extend_from_slice(&buf[..n]);
        }
    }

    pub async fn send_response(&mut self, response: &Response) -> Result<()> {
        let value =
            serde_json::to_value(response).map_err(|err| Error::Internal(err.to_string()))?;
        self.send_json(&value).await
    }

    pub async fn send_notification(&mut self, notification: &Notification) -> Result<()> {
        let value =
            serde_json::to_value(notification).map_err(|err| Error::Internal(err.to_string()))?;
        self.send_json(&value).await
    }

    async fn send_json(&mut self, value: &Value) -> Result<()> {
        let payload = serde_json::to_vec(value).map_err(|err| Error::Internal(err.to_string()))?;
        let framed = frame_message(&payload)?;
        self.stream
            .write_all(&framed)
            .await
            .map_err(|_| Error::ErrChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_message_prefixes_length() {
        let framed = frame_message(b"{\"id\":1}").unwrap();
        assert_eq!(&framed[..2], &[0, 8]);
        assert_eq!(&framed[2..], b"{\"id\":1}");
    }

    #[test]
    fn test_frame_message_too_big() {
        let huge = vec![b'x'; MAX_PAYLOAD_SIZE + 1];
        assert_eq!(frame_message(&huge), Err(Error::ErrMessageTooBig));
    }

    #[test]
    fn test_decoder_partial_reads() {
        let mut decoder = FrameDecoder::new();
        let framed = frame_message(b"hello").unwrap();

        decoder.extend_from_slice(&framed[..3]);
        assert!(decoder.next_frame().is_none());

        decoder.extend_from_slice(&framed[3..]);
        assert_eq!(decoder.next_frame(), Some(b"hello".to_vec()));
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn test_decoder_multiple_frames() {
        let mut decoder = FrameDecoder::new();
        let mut data = frame_message(b"first").unwrap();
        data.extend_from_slice(&frame_message(b"second").unwrap());
        decoder.extend_from_slice(&data);

        assert_eq!(decoder.next_frame(), Some(b"first".to_vec()));
        assert_eq!(decoder.next_frame(), Some(b"second".to_vec()));
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn test_decoder_empty_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.extend_from_slice(&frame_message(b"").unwrap());
        assert_eq!(decoder.next_frame(), Some(vec![]));
    }
}
