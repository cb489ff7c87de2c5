//! Wire codec for the broker's Unix-socket transport.
//!
//! Frames are self-delimited so a short read never splits a message:
//!
//! ```text
//! [u32 BE length] [length bytes of JSON-encoded AgentMessage]
//! ```

use crate::message::AgentMessage;

/// Maximum accepted frame payload size. Guards against a misbehaving peer
/// claiming an enormous length and exhausting memory before the rest of the
/// frame ever arrives.
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Encode a message into a length-prefixed frame.
pub fn encode(message: &AgentMessage) -> Result<Vec<u8>, FramingError> {
    let payload = serde_json::to_vec(message).map_err(FramingError::Encode)?;
    if payload.len() as u64 > u64::from(MAX_FRAME_SIZE) {
        return Err(FramingError::TooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Errors raised while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// The message could not be serialized to JSON.
    #[error("failed to encode message: {0}")]
    Encode(serde_json::Error),
    /// The message payload failed to parse as JSON.
    #[error("failed to decode frame payload: {0}")]
    Decode(serde_json::Error),
    /// The encoded payload (or a claimed incoming length) exceeds the cap.
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    TooLarge(usize),
}

/// Incremental frame decoder: feed arbitrary byte chunks, pull out whatever
/// complete frames have accumulated. Handles TCP/stream-style partial reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Construct an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly-read bytes into the decoder and drain every frame that is
    /// now complete. Incomplete trailing bytes are retained for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<AgentMessage>, FramingError> {
        self.buf.extend_from_slice(bytes);
        let mut messages = Vec::new();

        loop {
            if self.buf.len() < 4 {
                break;
            }
            let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            if length > MAX_FRAME_SIZE {
                return Err(FramingError::TooLarge(length as usize));
            }
            let total = 4 + length as usize;
            if self.buf.len() < total {
                break;
            }
            let payload = &self.buf[4..total];
            let message: AgentMessage = serde_json::from_slice(payload).map_err(FramingError::Decode)?;
            messages.push(message);
            self.buf.drain(0..total);
        }

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use serde_json::Map;

    fn sample() -> AgentMessage {
        AgentMessage::new("a", "b", MessageType::Heartbeat, Map::new())
    }

    #[test]
    fn encode_then_feed_recovers_message() {
        let msg = sample();
        let frame = encode(&msg).unwrap();
        let mut decoder = FrameDecoder::new();
        let decoded = decoder.feed(&frame).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].message_id, msg.message_id);
    }

    #[test]
    fn split_frame_across_two_feeds_is_not_lost() {
        let msg = sample();
        let frame = encode(&msg).unwrap();
        let (first, second) = frame.split_at(frame.len() / 2);
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(first).unwrap().is_empty());
        let decoded = decoder.feed(second).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].message_id, msg.message_id);
    }

    #[test]
    fn two_frames_in_one_feed_both_decode() {
        let a = encode(&sample()).unwrap();
        let b = encode(&sample()).unwrap();
        let mut combined = a.clone();
        combined.extend_from_slice(&b);
        let mut decoder = FrameDecoder::new();
        let decoded = decoder.feed(&combined).unwrap();
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn oversized_length_header_is_rejected() {
        let mut bogus = Vec::new();
        bogus.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&bogus).is_err());
    }
}
