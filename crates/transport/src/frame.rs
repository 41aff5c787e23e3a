//! Binary frame codec for the provider protocol
//!
//! Wire layout, per frame:
//!
//! ```text
//! byte 0: version (high nibble) | frame type (low nibble)
//! byte 1: flags
//! byte 2: serialization (high nibble) | compression (low nibble)
//! byte 3: reserved
//! bytes 4..8: payload length, u32 big-endian
//! bytes 8..: payload
//! ```
//!
//! Control frames (`SessionStart`, `TurnText`, `Status`) carry JSON payloads;
//! `AudioChunk` carries raw codec bytes.

use serde::{Deserialize, Serialize};

use crate::TransportError;

/// Protocol version carried in every frame header.
pub const PROTOCOL_VERSION: u8 = 0x1;

/// Status code signalling clean end of a session. Any other code is an error.
pub const STATUS_FINAL: i32 = 0;

const HEADER_LEN: usize = 8;

const SERIALIZATION_RAW: u8 = 0x0;
const SERIALIZATION_JSON: u8 = 0x1;

/// Frame type nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    SessionStart = 0x1,
    TurnText = 0x2,
    AudioChunk = 0x3,
    Status = 0x4,
}

impl FrameType {
    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0x1 => Some(FrameType::SessionStart),
            0x2 => Some(FrameType::TurnText),
            0x3 => Some(FrameType::AudioChunk),
            0x4 => Some(FrameType::Status),
            _ => None,
        }
    }
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub flags: u8,
    pub serialization: u8,
    pub compression: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    fn json(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            flags: 0,
            serialization: SERIALIZATION_JSON,
            compression: 0,
            payload,
        }
    }

    fn raw(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            flags: 0,
            serialization: SERIALIZATION_RAW,
            compression: 0,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push((PROTOCOL_VERSION << 4) | (self.frame_type as u8));
        buf.push(self.flags);
        buf.push((self.serialization << 4) | (self.compression & 0x0f));
        buf.push(0); // reserved
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TransportError> {
        if buf.len() < HEADER_LEN {
            return Err(TransportError::ShortFrame(buf.len()));
        }

        let version = buf[0] >> 4;
        if version != PROTOCOL_VERSION {
            return Err(TransportError::Version(version));
        }

        let frame_type = FrameType::from_nibble(buf[0] & 0x0f)
            .ok_or(TransportError::UnknownFrameType(buf[0] & 0x0f))?;

        let declared = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        let actual = buf.len() - HEADER_LEN;
        if declared != actual {
            return Err(TransportError::LengthMismatch { declared, actual });
        }

        Ok(Self {
            frame_type,
            flags: buf[1],
            serialization: buf[2] >> 4,
            compression: buf[2] & 0x0f,
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Voice profile assignment for one speaker in a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceSpec {
    pub speaker: u16,
    pub voice: String,
}

/// Output format parameters for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSpec {
    pub codec: String,
    pub sample_rate: u32,
}

/// Control frame opening a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStart {
    pub session_id: String,
    pub voices: Vec<VoiceSpec>,
    pub audio: AudioSpec,
}

/// Data frame carrying one dialogue turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnText {
    pub speaker: u16,
    pub text: String,
    /// True only on the final turn of the segment.
    pub is_last: bool,
}

/// Provider status frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub code: i32,
    pub message: String,
}

/// Typed view over a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    SessionStart(SessionStart),
    TurnText(TurnText),
    AudioChunk(Vec<u8>),
    Status(StatusPayload),
}

impl Message {
    pub fn into_frame(self) -> Result<Frame, TransportError> {
        let frame = match self {
            Message::SessionStart(payload) => {
                Frame::json(FrameType::SessionStart, encode_json(&payload)?)
            }
            Message::TurnText(payload) => Frame::json(FrameType::TurnText, encode_json(&payload)?),
            Message::AudioChunk(bytes) => Frame::raw(FrameType::AudioChunk, bytes),
            Message::Status(payload) => Frame::json(FrameType::Status, encode_json(&payload)?),
        };
        Ok(frame)
    }

    pub fn from_frame(frame: Frame) -> Result<Self, TransportError> {
        let message = match frame.frame_type {
            FrameType::SessionStart => Message::SessionStart(decode_json(&frame.payload)?),
            FrameType::TurnText => Message::TurnText(decode_json(&frame.payload)?),
            FrameType::AudioChunk => Message::AudioChunk(frame.payload),
            FrameType::Status => Message::Status(decode_json(&frame.payload)?),
        };
        Ok(message)
    }
}

fn encode_json<T: Serialize>(payload: &T) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(payload).map_err(|e| TransportError::MalformedPayload(e.to_string()))
}

fn decode_json<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, TransportError> {
    serde_json::from_slice(payload).map_err(|e| TransportError::MalformedPayload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let frame = Frame::raw(FrameType::AudioChunk, vec![0xaa, 0xbb]);
        let bytes = frame.encode();
        assert_eq!(bytes[0], 0x13); // version 1, type AudioChunk
        assert_eq!(bytes[2], 0x00); // raw serialization, no compression
        assert_eq!(&bytes[4..8], &[0, 0, 0, 2]);
        assert_eq!(&bytes[8..], &[0xaa, 0xbb]);
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        assert!(matches!(
            Frame::decode(&[0x11, 0, 0]),
            Err(TransportError::ShortFrame(3))
        ));
    }

    #[test]
    fn test_decode_rejects_wrong_version() {
        let mut bytes = Frame::raw(FrameType::AudioChunk, vec![]).encode();
        bytes[0] = 0x23; // version 2
        assert!(matches!(
            Frame::decode(&bytes),
            Err(TransportError::Version(2))
        ));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let mut bytes = Frame::raw(FrameType::AudioChunk, vec![1, 2, 3]).encode();
        bytes[7] = 9;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(TransportError::LengthMismatch {
                declared: 9,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_turn_text_frame_round_trip() {
        let message = Message::TurnText(TurnText {
            speaker: 1,
            text: "hello there".to_string(),
            is_last: true,
        });
        let frame = message.clone().into_frame().unwrap();
        let decoded = Message::from_frame(Frame::decode(&frame.encode()).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_status_frame_round_trip() {
        let message = Message::Status(StatusPayload {
            code: 45000292,
            message: "quota exceeded".to_string(),
        });
        let frame = message.clone().into_frame().unwrap();
        let decoded = Message::from_frame(Frame::decode(&frame.encode()).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }
}
