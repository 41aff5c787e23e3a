//! Provider transport layer
//!
//! Drives the remote synthesis provider's bidirectional framed protocol:
//! - Binary frame codec (4-byte header + length-prefixed payload)
//! - WebSocket connector with authentication headers
//! - `ProviderSession`: one streaming synthesis session per segment
//! - `SpeechProvider`: the seam the segment worker synthesises through

pub mod frame;
pub mod session;

pub use frame::{
    AudioSpec, Frame, FrameType, Message, SessionStart, StatusPayload, TurnText, VoiceSpec,
    PROTOCOL_VERSION, STATUS_FINAL,
};
pub use session::{FrameTransport, ProviderSession, SpeechProvider, WsSpeechProvider, WsTransport};

use thiserror::Error;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("frame too short: {0} bytes")]
    ShortFrame(usize),

    #[error("unsupported protocol version: {0}")]
    Version(u8),

    #[error("unknown frame type: {0:#x}")]
    UnknownFrameType(u8),

    #[error("payload length mismatch: declared {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("connection closed")]
    Closed,

    #[error("timed out during {0}")]
    Timeout(&'static str),
}
