//! Provider session management
//!
//! One `ProviderSession` drives one streaming synthesis exchange for one
//! segment: open, send the session control frame and the segment's turns,
//! collect audio chunks until the provider's final status, enforce idle and
//! total timeouts. Sessions are single-use; the segment worker creates a fresh
//! one per attempt.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use podcast_tts_config::ProviderConfig;
use podcast_tts_core::{InputError, ProviderError, Segment, VoiceMap};

use crate::frame::{AudioSpec, Frame, Message, SessionStart, TurnText, VoiceSpec, STATUS_FINAL};
use crate::TransportError;

/// Bidirectional frame transport.
///
/// The session is written against this seam so tests can drive it with a
/// scripted provider instead of a live socket.
#[async_trait]
pub trait FrameTransport: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Receive the next frame. `Ok(None)` means the peer closed the transport.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;

    async fn close(&mut self);
}

#[async_trait]
impl<T: FrameTransport + ?Sized> FrameTransport for &mut T {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        (**self).send(frame).await
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        (**self).recv().await
    }

    async fn close(&mut self) {
        (**self).close().await
    }
}

/// WebSocket-backed frame transport.
pub struct WsTransport {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsTransport {
    /// Connect to the provider endpoint with authentication headers.
    ///
    /// Headers carry the static credentials plus a fresh connect nonce, so a
    /// reused session id can never alias a previous connection.
    pub async fn connect(config: &ProviderConfig) -> Result<Self, TransportError> {
        let mut request = config
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let headers = request.headers_mut();
        headers.insert("X-Api-App-Id", header_value(&config.app_id)?);
        headers.insert("X-Api-Access-Key", header_value(&config.access_token)?);
        headers.insert("X-Api-Resource-Id", header_value(&config.resource_id)?);
        headers.insert(
            "X-Api-Connect-Id",
            header_value(&uuid::Uuid::new_v4().to_string())?,
        );

        let connect = connect_async(request);
        let (stream, _response) = tokio::time::timeout(config.connect_timeout(), connect)
            .await
            .map_err(|_| TransportError::Timeout("connect"))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        Ok(Self { inner: stream })
    }
}

fn header_value(value: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value)
        .map_err(|e| TransportError::ConnectionFailed(format!("invalid header value: {e}")))
}

#[async_trait]
impl FrameTransport for WsTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.inner
            .send(WsMessage::Binary(frame.encode()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            match self.inner.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
                Some(Ok(WsMessage::Binary(bytes))) => return Frame::decode(&bytes).map(Some),
                Some(Ok(WsMessage::Close(_))) => return Ok(None),
                // Control pings are handled by tungstenite; skip anything else.
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}

/// One streaming synthesis session over a frame transport.
pub struct ProviderSession<T: FrameTransport> {
    transport: T,
    session_id: String,
    audio: AudioSpec,
    idle_timeout: Duration,
    total_timeout: Duration,
    transient_codes: Vec<i32>,
}

impl<T: FrameTransport> ProviderSession<T> {
    pub fn new(transport: T, config: &ProviderConfig) -> Self {
        Self {
            transport,
            session_id: uuid::Uuid::new_v4().to_string(),
            audio: AudioSpec {
                codec: config.codec.clone(),
                sample_rate: config.sample_rate,
            },
            idle_timeout: config.idle_timeout(),
            total_timeout: config.total_timeout(),
            transient_codes: config.transient_error_codes.clone(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Run the session to completion for one segment.
    ///
    /// On success the returned buffer is the segment's audio in turn order.
    pub async fn synthesize(
        mut self,
        segment: &Segment,
        voices: &VoiceMap,
    ) -> podcast_tts_core::Result<Vec<u8>> {
        let total = self.total_timeout;
        match tokio::time::timeout(total, self.run(segment, voices)).await {
            Ok(result) => result,
            Err(_) => {
                self.transport.close().await;
                Err(ProviderError::Timeout { phase: "session" }.into())
            }
        }
    }

    async fn run(
        &mut self,
        segment: &Segment,
        voices: &VoiceMap,
    ) -> podcast_tts_core::Result<Vec<u8>> {
        if segment.turns.is_empty() {
            return Err(InputError::EmptyInput.into());
        }

        let mut specs = Vec::new();
        for speaker in segment.speakers() {
            let voice = voices
                .voice_for(speaker)
                .ok_or_else(|| InputError::InvalidSpeaker(speaker.to_string()))?;
            specs.push(VoiceSpec {
                speaker,
                voice: voice.to_string(),
            });
        }

        self.send(Message::SessionStart(SessionStart {
            session_id: self.session_id.clone(),
            voices: specs,
            audio: self.audio.clone(),
        }))
        .await?;

        let last = segment.turns.len() - 1;
        for (i, turn) in segment.turns.iter().enumerate() {
            self.send(Message::TurnText(TurnText {
                speaker: turn.speaker,
                text: turn.utterance.clone(),
                is_last: i == last,
            }))
            .await?;
        }

        let mut audio = Vec::new();
        loop {
            let frame = tokio::time::timeout(self.idle_timeout, self.transport.recv())
                .await
                .map_err(|_| ProviderError::Timeout { phase: "idle" })?
                .map_err(provider_error)?;

            let Some(frame) = frame else {
                return Err(ProviderError::Truncated.into());
            };

            match Message::from_frame(frame).map_err(provider_error)? {
                Message::AudioChunk(bytes) => {
                    tracing::trace!(
                        session_id = %self.session_id,
                        chunk_bytes = bytes.len(),
                        total_bytes = audio.len(),
                        "audio chunk received"
                    );
                    audio.extend_from_slice(&bytes);
                }
                Message::Status(status) if status.code == STATUS_FINAL => {
                    self.transport.close().await;
                    if audio.is_empty() {
                        return Err(ProviderError::Transport(
                            "no audio received before final status".to_string(),
                        )
                        .into());
                    }
                    return Ok(audio);
                }
                Message::Status(status) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        code = status.code,
                        message = %status.message,
                        "provider error status"
                    );
                    self.transport.close().await;
                    let transient = self.transient_codes.contains(&status.code);
                    return Err(ProviderError::Server {
                        code: status.code,
                        message: status.message,
                        transient,
                    }
                    .into());
                }
                Message::SessionStart(_) | Message::TurnText(_) => {
                    self.transport.close().await;
                    return Err(ProviderError::Transport(
                        "unexpected control frame from provider".to_string(),
                    )
                    .into());
                }
            }
        }
    }

    async fn send(&mut self, message: Message) -> Result<(), ProviderError> {
        let frame = message.into_frame().map_err(provider_error)?;
        self.transport.send(frame).await.map_err(provider_error)
    }
}

fn provider_error(e: TransportError) -> ProviderError {
    match e {
        TransportError::Timeout(phase) => ProviderError::Timeout { phase },
        TransportError::Closed => ProviderError::Truncated,
        other => ProviderError::Transport(other.to_string()),
    }
}

/// The synthesis seam the segment worker drives.
#[async_trait]
pub trait SpeechProvider: Send + Sync {
    /// Synthesise one segment into a contiguous audio buffer.
    ///
    /// Implementations must open a fresh session per call.
    async fn synthesize_segment(
        &self,
        segment: &Segment,
        voices: &VoiceMap,
    ) -> podcast_tts_core::Result<Vec<u8>>;
}

/// Production provider: one WebSocket session per segment.
pub struct WsSpeechProvider {
    config: ProviderConfig,
}

impl WsSpeechProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }

    /// Connect-and-close handshake for diagnostics; no synthesis occurs.
    pub async fn probe(&self) -> Result<(), TransportError> {
        let mut transport = WsTransport::connect(&self.config).await?;
        transport.close().await;
        Ok(())
    }
}

#[async_trait]
impl SpeechProvider for WsSpeechProvider {
    async fn synthesize_segment(
        &self,
        segment: &Segment,
        voices: &VoiceMap,
    ) -> podcast_tts_core::Result<Vec<u8>> {
        let transport = WsTransport::connect(&self.config)
            .await
            .map_err(provider_error)?;
        let session = ProviderSession::new(transport, &self.config);
        tracing::debug!(
            session_id = %session.session_id(),
            segment = segment.index,
            turns = segment.turn_count(),
            "provider session opened"
        );
        session.synthesize(segment, voices).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::StatusPayload;
    use podcast_tts_core::{DialogueTurn, Error, ErrorKind};
    use std::collections::VecDeque;

    struct ScriptedTransport {
        incoming: VecDeque<Frame>,
        sent: Vec<Frame>,
        closed: bool,
    }

    impl ScriptedTransport {
        fn new(messages: Vec<Message>) -> Self {
            Self {
                incoming: messages
                    .into_iter()
                    .map(|m| m.into_frame().unwrap())
                    .collect(),
                sent: Vec::new(),
                closed: false,
            }
        }
    }

    #[async_trait]
    impl FrameTransport for ScriptedTransport {
        async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
            self.sent.push(frame);
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
            Ok(self.incoming.pop_front())
        }

        async fn close(&mut self) {
            self.closed = true;
        }
    }

    /// Transport that never produces a frame, for idle-timeout tests.
    struct SilentTransport;

    #[async_trait]
    impl FrameTransport for SilentTransport {
        async fn send(&mut self, _frame: Frame) -> Result<(), TransportError> {
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
            futures::future::pending().await
        }

        async fn close(&mut self) {}
    }

    fn test_config() -> ProviderConfig {
        let mut config = ProviderConfig::default();
        config.idle_timeout_seconds = 1;
        config.total_timeout_seconds = 2;
        config
    }

    fn two_turn_segment() -> Segment {
        Segment {
            index: 0,
            turns: vec![
                DialogueTurn::new(0, "hello"),
                DialogueTurn::new(1, "hi there"),
            ],
        }
    }

    fn voices() -> VoiceMap {
        VoiceMap::new(vec!["voice_a".into(), "voice_b".into()])
    }

    #[tokio::test]
    async fn test_session_collects_audio_until_final() {
        let transport = ScriptedTransport::new(vec![
            Message::AudioChunk(vec![1, 2]),
            Message::AudioChunk(vec![3]),
            Message::Status(StatusPayload {
                code: STATUS_FINAL,
                message: "done".into(),
            }),
        ]);
        let session = ProviderSession::new(transport, &test_config());
        let audio = session
            .synthesize(&two_turn_segment(), &voices())
            .await
            .unwrap();
        assert_eq!(audio, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_session_sends_start_then_turns_with_last_marker() {
        let mut transport = ScriptedTransport::new(vec![
            Message::AudioChunk(vec![9]),
            Message::Status(StatusPayload {
                code: STATUS_FINAL,
                message: String::new(),
            }),
        ]);
        let config = test_config();

        // Drive run() directly so the transport stays inspectable.
        let segment = two_turn_segment();
        let map = voices();
        {
            let mut session = ProviderSession::new(&mut transport, &config);
            session.run(&segment, &map).await.unwrap();
        }

        let sent: Vec<Message> = transport
            .sent
            .iter()
            .map(|f| Message::from_frame(f.clone()).unwrap())
            .collect();
        assert_eq!(sent.len(), 3);
        assert!(matches!(&sent[0], Message::SessionStart(s) if s.voices.len() == 2));
        assert!(matches!(&sent[1], Message::TurnText(t) if !t.is_last && t.speaker == 0));
        assert!(matches!(&sent[2], Message::TurnText(t) if t.is_last && t.speaker == 1));
    }

    #[tokio::test]
    async fn test_error_status_is_classified_by_code() {
        let transport = ScriptedTransport::new(vec![Message::Status(StatusPayload {
            code: 45000292,
            message: "quota exceeded".into(),
        })]);
        let session = ProviderSession::new(transport, &test_config());
        let err = session
            .synthesize(&two_turn_segment(), &voices())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientProvider);

        let transport = ScriptedTransport::new(vec![Message::Status(StatusPayload {
            code: 40000003,
            message: "bad credentials".into(),
        })]);
        let session = ProviderSession::new(transport, &test_config());
        let err = session
            .synthesize(&two_turn_segment(), &voices())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FatalProvider);
    }

    #[tokio::test]
    async fn test_transport_close_before_final_is_truncated() {
        let transport = ScriptedTransport::new(vec![Message::AudioChunk(vec![1])]);
        let session = ProviderSession::new(transport, &test_config());
        let err = session
            .synthesize(&two_turn_segment(), &voices())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Provider(ProviderError::Truncated)
        ));
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let mut config = test_config();
        config.idle_timeout_seconds = 0;
        let session = ProviderSession::new(SilentTransport, &config);
        let err = session
            .synthesize(&two_turn_segment(), &voices())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Provider(ProviderError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_unmapped_speaker_is_rejected() {
        let transport = ScriptedTransport::new(vec![]);
        let session = ProviderSession::new(transport, &test_config());
        let err = session
            .synthesize(&two_turn_segment(), &VoiceMap::new(vec!["only_one".into()]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }
}
