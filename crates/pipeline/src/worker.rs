//! Segment worker
//!
//! Executes one segment with bounded retries. Every attempt runs through a
//! fresh provider session; only transient provider failures are retried, with
//! linear backoff between attempts.

use std::sync::Arc;
use std::time::Duration;

use podcast_tts_core::{Result, Segment, VoiceMap};
use podcast_tts_transport::SpeechProvider;

#[derive(Clone)]
pub struct SegmentWorker {
    provider: Arc<dyn SpeechProvider>,
    voices: VoiceMap,
    max_attempts: u32,
    retry_delay_base: Duration,
}

impl SegmentWorker {
    pub fn new(
        provider: Arc<dyn SpeechProvider>,
        voices: VoiceMap,
        max_attempts: u32,
        retry_delay_base: Duration,
    ) -> Self {
        Self {
            provider,
            voices,
            max_attempts: max_attempts.max(1),
            retry_delay_base,
        }
    }

    /// Synthesise one segment, retrying transient failures.
    pub async fn run(&self, segment: &Segment) -> Result<Vec<u8>> {
        let mut attempt = 1u32;
        loop {
            match self.provider.synthesize_segment(segment, &self.voices).await {
                Ok(audio) => {
                    tracing::debug!(
                        segment = segment.index,
                        attempt,
                        bytes = audio.len(),
                        "segment synthesised"
                    );
                    return Ok(audio);
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    tracing::warn!(
                        segment = segment.index,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "segment attempt failed; retrying"
                    );
                    tokio::time::sleep(self.retry_delay_base * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        segment = segment.index,
                        attempt,
                        error = %e,
                        "segment failed"
                    );
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use podcast_tts_core::{DialogueTurn, Error, ErrorKind, InputError, ProviderError};

    /// Provider that fails a scripted number of times before succeeding.
    struct FlakyProvider {
        calls: Mutex<u32>,
        failures: u32,
        error_factory: fn() -> Error,
    }

    impl FlakyProvider {
        fn new(failures: u32, error_factory: fn() -> Error) -> Self {
            Self {
                calls: Mutex::new(0),
                failures,
                error_factory,
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl SpeechProvider for FlakyProvider {
        async fn synthesize_segment(
            &self,
            segment: &Segment,
            _voices: &VoiceMap,
        ) -> Result<Vec<u8>> {
            let mut calls = self.calls.lock();
            *calls += 1;
            if *calls <= self.failures {
                return Err((self.error_factory)());
            }
            Ok(vec![segment.index as u8])
        }
    }

    fn segment() -> Segment {
        Segment {
            index: 4,
            turns: vec![DialogueTurn::new(0, "hello")],
        }
    }

    fn voices() -> VoiceMap {
        VoiceMap::new(vec!["voice_a".into()])
    }

    fn truncated() -> Error {
        ProviderError::Truncated.into()
    }

    fn fatal() -> Error {
        ProviderError::Server {
            code: 40000003,
            message: "bad credentials".into(),
            transient: false,
        }
        .into()
    }

    fn invalid_speaker() -> Error {
        InputError::InvalidSpeaker("9".into()).into()
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let provider = Arc::new(FlakyProvider::new(2, truncated));
        let worker = SegmentWorker::new(provider.clone(), voices(), 3, Duration::ZERO);

        let audio = worker.run(&segment()).await.unwrap();
        assert_eq!(audio, vec![4]);
        // One fresh session per attempt.
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_last_error() {
        let provider = Arc::new(FlakyProvider::new(5, truncated));
        let worker = SegmentWorker::new(provider.clone(), voices(), 3, Duration::ZERO);

        let err = worker.run(&segment()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientProvider);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_fatal_provider_error_is_not_retried() {
        let provider = Arc::new(FlakyProvider::new(5, fatal));
        let worker = SegmentWorker::new(provider.clone(), voices(), 3, Duration::ZERO);

        let err = worker.run(&segment()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FatalProvider);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_input_error_is_not_retried() {
        let provider = Arc::new(FlakyProvider::new(5, invalid_speaker));
        let worker = SegmentWorker::new(provider.clone(), voices(), 3, Duration::ZERO);

        let err = worker.run(&segment()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
        assert_eq!(provider.calls(), 1);
    }
}
