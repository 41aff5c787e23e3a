//! Task engine
//!
//! Runs one synthesis task end to end: parse, choose the strategy, execute
//! segment workers (serially or in bounded parallel batches), concatenate the
//! per-segment buffers in index order, upload the artifact, record the audio
//! row, and complete the task at the monitor. On any failure nothing is
//! uploaded or recorded; the caller transitions the task to FAILED.

use std::sync::Arc;

use podcast_tts_config::EngineConfig;
use podcast_tts_core::{Error, Result, Segment, Strategy, VoiceMap};
use podcast_tts_monitor::{MonitorError, TaskMonitor};
use podcast_tts_persistence::{
    audio_filename, audio_object_key, AudioStore, BlobStore, NewAudioRow, PersistenceError,
    MAX_AUDIO_VERSION,
};
use podcast_tts_transport::SpeechProvider;

use crate::parser::{segment_turns, DialogueParser};
use crate::worker::SegmentWorker;

const AUDIO_CONTENT_TYPE: &str = "audio/mpeg";

/// Result of a completed engine run.
#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub audio_key: String,
    pub audio_filename: String,
    pub audio_url: String,
    pub size: usize,
    pub version: u32,
    pub strategy: Strategy,
    pub segment_count: usize,
}

pub struct TaskEngine {
    provider: Arc<dyn SpeechProvider>,
    blob: Arc<dyn BlobStore>,
    audio_store: Arc<dyn AudioStore>,
    monitor: Arc<dyn TaskMonitor>,
    voices: VoiceMap,
    config: EngineConfig,
    public_read: bool,
}

impl TaskEngine {
    pub fn new(
        provider: Arc<dyn SpeechProvider>,
        blob: Arc<dyn BlobStore>,
        audio_store: Arc<dyn AudioStore>,
        monitor: Arc<dyn TaskMonitor>,
        voices: VoiceMap,
        config: EngineConfig,
        public_read: bool,
    ) -> Self {
        Self {
            provider,
            blob,
            audio_store,
            monitor,
            voices,
            config,
            public_read,
        }
    }

    /// Execute a task. The caller has already acquired a limiter slot and
    /// moved the task to PROCESSING.
    pub async fn execute(
        &self,
        text_id: &str,
        text: &str,
        user_id: &str,
        title: &str,
    ) -> Result<EngineOutput> {
        let parser = DialogueParser::new(self.voices.clone());
        let turns = parser.parse(text)?;
        let segments = segment_turns(turns, self.config.max_turns_per_segment);

        let char_count = text.chars().count();
        let strategy = choose_strategy(char_count, segments.len(), self.config.long_text_threshold);
        self.monitor
            .record_strategy(text_id, strategy, segments.len() as u32)
            .await
            .map_err(monitor_internal)?;

        tracing::info!(
            text_id,
            char_count,
            segments = segments.len(),
            strategy = strategy.as_str(),
            "task execution started"
        );

        let buffers = match strategy {
            Strategy::Serial => self.run_serial(text_id, &segments).await?,
            Strategy::Parallel => self.run_parallel(text_id, &segments).await?,
        };

        // The provider's codec is append-safe; reassembly is plain
        // concatenation in segment-index order.
        let audio: Vec<u8> = buffers.concat();

        let version = self
            .audio_store
            .next_version(text_id)
            .await
            .map_err(|e| Error::storage(e.to_string()))?;
        if version > MAX_AUDIO_VERSION {
            return Err(Error::storage(format!(
                "audio version limit reached for text {text_id}"
            )));
        }

        let filename = audio_filename(title, char_count, version);
        let key = audio_object_key(chrono::Utc::now(), &filename);
        let url = self
            .blob
            .put(&key, &audio, AUDIO_CONTENT_TYPE, self.public_read)
            .await
            .map_err(|e| Error::storage(e.to_string()))?;

        let row = NewAudioRow {
            text_id: text_id.to_string(),
            user_id: user_id.to_string(),
            filename: filename.clone(),
            object_key: key.clone(),
            duration_secs: None,
            size: audio.len() as u64,
            version_num: version,
        };
        match self.audio_store.insert(row).await {
            Ok(_) => {}
            Err(PersistenceError::Conflict(_)) => {
                // A concurrent writer got there first; reuse its row only if
                // it points at the same object.
                let existing = self
                    .audio_store
                    .live_for_text(text_id)
                    .await
                    .map_err(|e| Error::storage(e.to_string()))?;
                match existing {
                    Some(row) if row.object_key == key => {
                        tracing::warn!(text_id, "audio row already recorded; reusing");
                    }
                    _ => {
                        return Err(Error::storage(format!(
                            "conflicting audio row for text {text_id}"
                        )));
                    }
                }
            }
            Err(e) => return Err(Error::storage(e.to_string())),
        }

        self.monitor
            .complete_task(text_id, &key, &filename, &url)
            .await
            .map_err(monitor_internal)?;

        tracing::info!(
            text_id,
            audio_key = %key,
            size = audio.len(),
            version,
            "task completed"
        );

        Ok(EngineOutput {
            audio_key: key,
            audio_filename: filename,
            audio_url: url,
            size: audio.len(),
            version,
            strategy,
            segment_count: segments.len(),
        })
    }

    fn worker(&self) -> SegmentWorker {
        SegmentWorker::new(
            self.provider.clone(),
            self.voices.clone(),
            self.config.segment_max_retries,
            self.config.segment_retry_delay_base(),
        )
    }

    async fn run_serial(&self, text_id: &str, segments: &[Segment]) -> Result<Vec<Vec<u8>>> {
        let worker = self.worker();
        let mut buffers = Vec::with_capacity(segments.len());
        for segment in segments {
            let audio = worker.run(segment).await?;
            buffers.push(audio);
            self.report_progress(text_id, buffers.len() as u32).await;
        }
        Ok(buffers)
    }

    /// Dispatch segments in contiguous batches of `max_concurrent_segments`.
    /// A failing batch member cancels its in-flight peers; collected buffers
    /// are discarded with the task.
    async fn run_parallel(&self, text_id: &str, segments: &[Segment]) -> Result<Vec<Vec<u8>>> {
        let worker = self.worker();
        let mut buffers: Vec<Option<Vec<u8>>> = vec![None; segments.len()];
        let mut completed = 0u32;

        for batch in segments.chunks(self.config.max_concurrent_segments) {
            let mut join = tokio::task::JoinSet::new();
            for segment in batch {
                let worker = worker.clone();
                let segment = segment.clone();
                join.spawn(async move {
                    let result = worker.run(&segment).await;
                    (segment.index, result)
                });
            }

            let mut first_failure: Option<(usize, Error)> = None;
            while let Some(joined) = join.join_next().await {
                match joined {
                    Ok((index, Ok(audio))) => {
                        buffers[index] = Some(audio);
                    }
                    Ok((index, Err(e))) => {
                        if first_failure.is_none() {
                            tracing::warn!(
                                text_id,
                                segment = index,
                                error = %e,
                                "batch member failed; cancelling peers"
                            );
                            first_failure = Some((index, e));
                            // Aborted workers drop their sessions, which
                            // closes the provider transports.
                            join.abort_all();
                        }
                    }
                    Err(join_err) if join_err.is_cancelled() => {}
                    Err(join_err) => {
                        if first_failure.is_none() {
                            first_failure = Some((
                                batch[0].index,
                                Error::internal(format!("segment task panicked: {join_err}")),
                            ));
                            join.abort_all();
                        }
                    }
                }
            }

            if let Some((index, e)) = first_failure {
                tracing::warn!(text_id, segment = index, "task aborted in parallel batch");
                return Err(e);
            }

            completed += batch.len() as u32;
            self.report_progress(text_id, completed).await;
        }

        buffers
            .into_iter()
            .map(|b| b.ok_or_else(|| Error::internal("segment buffer missing after join")))
            .collect()
    }

    /// Progress is advisory; a store hiccup must not fail the task.
    async fn report_progress(&self, text_id: &str, completed: u32) {
        if let Err(e) = self.monitor.record_progress(text_id, completed).await {
            tracing::warn!(text_id, error = %e, "progress update failed");
        }
    }
}

/// Serial for short texts and single-segment tasks; parallel otherwise. The
/// character threshold is inclusive.
pub(crate) fn choose_strategy(
    char_count: usize,
    segment_count: usize,
    long_text_threshold: usize,
) -> Strategy {
    if segment_count <= 1 || char_count < long_text_threshold {
        Strategy::Serial
    } else {
        Strategy::Parallel
    }
}

fn monitor_internal(e: MonitorError) -> Error {
    Error::internal(format!("monitor: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_serial() {
        assert_eq!(choose_strategy(1500, 3, 2000), Strategy::Serial);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        assert_eq!(choose_strategy(2000, 3, 2000), Strategy::Parallel);
        assert_eq!(choose_strategy(1999, 3, 2000), Strategy::Serial);
    }

    #[test]
    fn test_single_segment_is_serial_regardless_of_length() {
        assert_eq!(choose_strategy(10_000, 1, 2000), Strategy::Serial);
    }
}
