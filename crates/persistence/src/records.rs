//! Row-level persistence contracts
//!
//! Two tables: `texts` (submitted dialogue texts) and `audios` (synthesised
//! outputs). At most one live audio exists per text: the `(text_id, live)`
//! pair is unique, as is the audio object key.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::PersistenceError;

/// A submitted text row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextRow {
    pub text_id: String,
    pub user_id: String,
    pub filename: String,
    pub title: String,
    pub content: String,
    pub char_count: usize,
    pub object_key: String,
    pub created_at_ms: i64,
    pub is_deleted: bool,
}

/// A synthesised audio row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioRow {
    pub audio_id: u64,
    pub text_id: String,
    pub user_id: String,
    pub filename: String,
    pub object_key: String,
    pub duration_secs: Option<u32>,
    pub size: u64,
    pub version_num: u32,
    pub created_at_ms: i64,
    pub is_deleted: bool,
}

/// Insert payload for an audio row; the store assigns `audio_id`.
#[derive(Debug, Clone)]
pub struct NewAudioRow {
    pub text_id: String,
    pub user_id: String,
    pub filename: String,
    pub object_key: String,
    pub duration_secs: Option<u32>,
    pub size: u64,
    pub version_num: u32,
}

#[async_trait]
pub trait TextStore: Send + Sync {
    async fn insert(&self, row: TextRow) -> Result<(), PersistenceError>;

    async fn get(&self, text_id: &str) -> Result<Option<TextRow>, PersistenceError>;
}

#[async_trait]
pub trait AudioStore: Send + Sync {
    /// Insert a new audio row.
    ///
    /// Fails with `Conflict` when a live audio already exists for the text or
    /// the object key is taken.
    async fn insert(&self, row: NewAudioRow) -> Result<AudioRow, PersistenceError>;

    /// The live (non-deleted) audio for a text, if any.
    async fn live_for_text(&self, text_id: &str) -> Result<Option<AudioRow>, PersistenceError>;

    /// Next version number for a text (1 + highest existing, deleted included).
    async fn next_version(&self, text_id: &str) -> Result<u32, PersistenceError>;

    /// Number of live audio rows; the durable completion count.
    async fn count_live(&self) -> Result<u64, PersistenceError>;
}
