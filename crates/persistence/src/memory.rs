//! In-memory reference implementations
//!
//! Back the test suite and single-process deployments without external
//! services. The audio store enforces the same uniqueness rules a relational
//! schema would.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::blob::BlobStore;
use crate::records::{AudioRow, AudioStore, NewAudioRow, TextRow, TextStore};
use crate::PersistenceError;

/// In-memory blob store; records every put for assertions.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    put_count: Mutex<u64>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_count(&self) -> u64 {
        *self.put_count.lock()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        _content_type: &str,
        _public_read: bool,
    ) -> Result<String, PersistenceError> {
        self.objects.lock().insert(key.to_string(), bytes.to_vec());
        *self.put_count.lock() += 1;
        Ok(self.public_url(key))
    }

    async fn exists(&self, key: &str) -> Result<bool, PersistenceError> {
        Ok(self.objects.lock().contains_key(key))
    }

    fn public_url(&self, key: &str) -> String {
        format!("memory://{key}")
    }
}

/// In-memory text table.
#[derive(Default)]
pub struct MemoryTextStore {
    rows: Mutex<HashMap<String, TextRow>>,
}

impl MemoryTextStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TextStore for MemoryTextStore {
    async fn insert(&self, row: TextRow) -> Result<(), PersistenceError> {
        let mut rows = self.rows.lock();
        if rows.contains_key(&row.text_id) {
            return Err(PersistenceError::Conflict(format!(
                "text {} already exists",
                row.text_id
            )));
        }
        rows.insert(row.text_id.clone(), row);
        Ok(())
    }

    async fn get(&self, text_id: &str) -> Result<Option<TextRow>, PersistenceError> {
        Ok(self.rows.lock().get(text_id).cloned())
    }
}

/// In-memory audio table with the schema's uniqueness rules.
#[derive(Default)]
pub struct MemoryAudioStore {
    rows: Mutex<Vec<AudioRow>>,
    next_id: Mutex<u64>,
}

impl MemoryAudioStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().len()
    }
}

#[async_trait]
impl AudioStore for MemoryAudioStore {
    async fn insert(&self, row: NewAudioRow) -> Result<AudioRow, PersistenceError> {
        let mut rows = self.rows.lock();

        if rows
            .iter()
            .any(|r| r.text_id == row.text_id && !r.is_deleted)
        {
            return Err(PersistenceError::Conflict(format!(
                "live audio already exists for text {}",
                row.text_id
            )));
        }
        if rows.iter().any(|r| r.object_key == row.object_key) {
            return Err(PersistenceError::Conflict(format!(
                "object key already recorded: {}",
                row.object_key
            )));
        }

        let mut next_id = self.next_id.lock();
        *next_id += 1;

        let stored = AudioRow {
            audio_id: *next_id,
            text_id: row.text_id,
            user_id: row.user_id,
            filename: row.filename,
            object_key: row.object_key,
            duration_secs: row.duration_secs,
            size: row.size,
            version_num: row.version_num,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
            is_deleted: false,
        };
        rows.push(stored.clone());
        Ok(stored)
    }

    async fn live_for_text(&self, text_id: &str) -> Result<Option<AudioRow>, PersistenceError> {
        Ok(self
            .rows
            .lock()
            .iter()
            .find(|r| r.text_id == text_id && !r.is_deleted)
            .cloned())
    }

    async fn next_version(&self, text_id: &str) -> Result<u32, PersistenceError> {
        let highest = self
            .rows
            .lock()
            .iter()
            .filter(|r| r.text_id == text_id)
            .map(|r| r.version_num)
            .max()
            .unwrap_or(0);
        Ok(highest + 1)
    }

    async fn count_live(&self) -> Result<u64, PersistenceError> {
        Ok(self.rows.lock().iter().filter(|r| !r.is_deleted).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(text_id: &str, object_key: &str, version: u32) -> NewAudioRow {
        NewAudioRow {
            text_id: text_id.to_string(),
            user_id: "u-1".to_string(),
            filename: format!("a_v{version:02}.mp3"),
            object_key: object_key.to_string(),
            duration_secs: None,
            size: 128,
            version_num: version,
        }
    }

    #[tokio::test]
    async fn test_one_live_audio_per_text() {
        let store = MemoryAudioStore::new();
        store.insert(audio("t-1", "audio/2026/01/a.mp3", 1)).await.unwrap();

        let err = store
            .insert(audio("t-1", "audio/2026/01/b.mp3", 2))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_object_key_unique() {
        let store = MemoryAudioStore::new();
        store.insert(audio("t-1", "audio/2026/01/a.mp3", 1)).await.unwrap();

        let err = store
            .insert(audio("t-2", "audio/2026/01/a.mp3", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_next_version_counts_all_rows() {
        let store = MemoryAudioStore::new();
        assert_eq!(store.next_version("t-1").await.unwrap(), 1);
        store.insert(audio("t-1", "audio/2026/01/a.mp3", 1)).await.unwrap();
        assert_eq!(store.next_version("t-1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_blob_store_records_puts() {
        let store = MemoryBlobStore::new();
        let url = store.put("audio/x.mp3", &[1, 2, 3], "audio/mpeg", true).await.unwrap();
        assert_eq!(url, "memory://audio/x.mp3");
        assert_eq!(store.put_count(), 1);
        assert_eq!(store.get("audio/x.mp3"), Some(vec![1, 2, 3]));
        assert!(store.exists("audio/x.mp3").await.unwrap());
    }
}
