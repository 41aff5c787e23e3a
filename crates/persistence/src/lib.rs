//! Persistence contracts for the dialogue TTS service
//!
//! Object storage and relational persistence are external collaborators; this
//! crate defines the interfaces the task pipeline writes through:
//! - `BlobStore`: blob-put with public URLs
//! - `TextStore` / `AudioStore`: row-level inserts and reads
//! - Object-key and filename derivation rules
//!
//! Reference implementations (in-memory, filesystem blob) back tests and
//! single-node deployments.

pub mod blob;
pub mod error;
pub mod keys;
pub mod memory;
pub mod records;

pub use blob::{BlobStore, FsBlobStore};
pub use error::PersistenceError;
pub use keys::{audio_filename, audio_object_key, char_bucket, text_object_key, MAX_AUDIO_VERSION};
pub use memory::{MemoryAudioStore, MemoryBlobStore, MemoryTextStore};
pub use records::{AudioRow, AudioStore, NewAudioRow, TextRow, TextStore};
