//! Object-key and filename derivation
//!
//! Audio objects live under `audio/{yyyy}/{mm}/{base}_{bucket}_v{NN}.mp3`,
//! text objects under `text/{yyyy}/{mm}/…`. The bucket tag groups outputs by
//! submission size; the version suffix is zero-padded and capped at 99.

use chrono::{DateTime, Datelike, Utc};

/// Highest allowed audio version per text.
pub const MAX_AUDIO_VERSION: u32 = 99;

/// Character count above which an audio is bucketed as `long`.
const LONG_BUCKET_THRESHOLD: usize = 4000;

/// Size bucket tag embedded in audio filenames.
pub fn char_bucket(char_count: usize) -> &'static str {
    if char_count > LONG_BUCKET_THRESHOLD {
        "long"
    } else {
        "short"
    }
}

/// Filename for an audio object: `{base}_{bucket}_v{NN}.mp3`.
pub fn audio_filename(base_name: &str, char_count: usize, version: u32) -> String {
    format!(
        "{}_{}_v{:02}.mp3",
        sanitize_segment(base_name),
        char_bucket(char_count),
        version.min(MAX_AUDIO_VERSION)
    )
}

/// Object key for an audio file, dated by upload time.
pub fn audio_object_key(at: DateTime<Utc>, filename: &str) -> String {
    format!("audio/{:04}/{:02}/{}", at.year(), at.month(), filename)
}

/// Object key for a submitted text file.
pub fn text_object_key(at: DateTime<Utc>, filename: &str) -> String {
    format!(
        "text/{:04}/{:02}/{}",
        at.year(),
        at.month(),
        sanitize_segment(filename)
    )
}

/// Strip path-hostile characters from a user-provided name segment. The
/// result is always a single path segment; the blob store separately refuses
/// `..` segments.
fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| match c {
            '/' | '\\' | '?' | '#' | '%' | '\0' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "untitled".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_char_bucket_boundary() {
        assert_eq!(char_bucket(4000), "short");
        assert_eq!(char_bucket(4001), "long");
    }

    #[test]
    fn test_audio_filename_zero_padded_version() {
        assert_eq!(audio_filename("episode", 1500, 1), "episode_short_v01.mp3");
        assert_eq!(audio_filename("episode", 5000, 12), "episode_long_v12.mp3");
    }

    #[test]
    fn test_audio_object_key_dated() {
        let at = Utc.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).unwrap();
        assert_eq!(
            audio_object_key(at, "episode_short_v01.mp3"),
            "audio/2026/03/episode_short_v01.mp3"
        );
    }

    #[test]
    fn test_sanitize_strips_path_separators() {
        assert_eq!(
            audio_filename("../etc/passwd", 10, 1),
            ".._etc_passwd_short_v01.mp3"
        );
        assert_eq!(audio_filename("..", 10, 1), "untitled_short_v01.mp3");
        assert_eq!(
            text_object_key(Utc.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).unwrap(), "notes.txt"),
            "text/2026/03/notes.txt"
        );
    }
}
