//! Dialogue parsing and segmentation
//!
//! Recognised line shape: `speaker: utterance`, where the label may carry a
//! parenthesised description and both ASCII and full-width colon/parentheses
//! are accepted:
//!
//! ```text
//! Ann: Welcome back to the show.
//! Ben（旁白）：今天聊点别的。
//! ```
//!
//! Lines without a speaker label continue the previous turn's utterance.
//! Stage directions in square brackets (`[laughs]`) are stripped. Speakers
//! are mapped to voice-profile indices in first-appearance order; a dialogue
//! needing more voices than configured is rejected.

use std::collections::HashMap;

use podcast_tts_core::{DialogueTurn, InputError, Result, Segment, VoiceMap};

pub struct DialogueParser {
    voices: VoiceMap,
}

impl DialogueParser {
    pub fn new(voices: VoiceMap) -> Self {
        Self { voices }
    }

    /// Parse a dialogue text into ordered turns.
    pub fn parse(&self, text: &str) -> Result<Vec<DialogueTurn>> {
        let mut turns: Vec<DialogueTurn> = Vec::new();
        let mut speaker_ids: HashMap<String, u16> = HashMap::new();

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }

            match split_speaker_line(line) {
                Some((role, content)) => {
                    let content = strip_stage_directions(content);
                    if content.is_empty() {
                        continue;
                    }

                    let speaker = match speaker_ids.get(role) {
                        Some(&id) => id,
                        None => {
                            let id = speaker_ids.len() as u16;
                            if (id as usize) >= self.voices.capacity() {
                                return Err(InputError::InvalidSpeaker(role.to_string()).into());
                            }
                            speaker_ids.insert(role.to_string(), id);
                            id
                        }
                    };
                    turns.push(DialogueTurn::new(speaker, content));
                }
                None => {
                    // Continuation of the previous turn; leading text with no
                    // turn to attach to is dropped.
                    let content = strip_stage_directions(line);
                    if content.is_empty() {
                        continue;
                    }
                    if let Some(last) = turns.last_mut() {
                        last.utterance.push('\n');
                        last.utterance.push_str(&content);
                    }
                }
            }
        }

        if turns.is_empty() {
            return Err(InputError::EmptyInput.into());
        }
        Ok(turns)
    }
}

/// Split `label: content`, tolerating a parenthesised description in the
/// label and full-width punctuation. Returns `None` for continuation lines.
fn split_speaker_line(line: &str) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    for (idx, c) in line.char_indices() {
        match c {
            '（' | '(' => depth += 1,
            '）' | ')' => depth = depth.saturating_sub(1),
            ':' | '：' if depth == 0 => {
                let head = line[..idx].trim();
                let content = line[idx + c.len_utf8()..].trim();
                let role = strip_description(head);
                if role.is_empty() || content.is_empty() {
                    return None;
                }
                return Some((role, content));
            }
            _ => {}
        }
    }
    None
}

/// Drop a trailing `（description）` from a speaker label.
fn strip_description(label: &str) -> &str {
    for open in ['（', '('] {
        if let Some(idx) = label.find(open) {
            return label[..idx].trim();
        }
    }
    label
}

/// Remove `[stage direction]` spans from an utterance.
fn strip_stage_directions(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut in_brackets = false;
    for c in content.chars() {
        match c {
            '[' => in_brackets = true,
            ']' if in_brackets => in_brackets = false,
            c if !in_brackets => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}

/// Pack consecutive turns greedily into segments of at most
/// `max_per_segment` turns. Turns are never split across segments.
pub fn segment_turns(turns: Vec<DialogueTurn>, max_per_segment: usize) -> Vec<Segment> {
    turns
        .chunks(max_per_segment.max(1))
        .enumerate()
        .map(|(index, chunk)| Segment {
            index,
            turns: chunk.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use podcast_tts_core::{Error, ErrorKind};

    fn parser() -> DialogueParser {
        DialogueParser::new(VoiceMap::new(vec!["voice_a".into(), "voice_b".into()]))
    }

    #[test]
    fn test_parse_basic_dialogue() {
        let turns = parser()
            .parse("Ann: Welcome back.\nBen: Glad to be here.\nAnn: Let's begin.")
            .unwrap();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].speaker, 0);
        assert_eq!(turns[1].speaker, 1);
        assert_eq!(turns[2].speaker, 0);
        assert_eq!(turns[1].utterance, "Glad to be here.");
    }

    #[test]
    fn test_parse_full_width_punctuation_and_description() {
        let turns = parser()
            .parse("婷婷（活泼感性）：哈喽，大家好！\n小西(逻辑严谨): 我们开始吧。")
            .unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].speaker, 0);
        assert_eq!(turns[0].utterance, "哈喽，大家好！");
        assert_eq!(turns[1].speaker, 1);
    }

    #[test]
    fn test_continuation_attaches_to_previous_turn() {
        let turns = parser()
            .parse("Ann: First part.\nand the rest of it.\nBen: Next.")
            .unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].utterance, "First part.\nand the rest of it.");
    }

    #[test]
    fn test_leading_continuation_is_dropped() {
        let turns = parser().parse("stray preamble\nAnn: Actual start.").unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].utterance, "Actual start.");
    }

    #[test]
    fn test_stage_directions_are_stripped() {
        let turns = parser().parse("Ann: [laughs] That was close. [pause]").unwrap();
        assert_eq!(turns[0].utterance, "That was close.");
    }

    #[test]
    fn test_empty_input_rejected() {
        let err = parser().parse("\n  \n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
        assert!(matches!(err, Error::Input(InputError::EmptyInput)));
    }

    #[test]
    fn test_only_stage_directions_rejected() {
        let err = parser().parse("Ann: [sighs]").unwrap_err();
        assert!(matches!(err, Error::Input(InputError::EmptyInput)));
    }

    #[test]
    fn test_too_many_speakers_rejected() {
        let err = parser()
            .parse("A: one\nB: two\nC: three")
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Input(InputError::InvalidSpeaker(ref s)) if s == "C"
        ));
    }

    #[test]
    fn test_colon_inside_description_is_not_a_split_point() {
        let turns = parser().parse("Ann（note: host）: Hello.").unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].utterance, "Hello.");
    }

    #[test]
    fn test_segmentation_never_splits_turns() {
        let turns: Vec<DialogueTurn> = (0..25)
            .map(|i| DialogueTurn::new((i % 2) as u16, format!("turn {i}")))
            .collect();
        let segments = segment_turns(turns, 10);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].turn_count(), 10);
        assert_eq!(segments[1].turn_count(), 10);
        assert_eq!(segments[2].turn_count(), 5);
        assert_eq!(segments[2].index, 2);
    }

    #[test]
    fn test_segmentation_single_turn_per_segment() {
        let turns: Vec<DialogueTurn> = (0..15)
            .map(|i| DialogueTurn::new(0, format!("turn {i}")))
            .collect();
        let segments = segment_turns(turns, 1);
        assert_eq!(segments.len(), 15);
        assert!(segments.iter().all(|s| s.turn_count() == 1));
    }
}
