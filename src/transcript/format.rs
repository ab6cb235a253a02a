//! Transcript payload decoding and flattening.
//!
//! Two payload shapes are accepted, both a JSON array of segments:
//! - `{ "participant": { "name": .. }, "words": [{ "text": .. }] }`
//! - `{ "speaker": .., "words": [{ "text": .. }] }`
//!
//! Words may also be bare strings.

use serde_json::Value as JsonValue;

use crate::error::SyncError;

const UNKNOWN_SPEAKER: &str = "Unknown speaker";

/// One speaker turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub speaker: String,
    pub words: Vec<String>,
}

impl Segment {
    pub fn text(&self) -> String {
        self.words.join(" ")
    }
}

pub fn parse_segments(raw: &str) -> Result<Vec<Segment>, SyncError> {
    let payload: JsonValue = serde_json::from_str(raw)
        .map_err(|err| SyncError::parse(format!("transcript is not JSON: {err}"), raw))?;

    let items = match &payload {
        JsonValue::Array(items) => items,
        JsonValue::Object(obj) => match obj.get("segments").or_else(|| obj.get("results")) {
            Some(JsonValue::Array(items)) => items,
            _ => return Err(SyncError::parse("transcript has no segment list", raw)),
        },
        _ => return Err(SyncError::parse("transcript is not a segment list", raw)),
    };

    let mut segments = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            return Err(SyncError::parse(
                format!("transcript segment {idx} is not an object"),
                raw,
            ));
        };

        let speaker = item
            .pointer("/participant/name")
            .or_else(|| obj.get("speaker"))
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(UNKNOWN_SPEAKER)
            .to_string();

        let words = match obj.get("words") {
            Some(JsonValue::Array(words)) => words
                .iter()
                .filter_map(|w| match w {
                    JsonValue::String(text) => Some(text.as_str()),
                    JsonValue::Object(word) => word.get("text").and_then(|t| t.as_str()),
                    _ => None,
                })
                .map(str::trim)
                .filter(|w| !w.is_empty())
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>(),
            Some(JsonValue::Null) | None => Vec::new(),
            Some(_) => {
                return Err(SyncError::parse(
                    format!("transcript segment {idx} has non-array words"),
                    raw,
                ))
            }
        };

        if !words.is_empty() {
            segments.push(Segment { speaker, words });
        }
    }

    Ok(segments)
}

/// Speaker-attributed plain text, one line per turn. Consecutive segments by
/// the same speaker share a line.
pub fn flatten(segments: &[Segment]) -> String {
    let mut lines: Vec<(String, String)> = Vec::new();

    for segment in segments {
        let text = segment.text();
        match lines.last_mut() {
            Some((speaker, line)) if *speaker == segment.speaker => {
                line.push(' ');
                line.push_str(&text);
            }
            _ => lines.push((segment.speaker.clone(), text)),
        }
    }

    lines
        .into_iter()
        .map(|(speaker, text)| format!("{speaker}: {text}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_format() {
        let raw = r#"[
            {"participant": {"id": 1, "name": "Alice"},
             "words": [{"text": "Hello", "start_timestamp": {"relative": 0.1}}, {"text": "team"}]},
            {"participant": {"id": 2, "name": "Bob"}, "words": [{"text": "Hi"}]}
        ]"#;
        let segments = parse_segments(raw).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].speaker, "Alice");
        assert_eq!(segments[0].text(), "Hello team");
        assert_eq!(flatten(&segments), "Alice: Hello team\nBob: Hi");
    }

    #[test]
    fn test_speaker_format_and_bare_words() {
        let raw = r#"{"segments": [{"speaker": "Carol", "words": ["Ship", " it "]}]}"#;
        let segments = parse_segments(raw).unwrap();
        assert_eq!(flatten(&segments), "Carol: Ship it");
    }

    #[test]
    fn test_consecutive_turns_merge() {
        let segments = vec![
            Segment {
                speaker: "Alice".into(),
                words: vec!["One".into()],
            },
            Segment {
                speaker: "Alice".into(),
                words: vec!["two".into()],
            },
            Segment {
                speaker: "Bob".into(),
                words: vec!["Three".into()],
            },
            Segment {
                speaker: "Alice".into(),
                words: vec!["four".into()],
            },
        ];
        assert_eq!(flatten(&segments), "Alice: One two\nBob: Three\nAlice: four");
    }

    #[test]
    fn test_missing_speaker_and_empty_segments() {
        let raw = r#"[
            {"participant": {"name": null}, "words": [{"text": "anyone?"}]},
            {"speaker": "Dan", "words": []},
            {"speaker": "Eve", "words": [{"text": "  "}]}
        ]"#;
        let segments = parse_segments(raw).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].speaker, UNKNOWN_SPEAKER);
    }

    #[test]
    fn test_unexpected_shapes_are_parse_errors() {
        for raw in [
            "not json",
            r#"{"status": "processing"}"#,
            r#"[1, 2]"#,
            r#"[{"speaker": "A", "words": "hello"}]"#,
        ] {
            let err = parse_segments(raw).unwrap_err();
            assert_eq!(err.kind(), "parse", "payload {raw}");
        }
    }

    #[test]
    fn test_empty_transcript() {
        assert!(parse_segments("[]").unwrap().is_empty());
        assert_eq!(flatten(&[]), "");
    }
}
