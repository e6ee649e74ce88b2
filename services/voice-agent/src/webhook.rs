//! Transcript extraction for device webhooks
//!
//! Wearable devices post transcripts in a handful of shapes. The first shape
//! that yields non-blank text wins.

use serde_json::Value;

/// Pull the spoken text out of a webhook payload.
///
/// Accepted shapes, checked in order:
/// - `{"transcript": "..."}`
/// - `{"text": "..."}`
/// - `{"segments": [{"text": "..."}, ...]}` (items may also be plain strings)
/// - `{"transcript_segments": [...]}` (same item rules as `segments`)
///
/// Returns `None` when nothing usable is found.
pub fn extract_transcript(payload: &Value) -> Option<String> {
    let object = payload.as_object()?;

    for key in ["transcript", "text"] {
        if let Some(text) = object.get(key).and_then(Value::as_str).and_then(non_blank) {
            return Some(text);
        }
    }

    ["segments", "transcript_segments"]
        .into_iter()
        .filter_map(|key| object.get(key).and_then(Value::as_array))
        .find_map(|segments| join_segments(segments))
}

fn join_segments(segments: &[Value]) -> Option<String> {
    let parts: Vec<&str> = segments
        .iter()
        .filter_map(|segment| match segment {
            Value::String(s) => Some(s.as_str()),
            Value::Object(o) => o.get("text").and_then(Value::as_str),
            _ => None,
        })
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    non_blank(&parts.join(" "))
}

fn non_blank(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
