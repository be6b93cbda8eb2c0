use chrono::{DateTime, Utc};
use serde_json::Value;

/// Block types that never contribute to a turn's visible text.
const OPAQUE_BLOCKS: [&str; 4] = ["thinking", "redacted_thinking", "image", "tool_use"];

/// Text of a `content` value from either transcript format: a plain string,
/// an array of content blocks joined by newlines, or a single block or tool
/// result envelope. Reasoning, image and call blocks yield nothing.
pub fn extract_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(extract_text)
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(block) => {
            let kind = block.get("type").and_then(Value::as_str);
            if kind.is_some_and(|k| OPAQUE_BLOCKS.contains(&k)) {
                return None;
            }
            return ["text", "content", "output", "message"]
                .iter()
                .find_map(|key| block.get(*key).and_then(extract_text));
        }
        _ => return None,
    };
    (!text.trim().is_empty()).then_some(text)
}

/// The `timestamp` field of a transcript record. Both Claude and Codex write
/// RFC 3339 strings; anything else is treated as missing.
pub fn record_timestamp(record: &Value) -> Option<DateTime<Utc>> {
    let raw = record.get("timestamp")?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
