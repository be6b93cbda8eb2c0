use anyhow::{anyhow, ensure, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    System,
    Human,
    Gpt,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::System => "system",
            Speaker::Human => "human",
            Speaker::Gpt => "gpt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub from: Speaker,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub category: String,
    pub session_id: String,
    pub quality_score: f64,
    pub chunk_index: usize,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub downweighted: bool,
}

/// One emitted training example, serialized as a single shard line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub conversations: Vec<ConversationEntry>,
    pub metadata: RecordMetadata,
}

impl TrainingRecord {
    pub fn to_json_line(&self) -> Result<String> {
        serde_json::to_string(self).context("serialize training record")
    }

    pub fn validate_schema(&self) -> Result<()> {
        validate_record_value(&serde_json::to_value(self)?)
    }
}

/// Check one already-serialized shard line against the record schema.
pub fn validate_record_value(value: &serde_json::Value) -> Result<()> {
    let obj = value
        .as_object()
        .context("record must be a JSON object")?;

    let conversations = obj
        .get("conversations")
        .and_then(|v| v.as_array())
        .context("conversations must be an array")?;
    ensure!(
        conversations.len() >= 3,
        "conversations needs a system entry and at least one human/gpt exchange"
    );

    let mut prev: Option<&str> = None;
    for (i, entry) in conversations.iter().enumerate() {
        let entry = entry
            .as_object()
            .with_context(|| format!("conversation entry {i} must be an object"))?;
        let from = ensure_string(entry, "from").with_context(|| format!("entry {i}"))?;
        ensure_string(entry, "value").with_context(|| format!("entry {i}"))?;

        let expected: &[&str] = match prev {
            None => &["system"],
            Some("system") | Some("gpt") => &["human"],
            Some(_) => &["gpt"],
        };
        ensure!(
            expected.contains(&from),
            "entry {i}: expected '{}' but found '{from}'",
            expected[0]
        );
        prev = Some(from);
    }
    ensure!(
        prev == Some("gpt"),
        "conversation must end with a 'gpt' entry"
    );

    let metadata = obj
        .get("metadata")
        .and_then(|v| v.as_object())
        .context("metadata must be an object")?;
    ensure_string(metadata, "category")?;
    ensure_string(metadata, "session_id")?;
    let score = metadata
        .get("quality_score")
        .and_then(|v| v.as_f64())
        .context("metadata.quality_score must be a number")?;
    ensure!(
        (0.0..=1.0).contains(&score),
        "metadata.quality_score must be within [0, 1], got {score}"
    );

    Ok(())
}

fn ensure_string<'a>(
    map: &'a serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<&'a str> {
    map.get(key)
        .and_then(|v| v.as_str())
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| anyhow!("{key} missing or not a non-empty string"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> TrainingRecord {
        TrainingRecord {
            conversations: vec![
                ConversationEntry {
                    from: Speaker::System,
                    value: "You are a worker agent.".to_string(),
                },
                ConversationEntry {
                    from: Speaker::Human,
                    value: "list the files".to_string(),
                },
                ConversationEntry {
                    from: Speaker::Gpt,
                    value: "<tool_call name=\"Bash\">\n{\"command\":\"ls\"}\n</tool_call>".to_string(),
                },
            ],
            metadata: RecordMetadata {
                category: "polecat".to_string(),
                session_id: "session-1".to_string(),
                quality_score: 0.61,
                chunk_index: 0,
                downweighted: false,
            },
        }
    }

    #[test]
    fn accepts_valid_record() -> Result<()> {
        record().validate_schema()?;
        Ok(())
    }

    #[test]
    fn serializes_wire_shape() -> Result<()> {
        let line = record().to_json_line()?;
        let value: serde_json::Value = serde_json::from_str(&line)?;
        assert_eq!(value["conversations"][0]["from"], "system");
        assert_eq!(value["conversations"][2]["from"], "gpt");
        assert_eq!(value["metadata"]["category"], "polecat");
        assert!(value["metadata"].get("downweighted").is_none());
        Ok(())
    }

    #[test]
    fn downweighted_flag_is_written_when_set() -> Result<()> {
        let mut rec = record();
        rec.metadata.downweighted = true;
        let value: serde_json::Value = serde_json::from_str(&rec.to_json_line()?)?;
        assert_eq!(value["metadata"]["downweighted"], true);
        Ok(())
    }

    #[test]
    fn rejects_repeated_speaker() {
        let invalid = json!({
            "conversations": [
                {"from": "system", "value": "s"},
                {"from": "human", "value": "a"},
                {"from": "human", "value": "b"},
                {"from": "gpt", "value": "c"}
            ],
            "metadata": {"category": "crew", "session_id": "s1", "quality_score": 0.5}
        });
        assert!(validate_record_value(&invalid).is_err());
    }

    #[test]
    fn rejects_missing_system() {
        let invalid = json!({
            "conversations": [
                {"from": "human", "value": "a"},
                {"from": "gpt", "value": "b"},
                {"from": "human", "value": "c"},
                {"from": "gpt", "value": "d"}
            ],
            "metadata": {"category": "crew", "session_id": "s1", "quality_score": 0.5}
        });
        assert!(validate_record_value(&invalid).is_err());
    }

    #[test]
    fn rejects_out_of_range_score() {
        let invalid = json!({
            "conversations": [
                {"from": "system", "value": "s"},
                {"from": "human", "value": "a"},
                {"from": "gpt", "value": "b"}
            ],
            "metadata": {"category": "crew", "session_id": "s1", "quality_score": 1.5}
        });
        assert!(validate_record_value(&invalid).is_err());
    }
}
