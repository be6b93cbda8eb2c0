use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Speaker of a single turn inside a source transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ActionResult,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::ActionResult => "action_result",
        }
    }

    /// Assistant text and action results both end up on the model side of a record.
    pub fn is_model_side(&self) -> bool {
        matches!(self, Role::Assistant | Role::ActionResult)
    }
}

/// A tool call requested by the assistant.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

/// The output returned for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutput {
    pub invocation_id: String,
    pub name: Option<String>,
    pub content: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Call,
    Result,
}

/// Canonical inline markup for an invocation or its result. The invocation id
/// is kept so pairing can still be checked after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionTag {
    pub invocation_id: String,
    pub kind: TagKind,
    pub markup: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Invocation(Invocation),
    Output(ActionOutput),
    Tag(ActionTag),
}

impl Segment {
    /// Invocation id this segment requests, if it is the call half of a pair.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Segment::Invocation(inv) => Some(&inv.id),
            Segment::Tag(tag) if tag.kind == TagKind::Call => Some(&tag.invocation_id),
            _ => None,
        }
    }

    /// Invocation id this segment answers, if it is the result half of a pair.
    pub fn result_id(&self) -> Option<&str> {
        match self {
            Segment::Output(out) => Some(&out.invocation_id),
            Segment::Tag(tag) if tag.kind == TagKind::Result => Some(&tag.invocation_id),
            _ => None,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Segment::Text(text) => text.clone(),
            Segment::Invocation(inv) => {
                format!("{}({})", inv.name, Value::Object(inv.arguments.clone()))
            }
            Segment::Output(out) => out.content.clone(),
            Segment::Tag(tag) => tag.markup.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub segments: Vec<Segment>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Turn {
    pub fn new(role: Role, segments: Vec<Segment>, timestamp: Option<DateTime<Utc>>) -> Self {
        Self {
            role,
            segments,
            timestamp,
        }
    }

    pub fn text(&self) -> String {
        self.segments
            .iter()
            .map(Segment::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn char_len(&self) -> usize {
        self.text().chars().count()
    }

    pub fn call_ids(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(Segment::call_id)
    }

    /// The invocation this turn answers. Only meaningful for `ActionResult` turns.
    pub fn answered_id(&self) -> Option<&str> {
        self.segments.iter().find_map(Segment::result_id)
    }

    /// Free-text segments only, without action markup.
    pub fn plain_text(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Text(text) => Some(text.as_str()),
            _ => None,
        })
    }
}

/// One parsed transcript file.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub source_path: PathBuf,
    pub format: &'static str,
    pub turns: Vec<Turn>,
    pub category: Option<String>,
}

impl Session {
    pub fn category(&self) -> &str {
        self.category.as_deref().unwrap_or(crate::UNKNOWN_CATEGORY)
    }

    pub fn first_user_text(&self) -> Option<String> {
        self.turns
            .iter()
            .find(|t| t.role == Role::User)
            .map(Turn::text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> Segment {
        Segment::Invocation(Invocation {
            id: id.to_string(),
            name: "Bash".to_string(),
            arguments: Map::new(),
        })
    }

    #[test]
    fn pairing_ids_survive_tagging() {
        let raw = call("t1");
        let tagged = Segment::Tag(ActionTag {
            invocation_id: "t1".to_string(),
            kind: TagKind::Call,
            markup: "<tool_call name=\"Bash\">\n{}\n</tool_call>".to_string(),
        });
        assert_eq!(raw.call_id(), Some("t1"));
        assert_eq!(tagged.call_id(), Some("t1"));
        assert_eq!(tagged.result_id(), None);
    }

    #[test]
    fn turn_text_joins_segments() {
        let turn = Turn::new(
            Role::Assistant,
            vec![Segment::Text("running it".to_string()), call("t1")],
            None,
        );
        assert_eq!(turn.text(), "running it\nBash({})");
        assert_eq!(turn.call_ids().collect::<Vec<_>>(), vec!["t1"]);
        assert_eq!(turn.plain_text().collect::<Vec<_>>(), vec!["running it"]);
    }

    #[test]
    fn model_side_roles() {
        assert!(!Role::User.is_model_side());
        assert!(Role::Assistant.is_model_side());
        assert!(Role::ActionResult.is_model_side());
    }
}
