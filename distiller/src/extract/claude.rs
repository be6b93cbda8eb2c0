use super::{file_stem, ExtractReport, PairTracker, TranscriptFormat};
use crate::parse::{extract_text, record_timestamp};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use transcript_types::{ActionOutput, Invocation, Role, Segment, Session, Turn};

/// Claude Code per-project session files: one JSON record per line, no header.
pub struct ClaudeFormat;

impl TranscriptFormat for ClaudeFormat {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn matches(&self, first: &Value) -> bool {
        first
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|t| t != "session_meta")
    }

    fn parse(&self, path: &Path, records: &[Value], report: &mut ExtractReport) -> Option<Session> {
        let mut builder = Builder::default();
        let mut session_id: Option<String> = None;

        for record in records {
            if session_id.is_none() {
                session_id = record
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
            }
            let timestamp = record_timestamp(record);
            match record.get("type").and_then(Value::as_str) {
                Some("user") if !is_meta(record) => builder.user(record, timestamp, report),
                Some("assistant") => builder.assistant(record, timestamp, report),
                _ => report.skipped_records += 1,
            }
        }

        let turns = builder.finish();
        if turns.is_empty() {
            return None;
        }
        Some(Session {
            id: session_id.unwrap_or_else(|| file_stem(path)),
            source_path: path.to_path_buf(),
            format: self.name(),
            turns,
            category: None,
        })
    }
}

fn is_meta(record: &Value) -> bool {
    record.get("isMeta").and_then(Value::as_bool).unwrap_or(false)
}

#[derive(Default)]
struct Builder {
    turns: Vec<Turn>,
    pending: Option<(String, Turn)>,
    pairs: PairTracker,
    names: HashMap<String, String>,
}

impl Builder {
    fn flush(&mut self) {
        if let Some((_, turn)) = self.pending.take() {
            if !turn.segments.is_empty() {
                self.turns.push(turn);
            }
        }
    }

    fn finish(mut self) -> Vec<Turn> {
        self.flush();
        self.turns
    }

    fn user(&mut self, record: &Value, timestamp: Option<DateTime<Utc>>, report: &mut ExtractReport) {
        self.flush();
        let content = record.pointer("/message/content");
        match content {
            Some(Value::String(text)) => {
                if !text.trim().is_empty() {
                    self.turns.push(Turn::new(
                        Role::User,
                        vec![Segment::Text(text.clone())],
                        timestamp,
                    ));
                }
            }
            Some(Value::Array(blocks)) => {
                let mut texts = Vec::new();
                for block in blocks {
                    match block.get("type").and_then(Value::as_str) {
                        Some("tool_result") => self.result(record, block, timestamp, report),
                        Some("text") => {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                if !text.trim().is_empty() {
                                    texts.push(Segment::Text(text.to_string()));
                                }
                            }
                        }
                        _ => {}
                    }
                }
                if !texts.is_empty() {
                    self.turns.push(Turn::new(Role::User, texts, timestamp));
                }
            }
            _ => report.skipped_records += 1,
        }
    }

    fn result(
        &mut self,
        record: &Value,
        block: &Value,
        timestamp: Option<DateTime<Utc>>,
        report: &mut ExtractReport,
    ) {
        let id = block
            .get("tool_use_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !self.pairs.answer(id) {
            tracing::debug!(invocation_id = id, "dropping result without a matching call");
            report.orphan_results += 1;
            return;
        }

        let inline = block.get("content").and_then(extract_text).unwrap_or_default();
        let content = if inline.trim().is_empty() {
            record
                .get("toolUseResult")
                .map(fallback_result_text)
                .unwrap_or_default()
        } else {
            inline
        };

        let output = ActionOutput {
            invocation_id: id.to_string(),
            name: self.names.get(id).cloned(),
            content,
            is_error: block.get("is_error").and_then(Value::as_bool).unwrap_or(false),
        };
        self.turns.push(Turn::new(
            Role::ActionResult,
            vec![Segment::Output(output)],
            timestamp,
        ));
    }

    fn assistant(
        &mut self,
        record: &Value,
        timestamp: Option<DateTime<Utc>>,
        report: &mut ExtractReport,
    ) {
        let key = record
            .get("requestId")
            .or_else(|| record.pointer("/message/id"))
            .or_else(|| record.get("uuid"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let continues = matches!(&self.pending, Some((pending, _)) if !key.is_empty() && *pending == key);
        if !continues {
            self.flush();
            self.pending = Some((key, Turn::new(Role::Assistant, Vec::new(), timestamp)));
        }

        let Some(Value::Array(blocks)) = record.pointer("/message/content") else {
            return;
        };
        let mut segments = Vec::new();
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    let text = block.get("text").and_then(Value::as_str).unwrap_or("").trim();
                    if !text.is_empty() {
                        segments.push(Segment::Text(text.to_string()));
                    }
                }
                Some("tool_use") => {
                    let id = block.get("id").and_then(Value::as_str).unwrap_or_default();
                    let name = block.get("name").and_then(Value::as_str).unwrap_or("tool");
                    self.pairs.request(id);
                    self.names.insert(id.to_string(), name.to_string());
                    segments.push(Segment::Invocation(Invocation {
                        id: id.to_string(),
                        name: name.to_string(),
                        arguments: arguments_object(block.get("input")),
                    }));
                }
                Some("thinking") | Some("redacted_thinking") => report.reasoning_discarded += 1,
                _ => {}
            }
        }
        if let Some((_, turn)) = self.pending.as_mut() {
            turn.segments.extend(segments);
        }
    }
}

fn arguments_object(input: Option<&Value>) -> Map<String, Value> {
    match input {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::Null) | None => Map::new(),
        Some(other) => {
            let mut map = Map::new();
            map.insert("input".to_string(), other.clone());
            map
        }
    }
}

/// Result text from the record-level `toolUseResult` blob.
fn fallback_result_text(blob: &Value) -> String {
    if let Value::String(s) = blob {
        return s.clone();
    }
    let stdout = blob.get("stdout").and_then(Value::as_str).unwrap_or("");
    let stderr = blob.get("stderr").and_then(Value::as_str).unwrap_or("");
    if !stdout.is_empty() || !stderr.is_empty() {
        return [stdout, stderr]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n");
    }
    extract_text(blob).unwrap_or_default()
}
