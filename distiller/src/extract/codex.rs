use super::{file_stem, ExtractReport, PairTracker, TranscriptFormat};
use crate::parse::{extract_text, record_timestamp};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use transcript_types::{ActionOutput, Invocation, Role, Segment, Session, Turn};

/// Injected context blocks that are not something the user typed.
const PREAMBLE_PREFIXES: [&str; 2] = ["<environment_context>", "<user_instructions>"];

/// Codex CLI rollout files: a `session_meta` header followed by response items and events.
pub struct CodexFormat;

impl TranscriptFormat for CodexFormat {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn matches(&self, first: &Value) -> bool {
        first.get("type").and_then(Value::as_str) == Some("session_meta")
    }

    fn parse(&self, path: &Path, records: &[Value], report: &mut ExtractReport) -> Option<Session> {
        let exec_results = collect_exec_results(records);
        let mut builder = Builder {
            exec_results,
            ..Builder::default()
        };
        let mut session_id = None;

        for record in records {
            let timestamp = record_timestamp(record);
            let payload = record.get("payload").unwrap_or(&Value::Null);
            match record.get("type").and_then(Value::as_str) {
                Some("session_meta") => {
                    if session_id.is_none() {
                        session_id = payload.get("id").and_then(Value::as_str).map(str::to_string);
                    }
                }
                Some("response_item") => builder.item(payload, timestamp, report),
                // exec_command_end events were indexed above.
                Some("event_msg") => {}
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

struct ExecResult {
    output: String,
    exit_code: Option<i64>,
}

fn collect_exec_results(records: &[Value]) -> HashMap<String, ExecResult> {
    let mut results = HashMap::new();
    for record in records {
        if record.get("type").and_then(Value::as_str) != Some("event_msg") {
            continue;
        }
        let Some(payload) = record.get("payload") else {
            continue;
        };
        if payload.get("type").and_then(Value::as_str) != Some("exec_command_end") {
            continue;
        }
        let Some(call_id) = payload.get("call_id").and_then(Value::as_str) else {
            continue;
        };
        let output = match payload.get("aggregated_output").and_then(Value::as_str) {
            Some(out) if !out.is_empty() => out.to_string(),
            _ => {
                let stdout = payload.get("stdout").and_then(Value::as_str).unwrap_or("");
                let stderr = payload.get("stderr").and_then(Value::as_str).unwrap_or("");
                format!("{stdout}{stderr}")
            }
        };
        results.insert(
            call_id.to_string(),
            ExecResult {
                output,
                exit_code: payload.get("exit_code").and_then(Value::as_i64),
            },
        );
    }
    results
}

#[derive(Default)]
struct Builder {
    turns: Vec<Turn>,
    assistant: Option<Turn>,
    pairs: PairTracker,
    names: HashMap<String, String>,
    exec_results: HashMap<String, ExecResult>,
}

impl Builder {
    fn flush(&mut self) {
        if let Some(turn) = self.assistant.take() {
            if !turn.segments.is_empty() {
                self.turns.push(turn);
            }
        }
    }

    fn finish(mut self) -> Vec<Turn> {
        self.flush();
        self.turns
    }

    fn push_assistant(&mut self, segment: Segment, timestamp: Option<DateTime<Utc>>) {
        self.assistant
            .get_or_insert_with(|| Turn::new(Role::Assistant, Vec::new(), timestamp))
            .segments
            .push(segment);
    }

    fn item(&mut self, payload: &Value, timestamp: Option<DateTime<Utc>>, report: &mut ExtractReport) {
        match payload.get("type").and_then(Value::as_str) {
            Some("message") => self.message(payload, timestamp, report),
            Some("reasoning") => report.reasoning_discarded += 1,
            Some("function_call") => {
                let arguments = match payload.get("arguments") {
                    Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
                        Ok(Value::Object(map)) => map,
                        _ => single("raw", Value::String(raw.clone())),
                    },
                    Some(Value::Object(map)) => map.clone(),
                    _ => Map::new(),
                };
                self.call(payload, arguments, timestamp);
            }
            Some("custom_tool_call") => {
                let input = payload.get("input").cloned().unwrap_or(Value::Null);
                self.call(payload, single("input", input), timestamp);
            }
            Some("function_call_output") | Some("custom_tool_call_output") => {
                self.output(payload, timestamp, report)
            }
            _ => report.skipped_records += 1,
        }
    }

    fn message(&mut self, payload: &Value, timestamp: Option<DateTime<Utc>>, report: &mut ExtractReport) {
        let blocks = payload
            .get("content")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        match payload.get("role").and_then(Value::as_str) {
            Some("user") => {
                let texts: Vec<Segment> = blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("input_text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .filter(|t| !t.trim().is_empty())
                    .filter(|t| {
                        let t = t.trim_start();
                        !PREAMBLE_PREFIXES.iter().any(|p| t.starts_with(p))
                    })
                    .map(|t| Segment::Text(t.to_string()))
                    .collect();
                if texts.is_empty() {
                    report.skipped_records += 1;
                    return;
                }
                self.flush();
                self.turns.push(Turn::new(Role::User, texts, timestamp));
            }
            Some("assistant") => {
                for block in blocks {
                    if block.get("type").and_then(Value::as_str) != Some("output_text") {
                        continue;
                    }
                    let text = block.get("text").and_then(Value::as_str).unwrap_or("").trim();
                    if !text.is_empty() {
                        self.push_assistant(Segment::Text(text.to_string()), timestamp);
                    }
                }
            }
            _ => report.skipped_records += 1,
        }
    }

    fn call(&mut self, payload: &Value, arguments: Map<String, Value>, timestamp: Option<DateTime<Utc>>) {
        let id = payload.get("call_id").and_then(Value::as_str).unwrap_or_default();
        let name = payload.get("name").and_then(Value::as_str).unwrap_or("tool");
        self.pairs.request(id);
        self.names.insert(id.to_string(), name.to_string());
        self.push_assistant(
            Segment::Invocation(Invocation {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            }),
            timestamp,
        );
    }

    fn output(&mut self, payload: &Value, timestamp: Option<DateTime<Utc>>, report: &mut ExtractReport) {
        let id = payload.get("call_id").and_then(Value::as_str).unwrap_or_default();
        if !self.pairs.answer(id) {
            tracing::debug!(invocation_id = id, "dropping output without a matching call");
            report.orphan_results += 1;
            return;
        }

        let (mut content, mut exit_code) = unwrap_output(payload.get("output"));
        if content.trim().is_empty() {
            if let Some(exec) = self.exec_results.get(id) {
                content = exec.output.clone();
                exit_code = exit_code.or(exec.exit_code);
            }
        }

        self.flush();
        self.turns.push(Turn::new(
            Role::ActionResult,
            vec![Segment::Output(ActionOutput {
                invocation_id: id.to_string(),
                name: self.names.get(id).cloned(),
                content,
                is_error: exit_code.is_some_and(|code| code != 0),
            })],
            timestamp,
        ));
    }
}

/// Outputs are either plain text or a JSON envelope carrying the exit code.
fn unwrap_output(output: Option<&Value>) -> (String, Option<i64>) {
    match output {
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(env)) if env.contains_key("output") => {
                let text = env.get("output").and_then(extract_text).unwrap_or_default();
                let code = env
                    .get("metadata")
                    .and_then(|m| m.get("exit_code"))
                    .and_then(Value::as_i64);
                (text, code)
            }
            _ => (raw.clone(), None),
        },
        Some(other) => (extract_text(other).unwrap_or_default(), None),
        None => (String::new(), None),
    }
}

fn single(key: &str, value: Value) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    map
}
