//! Checks and summaries over shard files that already exist on disk.

use crate::chunker::estimate_tokens;
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use transcript_types::validate_record_value;

/// Errors kept per shard; the rest are only counted.
pub const MAX_REPORTED_ERRORS: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct ShardValidation {
    pub path: PathBuf,
    pub total: usize,
    pub valid: usize,
    /// `(line number, message)` for the first [`MAX_REPORTED_ERRORS`] bad lines.
    pub errors: Vec<(usize, String)>,
}

impl ShardValidation {
    pub fn invalid(&self) -> usize {
        self.total - self.valid
    }

    pub fn is_valid(&self) -> bool {
        self.total == self.valid
    }
}

pub fn validate_shard(path: &Path) -> Result<ShardValidation> {
    let file = File::open(path).with_context(|| format!("open shard {path:?}"))?;
    let mut report = ShardValidation {
        path: path.to_path_buf(),
        total: 0,
        valid: 0,
        errors: Vec::new(),
    };
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read {path:?}"))?;
        if line.trim().is_empty() {
            continue;
        }
        report.total += 1;
        let checked = serde_json::from_str::<Value>(&line)
            .context("invalid JSON")
            .and_then(|value| validate_record_value(&value));
        match checked {
            Ok(()) => report.valid += 1,
            Err(e) if report.errors.len() < MAX_REPORTED_ERRORS => {
                report.errors.push((idx + 1, format!("{e:#}")))
            }
            Err(_) => {}
        }
    }
    Ok(report)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Spread {
    pub min: usize,
    pub max: usize,
    pub mean: f64,
    pub median: usize,
}

impl Spread {
    fn of(values: &[usize]) -> Option<Self> {
        let mut sorted = values.to_vec();
        sorted.sort_unstable();
        let min = *sorted.first()?;
        let max = *sorted.last()?;
        let mean = sorted.iter().sum::<usize>() as f64 / sorted.len() as f64;
        Some(Self {
            min,
            max,
            mean: (mean * 10.0).round() / 10.0,
            median: sorted[sorted.len() / 2],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreRange {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardInspection {
    pub path: PathBuf,
    pub records: usize,
    pub unparsable: usize,
    pub categories: BTreeMap<String, usize>,
    /// Non-system entries per record.
    pub entries: Option<Spread>,
    pub chars: Option<Spread>,
    pub approx_tokens_mean: Option<f64>,
    pub quality: Option<ScoreRange>,
    pub with_tool_calls: usize,
    pub tool_call_ratio: f64,
}

pub fn inspect_shard(path: &Path, chars_per_token: usize) -> Result<ShardInspection> {
    let file = File::open(path).with_context(|| format!("open shard {path:?}"))?;
    let mut categories = BTreeMap::new();
    let mut entries: Vec<usize> = Vec::new();
    let mut chars: Vec<usize> = Vec::new();
    let mut scores = Vec::new();
    let mut unparsable = 0;
    let mut with_tool_calls = 0;

    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("read {path:?}"))?;
        if line.trim().is_empty() {
            continue;
        }
        let Ok(record) = serde_json::from_str::<Value>(&line) else {
            unparsable += 1;
            continue;
        };
        let category = record
            .pointer("/metadata/category")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        *categories.entry(category.to_string()).or_insert(0) += 1;
        if let Some(score) = record.pointer("/metadata/quality_score").and_then(Value::as_f64) {
            scores.push(score);
        }

        let conversation = record
            .get("conversations")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let value = |e: &Value| e.get("value").and_then(Value::as_str).unwrap_or("").to_string();
        let from = |e: &Value| e.get("from").and_then(Value::as_str).unwrap_or("").to_string();
        entries.push(conversation.iter().filter(|e| from(e) != "system").count());
        chars.push(conversation.iter().map(|e| value(e).chars().count()).sum());
        if conversation
            .iter()
            .any(|e| from(e) == "gpt" && value(e).contains("<tool_call"))
        {
            with_tool_calls += 1;
        }
    }

    let records = entries.len();
    let quality = (!scores.is_empty()).then(|| {
        let round = |v: f64| (v * 1000.0).round() / 1000.0;
        ScoreRange {
            min: round(scores.iter().copied().fold(f64::INFINITY, f64::min)),
            max: round(scores.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
            mean: round(scores.iter().sum::<f64>() / scores.len() as f64),
        }
    });
    let chars_spread = Spread::of(&chars);
    Ok(ShardInspection {
        path: path.to_path_buf(),
        records,
        unparsable,
        categories,
        entries: Spread::of(&entries),
        approx_tokens_mean: chars_spread
            .map(|s| estimate_tokens(s.mean.round() as usize, chars_per_token) as f64),
        chars: chars_spread,
        quality,
        with_tool_calls,
        tool_call_ratio: if records == 0 {
            0.0
        } else {
            (with_tool_calls as f64 / records as f64 * 1000.0).round() / 1000.0
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn record(category: &str, score: f64, gpt: &str) -> String {
        json!({
            "conversations": [
                {"from": "system", "value": "sys"},
                {"from": "human", "value": "do it"},
                {"from": "gpt", "value": gpt}
            ],
            "metadata": {"category": category, "session_id": "s", "quality_score": score, "chunk_index": 0}
        })
        .to_string()
    }

    #[test]
    fn validation_counts_and_reports_bad_lines() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("crew_train.jsonl");
        let body = [
            record("crew", 0.5, "done"),
            "{broken".to_string(),
            json!({"conversations": [], "metadata": {}}).to_string(),
            record("crew", 0.7, "also done"),
        ]
        .join("\n");
        fs::write(&path, body)?;

        let report = validate_shard(&path)?;
        assert_eq!(report.total, 4);
        assert_eq!(report.valid, 2);
        assert_eq!(report.invalid(), 2);
        assert!(!report.is_valid());
        assert_eq!(report.errors[0].0, 2);
        assert!(report.errors[0].1.contains("invalid JSON"));
        Ok(())
    }

    #[test]
    fn error_list_is_capped() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("bad.jsonl");
        fs::write(&path, "{\n".repeat(MAX_REPORTED_ERRORS + 5))?;
        let report = validate_shard(&path)?;
        assert_eq!(report.invalid(), MAX_REPORTED_ERRORS + 5);
        assert_eq!(report.errors.len(), MAX_REPORTED_ERRORS);
        Ok(())
    }

    #[test]
    fn inspection_summarizes_records() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("mixed.jsonl");
        let body = [
            record("crew", 0.5, "<tool_call name=\"Bash\">\n{}\n</tool_call>"),
            record("mayor", 0.9, "plain"),
        ]
        .join("\n");
        fs::write(&path, body)?;

        let inspection = inspect_shard(&path, 4)?;
        assert_eq!(inspection.records, 2);
        assert_eq!(inspection.categories.get("crew"), Some(&1));
        assert_eq!(inspection.with_tool_calls, 1);
        assert_eq!(inspection.tool_call_ratio, 0.5);
        let quality = inspection.quality.unwrap();
        assert_eq!(quality.min, 0.5);
        assert_eq!(quality.max, 0.9);
        assert_eq!(quality.mean, 0.7);
        assert_eq!(inspection.entries.unwrap().median, 2);
        Ok(())
    }
}
