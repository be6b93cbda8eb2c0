//! Format detection and per-format session extraction.
//!
//! Every supported on-disk layout implements [`TranscriptFormat`]. The
//! [`Extractor`] reads a file once, picks the first format whose `matches`
//! accepts the first JSON record, and hands the parsed records over.

mod claude;
mod codex;

pub use claude::ClaudeFormat;
pub use codex::CodexFormat;

use crate::error::PipelineError;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use transcript_types::Session;
use walkdir::WalkDir;

/// Files with this prefix are session indexes, not transcripts.
const INDEX_FILE_PREFIX: &str = "sessions-";

pub trait TranscriptFormat: Send + Sync {
    fn name(&self) -> &'static str;

    /// Decide from the first parseable record whether this format owns the file.
    fn matches(&self, first: &Value) -> bool;

    /// Build a session from the file's records. `None` when nothing usable remains.
    fn parse(&self, path: &Path, records: &[Value], report: &mut ExtractReport) -> Option<Session>;
}

/// Per-file counters for data that was skipped rather than extracted.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ExtractReport {
    pub parse_errors: usize,
    pub skipped_records: usize,
    pub orphan_results: usize,
    pub reasoning_discarded: usize,
}

impl ExtractReport {
    pub fn merge(&mut self, other: &ExtractReport) {
        self.parse_errors += other.parse_errors;
        self.skipped_records += other.skipped_records;
        self.orphan_results += other.orphan_results;
        self.reasoning_discarded += other.reasoning_discarded;
    }
}

pub struct Extractor {
    formats: Vec<Box<dyn TranscriptFormat>>,
}

impl Extractor {
    pub fn new() -> Self {
        // Header-bearing formats first; Claude files have no header and act as the fallback.
        Self {
            formats: vec![Box::new(CodexFormat), Box::new(ClaudeFormat)],
        }
    }

    pub fn detect(&self, first: &Value) -> Option<&dyn TranscriptFormat> {
        self.formats
            .iter()
            .find(|f| f.matches(first))
            .map(|f| f.as_ref())
    }

    /// Read and parse one transcript. I/O failure opening the file is the
    /// caller's to count; everything inside the file is recovered here.
    pub fn extract(&self, path: &Path, report: &mut ExtractReport) -> io::Result<Option<Session>> {
        let records = read_records(path, report)?;
        let Some(first) = records.first() else {
            return Ok(None);
        };
        let Some(format) = self.detect(first) else {
            tracing::debug!(path = ?path, "no transcript format matched");
            report.skipped_records += records.len();
            return Ok(None);
        };
        let session = format.parse(path, &records, report);
        if let Some(session) = session.as_ref() {
            tracing::debug!(
                path = ?path,
                format = format.name(),
                turns = session.turns.len(),
                "extracted session"
            );
        }
        Ok(session)
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a JSONL file, logging and counting lines that are not valid JSON.
pub fn read_records(path: &Path, report: &mut ExtractReport) -> io::Result<Vec<Value>> {
    let reader = BufReader::new(fs::File::open(path)?);
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(path = ?path, line = idx + 1, err = %e, "unreadable line");
                report.parse_errors += 1;
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(value) => records.push(value),
            Err(e) => {
                tracing::warn!(path = ?path, line = idx + 1, err = %e, "skipping malformed record");
                report.parse_errors += 1;
            }
        }
    }
    Ok(records)
}

/// All transcript files under `root`, sorted so job order is stable.
pub fn discover(root: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    fs::read_dir(root).map_err(|source| PipelineError::SourceUnreadable {
        path: root.to_path_buf(),
        source,
    })?;

    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(err = %e, "skipping unreadable directory entry");
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("jsonl"))
        .filter(|e| {
            !e.file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(INDEX_FILE_PREFIX))
        })
        .map(|e| e.path().to_path_buf())
        .collect();

    files.sort();
    Ok(files)
}

pub(crate) fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("session")
        .to_string()
}

/// Tracks invocation ids so every result can be linked to an earlier call.
#[derive(Default)]
pub(crate) struct PairTracker {
    requested: HashSet<String>,
    answered: HashSet<String>,
}

impl PairTracker {
    pub fn request(&mut self, id: &str) {
        self.requested.insert(id.to_string());
    }

    /// True when `id` was requested and not answered yet. Anything else is an orphan.
    pub fn answer(&mut self, id: &str) -> bool {
        self.requested.contains(id) && self.answered.insert(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn malformed_lines_are_counted_not_fatal() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("s.jsonl");
        let mut f = fs::File::create(&path)?;
        writeln!(f, "{}", json!({"type": "user"}))?;
        writeln!(f, "{{not json")?;
        writeln!(f)?;
        writeln!(f, "{}", json!({"type": "assistant"}))?;

        let mut report = ExtractReport::default();
        let records = read_records(&path, &mut report)?;
        assert_eq!(records.len(), 2);
        assert_eq!(report.parse_errors, 1);
        Ok(())
    }

    #[test]
    fn detection_prefers_header_format() {
        let extractor = Extractor::new();
        let codex = json!({"type": "session_meta", "payload": {"id": "abc"}});
        let claude = json!({"type": "user", "message": {"content": "hi"}});
        assert_eq!(extractor.detect(&codex).map(|f| f.name()), Some("codex"));
        assert_eq!(extractor.detect(&claude).map(|f| f.name()), Some("claude"));
        assert!(extractor.detect(&json!([1, 2])).is_none());
    }

    #[test]
    fn discover_sorts_and_skips_index_files() -> anyhow::Result<()> {
        let dir = tempdir()?;
        fs::create_dir_all(dir.path().join("b"))?;
        fs::write(dir.path().join("b/two.jsonl"), "")?;
        fs::write(dir.path().join("a.jsonl"), "")?;
        fs::write(dir.path().join("sessions-index.jsonl"), "")?;
        fs::write(dir.path().join("notes.txt"), "")?;

        let files = discover(dir.path())?;
        assert_eq!(
            files,
            vec![dir.path().join("a.jsonl"), dir.path().join("b/two.jsonl")]
        );
        Ok(())
    }

    #[test]
    fn missing_source_is_fatal() {
        let dir = tempdir().unwrap();
        let err = discover(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnreadable { .. }));
    }

    #[test]
    fn results_pair_once() {
        let mut pairs = PairTracker::default();
        pairs.request("t1");
        assert!(pairs.answer("t1"));
        assert!(!pairs.answer("t1"));
        assert!(!pairs.answer("t2"));
    }
}
