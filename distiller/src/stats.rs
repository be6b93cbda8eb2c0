use crate::chunker::ChunkSkip;
use crate::error::PipelineError;
use crate::extract::ExtractReport;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const STATS_FILE: &str = "stats.json";

const HISTOGRAM_BUCKETS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    NoExchange,
    Unsplittable,
    RepeatWindow,
    Quality,
    Duplicate,
    Schema,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::NoExchange => "no_exchange",
            DropReason::Unsplittable => "unsplittable",
            DropReason::RepeatWindow => "repeat_window",
            DropReason::Quality => "quality",
            DropReason::Duplicate => "duplicate",
            DropReason::Schema => "schema",
        }
    }
}

impl From<ChunkSkip> for DropReason {
    fn from(skip: ChunkSkip) -> Self {
        match skip {
            ChunkSkip::NoExchange => DropReason::NoExchange,
            ChunkSkip::Unsplittable => DropReason::Unsplittable,
            ChunkSkip::RepeatWindow => DropReason::RepeatWindow,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct CategoryStats {
    pub sessions: usize,
    pub emitted: usize,
    pub held_out: usize,
    pub downweighted: usize,
    pub drops: BTreeMap<DropReason, usize>,
}

/// Quality scores of emitted records, kept in integer thousandths so sums
/// do not depend on the order jobs finish in.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(into = "ScoreSummary")]
pub struct ScoreDistribution {
    count: usize,
    total_milli: u64,
    min_milli: Option<u32>,
    max_milli: Option<u32>,
    histogram: [usize; HISTOGRAM_BUCKETS],
}

#[derive(Serialize)]
struct ScoreSummary {
    count: usize,
    min: Option<f64>,
    max: Option<f64>,
    mean: Option<f64>,
    histogram: [usize; HISTOGRAM_BUCKETS],
}

impl From<ScoreDistribution> for ScoreSummary {
    fn from(d: ScoreDistribution) -> Self {
        ScoreSummary {
            count: d.count,
            min: d.min(),
            max: d.max(),
            mean: d.mean(),
            histogram: d.histogram,
        }
    }
}

impl ScoreDistribution {
    pub fn add(&mut self, score: f64) {
        let milli = (score.clamp(0.0, 1.0) * 1000.0).round() as u32;
        self.count += 1;
        self.total_milli += u64::from(milli);
        self.min_milli = Some(self.min_milli.map_or(milli, |m| m.min(milli)));
        self.max_milli = Some(self.max_milli.map_or(milli, |m| m.max(milli)));
        let bucket = (milli as usize * HISTOGRAM_BUCKETS / 1000).min(HISTOGRAM_BUCKETS - 1);
        self.histogram[bucket] += 1;
    }

    pub fn merge(&mut self, other: &ScoreDistribution) {
        self.count += other.count;
        self.total_milli += other.total_milli;
        self.min_milli = match (self.min_milli, other.min_milli) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_milli = match (self.max_milli, other.max_milli) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        for (mine, theirs) in self.histogram.iter_mut().zip(other.histogram) {
            *mine += theirs;
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn min(&self) -> Option<f64> {
        self.min_milli.map(|m| f64::from(m) / 1000.0)
    }

    pub fn max(&self) -> Option<f64> {
        self.max_milli.map(|m| f64::from(m) / 1000.0)
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| {
            let mean_milli = self.total_milli as f64 / self.count as f64;
            mean_milli.round() / 1000.0
        })
    }

    pub fn histogram(&self) -> &[usize; HISTOGRAM_BUCKETS] {
        &self.histogram
    }
}

/// Everything counted during a run. Each job fills its own copy; the
/// orchestrator merges them once all jobs are done.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct RunStats {
    pub files_seen: usize,
    pub files_unreadable: usize,
    pub sessions_extracted: usize,
    pub sessions_empty: usize,
    pub records_emitted: usize,
    /// Emitted records routed to validation shards; included in `records_emitted`.
    pub records_held_out: usize,
    #[serde(flatten)]
    pub extraction: ExtractReport,
    pub redactions: BTreeMap<String, usize>,
    pub drops: BTreeMap<DropReason, usize>,
    pub categories: BTreeMap<String, CategoryStats>,
    pub scores: ScoreDistribution,
    pub interrupted: bool,
}

impl RunStats {
    fn category(&mut self, category: &str) -> &mut CategoryStats {
        self.categories.entry(category.to_string()).or_default()
    }

    pub fn record_session(&mut self, category: &str) {
        self.sessions_extracted += 1;
        self.category(category).sessions += 1;
    }

    pub fn record_drop(&mut self, category: &str, reason: DropReason) {
        *self.drops.entry(reason).or_default() += 1;
        *self.category(category).drops.entry(reason).or_default() += 1;
    }

    pub fn record_emit(&mut self, category: &str, score: f64, downweighted: bool) {
        self.records_emitted += 1;
        self.scores.add(score);
        let stats = self.category(category);
        stats.emitted += 1;
        if downweighted {
            stats.downweighted += 1;
        }
    }

    pub fn record_holdout(&mut self, category: &str) {
        self.records_held_out += 1;
        self.category(category).held_out += 1;
    }

    pub fn record_redactions(&mut self, redactions: &BTreeMap<String, usize>) {
        for (class, count) in redactions {
            *self.redactions.entry(class.clone()).or_default() += count;
        }
    }

    pub fn dropped(&self, reason: DropReason) -> usize {
        self.drops.get(&reason).copied().unwrap_or(0)
    }

    pub fn merge(&mut self, other: &RunStats) {
        self.files_seen += other.files_seen;
        self.files_unreadable += other.files_unreadable;
        self.sessions_extracted += other.sessions_extracted;
        self.sessions_empty += other.sessions_empty;
        self.records_emitted += other.records_emitted;
        self.records_held_out += other.records_held_out;
        self.extraction.merge(&other.extraction);
        for (class, count) in &other.redactions {
            *self.redactions.entry(class.clone()).or_default() += count;
        }
        for (reason, count) in &other.drops {
            *self.drops.entry(*reason).or_default() += count;
        }
        for (name, theirs) in &other.categories {
            let mine = self.category(name);
            mine.sessions += theirs.sessions;
            mine.emitted += theirs.emitted;
            mine.held_out += theirs.held_out;
            mine.downweighted += theirs.downweighted;
            for (reason, count) in &theirs.drops {
                *mine.drops.entry(*reason).or_default() += count;
            }
        }
        self.scores.merge(&other.scores);
        self.interrupted |= other.interrupted;
    }

    /// Write `stats.json` into `dir`, returning its path.
    pub fn write_json(&self, dir: &Path) -> Result<PathBuf, PipelineError> {
        let path = dir.join(STATS_FILE);
        let body = serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::output(&path, e.into()))?;
        fs::write(&path, body + "\n").map_err(|e| PipelineError::output(&path, e))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_order_independent() {
        let mut a = RunStats::default();
        a.record_session("crew");
        a.record_emit("crew", 0.612, false);
        a.record_drop("crew", DropReason::Duplicate);

        let mut b = RunStats::default();
        b.record_session("mayor");
        b.record_emit("mayor", 0.35, true);
        b.record_drop("mayor", DropReason::Quality);
        b.record_holdout("mayor");
        b.extraction.parse_errors = 2;

        let mut ab = RunStats::default();
        ab.merge(&a);
        ab.merge(&b);
        let mut ba = RunStats::default();
        ba.merge(&b);
        ba.merge(&a);

        assert_eq!(ab, ba);
        assert_eq!(ab.records_emitted, 2);
        assert_eq!(ab.dropped(DropReason::Duplicate), 1);
        assert_eq!(ab.categories["mayor"].downweighted, 1);
        assert_eq!(ab.records_held_out, 1);
        assert_eq!(ab.categories["mayor"].held_out, 1);
        assert_eq!(ab.extraction.parse_errors, 2);
    }

    #[test]
    fn score_distribution_summary() {
        let mut d = ScoreDistribution::default();
        for score in [0.2, 0.45, 0.999, 1.0] {
            d.add(score);
        }
        assert_eq!(d.count(), 4);
        assert_eq!(d.min(), Some(0.2));
        assert_eq!(d.max(), Some(1.0));
        assert_eq!(d.histogram()[2], 1);
        assert_eq!(d.histogram()[4], 1);
        assert_eq!(d.histogram()[9], 2);
        assert_eq!(d.mean(), Some(0.662));
    }

    #[test]
    fn stats_file_uses_readable_keys() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut stats = RunStats::default();
        stats.record_drop("unknown", DropReason::RepeatWindow);
        stats.scores.add(0.5);
        let path = stats.write_json(dir.path())?;
        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(path)?)?;
        assert_eq!(value["drops"]["repeat_window"], 1);
        assert_eq!(value["categories"]["unknown"]["drops"]["repeat_window"], 1);
        assert_eq!(value["scores"]["mean"], 0.5);
        assert_eq!(value["parse_errors"], 0);
        Ok(())
    }
}
