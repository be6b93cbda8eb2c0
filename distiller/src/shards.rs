use crate::error::PipelineError;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Resolution of the hash-based holdout, in parts per ten thousand.
const SPLIT_RESOLUTION: u64 = 10_000;

/// Which file of a category a record goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Val,
}

impl Split {
    fn suffix(self) -> &'static str {
        match self {
            Split::Train => "_train.jsonl",
            Split::Val => "_val.jsonl",
        }
    }

    /// Stable holdout: the same content hash always lands on the same side,
    /// whatever order or worker count produced it.
    pub fn for_hash(hash: u64, val_fraction: f64) -> Self {
        let cutoff = (val_fraction.clamp(0.0, 1.0) * SPLIT_RESOLUTION as f64).round() as u64;
        if hash % SPLIT_RESOLUTION < cutoff {
            Split::Val
        } else {
            Split::Train
        }
    }
}

struct Shard {
    path: PathBuf,
    writer: BufWriter<File>,
    records: usize,
}

/// Newline-delimited output files, one per category and split, opened on
/// first use. Files are keyed by sanitized name, so categories that sanitize
/// alike share one file instead of truncating each other.
pub struct ShardSet {
    dir: PathBuf,
    shards: Mutex<HashMap<String, Arc<Mutex<Shard>>>>,
}

impl ShardSet {
    pub fn create(dir: &Path) -> Result<Self, PipelineError> {
        fs::create_dir_all(dir).map_err(|e| PipelineError::output(dir, e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            shards: Mutex::new(HashMap::new()),
        })
    }

    pub fn append(&self, category: &str, split: Split, line: &str) -> Result<(), PipelineError> {
        let shard = self.shard(shard_file_name(category, split))?;
        let mut shard = lock(&shard)?;
        let Shard {
            path,
            writer,
            records,
        } = &mut *shard;
        writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.write_all(b"\n"))
            .map_err(|e| PipelineError::output(path.clone(), e))?;
        *records += 1;
        Ok(())
    }

    fn shard(&self, name: String) -> Result<Arc<Mutex<Shard>>, PipelineError> {
        let mut shards = lock(&self.shards)?;
        if let Some(shard) = shards.get(&name) {
            return Ok(Arc::clone(shard));
        }
        let path = self.dir.join(&name);
        let file = File::create(&path).map_err(|e| PipelineError::output(&path, e))?;
        tracing::debug!(path = ?path, "opened shard");
        let shard = Arc::new(Mutex::new(Shard {
            path,
            writer: BufWriter::new(file),
            records: 0,
        }));
        shards.insert(name, Arc::clone(&shard));
        Ok(shard)
    }

    /// Flush every shard and report how many records each file received.
    pub fn finish(&self) -> Result<BTreeMap<String, usize>, PipelineError> {
        let shards = lock(&self.shards)?;
        let mut totals = BTreeMap::new();
        for (name, shard) in shards.iter() {
            let mut shard = lock(shard)?;
            let Shard {
                path,
                writer,
                records,
            } = &mut *shard;
            writer
                .flush()
                .map_err(|e| PipelineError::output(path.clone(), e))?;
            totals.insert(name.clone(), *records);
        }
        Ok(totals)
    }

    /// Delete shard files in the output directory that this run did not
    /// write, so a rerun is a full rewrite. Other files are left alone.
    pub fn remove_unwritten(&self) -> Result<usize, PipelineError> {
        let written: Vec<String> = lock(&self.shards)?.keys().cloned().collect();
        let entries = fs::read_dir(&self.dir).map_err(|e| PipelineError::output(&self.dir, e))?;
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| PipelineError::output(&self.dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_shard_file(&name) || written.contains(&name) {
                continue;
            }
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            fs::remove_file(&path).map_err(|e| PipelineError::output(&path, e))?;
            tracing::debug!(path = ?path, "removed stale shard");
            removed += 1;
        }
        Ok(removed)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, PipelineError> {
    mutex
        .lock()
        .map_err(|_| PipelineError::Worker("shard lock poisoned".into()))
}

fn is_shard_file(name: &str) -> bool {
    [Split::Train, Split::Val]
        .iter()
        .any(|split| name.len() > split.suffix().len() && name.ends_with(split.suffix()))
}

pub fn shard_file_name(category: &str, split: Split) -> String {
    format!("{}{}", sanitize_filename_component(category), split.suffix())
}

fn sanitize_filename_component(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_one_file_per_category_and_split() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let shards = ShardSet::create(&dir.path().join("out"))?;
        shards.append("crew", Split::Train, "{\"a\":1}")?;
        shards.append("mayor", Split::Train, "{\"b\":2}")?;
        shards.append("crew", Split::Train, "{\"c\":3}")?;
        shards.append("crew", Split::Val, "{\"d\":4}")?;
        let totals = shards.finish()?;

        assert_eq!(totals.get("crew_train.jsonl"), Some(&2));
        assert_eq!(totals.get("crew_val.jsonl"), Some(&1));
        assert_eq!(totals.get("mayor_train.jsonl"), Some(&1));
        let crew = fs::read_to_string(dir.path().join("out/crew_train.jsonl"))?;
        assert_eq!(crew, "{\"a\":1}\n{\"c\":3}\n");
        Ok(())
    }

    #[test]
    fn categories_that_sanitize_alike_share_a_file() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let shards = ShardSet::create(dir.path())?;
        shards.append("ops team", Split::Train, "1")?;
        shards.append("ops_team", Split::Train, "2")?;
        let totals = shards.finish()?;
        assert_eq!(totals.len(), 1);
        assert_eq!(fs::read_to_string(dir.path().join("ops_team_train.jsonl"))?, "1\n2\n");
        Ok(())
    }

    #[test]
    fn unwritten_shards_are_removed() -> anyhow::Result<()> {
        let dir = tempdir()?;
        for name in ["crew_train.jsonl", "crew_val.jsonl", "reviewer_train.jsonl", "notes.txt"] {
            fs::write(dir.path().join(name), "old\n")?;
        }
        let shards = ShardSet::create(dir.path())?;
        shards.append("crew", Split::Train, "new")?;
        shards.finish()?;

        assert_eq!(shards.remove_unwritten()?, 2);
        assert_eq!(fs::read_to_string(dir.path().join("crew_train.jsonl"))?, "new\n");
        assert!(!dir.path().join("crew_val.jsonl").exists());
        assert!(!dir.path().join("reviewer_train.jsonl").exists());
        assert!(dir.path().join("notes.txt").exists());
        Ok(())
    }

    #[test]
    fn holdout_follows_the_hash() {
        assert_eq!(Split::for_hash(12_345, 0.0), Split::Train);
        assert_eq!(Split::for_hash(12_345, 1.0), Split::Val);
        assert_eq!(Split::for_hash(20_499, 0.05), Split::Val);
        assert_eq!(Split::for_hash(20_500, 0.05), Split::Train);
    }

    #[test]
    fn category_names_are_sanitized() {
        assert_eq!(shard_file_name("crew", Split::Train), "crew_train.jsonl");
        assert_eq!(shard_file_name("crew", Split::Val), "crew_val.jsonl");
        assert_eq!(
            shard_file_name("../etc/x y", Split::Train),
            ".._etc_x_y_train.jsonl"
        );
    }
}
