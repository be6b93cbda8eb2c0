//! Orchestration: one blocking job per transcript file, bounded by a semaphore.
//!
//! Extraction through quality scoring, then scrubbing and validation, run fully
//! in parallel. The dedup step and the shard appends each go through one
//! run-wide sequencer in file order, so the accepted record set and the shard
//! bytes are the same for any worker count. Appends for different categories
//! therefore wait on each other; the per-shard locks only guard each writer.

use crate::chunker::Chunker;
use crate::config::PipelineConfig;
use crate::dedup::{final_model_hash, Deduplicator};
use crate::error::PipelineError;
use crate::extract::{discover, Extractor};
use crate::normalizer::ActionNormalizer;
use crate::quality::QualityFilter;
use crate::schema::SchemaValidator;
use crate::scrubber::SecretScrubber;
use crate::sequencer::{Sequencer, Ticket};
use crate::shards::{ShardSet, Split};
use crate::stats::{DropReason, RunStats};
use crate::tagger::CategoryTagger;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Every stage, built once from a validated config and shared by all jobs.
struct Stages {
    extractor: Extractor,
    tagger: CategoryTagger,
    normalizer: ActionNormalizer,
    chunker: Chunker,
    quality: QualityFilter,
    scrubber: SecretScrubber,
    validator: SchemaValidator,
}

pub struct Pipeline {
    config: PipelineConfig,
    stages: Stages,
}

#[derive(Debug)]
pub struct RunSummary {
    pub stats: RunStats,
    pub output_dir: PathBuf,
    /// Records written per shard file name.
    pub shards: BTreeMap<String, usize>,
    pub stats_path: PathBuf,
}

/// State shared by the jobs of one run.
struct Run {
    stages: Stages,
    dedup: Deduplicator,
    shards: ShardSet,
    val_fraction: f64,
    dedup_order: Sequencer,
    write_order: Sequencer,
    failed: AtomicBool,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let stages = Stages {
            extractor: Extractor::new(),
            tagger: CategoryTagger::new(&config.categories)?,
            normalizer: ActionNormalizer::new(&config.normalizer)?,
            chunker: Chunker::new(&config.chunker),
            quality: QualityFilter::new(&config.quality)?,
            scrubber: SecretScrubber::new(&config.secrets)?,
            validator: SchemaValidator,
        };
        Ok(Self { config, stages })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process every transcript under the source directory. Setting `stop`
    /// prevents new jobs from starting; jobs already running finish.
    pub async fn run(self, stop: Arc<AtomicBool>) -> Result<RunSummary, PipelineError> {
        let Pipeline { config, stages } = self;
        let files = discover(&config.source_dir)?;
        tracing::info!(
            source = ?config.source_dir,
            output = ?config.output_dir,
            files = files.len(),
            workers = config.workers,
            "starting distillation run"
        );

        let shards = ShardSet::create(&config.output_dir)?;
        let run = Arc::new(Run {
            stages,
            dedup: Deduplicator::new(),
            shards,
            val_fraction: config.val_fraction,
            dedup_order: Sequencer::new(),
            write_order: Sequencer::new(),
            failed: AtomicBool::new(false),
        });
        let semaphore = Arc::new(Semaphore::new(config.workers));
        let mut jobs = JoinSet::new();
        let mut stats = RunStats::default();
        let mut first_error: Option<PipelineError> = None;

        for (index, path) in files.into_iter().enumerate() {
            if stop.load(Ordering::SeqCst) {
                tracing::warn!(remaining_from = index, "stop requested; not starting further files");
                stats.interrupted = true;
                break;
            }
            // Permits are taken in file order, so every lower ticket is already running.
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| PipelineError::Worker(e.to_string()))?;
            if run.failed.load(Ordering::SeqCst) {
                break;
            }
            let job_run = Arc::clone(&run);
            jobs.spawn_blocking(move || {
                let _permit = permit;
                let result = job_run.process(index, &path);
                if result.is_err() {
                    job_run.failed.store(true, Ordering::SeqCst);
                }
                result
            });

            while let Some(joined) = jobs.try_join_next() {
                collect(joined, &mut stats, &mut first_error);
            }
        }

        while let Some(joined) = jobs.join_next().await {
            collect(joined, &mut stats, &mut first_error);
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let totals = run.shards.finish()?;
        for (name, records) in &totals {
            tracing::info!(records, shard = ?config.output_dir.join(name), "wrote shard");
        }
        let removed = run.shards.remove_unwritten()?;
        if removed > 0 {
            tracing::info!(removed, "removed shards from a previous run");
        }
        let stats_path = stats.write_json(&config.output_dir)?;
        tracing::info!(
            sessions = stats.sessions_extracted,
            emitted = stats.records_emitted,
            held_out = stats.records_held_out,
            duplicates = stats.dropped(DropReason::Duplicate),
            schema_rejects = stats.dropped(DropReason::Schema),
            "distillation run finished"
        );

        Ok(RunSummary {
            stats,
            output_dir: config.output_dir,
            shards: totals,
            stats_path,
        })
    }
}

fn collect(
    joined: Result<Result<RunStats, PipelineError>, tokio::task::JoinError>,
    stats: &mut RunStats,
    first_error: &mut Option<PipelineError>,
) {
    match joined {
        Ok(Ok(job_stats)) => stats.merge(&job_stats),
        Ok(Err(e)) => {
            tracing::error!(err = %e, "job failed");
            first_error.get_or_insert(e);
        }
        Err(e) => {
            tracing::error!(err = ?e, "job panicked");
            first_error.get_or_insert(PipelineError::Worker(e.to_string()));
        }
    }
}

/// A job's pending turns at both sequencers. Turns not taken explicitly are
/// passed on when this drops, including on early return or panic.
struct Turnstiles<'a> {
    index: usize,
    dedup: Option<&'a Sequencer>,
    write: Option<&'a Sequencer>,
}

impl<'a> Turnstiles<'a> {
    fn new(run: &'a Run, index: usize) -> Self {
        Self {
            index,
            dedup: Some(&run.dedup_order),
            write: Some(&run.write_order),
        }
    }

    fn dedup(&mut self) -> Option<Ticket<'a>> {
        self.dedup.take().map(|seq| seq.wait(self.index))
    }

    fn write(&mut self) -> Option<Ticket<'a>> {
        self.write.take().map(|seq| seq.wait(self.index))
    }
}

impl Drop for Turnstiles<'_> {
    fn drop(&mut self) {
        if let Some(seq) = self.dedup.take() {
            seq.skip(self.index);
        }
        if let Some(seq) = self.write.take() {
            seq.skip(self.index);
        }
    }
}

impl Run {
    fn process(&self, index: usize, path: &Path) -> Result<RunStats, PipelineError> {
        let mut turnstiles = Turnstiles::new(self, index);
        let mut stats = RunStats {
            files_seen: 1,
            ..RunStats::default()
        };
        let s = &self.stages;

        let mut session = match s.extractor.extract(path, &mut stats.extraction) {
            Ok(Some(session)) => session,
            Ok(None) => {
                tracing::debug!(path = ?path, "no usable turns");
                stats.sessions_empty += 1;
                return Ok(stats);
            }
            Err(e) => {
                tracing::warn!(path = ?path, err = %e, "cannot read transcript");
                stats.files_unreadable += 1;
                return Ok(stats);
            }
        };

        s.tagger.tag(&mut session);
        s.normalizer.normalize(&mut session);
        let category = session.category().to_string();
        let instruction = s.tagger.instruction(&category);
        stats.record_session(&category);

        let plan = s.chunker.chunk(&session, instruction);
        for skip in plan.skipped {
            stats.record_drop(&category, skip.into());
        }

        let mut scored = Vec::with_capacity(plan.chunks.len());
        for chunk in plan.chunks {
            let verdict = s.quality.assess(&chunk);
            if verdict.drop {
                tracing::debug!(session = %session.id, chunk = chunk.index, score = verdict.score, "below quality threshold");
                stats.record_drop(&category, DropReason::Quality);
                continue;
            }
            let hash = final_model_hash(&chunk);
            scored.push((chunk, verdict, hash));
        }

        let mut unique = Vec::with_capacity(scored.len());
        {
            let _turn = turnstiles.dedup();
            for (chunk, verdict, hash) in scored {
                if self.dedup.insert_if_absent(hash) {
                    unique.push((chunk, verdict, hash));
                } else {
                    tracing::debug!(session = %session.id, chunk = chunk.index, "duplicate chunk");
                    stats.record_drop(&category, DropReason::Duplicate);
                }
            }
        }

        let mut lines = Vec::with_capacity(unique.len());
        for (chunk, verdict, hash) in unique {
            let scrubbed = s.scrubber.scrub_chunk(&chunk);
            stats.record_redactions(&scrubbed.redactions);
            match s.validator.build(&scrubbed, instruction, &verdict) {
                Ok(record) => {
                    let line = record
                        .to_json_line()
                        .map_err(|e| PipelineError::Worker(format!("{e:#}")))?;
                    stats.record_emit(&category, verdict.score, verdict.downweighted);
                    let split = Split::for_hash(hash, self.val_fraction);
                    if split == Split::Val {
                        stats.record_holdout(&category);
                    }
                    lines.push((split, line));
                }
                Err(reason) => {
                    tracing::error!(
                        session = %session.id,
                        chunk = chunk.index,
                        reason = reason.as_str(),
                        "schema rejection: {reason}"
                    );
                    stats.record_drop(&category, DropReason::Schema);
                }
            }
        }

        let _turn = turnstiles.write();
        for (split, line) in &lines {
            self.shards.append(&category, *split, line)?;
        }
        Ok(stats)
    }
}
