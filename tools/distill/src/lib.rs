use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use distiller::report::{self, MAX_REPORTED_ERRORS, ShardInspection};
use distiller::{Pipeline, PipelineConfig, RunSummary};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Exit status for a run cut short by Ctrl-C.
const INTERRUPTED_EXIT: u8 = 130;

#[derive(Parser)]
#[command(
    name = "distill",
    about = "Distill agent session transcripts into category-sharded training data"
)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every transcript under the source directory and write shards plus stats.json.
    Run {
        /// TOML config file. Without it the built-in defaults apply.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Transcript root (overrides config and DISTILL_SOURCE_DIR).
        #[arg(long)]
        source: Option<PathBuf>,

        /// Output directory (overrides config and DISTILL_OUTPUT_DIR).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Concurrent session jobs (overrides config and DISTILL_WORKERS).
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Check every line of existing shard files against the record schema.
    ///
    /// Exits non-zero when any line is invalid.
    Validate {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Print record, size and quality statistics for one shard file.
    Inspect {
        file: PathBuf,

        /// Characters per token used for the token estimate.
        #[arg(long, default_value_t = 4)]
        chars_per_token: usize,

        /// Print the statistics as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

pub async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let fallback = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .init();

    match cli.command {
        Commands::Run {
            config,
            source,
            output,
            workers,
        } => {
            let mut config = PipelineConfig::load(config.as_deref())?;
            apply_overrides(&mut config, source, output, workers);
            run_pipeline(config).await
        }
        Commands::Validate { files } => run_validate(&files),
        Commands::Inspect {
            file,
            chars_per_token,
            json,
        } => run_inspect(file, chars_per_token, json),
    }
}

fn apply_overrides(
    config: &mut PipelineConfig,
    source: Option<PathBuf>,
    output: Option<PathBuf>,
    workers: Option<usize>,
) {
    if let Some(source) = source {
        config.source_dir = source;
    }
    if let Some(output) = output {
        config.output_dir = output;
    }
    if let Some(workers) = workers {
        config.workers = workers;
    }
}

async fn run_pipeline(config: PipelineConfig) -> Result<ExitCode> {
    let pipeline = Pipeline::new(config)?;

    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; letting running sessions finish");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let summary = pipeline.run(stop).await?;
    print!("{}", render_summary(&summary));
    if summary.stats.interrupted {
        return Ok(ExitCode::from(INTERRUPTED_EXIT));
    }
    Ok(ExitCode::SUCCESS)
}

fn render_summary(summary: &RunSummary) -> String {
    let stats = &summary.stats;
    let mut lines = vec![
        format!(
            "Distill complete: emitted={} held_out={} sessions={} empty={} files={} unreadable={}",
            stats.records_emitted,
            stats.records_held_out,
            stats.sessions_extracted,
            stats.sessions_empty,
            stats.files_seen,
            stats.files_unreadable,
        ),
        format!(
            "Extraction: parse_errors={} skipped_records={} orphan_results={} reasoning_discarded={}",
            stats.extraction.parse_errors,
            stats.extraction.skipped_records,
            stats.extraction.orphan_results,
            stats.extraction.reasoning_discarded,
        ),
    ];

    if !stats.drops.is_empty() {
        let drops: Vec<String> = stats
            .drops
            .iter()
            .map(|(reason, count)| format!("{}={count}", reason.as_str()))
            .collect();
        lines.push(format!("Dropped: {}", drops.join(" ")));
    }
    if !stats.redactions.is_empty() {
        let classes: Vec<String> = stats
            .redactions
            .iter()
            .map(|(class, count)| format!("{class}={count}"))
            .collect();
        lines.push(format!("Redacted: {}", classes.join(" ")));
    }

    let scores = &stats.scores;
    if let (Some(min), Some(max), Some(mean)) = (scores.min(), scores.max(), scores.mean()) {
        let histogram: Vec<String> = scores.histogram().iter().map(usize::to_string).collect();
        lines.push(format!(
            "Quality: count={} min={min:.3} max={max:.3} mean={mean:.3} histogram=[{}]",
            scores.count(),
            histogram.join(" "),
        ));
    }

    for (category, c) in &stats.categories {
        let mut line = format!(
            "  {category:<12} sessions={} emitted={} held_out={} downweighted={}",
            c.sessions, c.emitted, c.held_out, c.downweighted,
        );
        for (reason, count) in &c.drops {
            line.push_str(&format!(" {}={count}", reason.as_str()));
        }
        lines.push(line);
    }
    for (name, records) in &summary.shards {
        let path = summary.output_dir.join(name);
        lines.push(format!("Shard {} ({records} records)", path.display()));
    }
    lines.push(format!("Stats {}", summary.stats_path.display()));
    if stats.interrupted {
        lines.push("Run was interrupted; not every file was processed.".to_string());
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn run_validate(files: &[PathBuf]) -> Result<ExitCode> {
    let mut failed = false;
    let mut shown = 0;
    let mut hidden = 0;

    for file in files {
        let report = match report::validate_shard(file) {
            Ok(report) => report,
            Err(e) => {
                eprintln!("{}: {e:#}", file.display());
                failed = true;
                continue;
            }
        };
        println!(
            "{}: {}/{} valid",
            report.path.display(),
            report.valid,
            report.total
        );
        if report.is_valid() {
            continue;
        }
        failed = true;
        for (line, message) in &report.errors {
            if shown < MAX_REPORTED_ERRORS {
                println!("  line {line}: {message}");
                shown += 1;
            } else {
                hidden += 1;
            }
        }
        hidden += report.invalid() - report.errors.len();
    }

    if hidden > 0 {
        println!("... {hidden} more invalid lines not shown");
    }
    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn run_inspect(file: PathBuf, chars_per_token: usize, json: bool) -> Result<ExitCode> {
    anyhow::ensure!(chars_per_token > 0, "--chars-per-token must be positive");
    let inspection = report::inspect_shard(&file, chars_per_token)?;
    if json {
        let body = serde_json::to_string_pretty(&inspection).context("serialize inspection")?;
        println!("{body}");
    } else {
        print!("{}", render_inspection(&inspection));
    }
    Ok(ExitCode::SUCCESS)
}

fn render_inspection(inspection: &ShardInspection) -> String {
    let mut lines = vec![
        format!("Shard: {}", inspection.path.display()),
        format!(
            "Records: {} (unparsable {})",
            inspection.records, inspection.unparsable
        ),
    ];
    for (category, count) in &inspection.categories {
        lines.push(format!("  {category:<12} {count}"));
    }
    if let Some(e) = inspection.entries {
        lines.push(format!(
            "Entries per record: min={} max={} mean={:.1} median={}",
            e.min, e.max, e.mean, e.median
        ));
    }
    if let Some(c) = inspection.chars {
        lines.push(format!(
            "Chars per record: min={} max={} mean={:.1} median={}",
            c.min, c.max, c.mean, c.median
        ));
    }
    if let Some(tokens) = inspection.approx_tokens_mean {
        lines.push(format!("Approx tokens per record: {tokens:.0}"));
    }
    if let Some(q) = inspection.quality {
        lines.push(format!(
            "Quality: min={:.3} max={:.3} mean={:.3}",
            q.min, q.max, q.mean
        ));
    }
    lines.push(format!(
        "With tool calls: {} ({:.1}%)",
        inspection.with_tool_calls,
        inspection.tool_call_ratio * 100.0
    ));

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use distiller::{DropReason, RunStats};
    use std::collections::BTreeMap;

    #[test]
    fn run_accepts_overrides() {
        let parsed = Cli::try_parse_from([
            "distill", "run", "--source", "/tmp/in", "-o", "/tmp/out", "-w", "3", "-v",
        ])
        .unwrap();
        assert!(parsed.verbose);
        let Commands::Run {
            config,
            source,
            output,
            workers,
        } = parsed.command
        else {
            panic!("expected run subcommand");
        };
        assert!(config.is_none());
        assert_eq!(source, Some(PathBuf::from("/tmp/in")));
        assert_eq!(output, Some(PathBuf::from("/tmp/out")));
        assert_eq!(workers, Some(3));
    }

    #[test]
    fn validate_requires_files() {
        assert!(Cli::try_parse_from(["distill", "validate"]).is_err());
        let parsed = Cli::try_parse_from(["distill", "validate", "a.jsonl", "b.jsonl"]).unwrap();
        let Commands::Validate { files } = parsed.command else {
            panic!("expected validate subcommand");
        };
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn inspect_defaults_chars_per_token() {
        let parsed = Cli::try_parse_from(["distill", "inspect", "crew_train.jsonl"]).unwrap();
        let Commands::Inspect {
            chars_per_token,
            json,
            ..
        } = parsed.command
        else {
            panic!("expected inspect subcommand");
        };
        assert_eq!(chars_per_token, 4);
        assert!(!json);
    }

    #[test]
    fn flags_override_loaded_config() {
        let mut config = PipelineConfig::default();
        let before = config.output_dir.clone();
        apply_overrides(&mut config, Some(PathBuf::from("/data/sessions")), None, Some(2));
        assert_eq!(config.source_dir, PathBuf::from("/data/sessions"));
        assert_eq!(config.output_dir, before);
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn summary_lists_drops_and_shards() {
        let mut stats = RunStats::default();
        stats.files_seen = 2;
        stats.record_session("crew");
        stats.record_emit("crew", 0.75, false);
        stats.record_emit("crew", 0.5, false);
        stats.record_holdout("crew");
        stats.record_drop("crew", DropReason::Duplicate);
        stats.record_redactions(&BTreeMap::from([("GITHUB_PAT".to_string(), 1)]));
        let summary = RunSummary {
            stats,
            output_dir: PathBuf::from("out"),
            shards: BTreeMap::from([
                ("crew_train.jsonl".to_string(), 1),
                ("crew_val.jsonl".to_string(), 1),
            ]),
            stats_path: PathBuf::from("out/stats.json"),
        };

        let text = render_summary(&summary);
        assert!(text.contains("emitted=2 held_out=1 sessions=1"));
        assert!(text.contains("Dropped: duplicate=1"));
        assert!(text.contains("Redacted: GITHUB_PAT=1"));
        assert!(text.contains("mean=0.625"));
        assert!(text.contains("emitted=2 held_out=1 downweighted=0 duplicate=1"));
        assert!(text.contains("crew_train.jsonl (1 records)"));
        assert!(text.contains("crew_val.jsonl (1 records)"));
        assert!(!text.contains("interrupted"));
    }
}
