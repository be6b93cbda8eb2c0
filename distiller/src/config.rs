use crate::error::{compile, PipelineError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

// ── Default path constants ──────────────────────────────────────────────

/// Claude Code per-project session files relative to home.
const DEFAULT_SOURCE_REL: &str = ".claude/projects";

/// Output directory, relative to the working directory.
const DEFAULT_OUTPUT_DIR: &str = "output/datasets";

const DEFAULT_WORKERS_FALLBACK: usize = 4;

/// Share of emitted records held out into `<category>_val.jsonl`.
const DEFAULT_VAL_FRACTION: f64 = 0.05;

// ── Chunking and filtering defaults ─────────────────────────────────────

const DEFAULT_WINDOW_PAIRS: usize = 8;
const DEFAULT_OVERLAP: f64 = 0.5;
const DEFAULT_MAX_TOKENS: usize = 4096;
const DEFAULT_CHARS_PER_TOKEN: usize = 4;
const DEFAULT_MAX_RESULT_CHARS: usize = 2000;
const DEFAULT_MAX_ARGUMENT_CHARS: usize = 2000;
const DEFAULT_MIN_TURNS: usize = 4;
const DEFAULT_DROP_BELOW: f64 = 0.2;
const DEFAULT_DOWNWEIGHT_BELOW: f64 = 0.4;
const DEFAULT_ACTION_SATURATION: usize = 5;

// ── Config structs ──────────────────────────────────────────────────────

/// Everything a run needs. Deserialized from TOML; every field falls back to
/// the documented default in `distill.example.toml`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Root of the transcript tree. Default `~/.claude/projects`.
    pub source_dir: PathBuf,
    /// Where category shards and `stats.json` are written. Default `output/datasets`.
    pub output_dir: PathBuf,
    /// Concurrent session jobs. Default: available parallelism.
    pub workers: usize,
    /// Share of records routed to validation shards by content hash, in [0, 1]. Default 0.05.
    pub val_fraction: f64,
    pub chunker: ChunkerConfig,
    pub normalizer: NormalizerConfig,
    pub quality: QualityConfig,
    pub categories: CategoryConfig,
    /// Secret matchers. A `[[secrets]]` table in the file replaces the built-in list.
    pub secrets: Vec<SecretPattern>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChunkerConfig {
    /// Window size in user/model pairs. Default 8.
    pub window_pairs: usize,
    /// Fraction of a window shared with the next one, in [0, 1). Default 0.5.
    pub overlap: f64,
    /// Size budget per chunk in estimated tokens. Default 4096.
    pub max_tokens: usize,
    /// Characters counted as one token by the estimator. Default 4.
    pub chars_per_token: usize,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormalizerConfig {
    /// Characters kept from a single action output. Default 2000.
    pub max_result_chars: usize,
    /// Characters kept from serialized action arguments. Default 2000.
    pub max_argument_chars: usize,
    /// Output lines matching any of these are removed before truncation.
    pub noise_patterns: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QualityConfig {
    /// Chunks shorter than this many turns are penalized. Default 4.
    pub min_turns: usize,
    /// Hard threshold: chunks scoring below are dropped. Default 0.2.
    pub drop_below: f64,
    /// Soft threshold: chunks scoring below are kept but flagged. Default 0.4.
    pub downweight_below: f64,
    /// Action pairs at which the action reward saturates. Default 5.
    pub action_saturation: usize,
    pub weights: QualityWeights,
    /// First-line patterns marking a startup banner or empty acknowledgement.
    pub boilerplate_patterns: Vec<String>,
    /// Patterns in assistant text that signal a finished multi-step task.
    pub completion_patterns: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QualityWeights {
    pub base: f64,
    pub substance: f64,
    pub completion: f64,
    pub actions: f64,
    pub boilerplate: f64,
    pub short: f64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CategoryConfig {
    /// The closed label set. `unknown` is always implied.
    pub labels: Vec<String>,
    /// Ordered path rules; the first match wins.
    pub paths: Vec<PathRule>,
    /// Regex searched in the first user turn; capture group 1 names the category.
    pub marker_pattern: String,
    /// Instruction used for categories without their own entry.
    pub default_instruction: String,
    pub instructions: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathRule {
    pub pattern: String,
    pub category: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretPattern {
    /// Credential class, surfaced in the `[REDACTED:<class>]` token.
    pub class: String,
    pub pattern: String,
    /// Capture group holding the secret; 0 replaces the whole match.
    #[serde(default)]
    pub group: usize,
}

// ── Loading ─────────────────────────────────────────────────────────────

impl PipelineConfig {
    /// Defaults, then the optional TOML file, then `DISTILL_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, PipelineError> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .map_err(|e| PipelineError::Config(format!("read {path:?}: {e}")))?;
                Self::from_toml(&raw)
                    .map_err(|e| PipelineError::Config(format!("{path:?}: {e}")))?
            }
            None => Self::default(),
        };

        let home = dirs::home_dir().unwrap_or_default();
        config.source_dir = env_path("DISTILL_SOURCE_DIR", config.source_dir, &home);
        config.output_dir = env_path("DISTILL_OUTPUT_DIR", config.output_dir, &home);
        config.workers = env_usize("DISTILL_WORKERS", config.workers);
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(raw)?;
        let home = dirs::home_dir().unwrap_or_default();
        config.source_dir = expand_tilde(&config.source_dir.to_string_lossy(), &home);
        config.output_dir = expand_tilde(&config.output_dir.to_string_lossy(), &home);
        Ok(config)
    }

    /// Range checks plus a compile of every configured pattern.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let fail = |msg: String| Err(PipelineError::Config(msg));
        let c = &self.chunker;
        if c.window_pairs == 0 {
            return fail("chunker.window_pairs must be at least 1".into());
        }
        if !(0.0..1.0).contains(&c.overlap) {
            return fail(format!("chunker.overlap must be in [0, 1), got {}", c.overlap));
        }
        if c.max_tokens == 0 {
            return fail("chunker.max_tokens must be positive".into());
        }
        if c.chars_per_token == 0 {
            return fail("chunker.chars_per_token must be positive".into());
        }
        let q = &self.quality;
        for (name, value) in [
            ("quality.drop_below", q.drop_below),
            ("quality.downweight_below", q.downweight_below),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return fail(format!("{name} must be in [0, 1], got {value}"));
            }
        }
        if q.drop_below > q.downweight_below {
            return fail("quality.drop_below must not exceed quality.downweight_below".into());
        }
        if q.action_saturation == 0 {
            return fail("quality.action_saturation must be positive".into());
        }
        if self.workers == 0 {
            return fail("workers must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.val_fraction) {
            return fail(format!("val_fraction must be in [0, 1], got {}", self.val_fraction));
        }
        if self.normalizer.max_result_chars == 0 || self.normalizer.max_argument_chars == 0 {
            return fail("normalizer character budgets must be positive".into());
        }

        let tables: [(&'static str, Vec<&str>); 6] = [
            ("category path", self.categories.paths.iter().map(|r| r.pattern.as_str()).collect()),
            ("category marker", vec![self.categories.marker_pattern.as_str()]),
            ("noise", self.normalizer.noise_patterns.iter().map(String::as_str).collect()),
            ("boilerplate", q.boilerplate_patterns.iter().map(String::as_str).collect()),
            ("completion", q.completion_patterns.iter().map(String::as_str).collect()),
            ("secret", self.secrets.iter().map(|s| s.pattern.as_str()).collect()),
        ];
        for (table, patterns) in tables {
            for pattern in patterns {
                compile(table, pattern)?;
            }
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_default();
        Self {
            source_dir: home.join(DEFAULT_SOURCE_REL),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(DEFAULT_WORKERS_FALLBACK),
            val_fraction: DEFAULT_VAL_FRACTION,
            chunker: ChunkerConfig::default(),
            normalizer: NormalizerConfig::default(),
            quality: QualityConfig::default(),
            categories: CategoryConfig::default(),
            secrets: default_secret_patterns(),
        }
    }
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            window_pairs: DEFAULT_WINDOW_PAIRS,
            overlap: DEFAULT_OVERLAP,
            max_tokens: DEFAULT_MAX_TOKENS,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            max_result_chars: DEFAULT_MAX_RESULT_CHARS,
            max_argument_chars: DEFAULT_MAX_ARGUMENT_CHARS,
            noise_patterns: strings(&[
                r"^Shell cwd was reset to",
                r"^WARNING: This binary was built with",
            ]),
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_turns: DEFAULT_MIN_TURNS,
            drop_below: DEFAULT_DROP_BELOW,
            downweight_below: DEFAULT_DOWNWEIGHT_BELOW,
            action_saturation: DEFAULT_ACTION_SATURATION,
            weights: QualityWeights::default(),
            boilerplate_patterns: strings(&[
                r"(?i)^mayor,?\s+checking in\.?$",
                r"(?i)^let me check.*(hook|mail)",
                r"(?i)^nothing on hook",
                r"(?i)^no .* messages",
                r"(?i)^(ok|okay|sure|got it|understood|ack|acknowledged)[.!]*$",
                r"(?i)^(welcome to|starting session|session started)\b",
            ]),
            completion_patterns: strings(&[
                r"(?i)\ball tests pass(ed)?\b",
                r"(?i)\b(committed|pushed|merged)\b",
                r"(?i)\b(task|work|fix) (is )?(complete|completed|done|finished)\b",
                r"(?i)\bgt done\b",
            ]),
        }
    }
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            base: 0.3,
            substance: 0.3,
            completion: 0.2,
            actions: 0.2,
            boilerplate: 0.5,
            short: 0.3,
        }
    }
}

impl Default for CategoryConfig {
    fn default() -> Self {
        let rule = |pattern: &str, category: &str| PathRule {
            pattern: pattern.to_string(),
            category: category.to_string(),
        };
        let instructions = [
            (
                "mayor",
                "[GAS TOWN ROLE: mayor]\nYou are the Mayor, the human-facing orchestrator. You triage issues, review work and coordinate the other agents with gt and bd commands plus standard dev tools.",
            ),
            (
                "deacon",
                "[GAS TOWN ROLE: deacon]\nYou are the Deacon, an autonomous patrol agent. You watch system health, run patrol cycles and dispatch work without human prompting.",
            ),
            (
                "boot",
                "[GAS TOWN ROLE: boot]\nYou are Boot, the deacon's startup helper. You initialize the environment and verify infrastructure before other agents start.",
            ),
            (
                "witness",
                "[GAS TOWN ROLE: witness]\nYou are the Witness. You monitor workers, validate their changes and report findings to the mayor and deacon.",
            ),
            (
                "refinery",
                "[GAS TOWN ROLE: refinery]\nYou are the Refinery. You review and merge finished work, checking for bugs and enforcing quality standards.",
            ),
            (
                "polecat",
                "[GAS TOWN ROLE: polecat]\nYou are a Polecat, an autonomous worker. You take an assignment, make the change, commit, push and report completion, escalating blockers.",
            ),
            (
                "crew",
                "[GAS TOWN ROLE: crew]\nYou are a Crew member, a developer agent working on tasks in your assigned rig with standard dev tools.",
            ),
        ];

        Self {
            labels: strings(&[
                "mayor", "deacon", "boot", "witness", "refinery", "polecat", "crew",
            ]),
            paths: vec![
                rule(r"-deacon-dogs-boot/[^/]*$", "boot"),
                rule(r"-deacon-dogs-[^/]*/[^/]*$", "deacon"),
                rule(r"-deacon/[^/]*$", "deacon"),
                rule(r"-mayor/[^/]*$", "mayor"),
                rule(r"-witness/[^/]*$", "witness"),
                rule(r"-refinery-[^/]*/[^/]*$", "refinery"),
                rule(r"-crew-[^/]*/[^/]*$", "crew"),
                rule(r"-polecats-[^/]*/[^/]*$", "polecat"),
            ],
            marker_pattern: r"\[GAS TOWN\]\s+(\w+)\s+<-".to_string(),
            default_instruction: "[GAS TOWN ROLE: agent]\nYou are a Gas Town agent. You use gt commands and standard dev tools to complete software engineering tasks.".to_string(),
            instructions: instructions
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

fn default_secret_patterns() -> Vec<SecretPattern> {
    let secret = |class: &str, pattern: &str, group: usize| SecretPattern {
        class: class.to_string(),
        pattern: pattern.to_string(),
        group,
    };
    vec![
        secret("GITHUB_OAUTH", r"gho_[A-Za-z0-9]{36,}", 0),
        secret("GITHUB_PAT", r"ghp_[A-Za-z0-9]{36,}", 0),
        secret("GITHUB_APP_TOKEN", r"gh[sur]_[A-Za-z0-9]{36,}", 0),
        secret("GITHUB_FINE_GRAINED_PAT", r"github_pat_[A-Za-z0-9_]{40,}", 0),
        secret("GOOGLE_ACCESS_TOKEN", r"ya29\.[A-Za-z0-9_-]{50,}", 0),
        secret("GOOGLE_REFRESH_TOKEN", r"1//[A-Za-z0-9_-]{40,}", 0),
        secret("AWS_ACCESS_KEY", r"AKIA[0-9A-Z]{16}", 0),
        secret(
            "AWS_SECRET",
            r#"(?i)(?:aws_secret_access_key|secret_key)[\s:=]+['"]?([A-Za-z0-9+/=]{40})['"]?"#,
            1,
        ),
        secret("ANTHROPIC_KEY", r"sk-ant-[A-Za-z0-9_-]{20,}", 0),
        secret("OPENAI_PROJECT_KEY", r"sk-proj-[A-Za-z0-9_-]{20,}", 0),
        secret("OPENAI_KEY", r"sk-[A-Za-z0-9]{20,}", 0),
        secret("SLACK_TOKEN", r"xox[baprs]-[A-Za-z0-9-]{10,}", 0),
        secret(
            "JWT",
            r"eyJ[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{10,}",
            0,
        ),
        secret(
            "PRIVATE_KEY",
            r"(?s)-----BEGIN (?:RSA |EC |DSA |OPENSSH )?PRIVATE KEY-----.*?-----END (?:RSA |EC |DSA |OPENSSH )?PRIVATE KEY-----",
            0,
        ),
        secret(
            "BEARER_TOKEN",
            r#"(?i)(?:Bearer|Authorization)[\s:]+['"]?([A-Za-z0-9._+/=-]{30,})['"]?"#,
            1,
        ),
        secret("GH_TOKEN", r"GH_TOKEN[=\s]+([A-Za-z0-9_]{30,})", 1),
        secret(
            "API_KEY",
            r#"(?i)\b(?:api[_-]?key|apikey|secret|token|password|credential)[\s:=]+['"]?([A-Za-z0-9+/=_-]{32,})['"]?"#,
            1,
        ),
    ]
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn env_path(key: &str, default: PathBuf, home: &Path) -> PathBuf {
    match env::var(key) {
        Ok(val) if !val.trim().is_empty() => expand_tilde(&val, home),
        _ => default,
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    match env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

fn expand_tilde(input: &str, home: &Path) -> PathBuf {
    if let Some(rest) = input.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn toml_overrides_only_named_fields() {
        let config = PipelineConfig::from_toml(
            r#"
            output_dir = "/tmp/shards"
            workers = 2
            val_fraction = 0.1

            [chunker]
            window_pairs = 1
            overlap = 0.0

            [quality.weights]
            boilerplate = 0.9
            "#,
        )
        .unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/tmp/shards"));
        assert_eq!(config.workers, 2);
        assert_eq!(config.val_fraction, 0.1);
        assert_eq!(config.chunker.window_pairs, 1);
        assert_eq!(config.chunker.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(config.quality.weights.boilerplate, 0.9);
        assert_eq!(config.quality.weights.base, 0.3);
        assert!(!config.secrets.is_empty());
    }

    #[test]
    fn secret_table_replaces_builtins() {
        let config = PipelineConfig::from_toml(
            r#"
            [[secrets]]
            class = "INTERNAL"
            pattern = "int_[a-z]{8}"
            "#,
        )
        .unwrap();
        assert_eq!(config.secrets.len(), 1);
        assert_eq!(config.secrets[0].group, 0);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(PipelineConfig::from_toml("window = 3").is_err());
    }

    #[test]
    fn rejects_out_of_range_overlap() {
        let mut config = PipelineConfig::default();
        config.chunker.overlap = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_val_fraction() {
        let mut config = PipelineConfig::default();
        config.val_fraction = 1.5;
        assert!(config.validate().is_err());
        config.val_fraction = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut config = PipelineConfig::default();
        config.quality.drop_below = 0.6;
        config.quality.downweight_below = 0.4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_uncompilable_pattern() {
        let mut config = PipelineConfig::default();
        config.quality.boilerplate_patterns.push("(unclosed".into());
        assert!(matches!(
            config.validate(),
            Err(PipelineError::Pattern { table: "boilerplate", .. })
        ));
    }

    #[test]
    fn expands_home_prefix() {
        let home = Path::new("/home/tester");
        assert_eq!(
            expand_tilde("~/transcripts", home),
            PathBuf::from("/home/tester/transcripts")
        );
        assert_eq!(expand_tilde("/abs", home), PathBuf::from("/abs"));
    }

    #[test]
    fn example_file_matches_defaults() {
        let example = PipelineConfig::from_toml(include_str!("../../distill.example.toml")).unwrap();
        example.validate().unwrap();
        let defaults = PipelineConfig::default();

        assert_eq!(example.source_dir, defaults.source_dir);
        assert_eq!(example.val_fraction, defaults.val_fraction);
        assert_eq!(example.chunker.window_pairs, defaults.chunker.window_pairs);
        assert_eq!(example.quality.boilerplate_patterns, defaults.quality.boilerplate_patterns);
        assert_eq!(example.categories.instructions, defaults.categories.instructions);
        assert_eq!(
            example.categories.default_instruction,
            defaults.categories.default_instruction
        );
        let classes = |c: &PipelineConfig| {
            c.secrets
                .iter()
                .map(|s| (s.class.clone(), s.pattern.clone(), s.group))
                .collect::<Vec<_>>()
        };
        assert_eq!(classes(&example), classes(&defaults));
    }
}
