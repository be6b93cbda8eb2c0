use std::path::PathBuf;

/// Conditions that abort a run. Bad transcript data never ends up here; it is
/// counted in the run statistics instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid {table} pattern {pattern:?}: {source}")]
    Pattern {
        table: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("cannot read source directory {path:?}: {source}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write output {path:?}: {source}")]
    OutputUnwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("worker failed: {0}")]
    Worker(String),
}

impl PipelineError {
    pub(crate) fn output(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::OutputUnwritable {
            path: path.into(),
            source,
        }
    }
}

pub(crate) fn compile(table: &'static str, pattern: &str) -> Result<regex::Regex, PipelineError> {
    regex::Regex::new(pattern).map_err(|source| PipelineError::Pattern {
        table,
        pattern: pattern.to_string(),
        source,
    })
}
