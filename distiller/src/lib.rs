//! Turns agent session transcripts into category-sharded training records.
//!
//! Stages run per session in this order: extract, tag, normalize, chunk,
//! score, dedup, scrub, validate, write. [`Pipeline`] wires them together.

pub mod chunker;
pub mod config;
pub mod dedup;
pub mod error;
pub mod extract;
pub mod normalizer;
pub mod parse;
pub mod pipeline;
pub mod quality;
pub mod report;
pub mod schema;
pub mod scrubber;
pub mod sequencer;
pub mod shards;
pub mod stats;
pub mod tagger;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use pipeline::{Pipeline, RunSummary};
pub use stats::{DropReason, RunStats};
