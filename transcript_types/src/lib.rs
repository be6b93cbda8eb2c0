//! Shared data model for the distill pipeline: parsed sessions on the way in,
//! training records on the way out.

pub mod record;
pub mod session;

pub use record::{
    validate_record_value, ConversationEntry, RecordMetadata, Speaker, TrainingRecord,
};
pub use session::{ActionOutput, ActionTag, Invocation, Role, Segment, Session, TagKind, Turn};

/// Category assigned when neither the path nor the transcript identifies one.
pub const UNKNOWN_CATEGORY: &str = "unknown";
