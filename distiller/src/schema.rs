use crate::quality::QualityVerdict;
use crate::scrubber::ScrubbedChunk;
use serde::Serialize;
use transcript_types::{ConversationEntry, RecordMetadata, Role, Speaker, TrainingRecord, Turn};

/// Why a serialized chunk was refused. Any of these means an upstream stage
/// broke an invariant, so they are logged at error level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    #[error("record does not start with a system entry")]
    MissingSystem,
    #[error("record has no human/gpt entries")]
    NoExchange,
    #[error("same speaker appears twice in a row")]
    RepeatedSpeaker,
    #[error("system entry after the first position")]
    MisplacedSystem,
    #[error("first exchange entry is from gpt")]
    StartsWithGpt,
    #[error("record ends with a human entry")]
    EndsWithHuman,
    #[error("record contains an empty entry")]
    EmptyEntry,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MissingSystem => "missing_system",
            RejectReason::NoExchange => "no_exchange",
            RejectReason::RepeatedSpeaker => "repeated_speaker",
            RejectReason::MisplacedSystem => "misplaced_system",
            RejectReason::StartsWithGpt => "starts_with_gpt",
            RejectReason::EndsWithHuman => "ends_with_human",
            RejectReason::EmptyEntry => "empty_entry",
        }
    }
}

/// Turns a scrubbed chunk into a [`TrainingRecord`], or rejects it.
pub struct SchemaValidator;

impl SchemaValidator {
    pub fn build(
        &self,
        chunk: &ScrubbedChunk,
        instruction: &str,
        verdict: &QualityVerdict,
    ) -> Result<TrainingRecord, RejectReason> {
        let conversations = conversation_entries(instruction, &chunk.turns);
        check_entries(&conversations)?;
        Ok(TrainingRecord {
            conversations,
            metadata: RecordMetadata {
                category: chunk.category.clone(),
                session_id: chunk.session_id.clone(),
                quality_score: verdict.score,
                chunk_index: chunk.index,
                downweighted: verdict.downweighted,
            },
        })
    }
}

fn speaker(role: Role) -> Speaker {
    match role {
        Role::User => Speaker::Human,
        Role::Assistant | Role::ActionResult => Speaker::Gpt,
    }
}

/// A system entry followed by turns merged into runs of one speaker.
pub fn conversation_entries(instruction: &str, turns: &[Turn]) -> Vec<ConversationEntry> {
    let mut entries = Vec::with_capacity(turns.len() + 1);
    if !instruction.trim().is_empty() {
        entries.push(ConversationEntry {
            from: Speaker::System,
            value: instruction.to_string(),
        });
    }
    for turn in turns {
        let from = speaker(turn.role);
        let text = turn.text();
        match entries.last_mut() {
            Some(last) if last.from == from => {
                last.value.push('\n');
                last.value.push_str(&text);
            }
            _ => entries.push(ConversationEntry { from, value: text }),
        }
    }
    entries
}

pub fn check_entries(entries: &[ConversationEntry]) -> Result<(), RejectReason> {
    let Some((first, rest)) = entries.split_first() else {
        return Err(RejectReason::MissingSystem);
    };
    if first.from != Speaker::System {
        return Err(RejectReason::MissingSystem);
    }
    if rest.is_empty() {
        return Err(RejectReason::NoExchange);
    }
    if rest.iter().any(|e| e.from == Speaker::System) {
        return Err(RejectReason::MisplacedSystem);
    }
    if entries.iter().any(|e| e.value.trim().is_empty()) {
        return Err(RejectReason::EmptyEntry);
    }
    if rest.windows(2).any(|pair| pair[0].from == pair[1].from) {
        return Err(RejectReason::RepeatedSpeaker);
    }
    if rest[0].from == Speaker::Gpt {
        return Err(RejectReason::StartsWithGpt);
    }
    if rest.last().map(|e| e.from) == Some(Speaker::Human) {
        return Err(RejectReason::EndsWithHuman);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use transcript_types::Segment;

    fn entry(from: Speaker, value: &str) -> ConversationEntry {
        ConversationEntry {
            from,
            value: value.to_string(),
        }
    }

    fn turn(role: Role, body: &str) -> Turn {
        Turn::new(role, vec![Segment::Text(body.to_string())], None)
    }

    #[test]
    fn model_side_turns_merge_into_one_gpt_entry() {
        let turns = vec![
            turn(Role::User, "run it"),
            turn(Role::Assistant, "<tool_call name=\"Bash\">\n{}\n</tool_call>"),
            turn(Role::ActionResult, "<tool_result status=\"ok\">\nok\n</tool_result>"),
        ];
        let entries = conversation_entries("sys", &turns);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].from, Speaker::Gpt);
        assert!(entries[2].value.contains("<tool_call"));
        assert!(entries[2].value.contains("<tool_result"));
    }

    #[test]
    fn builds_record_with_metadata() {
        let chunk = ScrubbedChunk {
            session_id: "s9".into(),
            category: "witness".into(),
            index: 3,
            turns: vec![turn(Role::User, "status?"), turn(Role::Assistant, "green")],
            estimated_tokens: 4,
            redactions: BTreeMap::new(),
        };
        let verdict = QualityVerdict {
            score: 0.35,
            drop: false,
            downweighted: true,
        };
        let record = SchemaValidator.build(&chunk, "You are the Witness.", &verdict).unwrap();
        assert_eq!(record.metadata.session_id, "s9");
        assert_eq!(record.metadata.chunk_index, 3);
        assert!(record.metadata.downweighted);
        record.validate_schema().unwrap();
    }

    #[test]
    fn rejection_reasons() {
        use Speaker::*;
        let cases = [
            (vec![], RejectReason::MissingSystem),
            (vec![entry(Human, "a"), entry(Gpt, "b")], RejectReason::MissingSystem),
            (vec![entry(System, "s")], RejectReason::NoExchange),
            (
                vec![entry(System, "s"), entry(Human, "a"), entry(System, "x"), entry(Gpt, "b")],
                RejectReason::MisplacedSystem,
            ),
            (vec![entry(System, "s"), entry(Human, " "), entry(Gpt, "b")], RejectReason::EmptyEntry),
            (
                vec![entry(System, "s"), entry(Human, "a"), entry(Human, "b"), entry(Gpt, "c")],
                RejectReason::RepeatedSpeaker,
            ),
            (vec![entry(System, "s"), entry(Gpt, "b")], RejectReason::StartsWithGpt),
            (
                vec![entry(System, "s"), entry(Human, "a"), entry(Gpt, "b"), entry(Human, "c")],
                RejectReason::EndsWithHuman,
            ),
        ];
        for (entries, expected) in cases {
            assert_eq!(check_entries(&entries), Err(expected));
        }
        assert_eq!(
            check_entries(&[entry(System, "s"), entry(Human, "a"), entry(Gpt, "b")]),
            Ok(())
        );
    }

    #[test]
    fn empty_instruction_means_missing_system() {
        let entries = conversation_entries("  ", &[turn(Role::User, "a"), turn(Role::Assistant, "b")]);
        assert_eq!(check_entries(&entries), Err(RejectReason::MissingSystem));
    }
}
