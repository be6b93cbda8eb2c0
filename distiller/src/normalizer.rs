use crate::config::NormalizerConfig;
use crate::error::{compile, PipelineError};
use regex::Regex;
use serde_json::Value;
use transcript_types::{ActionOutput, ActionTag, Invocation, Segment, Session, TagKind};

pub const TRUNCATION_MARKER: &str = "\n... [truncated] ...\n";

/// Share of the character budget kept from the start of an oversized text.
const HEAD_SHARE: f64 = 0.6;

/// Rewrites raw invocations and outputs into canonical inline tags.
pub struct ActionNormalizer {
    max_result_chars: usize,
    max_argument_chars: usize,
    noise: Vec<Regex>,
}

impl ActionNormalizer {
    pub fn new(config: &NormalizerConfig) -> Result<Self, PipelineError> {
        let noise = config
            .noise_patterns
            .iter()
            .map(|p| compile("noise", p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            max_result_chars: config.max_result_chars,
            max_argument_chars: config.max_argument_chars,
            noise,
        })
    }

    pub fn normalize(&self, session: &mut Session) {
        for turn in &mut session.turns {
            for segment in &mut turn.segments {
                let tag = match segment {
                    Segment::Invocation(inv) => self.call_tag(inv),
                    Segment::Output(out) => self.result_tag(out),
                    Segment::Text(_) | Segment::Tag(_) => continue,
                };
                *segment = Segment::Tag(tag);
            }
        }
    }

    fn call_tag(&self, inv: &Invocation) -> ActionTag {
        let args = Value::Object(inv.arguments.clone()).to_string();
        let args = truncate_middle(&args, self.max_argument_chars);
        ActionTag {
            invocation_id: inv.id.clone(),
            kind: TagKind::Call,
            markup: format!(
                "<tool_call name=\"{}\">\n{args}\n</tool_call>",
                escape_attr(&inv.name)
            ),
        }
    }

    fn result_tag(&self, out: &ActionOutput) -> ActionTag {
        let body = truncate_middle(&self.clean(&out.content), self.max_result_chars);
        let status = if out.is_error { "error" } else { "ok" };
        let name = out
            .name
            .as_deref()
            .map(|n| format!(" name=\"{}\"", escape_attr(n)))
            .unwrap_or_default();
        ActionTag {
            invocation_id: out.invocation_id.clone(),
            kind: TagKind::Result,
            markup: format!("<tool_result{name} status=\"{status}\">\n{body}\n</tool_result>"),
        }
    }

    fn clean(&self, content: &str) -> String {
        content
            .lines()
            .filter(|line| !self.noise.iter().any(|re| re.is_match(line)))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}

/// Cut `text` to at most `max_chars` characters, keeping the head and the tail
/// around [`TRUNCATION_MARKER`].
pub fn truncate_middle(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    if max_chars <= marker_len {
        return text.chars().take(max_chars).collect();
    }
    let head_len = ((max_chars as f64 * HEAD_SHARE) as usize).min(max_chars - marker_len);
    let tail_len = max_chars - head_len - marker_len;

    let head: String = text.chars().take(head_len).collect();
    let tail: String = text.chars().skip(total - tail_len).collect();
    format!("{head}{TRUNCATION_MARKER}{tail}")
}

fn escape_attr(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}
