use crate::chunker::Chunk;
use crate::config::SecretPattern;
use crate::error::{compile, PipelineError};
use regex::Regex;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use transcript_types::{Segment, Turn};

/// Redaction passes per text. Each pass that changes anything removes at
/// least one secret, so real inputs settle in two or three.
const MAX_PASSES: usize = 8;

struct Matcher {
    class: String,
    token: String,
    regex: Regex,
    group: usize,
}

/// A chunk after redaction. Owns its turns; the source session is untouched.
#[derive(Debug, Clone)]
pub struct ScrubbedChunk {
    pub session_id: String,
    pub category: String,
    pub index: usize,
    pub turns: Vec<Turn>,
    pub estimated_tokens: usize,
    /// Replacements made, by credential class.
    pub redactions: BTreeMap<String, usize>,
}

/// One candidate replacement found by a matcher.
struct Span<'m> {
    start: usize,
    end: usize,
    whole_match: bool,
    matcher: &'m Matcher,
}

pub struct SecretScrubber {
    matchers: Vec<Matcher>,
}

impl SecretScrubber {
    pub fn new(patterns: &[SecretPattern]) -> Result<Self, PipelineError> {
        let matchers = patterns
            .iter()
            .map(|p| {
                let regex = compile("secret", &p.pattern)?;
                if p.group >= regex.captures_len() {
                    return Err(PipelineError::Config(format!(
                        "secret pattern {} has no capture group {}",
                        p.class, p.group
                    )));
                }
                Ok(Matcher {
                    class: p.class.clone(),
                    token: redaction_token(&p.class),
                    regex,
                    group: p.group,
                })
            })
            .collect::<Result<Vec<_>, PipelineError>>()?;
        Ok(Self { matchers })
    }

    pub fn scrub_chunk(&self, chunk: &Chunk) -> ScrubbedChunk {
        let mut redactions = BTreeMap::new();
        let turns = chunk
            .turns
            .iter()
            .map(|turn| {
                let segments = turn
                    .segments
                    .iter()
                    .map(|segment| self.scrub_segment(segment, &mut redactions))
                    .collect();
                Turn::new(turn.role, segments, turn.timestamp)
            })
            .collect();
        ScrubbedChunk {
            session_id: chunk.session_id.to_string(),
            category: chunk.category.to_string(),
            index: chunk.index,
            turns,
            estimated_tokens: chunk.estimated_tokens,
            redactions,
        }
    }

    fn scrub_segment(&self, segment: &Segment, counts: &mut BTreeMap<String, usize>) -> Segment {
        let mut segment = segment.clone();
        match &mut segment {
            Segment::Text(text) => *text = self.scrub_counted(text, counts),
            Segment::Tag(tag) => tag.markup = self.scrub_counted(&tag.markup, counts),
            Segment::Output(out) => out.content = self.scrub_counted(&out.content, counts),
            Segment::Invocation(inv) => {
                for value in inv.arguments.values_mut() {
                    self.scrub_value(value, counts);
                }
            }
        }
        segment
    }

    fn scrub_value(&self, value: &mut Value, counts: &mut BTreeMap<String, usize>) {
        match value {
            Value::String(s) => *s = self.scrub_counted(s, counts),
            Value::Array(items) => items.iter_mut().for_each(|v| self.scrub_value(v, counts)),
            Value::Object(map) => map.values_mut().for_each(|v| self.scrub_value(v, counts)),
            _ => {}
        }
    }

    fn scrub_counted(&self, text: &str, counts: &mut BTreeMap<String, usize>) -> String {
        let (out, classes) = self.scrub(text);
        for class in classes {
            *counts.entry(class.to_string()).or_default() += 1;
        }
        out
    }

    /// Replace every secret in `text`, repeating until nothing more matches.
    ///
    /// A redaction can expose a neighbour that a word boundary hid before
    /// (`AKIA...token=...`), so one pass is not enough. Returns the classes
    /// redacted across all passes.
    pub fn scrub<'a>(&'a self, text: &str) -> (String, Vec<&'a str>) {
        let mut out = text.to_string();
        let mut classes = Vec::new();
        for _ in 0..MAX_PASSES {
            let (next, found) = self.scrub_pass(&out);
            if found.is_empty() {
                break;
            }
            out = next;
            classes.extend(found);
        }
        (out, classes)
    }

    /// One pass over `text`. Overlaps resolve by earliest start, then longest
    /// span, then whole-match patterns over captured groups, then the smallest
    /// token, so the output does not depend on matcher order.
    fn scrub_pass<'a>(&'a self, text: &str) -> (String, Vec<&'a str>) {
        let mut spans: Vec<Span> = Vec::new();
        for matcher in &self.matchers {
            for caps in matcher.regex.captures_iter(text) {
                let Some(m) = caps.get(matcher.group) else {
                    continue;
                };
                if m.start() < m.end() {
                    spans.push(Span {
                        start: m.start(),
                        end: m.end(),
                        whole_match: matcher.group == 0,
                        matcher,
                    });
                }
            }
        }
        if spans.is_empty() {
            return (text.to_string(), Vec::new());
        }
        spans.sort_by(|a, b| {
            (a.start, Reverse(a.end - a.start), !a.whole_match, &a.matcher.token).cmp(&(
                b.start,
                Reverse(b.end - b.start),
                !b.whole_match,
                &b.matcher.token,
            ))
        });

        let mut out = String::with_capacity(text.len());
        let mut classes = Vec::new();
        let mut cursor = 0;
        for span in spans {
            if span.start < cursor {
                continue;
            }
            out.push_str(&text[cursor..span.start]);
            out.push_str(&span.matcher.token);
            classes.push(span.matcher.class.as_str());
            cursor = span.end;
        }
        out.push_str(&text[cursor..]);
        (out, classes)
    }
}

pub fn redaction_token(class: &str) -> String {
    format!("[REDACTED:{class}]")
}
