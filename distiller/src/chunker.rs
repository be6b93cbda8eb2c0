//! Sliding-window chunking that never separates an invocation from its result.
//!
//! Index `i` is a *cut point* when no invocation/result pair straddles it. A
//! chunk starts at a cut point holding a `user` turn and ends at a cut point
//! preceded by a model-side turn, so the serialized record always opens with
//! `human` and closes with `gpt`.

use crate::config::ChunkerConfig;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use transcript_types::{Role, Session, Turn};

/// Guards the step computation against `0.5 * 4.0 = 1.9999..` style float error.
const STEP_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct Chunk<'s> {
    pub session_id: &'s str,
    pub category: &'s str,
    /// Ordinal of this chunk within its session.
    pub index: usize,
    pub turns: &'s [Turn],
    pub estimated_tokens: usize,
}

/// Why a window produced no chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkSkip {
    NoExchange,
    Unsplittable,
    RepeatWindow,
}

#[derive(Debug, Default)]
pub struct ChunkPlan<'s> {
    pub chunks: Vec<Chunk<'s>>,
    pub skipped: Vec<ChunkSkip>,
}

pub struct Chunker {
    window_pairs: usize,
    step_pairs: usize,
    max_tokens: usize,
    chars_per_token: usize,
}

impl Chunker {
    pub fn new(config: &ChunkerConfig) -> Self {
        let step = (config.window_pairs as f64 * (1.0 - config.overlap) + STEP_EPSILON).floor();
        Self {
            window_pairs: config.window_pairs,
            step_pairs: (step as usize).max(1),
            max_tokens: config.max_tokens,
            chars_per_token: config.chars_per_token.max(1),
        }
    }

    pub fn step_pairs(&self) -> usize {
        self.step_pairs
    }

    pub fn chunk<'s>(&self, session: &'s Session, instruction: &str) -> ChunkPlan<'s> {
        let turns = session.turns.as_slice();
        let n = turns.len();
        let layout = Layout::new(turns);
        let sizing = Sizing::new(turns, instruction, self.chars_per_token);

        let window = 2 * self.window_pairs;
        let step = 2 * self.step_pairs;
        let mut plan = ChunkPlan::default();
        let mut emitted = HashSet::new();
        let mut raw_start = 0;

        while raw_start < n {
            let raw_end = (raw_start + window).min(n);
            let reached = match self.fit(&layout, &sizing, raw_start, raw_end) {
                Ok((start, end)) => {
                    if emitted.insert((start, end)) {
                        plan.chunks.push(Chunk {
                            session_id: &session.id,
                            category: session.category(),
                            index: plan.chunks.len(),
                            turns: &turns[start..end],
                            estimated_tokens: sizing.estimate(start, end),
                        });
                    } else {
                        plan.skipped.push(ChunkSkip::RepeatWindow);
                    }
                    end
                }
                Err(skip) => {
                    tracing::debug!(session = %session.id, raw_start, raw_end, reason = ?skip, "window skipped");
                    plan.skipped.push(skip);
                    raw_end
                }
            };
            if raw_end >= n || reached >= n {
                break;
            }
            raw_start += step;
        }
        plan
    }

    /// Resolve a raw window to a valid, in-budget `[start, end)` range.
    fn fit(
        &self,
        layout: &Layout,
        sizing: &Sizing,
        raw_start: usize,
        raw_end: usize,
    ) -> Result<(usize, usize), ChunkSkip> {
        if !layout.roles[raw_start..raw_end].contains(&Role::User) {
            return Err(ChunkSkip::NoExchange);
        }
        let start = layout
            .next_start(raw_start, raw_end)
            .ok_or(ChunkSkip::Unsplittable)?;

        // Extending forward closes a pair the window edge cut through.
        let forward = (raw_end..=layout.len()).find(|&j| layout.valid_end(j));
        let backward = (start + 1..raw_end).rev().filter(|&j| layout.valid_end(j));

        for end in forward.into_iter().chain(backward) {
            if end <= start {
                continue;
            }
            if let Some(start) = self.trim_start(layout, sizing, start, end) {
                return Ok((start, end));
            }
        }
        Err(ChunkSkip::Unsplittable)
    }

    /// Drop whole turns from the front until the range is pairable and fits.
    fn trim_start(&self, layout: &Layout, sizing: &Sizing, mut start: usize, end: usize) -> Option<usize> {
        if let Some(last) = (start..end).rev().find(|&i| layout.unpaired[i]) {
            start = layout.next_start(last + 1, end)?;
        }
        while sizing.estimate(start, end) > self.max_tokens {
            start = layout.next_start(start + 1, end)?;
        }
        Some(start)
    }
}

/// Pairing structure of a session's turns.
struct Layout {
    roles: Vec<Role>,
    /// `cut[i]`: no pair straddles index `i`. Length `n + 1`.
    cut: Vec<bool>,
    /// Turn holds half of a pair whose other half is missing from the session.
    unpaired: Vec<bool>,
}

impl Layout {
    fn new(turns: &[Turn]) -> Self {
        let n = turns.len();
        let mut result_at: HashMap<&str, usize> = HashMap::new();
        for (idx, turn) in turns.iter().enumerate() {
            if let Some(id) = turn.answered_id() {
                result_at.entry(id).or_insert(idx);
            }
        }

        let mut cut = vec![true; n + 1];
        let mut unpaired = vec![false; n];
        let mut called = HashSet::new();
        for (idx, turn) in turns.iter().enumerate() {
            for id in turn.call_ids() {
                called.insert(id);
                match result_at.get(id) {
                    Some(&res) if res > idx => cut[idx + 1..=res].iter_mut().for_each(|c| *c = false),
                    _ => unpaired[idx] = true,
                }
            }
            if let Some(id) = turn.answered_id() {
                if !called.contains(id) {
                    unpaired[idx] = true;
                }
            }
        }

        Self {
            roles: turns.iter().map(|t| t.role).collect(),
            cut,
            unpaired,
        }
    }

    fn len(&self) -> usize {
        self.roles.len()
    }

    fn valid_start(&self, i: usize) -> bool {
        i < self.len() && self.cut[i] && self.roles[i] == Role::User
    }

    fn valid_end(&self, j: usize) -> bool {
        j > 0 && j <= self.len() && self.cut[j] && self.roles[j - 1].is_model_side()
    }

    fn next_start(&self, from: usize, before: usize) -> Option<usize> {
        (from..before).find(|&i| self.valid_start(i))
    }
}

/// Prefix sums over rendered turn lengths for O(1) range estimates.
struct Sizing {
    prefix: Vec<usize>,
    instruction_chars: usize,
    chars_per_token: usize,
}

impl Sizing {
    fn new(turns: &[Turn], instruction: &str, chars_per_token: usize) -> Self {
        let mut prefix = Vec::with_capacity(turns.len() + 1);
        prefix.push(0);
        for turn in turns {
            let last = prefix.last().copied().unwrap_or(0);
            prefix.push(last + turn.char_len());
        }
        Self {
            prefix,
            instruction_chars: instruction.chars().count(),
            chars_per_token,
        }
    }

    /// Instruction, turn text and one separator per turn, in tokens, rounded up.
    fn estimate(&self, start: usize, end: usize) -> usize {
        let chars = self.instruction_chars + (self.prefix[end] - self.prefix[start]) + (end - start);
        chars.div_ceil(self.chars_per_token)
    }
}

/// Token estimate used across the pipeline: characters divided by `chars_per_token`, rounded up.
pub fn estimate_tokens(chars: usize, chars_per_token: usize) -> usize {
    chars.div_ceil(chars_per_token.max(1))
}
