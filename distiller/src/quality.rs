use crate::chunker::Chunk;
use crate::config::{QualityConfig, QualityWeights};
use crate::error::{compile, PipelineError};
use regex::Regex;
use transcript_types::{Role, Turn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityVerdict {
    /// Heuristic score in [0, 1], rounded to three decimals.
    pub score: f64,
    pub drop: bool,
    pub downweighted: bool,
}

/// Heuristic scorer with a hard (drop) and a soft (down-weight) threshold.
pub struct QualityFilter {
    min_turns: usize,
    drop_below: f64,
    downweight_below: f64,
    action_saturation: usize,
    weights: QualityWeights,
    boilerplate: Vec<Regex>,
    completion: Vec<Regex>,
}

impl QualityFilter {
    pub fn new(config: &QualityConfig) -> Result<Self, PipelineError> {
        let boilerplate = config
            .boilerplate_patterns
            .iter()
            .map(|p| compile("boilerplate", p))
            .collect::<Result<Vec<_>, _>>()?;
        let completion = config
            .completion_patterns
            .iter()
            .map(|p| compile("completion", p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            min_turns: config.min_turns,
            drop_below: config.drop_below,
            downweight_below: config.downweight_below,
            action_saturation: config.action_saturation.max(1),
            weights: config.weights.clone(),
            boilerplate,
            completion,
        })
    }

    pub fn assess(&self, chunk: &Chunk) -> QualityVerdict {
        let score = round3(self.score(chunk.turns));
        QualityVerdict {
            score,
            drop: score < self.drop_below,
            downweighted: score >= self.drop_below && score < self.downweight_below,
        }
    }

    fn score(&self, turns: &[Turn]) -> f64 {
        let w = &self.weights;
        let n = turns.len();

        let mut substantive = 0usize;
        let mut total = 0usize;
        for turn in turns {
            let len = turn.char_len();
            total += len;
            if turn.role != Role::ActionResult && !self.is_boilerplate(&turn.text()) {
                substantive += len;
            }
        }
        let ratio = if total == 0 {
            0.0
        } else {
            substantive as f64 / total as f64
        };

        let completed = turns
            .iter()
            .filter(|t| t.role == Role::Assistant)
            .flat_map(Turn::plain_text)
            .any(|text| self.completion.iter().any(|re| re.is_match(text)));

        let pairs = turns.iter().map(|t| t.call_ids().count()).sum::<usize>();
        let action_share = (pairs as f64 / self.action_saturation as f64).min(1.0);

        let opening_is_boilerplate = self.opening_lines(turns).any(|line| self.is_boilerplate(line));

        let shortfall = if self.min_turns == 0 {
            0.0
        } else {
            self.min_turns.saturating_sub(n) as f64 / self.min_turns as f64
        };

        let mut score = w.base + w.substance * ratio + w.actions * action_share - w.short * shortfall;
        if completed {
            score += w.completion;
        }
        if opening_is_boilerplate {
            score -= w.boilerplate;
        }
        score.clamp(0.0, 1.0)
    }

    /// First line of the opening user turn and of the first assistant reply.
    fn opening_lines<'t>(&self, turns: &'t [Turn]) -> impl Iterator<Item = &'t str> {
        let first_user = turns.iter().find(|t| t.role == Role::User);
        let first_reply = turns.iter().find(|t| t.role == Role::Assistant);
        [first_user, first_reply]
            .into_iter()
            .flatten()
            .filter_map(|t| t.plain_text().next())
            .filter_map(|text| text.lines().next())
    }

    fn is_boilerplate(&self, text: &str) -> bool {
        let first_line = text.lines().next().unwrap_or("").trim();
        self.boilerplate.iter().any(|re| re.is_match(first_line))
    }
}

pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use transcript_types::{ActionTag, Segment, TagKind};

    fn text(role: Role, body: &str) -> Turn {
        Turn::new(role, vec![Segment::Text(body.to_string())], None)
    }

    fn tag(role: Role, kind: TagKind, markup: &str) -> Turn {
        Turn::new(
            role,
            vec![Segment::Tag(ActionTag {
                invocation_id: "t1".into(),
                kind,
                markup: markup.into(),
            })],
            None,
        )
    }

    fn chunk(turns: &[Turn]) -> Chunk<'_> {
        Chunk {
            session_id: "s",
            category: "polecat",
            index: 0,
            turns,
            estimated_tokens: 0,
        }
    }

    fn filter() -> QualityFilter {
        QualityFilter::new(&QualityConfig::default()).unwrap()
    }

    #[test]
    fn completed_task_scores_well() {
        let turns = vec![
            text(Role::User, "The auth test is failing, please fix it."),
            tag(
                Role::Assistant,
                TagKind::Call,
                "<tool_call name=\"Bash\">\n{\"command\":\"cargo test auth\"}\n</tool_call>",
            ),
            tag(Role::ActionResult, TagKind::Result, "<tool_result status=\"ok\">\nok\n</tool_result>"),
            text(Role::Assistant, "Fixed the token check. All tests pass and the fix is committed."),
        ];
        let verdict = filter().assess(&chunk(&turns));
        assert!(verdict.score >= 0.7, "score {}", verdict.score);
        assert!(!verdict.drop);
        assert!(!verdict.downweighted);
    }

    #[test]
    fn boilerplate_opening_is_dropped() {
        let turns = vec![
            text(Role::User, "[GAS TOWN] mayor <- human"),
            text(Role::Assistant, "Mayor, checking in."),
        ];
        let verdict = filter().assess(&chunk(&turns));
        assert!(verdict.drop, "score {}", verdict.score);
        assert_eq!(verdict.score, 0.0);
    }

    #[test]
    fn middling_chunks_are_downweighted() {
        let turns = vec![
            text(Role::User, "what is in the readme"),
            text(Role::Assistant, "It documents the build steps."),
        ];
        // 0.3 base + 0.3 substance - 0.15 short = 0.45 with defaults; raise the soft bar.
        let mut config = QualityConfig::default();
        config.downweight_below = 0.5;
        let verdict = QualityFilter::new(&config).unwrap().assess(&chunk(&turns));
        assert_eq!(verdict.score, 0.45);
        assert!(!verdict.drop);
        assert!(verdict.downweighted);
    }

    #[test]
    fn weights_are_configurable() {
        let turns = vec![text(Role::User, "hi there"), text(Role::Assistant, "hello")];
        let mut config = QualityConfig::default();
        config.weights = QualityWeights {
            base: 1.0,
            substance: 0.0,
            completion: 0.0,
            actions: 0.0,
            boilerplate: 0.0,
            short: 0.0,
        };
        let verdict = QualityFilter::new(&config).unwrap().assess(&chunk(&turns));
        assert_eq!(verdict.score, 1.0);
    }
}
