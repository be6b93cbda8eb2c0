use crate::config::CategoryConfig;
use crate::error::{compile, PipelineError};
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use transcript_types::{Session, UNKNOWN_CATEGORY};

/// Assigns a category from the source path, then from an in-transcript marker.
pub struct CategoryTagger {
    paths: Vec<(Regex, String)>,
    marker: Regex,
    labels: HashSet<String>,
    instructions: BTreeMap<String, String>,
    default_instruction: String,
}

impl CategoryTagger {
    pub fn new(config: &CategoryConfig) -> Result<Self, PipelineError> {
        let paths = config
            .paths
            .iter()
            .map(|rule| Ok((compile("category path", &rule.pattern)?, rule.category.clone())))
            .collect::<Result<Vec<_>, PipelineError>>()?;
        Ok(Self {
            paths,
            marker: compile("category marker", &config.marker_pattern)?,
            labels: config.labels.iter().cloned().collect(),
            instructions: config.instructions.clone(),
            default_instruction: config.default_instruction.clone(),
        })
    }

    pub fn classify(&self, session: &Session) -> String {
        let path = session.source_path.to_string_lossy().replace('\\', "/");
        if let Some((_, category)) = self.paths.iter().find(|(re, _)| re.is_match(&path)) {
            return category.clone();
        }
        session
            .first_user_text()
            .and_then(|text| self.from_marker(&text))
            .unwrap_or_else(|| UNKNOWN_CATEGORY.to_string())
    }

    fn from_marker(&self, text: &str) -> Option<String> {
        let label = self.marker.captures(text)?.get(1)?.as_str().to_lowercase();
        self.labels.contains(&label).then_some(label)
    }

    pub fn tag(&self, session: &mut Session) {
        let category = self.classify(session);
        tracing::debug!(session = %session.id, category = %category, "tagged session");
        session.category = Some(category);
    }

    /// Fixed system instruction prefixed to every record of `category`.
    pub fn instruction(&self, category: &str) -> &str {
        self.instructions
            .get(category)
            .map(String::as_str)
            .unwrap_or(&self.default_instruction)
    }
}
