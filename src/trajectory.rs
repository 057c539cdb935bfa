//! Trajectories
//!
//! Ordered steps of one task attempt as recorded by the environment. Step 0
//! is the initial page state, not an executed action.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::skills::store::atomic_write;

/// Rendered page state, compared only for equality
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageState {
    /// Flattened accessibility tree
    #[serde(alias = "axtree_txt")]
    pub axtree: String,
    #[serde(default)]
    pub url: String,
}

/// One recorded agent step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Free text rationale
    #[serde(default)]
    pub thought: String,
    /// Action text as emitted, possibly several calls
    #[serde(default, alias = "last_action")]
    pub action: String,
    /// Page state after the action; missing when the step was not observed
    #[serde(default)]
    pub observation: Option<PageState>,
    /// Empty when the action succeeded
    #[serde(default, alias = "last_action_error")]
    pub error: String,
    #[serde(default)]
    pub is_terminal: bool,
}

impl Step {
    pub fn new(action: impl Into<String>, axtree: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            observation: Some(PageState {
                axtree: axtree.into(),
                url: String::new(),
            }),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }

    pub fn with_thought(mut self, thought: impl Into<String>) -> Self {
        self.thought = thought.into();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub steps: Vec<Step>,
}

impl Trajectory {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// State the step's action was taken in
    pub fn observation_before(&self, index: usize) -> Option<&PageState> {
        index
            .checked_sub(1)
            .and_then(|i| self.steps.get(i))
            .and_then(|s| s.observation.as_ref())
    }

    /// State the step's action produced
    pub fn observation_after(&self, index: usize) -> Option<&PageState> {
        self.steps.get(index).and_then(|s| s.observation.as_ref())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read trajectory: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse trajectory: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        atomic_write(path, &content)
            .with_context(|| format!("Failed to write trajectory: {}", path.display()))
    }
}
