//! Trajectory Replay Validator
//!
//! Per-step checks over a recorded trajectory:
//! 1. the step is valid (no error other than a timeout, non-empty action),
//! 2. it changes the page state or sends information to the user,
//! 3. it invokes one of a given set of induced actions.
//!
//! Step 0 is the initial state and is excluded from every vector.

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::results::ResultDir;
use crate::trajectory::{Step, Trajectory};

/// Actions that deliver information to the user
pub const INFO_ACTIONS: &[&str] = &["send_msg_to_user", "report_infeasible"];

const TIMEOUT_PREFIX: &str = "TimeoutError";

static CODE_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```(.*?)```").unwrap());

pub fn is_valid_step(step: &Step) -> bool {
    if step.observation.is_none() {
        return false;
    }
    if !step.error.is_empty() && !step.error.starts_with(TIMEOUT_PREFIX) {
        return false;
    }
    !step.action.is_empty()
}

/// Substring match on the action text
pub fn sends_info(step: &Step) -> bool {
    INFO_ACTIONS.iter().any(|a| step.action.contains(a))
}

pub fn is_state_change_step(step: &Step, previous: Option<&Step>) -> bool {
    let Some(ref current) = step.observation else {
        return false;
    };
    if sends_info(step) {
        return true;
    }
    match previous {
        None => false,
        Some(prev) => match prev.observation {
            Some(ref before) => before.axtree != current.axtree,
            None => true,
        },
    }
}

/// Substring match of any induced action name
pub fn has_induced_actions<S: AsRef<str>>(step: &Step, names: &[S]) -> bool {
    step.observation.is_some() && names.iter().any(|n| step.action.contains(n.as_ref()))
}

/// Outcome for one replayed trajectory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplayVerdict {
    /// An induced action was invoked
    pub name_used: bool,
    /// Every step invoking an induced action was valid
    pub valid: bool,
    /// Some step invoked an induced action, was valid and changed state
    pub overall_pass: bool,
}

/// The three per-step vectors, step 0 dropped
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepChecks {
    pub valid: Vec<bool>,
    pub state_change: Vec<bool>,
    pub induced: Vec<bool>,
}

impl StepChecks {
    pub fn evaluate<S: AsRef<str>>(trajectory: &Trajectory, names: &[S]) -> Self {
        let mut checks = Self::default();
        let mut previous: Option<&Step> = None;
        for (i, step) in trajectory.steps.iter().enumerate() {
            if i > 0 {
                checks.valid.push(is_valid_step(step));
                checks.state_change.push(is_state_change_step(step, previous));
                checks.induced.push(has_induced_actions(step, names));
            }
            previous = Some(step);
        }
        debug!(
            steps = trajectory.len(),
            valid = checks.valid_count(),
            state_change = checks.state_change_count(),
            induced = checks.induced_count(),
            "Evaluated step checks"
        );
        checks
    }

    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }

    pub fn state_change_count(&self) -> usize {
        self.state_change.iter().filter(|v| **v).count()
    }

    pub fn induced_count(&self) -> usize {
        self.induced.iter().filter(|v| **v).count()
    }

    pub fn verdict(&self) -> ReplayVerdict {
        let rows = || {
            self.valid
                .iter()
                .zip(&self.state_change)
                .zip(&self.induced)
                .map(|((v, s), i)| (*v, *s, *i))
        };
        let name_used = rows().any(|(_, _, i)| i);
        ReplayVerdict {
            name_used,
            valid: name_used && rows().filter(|(_, _, i)| *i).all(|(v, _, _)| v),
            overall_pass: rows().any(|(v, s, i)| i && v && s),
        }
    }
}

/// Simplifies the free-text part of a step
#[async_trait]
pub trait ThoughtSummarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<String>;
}

/// Keeps thoughts unchanged
pub struct KeepThought;

#[async_trait]
impl ThoughtSummarizer for KeepThought {
    async fn summarize(&self, text: &str) -> Result<String> {
        Ok(text.to_string())
    }
}

/// Text of a step as "thought + fenced code"
fn step_text(step: &Step) -> String {
    if step.action.contains("```") {
        return step.action.clone();
    }
    if step.thought.trim().is_empty() {
        format!("```{}```", step.action)
    } else {
        format!("{}\n```{}```", step.thought.trim(), step.action)
    }
}

/// Rewrite one step as a short summary followed by its code
pub async fn simplify_step(step: &Step, summarizer: &dyn ThoughtSummarizer) -> Result<String> {
    let text = step_text(step);
    let code: Vec<&str> = CODE_BLOCK
        .captures_iter(&text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    let prose: Vec<&str> = CODE_BLOCK
        .split(&text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    let mut simplified = if prose.is_empty() {
        String::new()
    } else {
        format!("{}\n", summarizer.summarize(&prose.join("\n")).await?.trim())
    };
    match code.as_slice() {
        [] => simplified.push_str(&format!("```{}```", step.action)),
        [single] => simplified.push_str(&format!("```{}```", single)),
        many => simplified.push_str(&format!("```\n{}\n```", many.join("\n"))),
    }
    Ok(simplified)
}

/// Valid steps (step 0 excluded), each simplified
pub async fn clean_steps(
    trajectory: &Trajectory,
    summarizer: &dyn ThoughtSummarizer,
) -> Result<Vec<String>> {
    let checks = StepChecks::evaluate::<&str>(trajectory, &[]);
    let mut cleaned = Vec::new();
    for (step, valid) in trajectory.steps.iter().skip(1).zip(&checks.valid) {
        if *valid {
            cleaned.push(simplify_step(step, summarizer).await?);
        }
    }
    Ok(cleaned)
}

/// Clean a run's trajectory and write `cleaned_steps.json`
pub async fn clean_and_store(dir: &ResultDir, summarizer: &dyn ThoughtSummarizer) -> Result<Vec<String>> {
    let trajectory = dir.trajectory()?;
    let cleaned = clean_steps(&trajectory, summarizer).await?;
    dir.write_cleaned_steps(&cleaned)?;
    info!(dir = %dir.path().display(), kept = cleaned.len(), total = trajectory.len(), "Stored cleaned steps");
    Ok(cleaned)
}

/// Checks and verdict of a recorded run
pub fn check_run<S: AsRef<str>>(dir: &ResultDir, names: &[S]) -> Result<(StepChecks, ReplayVerdict)> {
    let trajectory = dir.trajectory()?;
    let checks = StepChecks::evaluate(&trajectory, names);
    let verdict = checks.verdict();
    Ok((checks, verdict))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["search_product".to_string()]
    }

    fn five_steps(error_at_2: &str) -> Trajectory {
        Trajectory::new(vec![
            Step::new("", "home"),
            Step::new("click('12')", "search page"),
            Step::new("search_product('567', 'case')", "results").with_error(error_at_2),
            Step::new("scroll(0, 200)", "results"),
            Step::new("send_msg_to_user('done')", "results"),
        ])
    }

    #[test]
    fn test_verdict_passes_on_state_change() {
        let checks = StepChecks::evaluate(&five_steps(""), &names());
        assert_eq!(checks.induced, vec![false, true, false, false]);
        assert_eq!(checks.state_change, vec![true, true, false, true]);
        let verdict = checks.verdict();
        assert!(verdict.name_used);
        assert!(verdict.valid);
        assert!(verdict.overall_pass);
    }

    #[test]
    fn test_verdict_fails_on_error() {
        let checks = StepChecks::evaluate(&five_steps("ValueError: no element"), &names());
        let verdict = checks.verdict();
        assert!(verdict.name_used);
        assert!(!verdict.valid);
        assert!(!verdict.overall_pass);
    }

    #[test]
    fn test_timeout_counts_as_valid() {
        let checks = StepChecks::evaluate(&five_steps("TimeoutError: 500ms exceeded"), &names());
        assert!(checks.verdict().overall_pass);
    }

    #[test]
    fn test_single_step_has_no_counts() {
        let trajectory = Trajectory::new(vec![Step::new("send_msg_to_user('x')", "home")]);
        let checks = StepChecks::evaluate(&trajectory, &names());
        assert_eq!(checks.valid_count(), 0);
        assert_eq!(checks.state_change_count(), 0);
        assert_eq!(checks.induced_count(), 0);
        assert!(!checks.verdict().overall_pass);
    }

    #[test]
    fn test_missing_observation() {
        let mut step = Step::new("click('1')", "x");
        step.observation = None;
        assert!(!is_valid_step(&step));
        assert!(!is_state_change_step(&step, None));
        assert!(!has_induced_actions(&step, &["click"]));
    }

    #[tokio::test]
    async fn test_clean_steps() {
        let trajectory = Trajectory::new(vec![
            Step::new("", "home"),
            Step::new("click('12')", "a").with_thought("Open the search bar."),
            Step::new("fill('12', 'x')", "b").with_error("ValueError: bad"),
            Step::new("```fill('12', 'x')``` then ```keyboard_press('Enter')```", "c"),
        ]);
        let cleaned = clean_steps(&trajectory, &KeepThought).await.unwrap();
        assert_eq!(
            cleaned,
            vec![
                "Open the search bar.\n```click('12')```".to_string(),
                "then\n```\nfill('12', 'x')\nkeyboard_press('Enter')\n```".to_string(),
            ]
        );
    }
}
