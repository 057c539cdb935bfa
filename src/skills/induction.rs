//! Skill Induction Engine
//!
//! One induction attempt over a domain's action store:
//!
//! ```text
//! COLLECT ─► PROPOSE ─► FILTER ─► STAGE ─► TEST ─┬─► COMMIT
//!    │                    │                      └─► REVERT
//!    └─ no examples       └─ nothing new: next response
//! ```
//!
//! Responses are evaluated in order; the first one whose whole batch of
//! replays passes is committed and ends the attempt. A failing batch is
//! reverted and its replay artifacts are discarded.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::parser::{extract_code_pieces, parse_module, ActionNames};
use super::primitives;
use super::registry::ActionRegistry;
use super::replay::{ReplayVerdict, StepChecks};
use super::store::ActionStore;
use crate::results::{ResultDir, TaskConfig};
use crate::trajectory::Trajectory;

const CODE_START: &str = "```python";
const CODE_END: &str = "```";
const TESTS_MARKER: &str = "rewritten trajectories";

/// One successful run rendered for the induction query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskExample {
    pub task_id: String,
    pub instruction: String,
    /// Intent template, or the instruction itself for sub-tasks
    pub task: String,
    pub steps: Vec<String>,
}

impl TaskExample {
    /// Load from a result directory's cleaned steps; `None` without steps
    pub fn from_result_dir(dir: &ResultDir, config_dir: &Path) -> Result<Option<Self>> {
        let task_id = dir
            .task_id()
            .with_context(|| format!("No task id in {}", dir.path().display()))?;
        let config = TaskConfig::load(config_dir, &task_id)?;
        let (instruction, task) = match dir.instruction_override() {
            Some(sub) => (sub.clone(), sub),
            None => (config.intent, config.intent_template),
        };

        let steps = dir.cleaned_steps()?;
        if steps.is_empty() {
            debug!(dir = %dir.path().display(), "No valid steps, skipping example");
            return Ok(None);
        }
        info!(dir = %dir.path().display(), steps = steps.len(), "Collected example");
        Ok(Some(Self {
            task_id: config.task_id,
            instruction,
            task,
            steps,
        }))
    }

    fn render(&self, index: usize) -> String {
        format!(
            "### Example {} ({}): {}\n{}",
            index,
            self.task_id,
            self.instruction,
            self.steps.join("\n")
        )
    }
}

/// Usable examples of the given result directories, in order
pub fn collect_examples(dirs: &[ResultDir], config_dir: &Path) -> Result<Vec<TaskExample>> {
    let mut examples = Vec::new();
    for dir in dirs {
        if let Some(example) = TaskExample::from_result_dir(dir, config_dir)? {
            examples.push(example);
        }
    }
    Ok(examples)
}

/// `## Task: ..` header followed by the numbered examples
pub fn build_query(examples: &[TaskExample]) -> Option<String> {
    let task = &examples.last()?.task;
    let rendered: Vec<String> = examples
        .iter()
        .enumerate()
        .map(|(i, e)| e.render(i + 1))
        .collect();
    Some(format!("## Task: {}\n{}", task, rendered.join("\n\n")))
}

/// Produces candidate responses for an induction query
#[async_trait]
pub trait SkillProposer: Send + Sync {
    async fn propose(&self, query: &str, existing_source: &str) -> Result<Vec<String>>;
}

/// Replay script for one test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayScript {
    pub index: usize,
    pub task_id: String,
    /// Action lines, one per replayed step
    pub steps: Vec<String>,
}

impl ReplayScript {
    /// Action file contents, one fenced step per line
    pub fn to_action_file(&self) -> String {
        self.steps
            .iter()
            .map(|s| format!("```{}```", s.trim()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Recorded outcome of a replay run
#[derive(Debug, Clone, Default)]
pub struct ReplayRun {
    pub trajectory: Trajectory,
    /// Whether the task itself was judged solved
    pub task_success: bool,
}

/// Drives the live environment for replays
#[async_trait]
pub trait ReplayRunner: Send + Sync {
    async fn run(&self, script: &ReplayScript) -> Result<ReplayRun>;

    /// Remove artifacts of a replay of `task_id`
    async fn discard(&self, task_id: &str) -> Result<()>;
}

/// Functions accepted from one response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Proposal {
    /// Source text of each accepted function
    pub sources: Vec<String>,
    pub names: Vec<String>,
}

impl Proposal {
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Names visible to a proposed block
struct ProposalScope<'a> {
    registry: &'a ActionRegistry,
}

impl ActionNames for ProposalScope<'_> {
    fn is_action(&self, name: &str) -> bool {
        self.registry.contains(name) || primitives::lookup(name).is_some()
    }
}

/// Keep composed function definitions whose names are new
///
/// A block passes when it contains `def` and more calls than
/// `threshold` per definition. Functions reusing an existing name are
/// dropped individually.
pub fn filter_proposals(response: &str, registry: &ActionRegistry, threshold: usize) -> Proposal {
    let scope = ProposalScope { registry };
    let mut proposal = Proposal::default();
    let mut taken: HashSet<String> = registry.names().into_iter().map(String::from).collect();

    for block in extract_code_pieces(response, CODE_START, CODE_END) {
        if !block.contains("def ") {
            continue;
        }
        let module = match parse_module(&block, &scope) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "Discarding unparsable proposal");
                continue;
            }
        };
        let defs = block.matches("def ").count();
        if module.call_count() <= threshold * defs {
            debug!(calls = module.call_count(), defs, "Discarding non-composed proposal");
            continue;
        }
        for function in module.functions {
            if !taken.insert(function.name.clone()) {
                debug!(name = %function.name, "Dropping proposal with existing name");
                continue;
            }
            proposal.names.push(function.name);
            proposal.sources.push(function.source);
        }
    }
    proposal
}

/// Keep lines up to and including the first call of a new action
fn clean_test(test: &str, names: &[String]) -> Vec<String> {
    let lines: Vec<&str> = test.split('\n').collect();
    let end = lines
        .iter()
        .position(|l| names.iter().any(|n| l.contains(n.as_str())))
        .map_or(lines.len(), |i| i + 1);
    lines[..end]
        .iter()
        .filter(|l| !l.starts_with("# ") && !l.trim().is_empty())
        .map(|l| l.trim().to_string())
        .collect()
}

/// Replay scripts from the code blocks after the tests marker
///
/// Test `i` replays `task_ids[i % n]`. Tests left empty after cleaning
/// are dropped.
pub fn parse_tests(response: &str, names: &[String], task_ids: &[String]) -> Vec<ReplayScript> {
    if task_ids.is_empty() {
        return Vec::new();
    }
    let section = match response.to_ascii_lowercase().find(TESTS_MARKER) {
        Some(i) => response[i..].trim_start(),
        None => response,
    };

    extract_code_pieces(section, CODE_START, CODE_END)
        .into_iter()
        .filter(|t| !t.contains("def "))
        .map(|t| clean_test(&t, names))
        .filter(|steps| !steps.is_empty())
        .enumerate()
        .map(|(index, steps)| ReplayScript {
            index,
            task_id: task_ids[index % task_ids.len()].clone(),
            steps,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct InductionConfig {
    /// Base subsets the domain is built on top of
    pub base_subsets: Vec<String>,
    /// Wall-clock bound of each replay
    pub replay_timeout: Duration,
    /// Minimum calls per definition
    pub call_threshold: usize,
}

impl Default for InductionConfig {
    fn default() -> Self {
        Self {
            base_subsets: vec!["webarena".to_string()],
            replay_timeout: Duration::from_secs(100),
            call_threshold: 1,
        }
    }
}

/// Result of one induction attempt
#[derive(Debug, Clone, PartialEq)]
pub enum InductionOutcome {
    /// No usable examples
    NothingToLearn,
    /// No response produced a new composed action
    NoProposals,
    Committed {
        response_index: usize,
        names: Vec<String>,
        version: String,
    },
    /// Every proposal batch failed its replays
    Reverted,
}

impl InductionOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// Why one replay failed
#[derive(Debug, Clone, PartialEq)]
enum ReplayFailure {
    Timeout,
    Runner(String),
    TaskFailed,
    Checks(ReplayVerdict),
}

pub struct SkillInducer<'a> {
    store: &'a ActionStore,
    proposer: &'a dyn SkillProposer,
    runner: &'a dyn ReplayRunner,
    config: InductionConfig,
}

impl<'a> SkillInducer<'a> {
    pub fn new(store: &'a ActionStore, proposer: &'a dyn SkillProposer, runner: &'a dyn ReplayRunner) -> Self {
        Self {
            store,
            proposer,
            runner,
            config: InductionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: InductionConfig) -> Self {
        self.config = config;
        self
    }

    /// Registry of the base subsets plus the domain built from `source`
    fn registry_with(&self, source: &str) -> Result<ActionRegistry, super::types::ActionError> {
        ActionRegistry::builder()
            .subsets(self.config.base_subsets.iter().cloned())
            .subset(self.store.domain())
            .domain_source(self.store.domain(), source)
            .build()
    }

    /// COLLECT and PROPOSE, then evaluate every response
    pub async fn induce(&self, examples: &[TaskExample], task_ids: &[String]) -> Result<InductionOutcome> {
        let Some(query) = build_query(examples) else {
            info!(domain = %self.store.domain(), "No usable examples, nothing to learn");
            return Ok(InductionOutcome::NothingToLearn);
        };
        info!(domain = %self.store.domain(), examples = examples.len(), "Proposing actions");
        let existing = self.store.read()?;
        let responses = self.proposer.propose(&query, &existing).await?;
        self.evaluate_responses(&responses, task_ids).await
    }

    /// FILTER through COMMIT/REVERT for each response in order
    pub async fn evaluate_responses(&self, responses: &[String], task_ids: &[String]) -> Result<InductionOutcome> {
        let mut any_proposal = false;
        for (index, response) in responses.iter().enumerate() {
            info!(response = index, "Evaluating response");
            let existing = self.store.read()?;
            let registry = self.registry_with(&existing)?;
            let proposal = filter_proposals(response, &registry, self.config.call_threshold);
            if proposal.is_empty() {
                info!(response = index, "No new actions in response");
                continue;
            }
            any_proposal = true;
            info!(response = index, names = ?proposal.names, "Filtered proposals");

            if let Some(version) = self.stage_and_test(response, &proposal, task_ids).await? {
                return Ok(InductionOutcome::Committed {
                    response_index: index,
                    names: proposal.names,
                    version,
                });
            }
        }
        Ok(if any_proposal {
            InductionOutcome::Reverted
        } else {
            InductionOutcome::NoProposals
        })
    }

    /// Returns the committed version, or `None` after a revert
    async fn stage_and_test(&self, response: &str, proposal: &Proposal, task_ids: &[String]) -> Result<Option<String>> {
        let mut tx = self.store.begin()?;
        let staged = tx.stage(&proposal.sources)?.to_string();
        info!(domain = %self.store.domain(), additions = proposal.names.len(), "STAGE");

        if let Err(e) = self.registry_with(&staged) {
            warn!(error = %e, "Staged store does not build, reverting");
            tx.abort()?;
            return Ok(None);
        }

        let scripts = parse_tests(response, &proposal.names, task_ids);
        if scripts.is_empty() {
            warn!("No replay tests in response, reverting");
            tx.abort()?;
            return Ok(None);
        }

        info!(tests = scripts.len(), "TEST");
        let mut passed = true;
        for script in &scripts {
            match self.replay(script, &proposal.names).await {
                Ok(()) => info!(test = script.index, task = %script.task_id, "Replay passed"),
                Err(failure) => {
                    warn!(test = script.index, task = %script.task_id, ?failure, "Replay failed");
                    passed = false;
                    break;
                }
            }
        }

        if passed {
            let record = tx.commit()?;
            info!(version = %record.version, names = ?proposal.names, "COMMIT");
            return Ok(Some(record.version));
        }

        tx.abort()?;
        info!(names = ?proposal.names, "REVERT");
        let mut discarded = HashSet::new();
        for script in &scripts {
            if discarded.insert(script.task_id.as_str()) {
                if let Err(e) = self.runner.discard(&script.task_id).await {
                    warn!(task = %script.task_id, error = %e, "Failed to discard replay artifacts");
                }
            }
        }
        Ok(None)
    }

    async fn replay(&self, script: &ReplayScript, names: &[String]) -> Result<(), ReplayFailure> {
        let run = match tokio::time::timeout(self.config.replay_timeout, self.runner.run(script)).await {
            Err(_) => return Err(ReplayFailure::Timeout),
            Ok(Err(e)) => return Err(ReplayFailure::Runner(e.to_string())),
            Ok(Ok(run)) => run,
        };
        if !run.task_success {
            return Err(ReplayFailure::TaskFailed);
        }
        let verdict = StepChecks::evaluate(&run.trajectory, names).verdict();
        if verdict.valid && verdict.overall_pass {
            Ok(())
        } else {
            Err(ReplayFailure::Checks(verdict))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH: &str = r#"Some thoughts.

```python
def search_product(search_id: str, query: str):
    """Search for a product.

    Examples:
        search_product('595', 'xbox')
    """
    fill(search_id, query)
    keyboard_press('Enter')
```

```python
def open_reviews(tab_id: str):
    """Open reviews.

    Examples:
        open_reviews('1')
    """
    click(tab_id)
```

## Rewritten Trajectories

```python
# search first
click('12')
search_product('595', 'xbox')
scroll(0, 200)
```

```python
search_product('595', 'ps5')
```
"#;

    fn registry() -> ActionRegistry {
        ActionRegistry::builder().subset("webarena").build().unwrap()
    }

    #[test]
    fn test_filter_keeps_composed_new_names() {
        let proposal = filter_proposals(SEARCH, &registry(), 1);
        assert_eq!(proposal.names, vec!["search_product".to_string()]);
        assert!(proposal.sources[0].starts_with("def search_product("));
        assert!(proposal.sources[0].ends_with("keyboard_press('Enter')"));
    }

    #[test]
    fn test_filter_drops_existing_names_only() {
        let response = "```python\ndef click(bid: str):\n    \"\"\"C.\n\n    Examples:\n        click('1')\n    \"\"\"\n    hover(bid)\n    focus(bid)\n\ndef tap(bid: str):\n    \"\"\"T.\n\n    Examples:\n        tap('1')\n    \"\"\"\n    hover(bid)\n    focus(bid)\n```";
        let proposal = filter_proposals(response, &registry(), 1);
        assert_eq!(proposal.names, vec!["tap".to_string()]);
    }

    #[test]
    fn test_parse_tests() {
        let names = vec!["search_product".to_string()];
        let ids = vec!["21".to_string()];
        let tests = parse_tests(SEARCH, &names, &ids);
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].steps, vec!["click('12')", "search_product('595', 'xbox')"]);
        assert_eq!(tests[1].task_id, "21");
        assert_eq!(tests[0].to_action_file(), "```click('12')```\n```search_product('595', 'xbox')```");
    }

    #[test]
    fn test_tests_cycle_task_ids() {
        let names = vec!["search_product".to_string()];
        let ids = vec!["21".to_string(), "22".to_string(), "23".to_string()];
        let tests = parse_tests(SEARCH, &names, &ids);
        assert_eq!(tests[0].task_id, "21");
        assert_eq!(tests[1].task_id, "22");
        assert!(parse_tests(SEARCH, &names, &[]).is_empty());
    }

    #[test]
    fn test_build_query() {
        let examples = vec![
            TaskExample {
                task_id: "21".into(),
                instruction: "List reviews of A".into(),
                task: "List reviews of {{product}}".into(),
                steps: vec!["```click('1')```".into()],
            },
            TaskExample {
                task_id: "22".into(),
                instruction: "List reviews of B".into(),
                task: "List reviews of {{product}}".into(),
                steps: vec!["a\n```click('2')```".into(), "```scroll(0, 1)```".into()],
            },
        ];
        assert_eq!(
            build_query(&examples).unwrap(),
            "## Task: List reviews of {{product}}\n### Example 1 (21): List reviews of A\n```click('1')```\n\n### Example 2 (22): List reviews of B\na\n```click('2')```\n```scroll(0, 1)```"
        );
        assert!(build_query(&[]).is_none());
    }
}
