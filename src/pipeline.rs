//! Experiment Pipeline
//!
//! Sequential loops over benchmark tasks. Each task is solved by a child
//! process, judged, cleaned and, depending on the experiment, mined for
//! new actions and/or workflows:
//!
//! | experiment     | solve | judge | clean | actions | workflows            |
//! |----------------|-------|-------|-------|---------|----------------------|
//! | `vanilla`      | yes   |       |       |         |                      |
//! | `awm`          | yes   | yes   | yes   |         | from the run         |
//! | `asi`          | yes   | yes   | yes   | yes     |                      |
//! | `mem_asi`      | yes   | yes   | yes   | yes     | from the replay      |
//! | `veri_program` | yes   | yes   | yes   | yes     | committed source     |
//!
//! Failures of one task are logged and the loop moves on.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::ValueEnum;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::llm::{
    InductionKind, InductionPrompts, LlmClient, LlmSkillProposer, LlmThoughtSummarizer,
    LlmWorkflowComparator, ResponseCache,
};
use crate::process::{run_template, CommandTemplate, ProcessOutput};
use crate::results::{Judge, ResultDir, TASK_PREFIX};
use crate::skills::induction::{
    build_query, collect_examples, InductionConfig, InductionOutcome, ReplayRun, ReplayRunner,
    ReplayScript, SkillInducer,
};
use crate::skills::replay::{clean_and_store, ThoughtSummarizer};
use crate::skills::store::ActionStore;
use crate::workflows::WorkflowMemory;

/// Runs shorter than this are not mined
pub const MIN_STEPS: usize = 3;

/// Expand `"12-14,20"` into `["12", "13", "14", "20"]`
///
/// Chunks are closed intervals, a single number is a one-element
/// interval. Malformed chunks are an error.
pub fn parse_task_ids(spec: &str) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    for chunk in spec.split(',').map(str::trim) {
        if chunk.is_empty() {
            bail!("Empty chunk in task id range '{}'", spec);
        }
        let (start, end) = match chunk.split_once('-') {
            Some((s, e)) => (s.trim(), e.trim()),
            None => (chunk, chunk),
        };
        let start: u64 = start
            .parse()
            .with_context(|| format!("Invalid task id '{}' in '{}'", start, spec))?;
        let end: u64 = end
            .parse()
            .with_context(|| format!("Invalid task id '{}' in '{}'", end, spec))?;
        if start > end {
            bail!("Descending task id range '{}'", chunk);
        }
        ids.extend((start..=end).map(|i| i.to_string()));
    }
    Ok(ids)
}

/// Seeded in-place shuffle
pub fn shuffle_task_ids(ids: &mut [String], seed: u64) {
    ids.shuffle(&mut StdRng::seed_from_u64(seed));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum Experiment {
    Vanilla,
    Awm,
    Asi,
    MemAsi,
    VeriProgram,
}

/// Placeholder values for command templates
fn command_vars(config: &Config, website: &str, task_id: &str) -> BTreeMap<&'static str, String> {
    let result_dir = ResultDir::for_task(&config.results_dir, task_id);
    BTreeMap::from([
        ("task_id", task_id.to_string()),
        ("website", website.to_string()),
        ("action_path", path_str(config.actions_dir.join(format!("{}.py", website)))),
        ("memory_path", path_str(config.workflows_dir.join(format!("{}.txt", website)))),
        ("rename_to", format!("{}{}", TASK_PREFIX, task_id)),
        ("result_dir", path_str(result_dir.path().to_path_buf())),
    ])
}

fn path_str(path: PathBuf) -> String {
    path.to_string_lossy().to_string()
}

/// Judge a finished run, invoking the autoevaluator when configured
async fn judge_run(config: &Config, dir: &ResultDir) -> Result<bool> {
    if config.eval_with_gold {
        return Ok(dir.is_success(Judge::Gold));
    }
    if let Some(ref cmd) = config.autoeval_cmd {
        let vars = BTreeMap::from([("result_dir", path_str(dir.path().to_path_buf()))]);
        let output = run_template(&CommandTemplate::new(cmd.as_str()), &vars, Duration::from_secs(config.induce_timeout_secs)).await?;
        if !output.success() {
            warn!(dir = %dir.path().display(), stderr = %output.stderr, "Autoevaluator failed");
        }
    }
    Ok(dir.is_success(Judge::Autoeval))
}

/// Replays through the configured environment driver command
pub struct CommandReplayRunner {
    config: Config,
    website: String,
}

impl CommandReplayRunner {
    pub fn new(config: Config, website: impl Into<String>) -> Self {
        Self {
            config,
            website: website.into(),
        }
    }

    fn base_id(task_id: &str) -> &str {
        task_id.split('_').next().unwrap_or(task_id)
    }
}

#[async_trait]
impl ReplayRunner for CommandReplayRunner {
    async fn run(&self, script: &ReplayScript) -> Result<ReplayRun> {
        let task_id = Self::base_id(&script.task_id);
        let test_path = self.config.tests_dir.join(format!("test_{}.txt", script.index));
        fs::create_dir_all(&self.config.tests_dir)
            .with_context(|| format!("Failed to create {}", self.config.tests_dir.display()))?;
        fs::write(&test_path, script.to_action_file())
            .with_context(|| format!("Failed to write {}", test_path.display()))?;

        let dir = ResultDir::for_replay(&self.config.results_dir, task_id);
        dir.remove()?;
        let mut vars = command_vars(&self.config, &self.website, task_id);
        vars.insert("action_path", path_str(test_path));
        vars.insert("rename_to", dir.name());
        vars.insert("result_dir", path_str(dir.path().to_path_buf()));

        let output = run_template(
            &CommandTemplate::new(self.config.replay_cmd.as_str()),
            &vars,
            Duration::from_secs(self.config.replay_timeout_secs),
        )
        .await?;
        if output.timed_out {
            bail!("Replay of task {} timed out", task_id);
        }

        let trajectory = dir.trajectory()?;
        let task_success = judge_run(&self.config, &dir).await?;
        Ok(ReplayRun {
            trajectory,
            task_success,
        })
    }

    async fn discard(&self, task_id: &str) -> Result<()> {
        ResultDir::for_replay(&self.config.results_dir, Self::base_id(task_id)).remove()
    }
}

/// Experiment driver for one website
pub struct Pipeline {
    config: Config,
    website: String,
    llm: LlmClient,
}

impl Pipeline {
    pub fn new(config: Config, website: impl Into<String>) -> Self {
        let llm = LlmClient::from_config(&config);
        Self {
            config,
            website: website.into(),
            llm,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Result<ActionStore> {
        Ok(ActionStore::open(&self.config.actions_dir, &self.website)?)
    }

    pub fn memory(&self) -> WorkflowMemory {
        WorkflowMemory::for_website(&self.config.workflows_dir, &self.website)
    }

    pub fn summarizer(&self) -> impl ThoughtSummarizer {
        LlmThoughtSummarizer::new(self.llm.clone())
    }

    /// Run an experiment over the given task ids
    pub async fn run(&self, experiment: Experiment, task_ids: &[String]) -> Result<()> {
        info!(?experiment, website = %self.website, tasks = task_ids.len(), "Starting experiment");
        let store = self.store()?;
        for (i, task_id) in task_ids.iter().enumerate() {
            info!(task = %task_id, progress = i + 1, total = task_ids.len(), "Task");
            if let Err(e) = self.run_task(experiment, task_id).await {
                error!(task = %task_id, error = %format!("{:#}", e), "Task failed");
            }
            let done = i + 1;
            if self.config.backup_interval > 0 && done % self.config.backup_interval == 0 {
                if let Err(e) = store.backup(&format!("step_{}", done)) {
                    warn!(error = %e, "Periodic backup failed");
                }
            }
        }
        info!(?experiment, "Experiment finished");
        Ok(())
    }

    async fn run_task(&self, experiment: Experiment, task_id: &str) -> Result<()> {
        let solved = self.solve(task_id).await?;
        if experiment == Experiment::Vanilla {
            return Ok(());
        }
        if solved.timed_out {
            info!(task = %task_id, "Solver timed out, skipping task");
            return Ok(());
        }

        let dir = ResultDir::for_task(&self.config.results_dir, task_id);
        if experiment != Experiment::Awm {
            let steps = dir.summary()?.n_steps;
            if steps < MIN_STEPS {
                info!(task = %task_id, steps, "Trajectory too short, skipping task");
                return Ok(());
            }
        }
        if !judge_run(&self.config, &dir).await? {
            info!(task = %task_id, "Run judged incorrect, skipping task");
            return Ok(());
        }
        clean_and_store(&dir, &self.summarizer()).await?;

        if experiment == Experiment::Awm {
            self.induce_workflows(&[dir]).await?;
            return Ok(());
        }

        let store = self.store()?;
        let before = store.read()?;
        let ids = vec![task_id.to_string()];
        let induced = tokio::time::timeout(
            Duration::from_secs(self.config.induce_timeout_secs),
            self.induce_actions(&[dir], &ids),
        )
        .await;
        match induced {
            Err(_) => {
                warn!(task = %task_id, "Action induction timed out");
                return Ok(());
            }
            Ok(outcome) => {
                let outcome = outcome?;
                info!(task = %task_id, ?outcome, "Action induction finished");
            }
        }
        let after = store.read()?;
        if after == before {
            return Ok(());
        }

        match experiment {
            Experiment::VeriProgram => {
                let added = after.strip_prefix(before.as_str()).unwrap_or(&after).trim();
                self.memory().append(added)?;
                info!(task = %task_id, "Appended committed actions to workflow memory");
            }
            Experiment::MemAsi => {
                let replay = ResultDir::for_replay(&self.config.results_dir, task_id);
                if !replay.has_cleaned_steps() {
                    clean_and_store(&replay, &self.summarizer()).await?;
                }
                self.induce_workflows(&[replay]).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn solve(&self, task_id: &str) -> Result<ProcessOutput> {
        let vars = command_vars(&self.config, &self.website, task_id);
        run_template(
            &CommandTemplate::new(self.config.solve_cmd.as_str()),
            &vars,
            Duration::from_secs(self.config.solve_timeout_secs),
        )
        .await
    }

    /// Induce actions from result directories and replay on `task_ids`
    pub async fn induce_actions(&self, dirs: &[ResultDir], task_ids: &[String]) -> Result<InductionOutcome> {
        let store = self.store()?;
        let examples = collect_examples(dirs, &self.config.config_dir)?;
        let prompts = InductionPrompts::load(&self.config.prompt_dir, &self.website, InductionKind::Actions);
        let proposer = LlmSkillProposer::new(
            self.llm.clone(),
            prompts,
            self.config.temperature,
            self.config.num_responses,
        )
        .with_cache(ResponseCache::for_tasks(&self.config.outputs_dir, &self.website, "action", task_ids));
        let runner = CommandReplayRunner::new(self.config.clone(), self.website.clone());

        let inducer = SkillInducer::new(&store, &proposer, &runner).with_config(InductionConfig {
            replay_timeout: Duration::from_secs(self.config.replay_timeout_secs),
            ..Default::default()
        });
        inducer.induce(&examples, task_ids).await
    }

    /// Induce workflows from result directories into the memory file
    pub async fn induce_workflows(&self, dirs: &[ResultDir]) -> Result<usize> {
        let examples = collect_examples(dirs, &self.config.config_dir)?;
        let Some(query) = build_query(&examples) else {
            info!("No usable examples for workflow induction");
            return Ok(0);
        };
        let ids: Vec<String> = dirs
            .iter()
            .map(|d| d.name().trim_start_matches(TASK_PREFIX).to_string())
            .collect();
        let cache = ResponseCache::for_tasks(&self.config.outputs_dir, &self.website, "workflow", &ids);
        let memory = self.memory();

        let responses = match cache.load()? {
            Some(cached) => cached,
            None => {
                let prompts = InductionPrompts::load(&self.config.prompt_dir, &self.website, InductionKind::Workflows);
                let messages = prompts.messages(&query, &memory.read()?);
                let responses = self.llm.complete(&messages, self.config.temperature, 1).await?;
                cache.store(&query, &responses)?;
                responses
            }
        };
        let Some(response) = responses.first() else {
            warn!("No workflow response");
            return Ok(0);
        };
        let comparator = LlmWorkflowComparator::new(self.llm.clone(), self.config.temperature);
        memory.merge_response(response, &comparator).await
    }

    /// Result directories of the given ids that exist
    pub fn result_dirs(&self, ids: &[String]) -> Vec<ResultDir> {
        ids.iter()
            .map(|id| ResultDir::for_task(&self.config.results_dir, id))
            .filter(|d| {
                let exists = d.exists();
                if !exists {
                    warn!(dir = %d.path().display(), "Missing result directory");
                }
                exists
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::TEST_SUFFIX;
    use tempfile::TempDir;

    #[test]
    fn test_parse_task_ids() {
        assert_eq!(parse_task_ids("12-14,20").unwrap(), vec!["12", "13", "14", "20"]);
        assert_eq!(parse_task_ids("12-18,30-30").unwrap().len(), 8);
        assert_eq!(parse_task_ids(" 5 ").unwrap(), vec!["5"]);
    }

    #[test]
    fn test_parse_task_ids_fails_fast() {
        assert!(parse_task_ids("a-3").is_err());
        assert!(parse_task_ids("1-b").is_err());
        assert!(parse_task_ids("14-12").is_err());
        assert!(parse_task_ids("1,,2").is_err());
        assert!(parse_task_ids("").is_err());
    }

    #[test]
    fn test_shuffle_is_seeded() {
        let mut a = parse_task_ids("1-20").unwrap();
        let mut b = a.clone();
        shuffle_task_ids(&mut a, 7);
        shuffle_task_ids(&mut b, 7);
        assert_eq!(a, b);
        a.sort_by_key(|s| s.parse::<u64>().unwrap());
        assert_eq!(a, parse_task_ids("1-20").unwrap());
    }

    #[test]
    fn test_command_vars() {
        let config = Config {
            actions_dir: PathBuf::from("acts"),
            ..Default::default()
        };
        let vars = command_vars(&config, "shopping", "21");
        let argv = CommandTemplate::new(config.solve_cmd.as_str()).render(&vars).unwrap();
        assert!(argv.contains(&"webarena.21".to_string()));
        assert!(argv.contains(&path_str(PathBuf::from("acts").join("shopping.py"))));
    }

    #[tokio::test]
    async fn test_discard_removes_replay_dir() {
        let root = TempDir::new().unwrap();
        let config = Config {
            results_dir: root.path().to_path_buf(),
            ..Default::default()
        };
        let replay = ResultDir::for_replay(root.path(), "21");
        fs::create_dir_all(replay.path()).unwrap();
        assert!(replay.name().ends_with(TEST_SUFFIX));

        let runner = CommandReplayRunner::new(config, "shopping");
        runner.discard("21_2").await.unwrap();
        assert!(!replay.exists());
    }
}
