//! Result Directories
//!
//! Layout of one task run under the results directory:
//!
//! ```text
//! results/webarena.<task_id>[_<suffix>]/
//!   trajectory.json        recorded steps
//!   summary_info.json      {"cum_reward": .., "n_steps": ..}
//!   *_autoeval.json        [{"rm": true|false, ..}]
//!   cleaned_steps.json     ["thought\n```action```", ..]
//!   instruction.txt        sub-task instruction override (optional)
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::skills::store::atomic_write;
use crate::trajectory::Trajectory;

pub const TASK_PREFIX: &str = "webarena.";
pub const TEST_SUFFIX: &str = "_test";

const TRAJECTORY_FILE: &str = "trajectory.json";
const SUMMARY_FILE: &str = "summary_info.json";
const AUTOEVAL_SUFFIX: &str = "_autoeval.json";
const CLEANED_FILE: &str = "cleaned_steps.json";
const INSTRUCTION_FILE: &str = "instruction.txt";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryInfo {
    #[serde(default)]
    pub cum_reward: f64,
    #[serde(default)]
    pub n_steps: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoevalVerdict {
    pub rm: bool,
}

/// How a finished run is judged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Judge {
    /// Benchmark reward equals 1.0
    Gold,
    /// LLM judge verdict
    Autoeval,
}

/// Benchmark task configuration (`<config_dir>/<task_id>.json`)
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    #[serde(deserialize_with = "id_string")]
    pub task_id: String,
    pub intent: String,
    pub intent_template: String,
    #[serde(default)]
    pub intent_template_id: Option<i64>,
}

fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}

impl TaskConfig {
    pub fn load(config_dir: &Path, task_id: &str) -> Result<Self> {
        let path = config_dir.join(format!("{}.json", task_id));
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read task config: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse task config: {}", path.display()))
    }
}

/// One run's directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultDir {
    path: PathBuf,
}

impl ResultDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `results/webarena.<id>`
    pub fn for_task(results_dir: &Path, task_id: &str) -> Self {
        Self::new(results_dir.join(format!("{}{}", TASK_PREFIX, task_id)))
    }

    /// `results/webarena.<id>_test`, written by replays
    pub fn for_replay(results_dir: &Path, task_id: &str) -> Self {
        Self::new(results_dir.join(format!("{}{}{}", TASK_PREFIX, task_id, TEST_SUFFIX)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Task id encoded in the directory name
    ///
    /// `webarena.110_2_0` → `110`
    pub fn task_id(&self) -> Option<String> {
        let name = self.name();
        let rest = name.split_once('.')?.1;
        let id = rest.split('_').next().unwrap_or(rest);
        if id.is_empty() {
            None
        } else {
            Some(id.to_string())
        }
    }

    pub fn trajectory(&self) -> Result<Trajectory> {
        Trajectory::load(&self.path.join(TRAJECTORY_FILE))
    }

    pub fn summary(&self) -> Result<SummaryInfo> {
        let path = self.path.join(SUMMARY_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read summary: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse summary: {}", path.display()))
    }

    /// First autoeval file in the directory, if any
    pub fn autoeval_path(&self) -> Option<PathBuf> {
        let mut candidates: Vec<PathBuf> = fs::read_dir(&self.path)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map_or(false, |n| n.to_string_lossy().ends_with(AUTOEVAL_SUFFIX))
            })
            .collect();
        candidates.sort();
        candidates.into_iter().next()
    }

    pub fn autoeval(&self) -> Result<Option<bool>> {
        let Some(path) = self.autoeval_path() else {
            return Ok(None);
        };
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read autoeval: {}", path.display()))?;
        let verdicts: Vec<AutoevalVerdict> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse autoeval: {}", path.display()))?;
        Ok(verdicts.first().map(|v| v.rm))
    }

    /// Whether the run solved its task; missing files count as failure
    pub fn is_success(&self, judge: Judge) -> bool {
        let verdict = match judge {
            Judge::Gold => self.summary().map(|s| s.cum_reward == 1.0).unwrap_or(false),
            Judge::Autoeval => self.autoeval().ok().flatten().unwrap_or(false),
        };
        debug!(dir = %self.path.display(), ?judge, verdict, "Judged run");
        verdict
    }

    /// Whether a run may feed induction
    ///
    /// A negative autoeval verdict excludes the run; otherwise the gold
    /// reward must be 1.0.
    pub fn is_usable_example(&self) -> bool {
        if let Ok(Some(false)) = self.autoeval() {
            return false;
        }
        self.is_success(Judge::Gold)
    }

    pub fn cleaned_steps(&self) -> Result<Vec<String>> {
        let path = self.path.join(CLEANED_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read cleaned steps: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse cleaned steps: {}", path.display()))
    }

    pub fn has_cleaned_steps(&self) -> bool {
        self.path.join(CLEANED_FILE).exists()
    }

    pub fn write_cleaned_steps(&self, steps: &[String]) -> Result<()> {
        let path = self.path.join(CLEANED_FILE);
        atomic_write(&path, &serde_json::to_string(steps)?)
            .with_context(|| format!("Failed to write cleaned steps: {}", path.display()))
    }

    /// Sub-task instruction replacing the config intent
    pub fn instruction_override(&self) -> Option<String> {
        fs::read_to_string(self.path.join(INSTRUCTION_FILE)).ok()
    }

    pub fn remove(&self) -> Result<()> {
        if self.exists() {
            fs::remove_dir_all(&self.path)
                .with_context(|| format!("Failed to remove {}", self.path.display()))?;
        }
        Ok(())
    }
}

/// Usable runs of every task sharing an intent template
pub fn template_result_dirs(
    results_dir: &Path,
    config_dir: &Path,
    template_id: i64,
) -> Result<Vec<ResultDir>> {
    let mut configs: Vec<(u64, String)> = Vec::new();
    for entry in fs::read_dir(config_dir)
        .with_context(|| format!("Failed to list {}", config_dir.display()))?
    {
        let path = entry?.path();
        let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
            continue;
        };
        let Ok(order) = stem.parse::<u64>() else {
            continue;
        };
        let config = TaskConfig::load(config_dir, &stem)?;
        if config.intent_template_id == Some(template_id) {
            configs.push((order, stem));
        }
    }
    configs.sort();

    Ok(configs
        .into_iter()
        .map(|(_, id)| ResultDir::for_task(results_dir, &id))
        .filter(ResultDir::is_usable_example)
        .collect())
}
