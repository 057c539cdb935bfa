//! Configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_LLM_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory of per-domain action stores (`<domain>.py`)
    pub actions_dir: PathBuf,

    /// Directory of run results (`webarena.<id>/`)
    pub results_dir: PathBuf,

    /// Benchmark task configs (`<id>.json`)
    pub config_dir: PathBuf,

    /// Workflow memory files (`<website>.txt`)
    pub workflows_dir: PathBuf,

    /// Where replay action files are written
    pub tests_dir: PathBuf,

    /// Prompt templates for induction
    pub prompt_dir: PathBuf,

    /// Cached model responses
    pub outputs_dir: PathBuf,

    /// OpenAI-compatible API base
    pub llm_base_url: String,

    /// API key (optional - induction needs it)
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    pub model: String,

    pub temperature: f32,

    /// Candidate responses per induction query
    pub num_responses: usize,

    pub solve_timeout_secs: u64,

    pub induce_timeout_secs: u64,

    pub replay_timeout_secs: u64,

    /// Task solver command template
    pub solve_cmd: String,

    /// Replay driver command template
    pub replay_cmd: String,

    /// Trajectory judge command template (optional)
    pub autoeval_cmd: Option<String>,

    /// Judge replays by benchmark reward instead of the autoevaluator
    pub eval_with_gold: bool,

    /// Back up the action store every N tasks (0 disables)
    pub backup_interval: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            actions_dir: PathBuf::from("actions"),
            results_dir: PathBuf::from("results"),
            config_dir: PathBuf::from("config_files"),
            workflows_dir: PathBuf::from("workflows"),
            tests_dir: PathBuf::from("debug_actions"),
            prompt_dir: PathBuf::from("induce/prompt"),
            outputs_dir: PathBuf::from("outputs"),
            llm_base_url: DEFAULT_LLM_BASE_URL.to_string(),
            api_key: None,
            model: "anthropic/claude-3.5-sonnet".to_string(),
            temperature: 1.0,
            num_responses: 1,
            solve_timeout_secs: 300,
            induce_timeout_secs: 200,
            replay_timeout_secs: 100,
            solve_cmd: "python run_demo.py --task_name webarena.{task_id} --websites {website} --action_path {action_path} --headless".to_string(),
            replay_cmd: "python run_demo.py --websites {website} --headless --task_name webarena.{task_id} --action_path {action_path} --rename_to {rename_to}".to_string(),
            autoeval_cmd: Some("python -m autoeval.evaluate_trajectory --result_dir {result_dir}".to_string()),
            eval_with_gold: false,
            backup_interval: 10,
        }
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self::default().with_env())
    }

    /// Load a TOML file, then apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        Ok(config.with_env())
    }

    fn with_env(self) -> Self {
        let api_key = std::env::var("OPENROUTER_API_KEY").ok().or(self.api_key);

        let eval_with_gold = std::env::var("ASI_EVAL_WITH_GOLD")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(self.eval_with_gold);

        let autoeval_cmd = match std::env::var("ASI_AUTOEVAL_CMD") {
            Ok(v) if v.trim().is_empty() => None,
            Ok(v) => Some(v),
            Err(_) => self.autoeval_cmd,
        };

        Self {
            actions_dir: env_path("ASI_ACTIONS_DIR", self.actions_dir),
            results_dir: env_path("ASI_RESULTS_DIR", self.results_dir),
            config_dir: env_path("ASI_CONFIG_DIR", self.config_dir),
            workflows_dir: env_path("ASI_WORKFLOWS_DIR", self.workflows_dir),
            tests_dir: env_path("ASI_TESTS_DIR", self.tests_dir),
            prompt_dir: env_path("ASI_PROMPT_DIR", self.prompt_dir),
            outputs_dir: env_path("ASI_OUTPUTS_DIR", self.outputs_dir),
            llm_base_url: std::env::var("LLM_BASE_URL").unwrap_or(self.llm_base_url),
            api_key,
            model: std::env::var("ASI_MODEL").unwrap_or(self.model),
            temperature: env_parse("ASI_TEMPERATURE", self.temperature),
            num_responses: env_parse("ASI_NUM_RESPONSES", self.num_responses),
            solve_timeout_secs: env_parse("ASI_SOLVE_TIMEOUT", self.solve_timeout_secs),
            induce_timeout_secs: env_parse("ASI_INDUCE_TIMEOUT", self.induce_timeout_secs),
            replay_timeout_secs: env_parse("ASI_REPLAY_TIMEOUT", self.replay_timeout_secs),
            solve_cmd: std::env::var("ASI_SOLVE_CMD").unwrap_or(self.solve_cmd),
            replay_cmd: std::env::var("ASI_REPLAY_CMD").unwrap_or(self.replay_cmd),
            autoeval_cmd,
            eval_with_gold,
            backup_interval: env_parse("ASI_BACKUP_INTERVAL", self.backup_interval),
        }
    }
}
