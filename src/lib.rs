//! ASI Agent
//!
//! Skill induction and action-space compilation for web-browsing LLM
//! agents.
//!
//! # Features
//!
//! - **Constrained action language**: parsed into an explicit AST, never evaluated as host code
//! - **Action registry**: primitive groups plus per-domain induced actions
//! - **Action-set compiler**: prompt description and executable program of an action
//! - **Skill induction**: propose, stage, replay and commit or revert new actions
//! - **Workflow memory**: natural-language task guidance merged by a pluggable judge
//!
//! # Architecture
//!
//! ```text
//! pipeline ──► solver (child process) ──► results/webarena.<id>/
//!    │                                          │
//!    │                                   replay checks + cleaning
//!    │                                          │
//!    ├── SkillInducer ──► LLM ──► staged store ─┴─► replays ──► commit / revert
//!    └── WorkflowMemory ──► LLM ──► merge
//! ```

pub mod config;
pub mod llm;
pub mod pipeline;
pub mod process;
pub mod results;
pub mod skills;
pub mod trajectory;
pub mod workflows;

pub use config::Config;
pub use llm::LlmClient;
pub use pipeline::{parse_task_ids, Experiment, Pipeline};
pub use results::{Judge, ResultDir};
pub use skills::{ActionRegistry, ActionStore, CustomActionSet, SkillInducer};
pub use trajectory::{Step, Trajectory};
pub use workflows::{WorkflowComparator, WorkflowMemory};
