//! Skill System
//!
//! Parses, registers, compiles and induces the actions exposed to a web
//! agent.
//!
//! # Architecture
//!
//! ```text
//! primitives ─┐
//!             ├─► ActionRegistry ─► CustomActionSet ─► describe() / compile()
//! store (.py) ┘         ▲                                   │
//!                       │                                   ▼
//!                 SkillInducer ◄── replay checks ◄── Interpreter (parsed AST)
//! ```
//!
//! # Action Language
//!
//! Actions and generated code use a small Python-compatible subset: calls
//! with literal arguments, `for` loops over literal lists or `range`, and
//! `def` blocks whose docstring carries an `Examples:` section. See
//! [`parser`] for the full grammar.

pub mod compiler;
pub mod induction;
pub mod interpreter;
pub mod parser;
pub mod primitives;
pub mod registry;
pub mod replay;
pub mod store;
pub mod types;

pub use compiler::{CompiledAction, CustomActionSet, DemoMode};
pub use induction::{
    InductionConfig, InductionOutcome, ReplayRun, ReplayRunner, ReplayScript, SkillInducer,
    SkillProposer, TaskExample,
};
pub use interpreter::{ActionHost, Interpreter, PrimitiveCall};
pub use parser::{parse_module, parse_script, validate, ActionNames, ParseError};
pub use registry::{ActionRegistry, RegistryBuilder};
pub use replay::{KeepThought, ReplayVerdict, StepChecks, ThoughtSummarizer};
pub use store::{ActionStore, StoreError, StoreTransaction};
pub use types::{ActionDefinition, ActionError, ActionOrigin, Param, Value};
