//! Terminal coding agent: plans a task with a remote model, then executes the
//! plan one gated tool call at a time.
//!
//! ## Provider bootstrap
//!
//! The provider is chosen by `provider` in the config file or
//! `CODING_AGENT_PROVIDER`:
//!
//! - `nim` (default) streams from an OpenAI-compatible endpoint; set
//!   `NVIDIA_API_KEY`, optionally `NVIDIA_BASE_URL` and `NVIDIA_MODEL`.
//! - `mock` is a scripted provider for offline runs and tests.
//!
//! ## Flow
//!
//! [`planner::plan_task`] turns a task into a validated [`agent_plan::Plan`].
//! [`executor::execute_plan`] walks it: every step passes the
//! [`safety::SafetyGate`] (writes show a diff first), runs through a
//! [`tools::ToolRunner`], and is appended to the session log before the next
//! step starts. [`agent::Agent`] ties the two together for `nv code` and
//! `nv run`, and drives `nv logs analyze` and `nv testgen`.

pub mod agent;
pub mod cancel;
pub mod chat;
pub mod commands;
pub mod config;
pub mod doctor;
pub mod executor;
pub mod logging;
pub mod logs;
pub mod models;
pub mod patch;
pub mod planner;
pub mod providers;
pub mod render;
pub mod safety;
pub mod summary;
pub mod testgen;
pub mod tools;

pub use agent::{Agent, AgentError, CodeTaskOptions, CommandOptions, CommandOutcome};
pub use config::{AgentConfig, ConfigError};
pub use executor::{execute_plan, ExecuteOptions, ExecutorContext, ExecutorError, ExecutorEvent};
pub use safety::{Allowlist, ConfirmationRequest, ConfirmationResponse, Confirmer, SafetyGate};
pub use summary::{RunSummary, StepReport};
pub use tools::{ToolCall, ToolRegistry, ToolRunner};
