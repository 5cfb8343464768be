//! Gated multi-agent build pipeline controller.
//!
//! A session pulls the most urgent open item from the backlog and drives it
//! through `Selected → PreVerify → Implement → Review → PostVerify → WrapUp →
//! Committed`, invoking a [`capability::TaskExecutor`] at each step and gating
//! every transition on [`gate::GateEvaluator`]. State is persisted at every
//! transition so a crashed session resumes where it stopped.
//!
//! - [`orchestrator`]: the [`orchestrator::WorkflowEngine`] session loop.
//! - [`state_machine`]: steps, transitions, backlog and run state.
//! - [`store`] / [`evidence`]: durable documents and evidence artifacts.
//! - [`executors`]: shell-command, git and webhook executors for real projects.

pub mod capability;
pub mod cli;
pub mod completion;
pub mod config;
pub mod error;
pub mod evidence;
pub mod executors;
pub mod gate;
pub mod git;
pub mod learnings;
pub mod logging;
pub mod orchestrator;
pub mod state_machine;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod ui;
