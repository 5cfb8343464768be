use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::step::Step;
use crate::gate::{Finding, GateResult};

/// Configuration for retry behavior shared by every bounded loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries of a loop before giving up.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff. Zero disables waiting.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 0,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given retry attempt using exponential backoff.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Per-session record of where the engine is. Persisted at every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default)]
    pub revision: u64,
    /// Identifies one run of one item; evidence is addressed by it.
    pub run_id: String,
    pub current_item_id: Option<String>,
    pub current_step: Step,
    #[serde(default)]
    pub retry_counts: BTreeMap<Step, u32>,
    pub last_gate_result: Option<GateResult>,
    /// Union of files touched by every implement pass on the current item.
    #[serde(default)]
    pub files_changed: Vec<String>,
    /// Findings the next implement pass has to address.
    #[serde(default)]
    pub pending_findings: Vec<Finding>,
    /// The PostVerify result that cleared the item for wrap-up.
    pub verified: Option<GateResult>,
    #[serde(default)]
    pub history: Vec<Step>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::idle()
    }
}

impl RunState {
    /// No item in flight.
    pub fn idle() -> Self {
        let now = Utc::now();
        Self {
            revision: 0,
            run_id: String::new(),
            current_item_id: None,
            current_step: Step::Selected,
            retry_counts: BTreeMap::new(),
            last_gate_result: None,
            files_changed: Vec::new(),
            pending_findings: Vec::new(),
            verified: None,
            history: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }

    /// Start a fresh run for `item_id`, keeping the document revision.
    pub fn begin(&mut self, item_id: &str) {
        let revision = self.revision;
        *self = Self::idle();
        self.revision = revision;
        self.run_id = Uuid::new_v4().to_string();
        self.current_item_id = Some(item_id.to_string());
    }

    /// Return to idle once the item is committed or abandoned.
    pub fn clear(&mut self) {
        let revision = self.revision;
        *self = Self::idle();
        self.revision = revision;
    }

    pub fn is_active(&self) -> bool {
        self.current_item_id.is_some()
    }

    pub fn retries(&self, step: Step) -> u32 {
        self.retry_counts.get(&step).copied().unwrap_or(0)
    }

    /// Bump and return the retry count for `step`.
    pub(crate) fn bump_retry(&mut self, step: Step) -> u32 {
        let count = self.retry_counts.entry(step).or_insert(0);
        *count += 1;
        *count
    }

    /// Add newly changed files, keeping first-seen order.
    pub fn merge_files(&mut self, files: &[String]) {
        for file in files {
            if !self.files_changed.contains(file) {
                self.files_changed.push(file.clone());
            }
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// How an item run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Committed,
    Blocked,
    SessionAborted,
}

/// Structured audit record produced when an item run ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub run_id: String,
    pub item_id: String,
    pub outcome: RunOutcome,
    pub state_transitions: Vec<Step>,
    pub retry_counts: BTreeMap<Step, u32>,
    pub files_changed: Vec<String>,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl AuditRecord {
    /// Generate an audit record from the run state of a finished item run.
    pub fn from_run(run: &RunState, outcome: RunOutcome, warnings: Vec<String>) -> Self {
        let now = Utc::now();
        let duration = now - run.started_at;
        let mut transitions = run.history.clone();
        transitions.push(run.current_step);

        Self {
            run_id: run.run_id.clone(),
            item_id: run.current_item_id.clone().unwrap_or_default(),
            outcome,
            state_transitions: transitions,
            retry_counts: run.retry_counts.clone(),
            files_changed: run.files_changed.clone(),
            warnings,
            started_at: run.started_at,
            completed_at: now,
            duration_ms: duration.num_milliseconds(),
        }
    }
}
