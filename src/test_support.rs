//! Test-only helpers: a scripted executor and a seeded project store.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use crate::capability::{Capability, CapabilityRequest, ExecutionResult, TaskExecutor};
use crate::error::{ExecutorError, PipelineError};
use crate::gate::GateResult;
use crate::state_machine::{Backlog, WorkItem};
use crate::store::SessionStore;

type Scripted = Result<ExecutionResult, ExecutorError>;

/// Executor that answers from per-capability queues, falling back to defaults,
/// and records every request it receives.
pub struct ScriptedExecutor {
    declared: Vec<Capability>,
    defaults: HashMap<Capability, Scripted>,
    queued: Mutex<HashMap<Capability, VecDeque<Scripted>>>,
    calls: Mutex<Vec<CapabilityRequest>>,
}

impl ScriptedExecutor {
    /// Every capability declared and every default result clears its gate.
    pub fn passing() -> Self {
        let defaults = HashMap::from([
            (
                Capability::Implement,
                Ok(ExecutionResult {
                    files_changed: vec!["src/feature.rs".into()],
                    evidence: vec!["implement.log".into()],
                    ..Default::default()
                }),
            ),
            (
                Capability::Verify,
                Ok(ExecutionResult {
                    evidence: vec!["screenshot.png".into()],
                    ..Default::default()
                }),
            ),
            (Capability::Review, Ok(ExecutionResult::default())),
            (
                Capability::Track,
                Ok(ExecutionResult {
                    confirmed: true,
                    ..Default::default()
                }),
            ),
            (
                Capability::Publish,
                Ok(ExecutionResult {
                    reference: Some("abc1234".into()),
                    ..Default::default()
                }),
            ),
            (Capability::Notify, Ok(ExecutionResult::default())),
        ]);
        Self {
            declared: Capability::ALL.to_vec(),
            defaults,
            queued: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Stop declaring `capability`.
    pub fn without(mut self, capability: Capability) -> Self {
        self.declared.retain(|c| *c != capability);
        self
    }

    /// Replace the fallback answer for `capability`.
    pub fn with_default(mut self, capability: Capability, result: Scripted) -> Self {
        self.defaults.insert(capability, result);
        self
    }

    /// Queue a one-shot answer, consumed before the default.
    pub fn push(&self, capability: Capability, result: Scripted) {
        self.queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(capability)
            .or_default()
            .push_back(result);
    }

    pub fn calls(&self) -> Vec<CapabilityRequest> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Capabilities in invocation order.
    pub fn capability_log(&self) -> Vec<Capability> {
        self.calls().iter().map(CapabilityRequest::capability).collect()
    }

    pub fn count(&self, capability: Capability) -> usize {
        self.capability_log()
            .into_iter()
            .filter(|c| *c == capability)
            .count()
    }
}

impl TaskExecutor for ScriptedExecutor {
    fn capabilities(&self) -> Vec<Capability> {
        self.declared.clone()
    }

    async fn invoke(&self, request: &CapabilityRequest) -> Result<ExecutionResult, ExecutorError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let capability = request.capability();
        if !self.declared.contains(&capability) {
            return Err(ExecutorError::Unsupported(capability));
        }
        let queued = self
            .queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&capability)
            .and_then(VecDeque::pop_front);
        match queued {
            Some(result) => result,
            None => self
                .defaults
                .get(&capability)
                .cloned()
                .unwrap_or_else(|| Ok(ExecutionResult::default())),
        }
    }
}

/// Initialize a project under `root` with a meta item plus `items`, marking the
/// ids in `done` as already finished.
pub fn seed_store(
    root: &Path,
    meta_item_id: &str,
    items: Vec<WorkItem>,
    done: &[&str],
) -> Result<SessionStore, PipelineError> {
    let mut all = vec![WorkItem::new(meta_item_id, "Session log", 0)];
    all.extend(items);
    let mut backlog = Backlog::new(meta_item_id, all)?;
    let seeded = GateResult::pass(vec!["seed.png".into()]);
    for id in done {
        backlog.mark_done(id, &seeded)?;
    }
    let store = SessionStore::new(root);
    store.initialize("test-project", &mut backlog)?;
    Ok(store)
}
