//! Evidence artifacts recorded per item run and step.
//!
//! Each run gets one document (`evidence/<run_id>.json`) holding the artifacts,
//! one [`Invocation`] per executor call and the final audit record. On resume the
//! engine reuses the gate of a call recorded under the current run state
//! revision instead of invoking the step again.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capability::Capability;
use crate::error::PipelineError;
use crate::gate::GateResult;
use crate::state_machine::{AuditRecord, Step};
use crate::store::{read_json, write_json};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub step: Step,
    pub capability: Capability,
    /// File path or external reference (screenshot, log, commit hash).
    pub reference: String,
    pub recorded_at: DateTime<Utc>,
}

/// Timing and outcome of one executor call made during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub step: Step,
    pub capability: Capability,
    /// 1-based attempt of `step` the call belongs to.
    pub attempt: u32,
    /// Run state revision the call was made under.
    pub run_revision: u64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    /// Gate decided from this call, for the call a step is gated on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateResult>,
}

impl Invocation {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-capability totals over a set of invocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityMetrics {
    pub capability: Capability,
    pub calls: u32,
    pub failures: u32,
    pub total_ms: u64,
}

impl CapabilityMetrics {
    pub fn average_ms(&self) -> u64 {
        if self.calls == 0 {
            0
        } else {
            self.total_ms / u64::from(self.calls)
        }
    }

    /// Totals for every capability that was called, in [`Capability::ALL`] order.
    pub fn summarize(invocations: &[Invocation]) -> Vec<CapabilityMetrics> {
        Capability::ALL
            .into_iter()
            .filter_map(|capability| {
                let calls: Vec<&Invocation> = invocations
                    .iter()
                    .filter(|i| i.capability == capability)
                    .collect();
                if calls.is_empty() {
                    return None;
                }
                Some(CapabilityMetrics {
                    capability,
                    calls: calls.len() as u32,
                    failures: calls.iter().filter(|i| !i.succeeded()).count() as u32,
                    total_ms: calls.iter().map(|i| i.duration_ms).sum(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceLog {
    pub run_id: String,
    pub item_id: String,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub invocations: Vec<Invocation>,
    #[serde(default)]
    pub audit: Option<AuditRecord>,
}

#[derive(Debug, Clone)]
pub struct EvidenceStore {
    dir: PathBuf,
}

impl EvidenceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load(&self, run_id: &str) -> Result<Option<EvidenceLog>, PipelineError> {
        read_json(&self.path(run_id))
    }

    fn update(
        &self,
        run_id: &str,
        item_id: &str,
        f: impl FnOnce(&mut EvidenceLog),
    ) -> Result<(), PipelineError> {
        let mut log = self.load(run_id)?.unwrap_or_else(|| EvidenceLog {
            run_id: run_id.to_string(),
            item_id: item_id.to_string(),
            ..Default::default()
        });
        f(&mut log);
        write_json(&self.path(run_id), &log)
    }

    /// Record the artifacts one capability produced in one step.
    pub fn record(
        &self,
        run_id: &str,
        item_id: &str,
        step: Step,
        capability: Capability,
        references: &[String],
    ) -> Result<(), PipelineError> {
        if references.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        self.update(run_id, item_id, |log| {
            log.artifacts.extend(references.iter().map(|r| Artifact {
                step,
                capability,
                reference: r.clone(),
                recorded_at: now,
            }));
        })
    }

    pub fn artifacts(&self, run_id: &str, step: Step) -> Result<Vec<Artifact>, PipelineError> {
        Ok(self
            .load(run_id)?
            .map(|log| {
                log.artifacts
                    .into_iter()
                    .filter(|a| a.step == step)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Whether `capability` already left evidence for `step` in this run.
    pub fn has(&self, run_id: &str, step: Step, capability: Capability) -> Result<bool, PipelineError> {
        Ok(self
            .artifacts(run_id, step)?
            .iter()
            .any(|a| a.capability == capability))
    }

    pub fn record_invocation(
        &self,
        run_id: &str,
        item_id: &str,
        invocation: &Invocation,
    ) -> Result<(), PipelineError> {
        self.update(run_id, item_id, |log| log.invocations.push(invocation.clone()))
    }

    /// The most recent call of `capability` made in `step` of this run.
    pub fn last_invocation(
        &self,
        run_id: &str,
        step: Step,
        capability: Capability,
    ) -> Result<Option<Invocation>, PipelineError> {
        Ok(self.load(run_id)?.and_then(|log| {
            log.invocations
                .into_iter()
                .rev()
                .find(|i| i.step == step && i.capability == capability)
        }))
    }

    pub fn record_audit(&self, record: &AuditRecord) -> Result<(), PipelineError> {
        self.update(&record.run_id, &record.item_id, |log| {
            log.audit = Some(record.clone());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{RunOutcome, RunState};
    use tempfile::TempDir;

    #[test]
    fn records_are_addressable_by_run_and_step() {
        let tmp = TempDir::new().unwrap();
        let store = EvidenceStore::new(tmp.path());

        store
            .record("run-1", "F-1", Step::PostVerify, Capability::Verify, &["login.png".into()])
            .unwrap();
        store
            .record("run-1", "F-1", Step::WrapUp, Capability::Publish, &["abc1234".into()])
            .unwrap();
        store
            .record("run-2", "F-2", Step::PostVerify, Capability::Verify, &["other.png".into()])
            .unwrap();

        let verify = store.artifacts("run-1", Step::PostVerify).unwrap();
        assert_eq!(verify.len(), 1);
        assert_eq!(verify[0].reference, "login.png");

        assert!(store.has("run-1", Step::WrapUp, Capability::Publish).unwrap());
        assert!(!store.has("run-1", Step::WrapUp, Capability::Notify).unwrap());
        assert!(store.artifacts("missing", Step::Review).unwrap().is_empty());
    }

    #[test]
    fn empty_reference_list_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = EvidenceStore::new(tmp.path());
        store
            .record("run-1", "F-1", Step::Review, Capability::Review, &[])
            .unwrap();
        assert!(store.load("run-1").unwrap().is_none());
    }

    fn invocation(step: Step, capability: Capability, duration_ms: u64) -> Invocation {
        Invocation {
            step,
            capability,
            attempt: 1,
            run_revision: 4,
            started_at: Utc::now(),
            duration_ms,
            error: None,
            files_changed: Vec::new(),
            gate: None,
        }
    }

    #[test]
    fn last_invocation_picks_latest_call_of_the_step() {
        let tmp = TempDir::new().unwrap();
        let store = EvidenceStore::new(tmp.path());

        let first = invocation(Step::PostVerify, Capability::Verify, 10);
        let mut second = invocation(Step::PostVerify, Capability::Verify, 20);
        second.attempt = 2;
        second.gate = Some(GateResult::pass(vec!["login.png".into()]));
        for call in [&first, &second, &invocation(Step::WrapUp, Capability::Notify, 5)] {
            store.record_invocation("run-1", "F-1", call).unwrap();
        }

        let last = store
            .last_invocation("run-1", Step::PostVerify, Capability::Verify)
            .unwrap()
            .unwrap();
        assert_eq!(last, second);
        assert!(store
            .last_invocation("run-1", Step::Review, Capability::Review)
            .unwrap()
            .is_none());
        assert!(store
            .last_invocation("missing", Step::PostVerify, Capability::Verify)
            .unwrap()
            .is_none());
    }

    #[test]
    fn metrics_total_calls_failures_and_latency() {
        let mut failed = invocation(Step::Implement, Capability::Implement, 300);
        failed.error = Some("execution failed: compile error".into());
        let calls = vec![
            invocation(Step::Implement, Capability::Implement, 100),
            failed,
            invocation(Step::PostVerify, Capability::Verify, 50),
        ];

        let metrics = CapabilityMetrics::summarize(&calls);
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].capability, Capability::Implement);
        assert_eq!((metrics[0].calls, metrics[0].failures), (2, 1));
        assert_eq!(metrics[0].total_ms, 400);
        assert_eq!(metrics[0].average_ms(), 200);
        assert_eq!(metrics[1].capability, Capability::Verify);
        assert_eq!(metrics[1].failures, 0);
    }

    #[test]
    fn audit_is_stored_with_the_run() {
        let tmp = TempDir::new().unwrap();
        let store = EvidenceStore::new(tmp.path());
        let mut run = RunState::idle();
        run.begin("F-1");

        let record = AuditRecord::from_run(&run, RunOutcome::Committed, vec![]);
        store.record_audit(&record).unwrap();

        let log = store.load(&run.run_id).unwrap().unwrap();
        assert_eq!(log.item_id, "F-1");
        assert_eq!(log.audit.unwrap().outcome, RunOutcome::Committed);
    }
}
