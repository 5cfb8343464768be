//! Drives backlog items through the gated step sequence.
//!
//! One [`WorkflowEngine`] owns the session: it selects items, invokes the
//! executor for each step, evaluates gates, persists the run state at every
//! transition and fans out the wrap-up bookkeeping.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::capability::{
    Capability, CapabilityRequest, ExecutionResult, ImplementRequest, ImplementScope,
    NotifyRequest, PublishRequest, ReportedLearning, ReviewRequest, TaskExecutor, TrackRequest,
    VerifyPurpose, VerifyRequest,
};
use crate::completion::{COMPLETION_SIGNAL, CompletionDetector, CompletionStatus};
use crate::config::GateworkConfig;
use crate::error::{ExecutorError, PipelineError};
use crate::evidence::{CapabilityMetrics, EvidenceStore, Invocation};
use crate::gate::{EVIDENCE_MISSING, Finding, GateEvaluator, GateResult, Severity, Verdict};
use crate::learnings::{LearningCategory, Learnings};
use crate::state_machine::{
    AuditRecord, Backlog, ItemStatus, RetryConfig, RunOutcome, RunState, StateMachine, Step,
    Transition, WorkItem,
};
use crate::store::SessionStore;
use crate::ui::SessionProgress;

const EVIDENCE_DIR: &str = "evidence";

/// Engine knobs derived from [`GateworkConfig`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry: RetryConfig,
    /// Finished items re-verified alongside a new one.
    pub regression_sample: usize,
    pub max_items_per_session: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            regression_sample: 2,
            max_items_per_session: None,
        }
    }
}

impl From<&GateworkConfig> for EngineConfig {
    fn from(config: &GateworkConfig) -> Self {
        Self {
            retry: config.retry_config(),
            regression_sample: config.sample_size(),
            max_items_per_session: config.max_items_per_session,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// The backlog became (or was found) complete in this session.
    Complete,
    /// Completion was already observed earlier in this session; nothing ran.
    AlreadyComplete,
    /// Items remain: blocked, or beyond the per-session limit.
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedItem {
    pub item_id: String,
    pub step: Step,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub status: CompletionStatus,
    pub committed: Vec<String>,
    pub blocked: Vec<BlockedItem>,
    pub warnings: Vec<String>,
    /// Executor calls made during the session, per capability.
    pub metrics: Vec<CapabilityMetrics>,
}

impl SessionReport {
    fn new(outcome: SessionOutcome, status: CompletionStatus) -> Self {
        Self {
            outcome,
            status,
            committed: Vec::new(),
            blocked: Vec::new(),
            warnings: Vec::new(),
            metrics: Vec::new(),
        }
    }

    /// The completion signal, present only for the session that observed completion.
    pub fn completion_signal(&self) -> Option<&'static str> {
        (self.outcome == SessionOutcome::Complete).then_some(COMPLETION_SIGNAL)
    }
}

enum ItemResult {
    Committed(Vec<String>),
    Blocked(BlockedItem),
}

/// One executor call with its timing, before a gate is decided from it.
struct Dispatched {
    capability: Capability,
    started_at: DateTime<Utc>,
    duration_ms: u64,
    outcome: Result<ExecutionResult, ExecutorError>,
}

async fn timed_invoke<E: TaskExecutor>(executor: &E, request: &CapabilityRequest) -> Dispatched {
    let started_at = Utc::now();
    let clock = Instant::now();
    let outcome = executor.invoke(request).await;
    Dispatched {
        capability: request.capability(),
        started_at,
        duration_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
        outcome,
    }
}

/// The gated workflow state machine bound to a store and an executor.
pub struct WorkflowEngine<E> {
    executor: E,
    store: SessionStore,
    evidence: EvidenceStore,
    config: EngineConfig,
    backlog: Backlog,
    run: RunState,
    learnings: Learnings,
    /// Learnings gathered during the current item, flushed when it ends.
    pending_learnings: Learnings,
    /// Every executor call of the current session.
    session_calls: Vec<Invocation>,
    completion_observed: bool,
    progress: Option<SessionProgress>,
}

impl<E: TaskExecutor> WorkflowEngine<E> {
    /// Load the project documents from `store` and bind them to `executor`.
    pub fn open(executor: E, store: SessionStore, config: EngineConfig) -> Result<Self, PipelineError> {
        let project = store.load_project()?;
        let backlog = store.load_backlog(&project)?;
        let run = store.load_run_state()?;
        let learnings = store.load_learnings()?;
        let evidence = EvidenceStore::new(store.root().join(EVIDENCE_DIR));
        debug!(
            project = %project.project_id,
            items = backlog.total_items,
            resumed = run.is_active(),
            "engine opened"
        );
        Ok(Self {
            executor,
            store,
            evidence,
            config,
            backlog,
            run,
            learnings,
            pending_learnings: Learnings::default(),
            session_calls: Vec::new(),
            completion_observed: false,
            progress: None,
        })
    }

    pub fn with_progress(mut self, progress: SessionProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn backlog(&self) -> &Backlog {
        &self.backlog
    }

    pub fn run_state(&self) -> &RunState {
        &self.run
    }

    pub fn learnings(&self) -> &Learnings {
        &self.learnings
    }

    pub fn evidence(&self) -> &EvidenceStore {
        &self.evidence
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    fn check_capabilities(&self) -> Result<(), PipelineError> {
        let declared = self.executor.capabilities();
        match Capability::ALL.into_iter().find(|c| !declared.contains(c)) {
            Some(missing) => Err(PipelineError::MissingCapability(missing)),
            None => Ok(()),
        }
    }

    /// Run one session: work items until the backlog completes, nothing is
    /// selectable or the per-session limit is hit.
    ///
    /// Session-fatal conditions (environment failure, PreVerify ceiling,
    /// revision conflict, invariant violation) are returned as errors.
    pub async fn run_session(&mut self) -> Result<SessionReport, PipelineError> {
        let status = CompletionDetector::check(&self.backlog)?;
        if self.completion_observed {
            info!("completion already observed in this session");
            return Ok(SessionReport::new(SessionOutcome::AlreadyComplete, status));
        }
        self.check_capabilities()?;
        self.settle_stale_run()?;
        self.session_calls.clear();

        let mut report = SessionReport::new(SessionOutcome::Incomplete, status);
        let mut blocked: HashSet<String> = HashSet::new();
        let mut attempted = 0u32;

        loop {
            let status = CompletionDetector::check(&self.backlog)?;
            report.status = status;
            if status.all_complete {
                self.finish_backlog(&mut report).await;
                report.outcome = SessionOutcome::Complete;
                report.metrics = CapabilityMetrics::summarize(&self.session_calls);
                return Ok(report);
            }
            if self
                .config
                .max_items_per_session
                .is_some_and(|max| attempted >= max)
            {
                info!(attempted, "per-session item limit reached");
                break;
            }
            let Some(item_id) = self.select_item(&blocked) else {
                info!(remaining = status.remaining(), "no selectable items left");
                break;
            };
            attempted += 1;

            match self.drive_item(&item_id).await? {
                ItemResult::Committed(warnings) => {
                    report.warnings.extend(warnings);
                    report.committed.push(item_id);
                }
                ItemResult::Blocked(item) => {
                    blocked.insert(item_id);
                    report.blocked.push(item);
                }
            }
        }

        report.status = CompletionDetector::check(&self.backlog)?;
        self.record_session_narrative(&mut report).await;
        report.metrics = CapabilityMetrics::summarize(&self.session_calls);
        Ok(report)
    }

    /// Resume the in-flight item if there is one, else the most urgent open item.
    fn select_item(&self, blocked: &HashSet<String>) -> Option<String> {
        if let Some(id) = &self.run.current_item_id {
            if !blocked.contains(id) {
                return Some(id.clone());
            }
        }
        self.backlog.next_open(blocked).map(|item| item.id.clone())
    }

    /// Close a run left behind by a crash after its item was already recorded Done.
    fn settle_stale_run(&mut self) -> Result<(), PipelineError> {
        let Some(id) = self.run.current_item_id.clone() else {
            return Ok(());
        };
        match self.backlog.get(&id).map(|item| item.status) {
            Some(ItemStatus::Done) => {
                info!(item = %id, "item already done, closing its run");
                self.finish_run(RunOutcome::Committed, Vec::new())
            }
            Some(_) => Ok(()),
            None => {
                warn!(item = %id, "run state refers to an unknown item, discarding it");
                self.run.clear();
                self.save_run()
            }
        }
    }

    async fn drive_item(&mut self, item_id: &str) -> Result<ItemResult, PipelineError> {
        let item = self
            .backlog
            .get(item_id)
            .cloned()
            .ok_or_else(|| PipelineError::ItemNotFound(item_id.to_string()))?;

        let mut resuming = self.run.current_item_id.as_deref() == Some(item_id);
        if resuming {
            info!(item = item_id, step = %self.run.current_step, "resuming item");
            if self.run.current_step >= Step::Implement {
                self.mark_in_progress(item_id)?;
            }
        } else {
            self.run.begin(item_id);
            self.save_run()?;
            info!(item = item_id, title = %item.title, run = %self.run.run_id, "selected item");
        }

        let mut warnings = Vec::new();
        loop {
            let step = self.run.current_step;
            if let Some(progress) = &self.progress {
                progress.step(item_id, step);
            }

            let replayed = if resuming { self.replay(step)? } else { None };
            resuming = false;
            let gate = match replayed {
                Some(gate) => gate,
                None => self.execute_step(step, &item, &mut warnings).await?,
            };
            debug!(item = item_id, %step, verdict = %gate.verdict, "gate evaluated");

            match StateMachine::next(&mut self.run, &gate, &self.config.retry) {
                Transition::Next(next) => {
                    if next == Step::Implement {
                        self.mark_in_progress(item_id)?;
                    }
                    self.save_run()?;
                    info!(item = item_id, from = %step, to = %next, "advanced");
                }
                Transition::Retry { attempt, reason, .. } => {
                    self.save_run()?;
                    warn!(item = item_id, %step, attempt, %reason, "gate failed, retrying step");
                    self.backoff(step, attempt, &reason).await;
                    if step == Step::PreVerify {
                        self.fix_regression(&item).await?;
                    }
                }
                Transition::FixAndReturn { from, attempt, reason } => {
                    self.save_run()?;
                    warn!(item = item_id, step = %from, attempt, %reason, "returning to implement");
                    self.backoff(from, attempt, &reason).await;
                }
                Transition::AbortItem { step, reason } => {
                    error!(item = item_id, %step, %reason, "retry ceiling exceeded, item blocked");
                    return self.abort_item(&item, step, reason, warnings);
                }
                Transition::AbortSession { step, reason } => {
                    let attempts = self.run.retries(step);
                    error!(item = item_id, %step, attempts, %reason, "retry ceiling exceeded, aborting session");
                    self.finish_run(RunOutcome::SessionAborted, warnings)?;
                    return Err(PipelineError::RetryCeilingExceeded {
                        step,
                        attempts,
                        reason,
                    });
                }
                Transition::Complete => {
                    self.finish_run(RunOutcome::Committed, warnings.clone())?;
                    info!(item = item_id, "item committed");
                    if let Some(progress) = &self.progress {
                        progress.committed(&item);
                    }
                    return Ok(ItemResult::Committed(warnings));
                }
            }
        }
    }

    async fn execute_step(
        &mut self,
        step: Step,
        item: &WorkItem,
        warnings: &mut Vec<String>,
    ) -> Result<GateResult, PipelineError> {
        match step {
            Step::Selected | Step::Committed => Ok(GateResult::pass(Vec::new())),
            Step::PreVerify => self.pre_verify(item).await,
            Step::Implement => self.implement(item).await,
            Step::Review => self.review(item).await,
            Step::PostVerify => self.post_verify(item).await,
            Step::WrapUp => self.wrap_up(item, warnings).await,
        }
    }

    /// The gate an interrupted run already decided for `step`, when the call
    /// it came from was recorded under the current run state revision.
    fn replay(&mut self, step: Step) -> Result<Option<GateResult>, PipelineError> {
        let capability = match step {
            Step::PreVerify | Step::PostVerify => Capability::Verify,
            Step::Implement => Capability::Implement,
            Step::Review => Capability::Review,
            _ => return Ok(None),
        };
        let Some(call) = self
            .evidence
            .last_invocation(&self.run.run_id, step, capability)?
        else {
            return Ok(None);
        };
        if call.run_revision != self.run.revision {
            return Ok(None);
        }
        let Some(gate) = call.gate else {
            return Ok(None);
        };
        self.run.merge_files(&call.files_changed);
        info!(%step, verdict = %gate.verdict, "step already ran before the interruption, reusing its gate");
        Ok(Some(gate))
    }

    /// Invoke the executor for `step`. Environment failures are recorded and
    /// end the session; any other outcome is left to the step to gate.
    async fn dispatch(
        &mut self,
        step: Step,
        request: &CapabilityRequest,
    ) -> Result<Dispatched, PipelineError> {
        let call = timed_invoke(&self.executor, request).await;
        if let Err(ExecutorError::Environment(msg)) = &call.outcome {
            let msg = msg.clone();
            self.record_call(step, &call, None)?;
            return Err(PipelineError::Environment(msg));
        }
        if let Err(e) = &call.outcome {
            warn!(capability = %call.capability, error = %e, "executor failed");
        }
        Ok(call)
    }

    /// Persist the call in the run's evidence log and count it for the session.
    fn record_call(
        &mut self,
        step: Step,
        call: &Dispatched,
        gate: Option<&GateResult>,
    ) -> Result<(), PipelineError> {
        let invocation = Invocation {
            step,
            capability: call.capability,
            attempt: self.run.retries(step) + 1,
            run_revision: self.run.revision,
            started_at: call.started_at,
            duration_ms: call.duration_ms,
            error: call.outcome.as_ref().err().map(|e| e.to_string()),
            files_changed: call
                .outcome
                .as_ref()
                .map(|r| r.files_changed.clone())
                .unwrap_or_default(),
            gate: gate.cloned(),
        };
        debug!(
            capability = %invocation.capability,
            %step,
            attempt = invocation.attempt,
            duration_ms = invocation.duration_ms,
            ok = invocation.succeeded(),
            "executor call"
        );
        if let Some(item_id) = self.run.current_item_id.as_deref() {
            self.evidence
                .record_invocation(&self.run.run_id, item_id, &invocation)?;
        }
        self.session_calls.push(invocation);
        Ok(())
    }

    /// Regression baseline over the finished items. Trivially passes when none are finished.
    async fn pre_verify(&mut self, item: &WorkItem) -> Result<GateResult, PipelineError> {
        let targets: Vec<WorkItem> = self.backlog.done_items().into_iter().cloned().collect();
        if targets.is_empty() {
            debug!(item = %item.id, "no finished items, regression baseline skipped");
            return Ok(GateResult::pass(Vec::new()));
        }
        let request = CapabilityRequest::Verify(VerifyRequest {
            purpose: VerifyPurpose::Baseline,
            targets,
        });
        let call = self.dispatch(Step::PreVerify, &request).await?;
        let gate = match &call.outcome {
            Ok(result) => {
                self.record_evidence(Step::PreVerify, Capability::Verify, &result.evidence)?;
                GateEvaluator::evaluate(Capability::Verify, result)
            }
            Err(e) => GateResult::fail(executor_failure(call.capability, e)),
        };
        self.record_call(Step::PreVerify, &call, Some(&gate))?;
        Ok(gate)
    }

    /// Ask `implement` to repair the regression found by the baseline.
    async fn fix_regression(&mut self, item: &WorkItem) -> Result<(), PipelineError> {
        let request = CapabilityRequest::Implement(ImplementRequest {
            item: item.clone(),
            scope: ImplementScope::FixRegression,
            findings: self.run.pending_findings.clone(),
            files_changed: self.run.files_changed.clone(),
            learnings: self.learnings_context(),
        });
        let call = self.dispatch(Step::PreVerify, &request).await?;
        self.record_call(Step::PreVerify, &call, None)?;
        match &call.outcome {
            Ok(result) => {
                self.run.merge_files(&result.files_changed);
                self.absorb_learnings(&item.id, &result.learnings);
                self.save_run()?;
            }
            Err(e) => warn!(item = %item.id, error = %e, "regression fix failed"),
        }
        Ok(())
    }

    async fn implement(&mut self, item: &WorkItem) -> Result<GateResult, PipelineError> {
        let scope = if self.run.pending_findings.is_empty() {
            ImplementScope::Item
        } else {
            ImplementScope::AddressFindings
        };
        let request = CapabilityRequest::Implement(ImplementRequest {
            item: item.clone(),
            scope,
            findings: self.run.pending_findings.clone(),
            files_changed: self.run.files_changed.clone(),
            learnings: self.learnings_context(),
        });
        let call = self.dispatch(Step::Implement, &request).await?;
        let gate = match &call.outcome {
            Ok(result) => {
                self.run.merge_files(&result.files_changed);
                self.record_evidence(Step::Implement, Capability::Implement, &result.evidence)?;
                self.absorb_learnings(&item.id, &result.learnings);
                implement_gate(item, result)
            }
            Err(e) => GateResult::fail(executor_failure(call.capability, e)),
        };
        self.record_call(Step::Implement, &call, Some(&gate))?;
        Ok(gate)
    }

    async fn review(&mut self, item: &WorkItem) -> Result<GateResult, PipelineError> {
        let request = CapabilityRequest::Review(ReviewRequest {
            item: item.clone(),
            files_changed: self.run.files_changed.clone(),
            learnings: self.learnings_context(),
        });
        let call = self.dispatch(Step::Review, &request).await?;
        let gate = match &call.outcome {
            Ok(result) => {
                self.record_evidence(Step::Review, Capability::Review, &result.evidence)?;
                self.absorb_learnings(&item.id, &result.learnings);
                for finding in &result.findings {
                    let category = if finding.severity.is_blocking() {
                        LearningCategory::Mistake
                    } else {
                        LearningCategory::Finding
                    };
                    self.pending_learnings
                        .append(category, finding.to_string(), Some(&item.id));
                }
                GateEvaluator::evaluate(Capability::Review, result)
            }
            Err(e) => GateResult::fail(executor_failure(call.capability, e)),
        };
        self.record_call(Step::Review, &call, Some(&gate))?;
        Ok(gate)
    }

    /// Verify the new item together with a sample of recently finished ones.
    async fn post_verify(&mut self, item: &WorkItem) -> Result<GateResult, PipelineError> {
        let mut targets = vec![item.clone()];
        targets.extend(
            self.backlog
                .recent_done(self.config.regression_sample, &item.id)
                .into_iter()
                .cloned(),
        );
        let request = CapabilityRequest::Verify(VerifyRequest {
            purpose: VerifyPurpose::Feature,
            targets,
        });
        let call = self.dispatch(Step::PostVerify, &request).await?;
        let gate = match &call.outcome {
            Ok(result) => {
                self.record_evidence(Step::PostVerify, Capability::Verify, &result.evidence)?;
                GateEvaluator::evaluate(Capability::Verify, result)
            }
            Err(e) => GateResult::fail(executor_failure(call.capability, e)),
        };
        self.record_call(Step::PostVerify, &call, Some(&gate))?;
        Ok(gate)
    }

    /// Fan out publish, track and notify, then join.
    ///
    /// Branches that already left evidence in this run are not dispatched again.
    /// The item becomes Done once `track` confirms; publish or notify failures
    /// after that are warnings.
    async fn wrap_up(
        &mut self,
        item: &WorkItem,
        warnings: &mut Vec<String>,
    ) -> Result<GateResult, PipelineError> {
        let verified = self.run.verified.clone().ok_or_else(|| {
            PipelineError::Invariant(format!(
                "{} reached wrap-up without a passing verification",
                item.id
            ))
        })?;
        let run_id = self.run.run_id.clone();
        let publish_done = self.evidence.has(&run_id, Step::WrapUp, Capability::Publish)?;
        let track_done = self.evidence.has(&run_id, Step::WrapUp, Capability::Track)?;
        let notify_done = self.evidence.has(&run_id, Step::WrapUp, Capability::Notify)?;

        let publish = CapabilityRequest::Publish(PublishRequest::Commit {
            item_id: item.id.clone(),
            title: item.title.clone(),
            category: item.category.clone(),
            files_changed: self.run.files_changed.clone(),
        });
        let track = CapabilityRequest::Track(TrackRequest::MarkDone {
            item_id: item.id.clone(),
            summary: format!(
                "{}: verified with {}",
                item.title,
                verified.evidence.join(", ")
            ),
        });
        let notify = CapabilityRequest::Notify(NotifyRequest {
            text: format!("{} committed: {}", item.id, item.title),
        });

        let (published, tracked, notified) = tokio::join!(
            self.dispatch_branch(publish_done, &publish),
            self.dispatch_branch(track_done, &track),
            self.dispatch_branch(notify_done, &notify),
        );

        let mut findings = Vec::new();
        let mut evidence = Vec::new();
        let mut environment = None;
        let branches = [
            (Capability::Publish, published),
            (Capability::Track, tracked),
            (Capability::Notify, notified),
        ];
        for (capability, call) in branches {
            let Some(call) = call else {
                debug!(item = %item.id, %capability, "branch already done, skipped");
                continue;
            };
            self.record_call(Step::WrapUp, &call, None)?;
            match call.outcome {
                Ok(result) if capability == Capability::Track && !result.confirmed => {
                    findings.push(
                        Finding::new(Severity::High, "track did not confirm the item as done")
                            .with_code("track-unconfirmed"),
                    );
                }
                Ok(result) => {
                    let references = branch_references(capability, &result);
                    self.record_evidence(Step::WrapUp, capability, &references)?;
                    evidence.extend(references);
                }
                Err(ExecutorError::Environment(msg)) => environment = Some(msg),
                Err(e) => findings.push(executor_failure(capability, &e)),
            }
        }
        if let Some(msg) = environment {
            return Err(PipelineError::Environment(msg));
        }

        if !self.evidence.has(&run_id, Step::WrapUp, Capability::Track)? {
            return Ok(GateResult {
                verdict: Verdict::Fail,
                evidence,
                findings,
            });
        }

        if self.backlog.mark_done(&item.id, &verified)? {
            self.store.save_backlog(&mut self.backlog)?;
            info!(item = %item.id, done = self.backlog.done_count(), "item marked done");
        }

        let softened: Vec<Finding> = findings
            .into_iter()
            .map(|f| Finding {
                severity: Severity::Medium,
                ..f
            })
            .collect();
        for finding in &softened {
            warn!(item = %item.id, warning = %finding.message, "wrap-up branch failed");
            warnings.push(finding.message.clone());
        }
        Ok(GateResult {
            verdict: if softened.is_empty() {
                Verdict::Pass
            } else {
                Verdict::Warn
            },
            evidence,
            findings: softened,
        })
    }

    async fn dispatch_branch(
        &self,
        already_done: bool,
        request: &CapabilityRequest,
    ) -> Option<Dispatched> {
        if already_done {
            return None;
        }
        Some(timed_invoke(&self.executor, request).await)
    }

    /// Final fan-out once every item is Done. Failures are warnings.
    async fn finish_backlog(&mut self, report: &mut SessionReport) {
        let summary = completion_narrative(&self.backlog, report);
        let narrative = CapabilityRequest::Track(TrackRequest::Narrative {
            item_id: self.backlog.meta_item_id.clone(),
            text: summary.clone(),
        });
        let publish = CapabilityRequest::Publish(PublishRequest::Summary { text: summary });
        let notify = CapabilityRequest::Notify(NotifyRequest {
            text: format!("{COMPLETION_SIGNAL} ({} items)", report.status.total),
        });

        let (tracked, published, notified) = tokio::join!(
            timed_invoke(&self.executor, &narrative),
            timed_invoke(&self.executor, &publish),
            timed_invoke(&self.executor, &notify),
        );
        for call in [tracked, published, notified] {
            let capability = call.capability;
            if let Err(e) = self.record_call(Step::Committed, &call, None) {
                warn!(error = %e, "failed to record completion call");
            }
            if let Err(e) = call.outcome {
                let msg = format!("{capability} failed during completion: {e}");
                warn!(%capability, error = %e, "completion fan-out branch failed");
                report.warnings.push(msg);
            }
        }

        self.completion_observed = true;
        info!(total = report.status.total, "backlog complete");
    }

    /// Append the session narrative to the meta item. Failure is only a warning.
    async fn record_session_narrative(&mut self, report: &mut SessionReport) {
        if report.committed.is_empty() && report.blocked.is_empty() {
            return;
        }
        let request = CapabilityRequest::Track(TrackRequest::Narrative {
            item_id: self.backlog.meta_item_id.clone(),
            text: session_narrative(report),
        });
        let call = timed_invoke(&self.executor, &request).await;
        if let Err(e) = self.record_call(Step::Committed, &call, None) {
            warn!(error = %e, "failed to record narrative call");
        }
        if let Err(e) = call.outcome {
            warn!(error = %e, "failed to record session narrative");
            report
                .warnings
                .push(format!("session narrative not recorded: {e}"));
        }
    }

    fn abort_item(
        &mut self,
        item: &WorkItem,
        step: Step,
        reason: String,
        warnings: Vec<String>,
    ) -> Result<ItemResult, PipelineError> {
        if self.backlog.get(&item.id).map(|i| i.status) == Some(ItemStatus::InProgress) {
            self.backlog.set_status(&item.id, ItemStatus::Open)?;
            self.store.save_backlog(&mut self.backlog)?;
        }
        self.finish_run(RunOutcome::Blocked, warnings)?;
        let blocked = BlockedItem {
            item_id: item.id.clone(),
            step,
            reason,
        };
        if let Some(progress) = &self.progress {
            progress.blocked(&blocked);
        }
        Ok(ItemResult::Blocked(blocked))
    }

    /// Write the audit record, return the run state to idle and flush learnings.
    fn finish_run(&mut self, outcome: RunOutcome, warnings: Vec<String>) -> Result<(), PipelineError> {
        let record = AuditRecord::from_run(&self.run, outcome, warnings);
        self.evidence.record_audit(&record)?;
        debug!(
            item = %record.item_id,
            outcome = ?record.outcome,
            duration_ms = record.duration_ms,
            "audit recorded"
        );
        self.run.clear();
        self.save_run()?;
        self.flush_learnings()
    }

    fn mark_in_progress(&mut self, item_id: &str) -> Result<(), PipelineError> {
        if self.backlog.get(item_id).map(|i| i.status) == Some(ItemStatus::Open) {
            self.backlog.set_status(item_id, ItemStatus::InProgress)?;
            self.store.save_backlog(&mut self.backlog)?;
        }
        Ok(())
    }

    async fn backoff(&self, step: Step, attempt: u32, reason: &str) {
        if let Some(progress) = &self.progress {
            progress.retry(step, attempt, self.config.retry.max_retries, reason);
        }
        let delay_ms = self.config.retry.delay_for_attempt(attempt);
        if delay_ms > 0 {
            debug!(delay_ms, "backing off");
            sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    fn save_run(&mut self) -> Result<(), PipelineError> {
        self.run.touch();
        self.store.save_run_state(&mut self.run)
    }

    fn record_evidence(
        &self,
        step: Step,
        capability: Capability,
        references: &[String],
    ) -> Result<(), PipelineError> {
        let Some(item_id) = self.run.current_item_id.as_deref() else {
            return Ok(());
        };
        self.evidence
            .record(&self.run.run_id, item_id, step, capability, references)
    }

    fn absorb_learnings(&mut self, item_id: &str, reported: &[ReportedLearning]) {
        for learning in reported {
            self.pending_learnings
                .append(learning.category, learning.text.clone(), Some(item_id));
        }
    }

    fn learnings_context(&self) -> String {
        let mut all = self.learnings.clone();
        all.merge(&self.pending_learnings);
        all.render()
    }

    fn flush_learnings(&mut self) -> Result<(), PipelineError> {
        if self.pending_learnings.is_empty() {
            return Ok(());
        }
        self.learnings = self.store.append_learnings(&self.pending_learnings)?;
        self.pending_learnings = Learnings::default();
        Ok(())
    }
}

/// Gate for an implement result: it must change files and, for user-observable
/// items, bring evidence.
fn implement_gate(item: &WorkItem, result: &ExecutionResult) -> GateResult {
    let mut gate = GateEvaluator::evaluate(Capability::Implement, result);
    if result.files_changed.is_empty() {
        gate.verdict = Verdict::Fail;
        gate.findings.push(
            Finding::new(Severity::High, "implement reported no changed files")
                .with_code("no-changes"),
        );
    } else if item.user_observable && result.evidence.is_empty() {
        gate.verdict = Verdict::Fail;
        gate.findings.push(
            Finding::new(
                Severity::High,
                format!("{} is user-observable but implement returned no evidence", item.id),
            )
            .with_code(EVIDENCE_MISSING),
        );
    }
    gate
}

fn executor_failure(capability: Capability, error: &ExecutorError) -> Finding {
    Finding::new(Severity::High, format!("{capability} failed: {error}")).with_code("executor-error")
}

/// Evidence that a wrap-up branch finished, so a resumed run does not repeat it.
fn branch_references(capability: Capability, result: &ExecutionResult) -> Vec<String> {
    let mut references = result.evidence.clone();
    if let Some(reference) = &result.reference {
        if !references.contains(reference) {
            references.push(reference.clone());
        }
    }
    if references.is_empty() {
        references.push(format!("{capability}:done"));
    }
    references
}

fn session_narrative(report: &SessionReport) -> String {
    let mut lines = vec![format!(
        "Session {}: {}/{} items done",
        Utc::now().format("%Y-%m-%d %H:%M UTC"),
        report.status.done,
        report.status.total
    )];
    if !report.committed.is_empty() {
        lines.push(format!("Committed: {}", report.committed.join(", ")));
    }
    for blocked in &report.blocked {
        lines.push(format!(
            "Blocked: {} at {} ({})",
            blocked.item_id, blocked.step, blocked.reason
        ));
    }
    lines.join("\n")
}

fn completion_narrative(backlog: &Backlog, report: &SessionReport) -> String {
    let mut text = format!(
        "All {} items implemented and verified.",
        backlog.total_items
    );
    if !report.committed.is_empty() {
        text.push_str(&format!(
            " Completed this session: {}.",
            report.committed.join(", ")
        ));
    }
    text
}
