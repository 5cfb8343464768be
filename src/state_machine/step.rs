use std::fmt;

use serde::{Deserialize, Serialize};

use super::run::{RetryConfig, RunState};
use crate::gate::{GateResult, Verdict};

/// The gated steps every work item flows through.
///
/// SELECTED → PRE_VERIFY → IMPLEMENT → REVIEW → POST_VERIFY → WRAP_UP → COMMITTED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Step {
    Selected,
    PreVerify,
    Implement,
    Review,
    PostVerify,
    WrapUp,
    Committed,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Selected => write!(f, "SELECTED"),
            Step::PreVerify => write!(f, "PRE_VERIFY"),
            Step::Implement => write!(f, "IMPLEMENT"),
            Step::Review => write!(f, "REVIEW"),
            Step::PostVerify => write!(f, "POST_VERIFY"),
            Step::WrapUp => write!(f, "WRAP_UP"),
            Step::Committed => write!(f, "COMMITTED"),
        }
    }
}

/// The result of evaluating a gate for the current step.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Advance to the next step.
    Next(Step),
    /// Re-enter the current step. In PreVerify the engine runs a regression fix first.
    Retry { step: Step, attempt: u32, reason: String },
    /// Send the item back to Implement with the gate's findings.
    FixAndReturn { from: Step, attempt: u32, reason: String },
    /// Give up on the item; it stays unfinished and is reported as blocked.
    AbortItem { step: Step, reason: String },
    /// Give up on the whole session.
    AbortSession { step: Step, reason: String },
    /// The item is committed.
    Complete,
}

/// Drives a [`RunState`] through the gated steps.
pub struct StateMachine;

impl StateMachine {
    /// Compute and apply the next transition for the run's current step given
    /// the gate result of the work just performed in it.
    ///
    /// - Pass or Warn advances, except PostVerify which only advances on a Pass
    ///   backed by evidence.
    /// - A Fail in PreVerify or Implement retries the same step; in Review or
    ///   PostVerify it loops back to Implement. Every loop is bounded by
    ///   `retry.max_retries`.
    /// - Exhausting the PreVerify loop aborts the session, any other loop aborts
    ///   only the item.
    /// - Committed is terminal and always returns `Complete`.
    pub fn next(run: &mut RunState, gate: &GateResult, retry: &RetryConfig) -> Transition {
        let step = run.current_step;
        let advances = matches!(gate.verdict, Verdict::Pass | Verdict::Warn);

        let transition = match step {
            Step::Selected => Transition::Next(Step::PreVerify),
            Step::PreVerify if advances => Transition::Next(Step::Implement),
            Step::PreVerify => Self::handle_failure(run, gate, retry, |attempt, reason| {
                Transition::Retry { step, attempt, reason }
            }),
            Step::Implement if advances => Transition::Next(Step::Review),
            Step::Implement => Self::handle_failure(run, gate, retry, |attempt, reason| {
                Transition::Retry { step, attempt, reason }
            }),
            Step::Review if advances => Transition::Next(Step::PostVerify),
            Step::PostVerify if gate.is_verified() => Transition::Next(Step::WrapUp),
            Step::Review | Step::PostVerify => {
                Self::handle_failure(run, gate, retry, |attempt, reason| {
                    Transition::FixAndReturn {
                        from: step,
                        attempt,
                        reason,
                    }
                })
            }
            Step::WrapUp if advances => Transition::Next(Step::Committed),
            Step::WrapUp => Self::handle_failure(run, gate, retry, |attempt, reason| {
                Transition::Retry { step, attempt, reason }
            }),
            Step::Committed => Transition::Complete,
        };

        Self::apply(run, gate, &transition);
        transition
    }

    fn handle_failure(
        run: &mut RunState,
        gate: &GateResult,
        retry: &RetryConfig,
        on_retry: impl FnOnce(u32, String) -> Transition,
    ) -> Transition {
        let step = run.current_step;
        let attempt = run.bump_retry(step);
        let reason = gate.reason();
        if attempt <= retry.max_retries {
            on_retry(attempt, reason)
        } else if step == Step::PreVerify {
            Transition::AbortSession { step, reason }
        } else {
            Transition::AbortItem { step, reason }
        }
    }

    fn apply(run: &mut RunState, gate: &GateResult, transition: &Transition) {
        run.last_gate_result = Some(gate.clone());
        match transition {
            Transition::Next(next) => {
                if run.current_step == Step::PostVerify {
                    run.verified = Some(gate.clone());
                }
                run.history.push(run.current_step);
                run.current_step = *next;
                run.pending_findings.clear();
            }
            Transition::Retry { step, .. } => {
                // Step stays the same; the retry count was already bumped.
                run.history.push(*step);
                if *step == Step::PreVerify {
                    run.pending_findings = gate.findings.clone();
                }
            }
            Transition::FixAndReturn { from, .. } => {
                run.history.push(*from);
                run.current_step = Step::Implement;
                run.pending_findings = gate.findings.clone();
            }
            Transition::AbortItem { .. } | Transition::AbortSession { .. } => {}
            Transition::Complete => {}
        }
        run.touch();
    }
}
