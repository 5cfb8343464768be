mod backlog;
mod run;
mod step;

pub use backlog::{Backlog, ItemStatus, ProjectDescriptor, WorkItem};
pub use run::{AuditRecord, RetryConfig, RunOutcome, RunState};
pub use step::{StateMachine, Step, Transition};
