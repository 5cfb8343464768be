use serde::Serialize;

use crate::error::PipelineError;
use crate::state_machine::{Backlog, ItemStatus, ProjectDescriptor, RunState, Step};

/// Literal line the surrounding harness waits for to stop the session loop.
pub const COMPLETION_SIGNAL: &str = "PROJECT_COMPLETE: All features implemented and verified.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompletionStatus {
    pub done: usize,
    pub total: usize,
    pub all_complete: bool,
}

impl CompletionStatus {
    pub fn remaining(&self) -> usize {
        self.total - self.done
    }
}

/// Decides whether the backlog is exhausted. The meta item never counts.
pub struct CompletionDetector;

impl CompletionDetector {
    pub fn check(backlog: &Backlog) -> Result<CompletionStatus, PipelineError> {
        backlog.check_invariants()?;
        let done = backlog.done_count();
        Ok(CompletionStatus {
            done,
            total: backlog.total_items,
            all_complete: done == backlog.total_items,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemSummary {
    pub id: String,
    pub title: String,
    pub priority: u32,
    pub status: ItemStatus,
}

/// Counts and per-item statuses shown by `gatework status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub project_id: String,
    pub done: usize,
    pub open: usize,
    pub in_progress: usize,
    pub total: usize,
    pub all_complete: bool,
    pub current_item_id: Option<String>,
    pub current_step: Option<Step>,
    pub items: Vec<ItemSummary>,
}

impl StatusSummary {
    pub fn collect(
        project: &ProjectDescriptor,
        backlog: &Backlog,
        run: &RunState,
    ) -> Result<Self, PipelineError> {
        let status = CompletionDetector::check(backlog)?;
        Ok(Self {
            project_id: project.project_id.clone(),
            done: status.done,
            open: backlog.count_with(ItemStatus::Open),
            in_progress: backlog.count_with(ItemStatus::InProgress),
            total: status.total,
            all_complete: status.all_complete,
            current_item_id: run.current_item_id.clone(),
            current_step: run.is_active().then_some(run.current_step),
            items: backlog
                .work_items()
                .map(|item| ItemSummary {
                    id: item.id.clone(),
                    title: item.title.clone(),
                    priority: item.priority,
                    status: item.status,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GateResult;
    use crate::state_machine::{ItemStatus, WorkItem};

    fn backlog(done: usize, open: usize) -> Backlog {
        let mut items = vec![WorkItem::new("META", "Session log", 0)];
        for i in 0..done + open {
            items.push(WorkItem::new(format!("F-{i}"), "feature", 1));
        }
        let mut backlog = Backlog::new("META", items).unwrap();
        for i in 0..done {
            backlog
                .mark_done(&format!("F-{i}"), &GateResult::pass(vec!["e.png".into()]))
                .unwrap();
        }
        backlog
    }

    #[test]
    fn four_of_five_is_not_complete() {
        let status = CompletionDetector::check(&backlog(4, 1)).unwrap();
        assert_eq!(status.done, 4);
        assert_eq!(status.total, 5);
        assert!(!status.all_complete);
        assert_eq!(status.remaining(), 1);
    }

    #[test]
    fn five_of_five_is_complete() {
        let status = CompletionDetector::check(&backlog(5, 0)).unwrap();
        assert!(status.all_complete);
    }

    #[test]
    fn meta_item_status_is_ignored() {
        let mut b = backlog(1, 1);
        b.items[0].status = ItemStatus::Done;
        let status = CompletionDetector::check(&b).unwrap();
        assert_eq!(status.done, 1);
        assert!(!status.all_complete);
    }

    #[test]
    fn done_over_total_is_an_invariant_violation() {
        let mut b = backlog(2, 0);
        b.items.push(WorkItem {
            status: ItemStatus::Done,
            ..WorkItem::new("F-late", "added later", 1)
        });
        assert!(CompletionDetector::check(&b).is_err());
    }

    #[test]
    fn status_summary_counts_and_run_position() {
        let mut b = backlog(1, 2);
        b.set_status("F-1", ItemStatus::InProgress).unwrap();
        let project = ProjectDescriptor {
            project_id: "shop".into(),
            total_items: b.total_items,
            meta_item_id: "META".into(),
            created_at: chrono::Utc::now(),
        };
        let mut run = RunState::idle();
        run.begin("F-1");
        run.current_step = Step::Review;

        let summary = StatusSummary::collect(&project, &b, &run).unwrap();
        assert_eq!((summary.done, summary.open, summary.in_progress), (1, 1, 1));
        assert_eq!(summary.total, 3);
        assert_eq!(summary.items.len(), 3);
        assert_eq!(summary.current_step, Some(Step::Review));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["items"][0]["status"], "Done");
    }

    #[test]
    fn signal_text_is_verbatim() {
        assert_eq!(
            COMPLETION_SIGNAL,
            "PROJECT_COMPLETE: All features implemented and verified."
        );
    }
}
