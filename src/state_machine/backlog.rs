use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::gate::GateResult;

/// Lifecycle status of a backlog item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemStatus {
    #[default]
    Open,
    InProgress,
    Done,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemStatus::Open => write!(f, "Open"),
            ItemStatus::InProgress => write!(f, "In Progress"),
            ItemStatus::Done => write!(f, "Done"),
        }
    }
}

fn default_true() -> bool {
    true
}

/// A single unit of work in the backlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Ordered verification steps.
    #[serde(default)]
    pub test_criteria: Vec<String>,
    #[serde(default)]
    pub category: String,
    /// Lower is more urgent.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub status: ItemStatus,
    /// Whether the item produces behaviour a user can observe (and so needs evidence).
    #[serde(default = "default_true")]
    pub user_observable: bool,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>, priority: u32) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            test_criteria: Vec::new(),
            category: String::new(),
            priority,
            status: ItemStatus::Open,
            user_observable: true,
            completed_at: None,
        }
    }
}

/// Identity of the project, written once by `init` and read at every session start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDescriptor {
    pub project_id: String,
    pub total_items: usize,
    pub meta_item_id: String,
    pub created_at: DateTime<Utc>,
}

/// Priority-ordered work items plus the declared total fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backlog {
    #[serde(default)]
    pub revision: u64,
    pub meta_item_id: String,
    pub total_items: usize,
    pub items: Vec<WorkItem>,
}

impl Backlog {
    /// Build a backlog, fixing `total_items` to the number of non-meta items.
    pub fn new(meta_item_id: impl Into<String>, items: Vec<WorkItem>) -> Result<Self, PipelineError> {
        let meta_item_id = meta_item_id.into();
        let mut seen = HashSet::new();
        for item in &items {
            if !seen.insert(item.id.as_str()) {
                return Err(PipelineError::Invariant(format!(
                    "duplicate work item id {}",
                    item.id
                )));
            }
        }
        let total_items = items.iter().filter(|i| i.id != meta_item_id).count();
        let backlog = Self {
            revision: 0,
            meta_item_id,
            total_items,
            items,
        };
        backlog.check_invariants()?;
        Ok(backlog)
    }

    pub fn is_meta(&self, id: &str) -> bool {
        id == self.meta_item_id
    }

    /// Items that take part in completion arithmetic.
    pub fn work_items(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.iter().filter(move |i| !self.is_meta(&i.id))
    }

    pub fn done_count(&self) -> usize {
        self.work_items()
            .filter(|i| i.status == ItemStatus::Done)
            .count()
    }

    pub fn count_with(&self, status: ItemStatus) -> usize {
        self.work_items().filter(|i| i.status == status).count()
    }

    pub fn get(&self, id: &str) -> Option<&WorkItem> {
        self.items.iter().find(|i| i.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut WorkItem, PipelineError> {
        self.items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| PipelineError::ItemNotFound(id.to_string()))
    }

    /// `done_count` never exceeds `total_items`.
    pub fn check_invariants(&self) -> Result<(), PipelineError> {
        let done = self.done_count();
        if done > self.total_items {
            return Err(PipelineError::Invariant(format!(
                "done count {done} exceeds declared total {}",
                self.total_items
            )));
        }
        Ok(())
    }

    /// Highest-priority unfinished item not in `skip`. Ties keep backlog order.
    pub fn next_open(&self, skip: &HashSet<String>) -> Option<&WorkItem> {
        self.work_items()
            .enumerate()
            .filter(|(_, i)| i.status != ItemStatus::Done && !skip.contains(&i.id))
            .min_by_key(|(pos, i)| (i.priority, *pos))
            .map(|(_, i)| i)
    }

    pub fn done_items(&self) -> Vec<&WorkItem> {
        self.work_items()
            .filter(|i| i.status == ItemStatus::Done)
            .collect()
    }

    /// Up to `n` finished items, most recently completed first.
    pub fn recent_done(&self, n: usize, exclude: &str) -> Vec<&WorkItem> {
        let mut done: Vec<&WorkItem> = self
            .done_items()
            .into_iter()
            .filter(|i| i.id != exclude)
            .collect();
        done.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        done.truncate(n);
        done
    }

    /// Move an unfinished item between Open and InProgress.
    ///
    /// Done is reachable only through [`Backlog::mark_done`] and is never left.
    pub fn set_status(&mut self, id: &str, status: ItemStatus) -> Result<(), PipelineError> {
        if status == ItemStatus::Done {
            return Err(PipelineError::Invariant(format!(
                "{id} can only become Done through a verified wrap-up"
            )));
        }
        let item = self.get_mut(id)?;
        if item.status == ItemStatus::Done {
            return Err(PipelineError::Invariant(format!(
                "{id} is Done and cannot move back to {status}"
            )));
        }
        item.status = status;
        Ok(())
    }

    /// Record an item as Done. Requires a passing, evidenced verification.
    ///
    /// Returns `false` when the item was already Done.
    pub fn mark_done(&mut self, id: &str, verified: &GateResult) -> Result<bool, PipelineError> {
        if self.is_meta(id) {
            return Err(PipelineError::Invariant(format!(
                "meta item {id} is never marked Done"
            )));
        }
        if !verified.is_verified() {
            return Err(PipelineError::Invariant(format!(
                "{id} has no passing verification with evidence"
            )));
        }
        let done = self.done_count();
        let total = self.total_items;
        let item = self.get_mut(id)?;
        if item.status == ItemStatus::Done {
            return Ok(false);
        }
        if done + 1 > total {
            return Err(PipelineError::Invariant(format!(
                "marking {id} Done would exceed declared total {total}"
            )));
        }
        item.status = ItemStatus::Done;
        item.completed_at = Some(Utc::now());
        Ok(true)
    }
}
