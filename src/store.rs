//! Durable session documents under the state directory (`.gatework/` by default).
//!
//! Every document is replaced whole, never patched. Documents that change during
//! a session carry a `revision`; a save is rejected when the on-disk revision no
//! longer matches the one the caller loaded, so a second writer shows up as a
//! [`PipelineError::RevisionConflict`] instead of silently clobbering state.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::PipelineError;
use crate::learnings::Learnings;
use crate::state_machine::{Backlog, ProjectDescriptor, RunState};

const PROJECT_FILE: &str = "project.json";
const BACKLOG_FILE: &str = "backlog.json";
const RUN_STATE_FILE: &str = "run_state.json";
const LEARNINGS_FILE: &str = "learnings.json";

/// A document guarded by optimistic versioning.
pub trait Revisioned: Serialize + DeserializeOwned {
    const NAME: &'static str;

    fn revision(&self) -> u64;
    fn set_revision(&mut self, revision: u64);
}

impl Revisioned for Backlog {
    const NAME: &'static str = "backlog";

    fn revision(&self) -> u64 {
        self.revision
    }

    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }
}

impl Revisioned for RunState {
    const NAME: &'static str = "run state";

    fn revision(&self) -> u64 {
        self.revision
    }

    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }
}

impl Revisioned for Learnings {
    const NAME: &'static str = "learnings";

    fn revision(&self) -> u64 {
        self.revision
    }

    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }
}

#[derive(serde::Deserialize)]
struct RevisionOnly {
    #[serde(default)]
    revision: u64,
}

/// File-backed store for the project descriptor, backlog, run state and learnings.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn is_initialized(&self) -> bool {
        self.path(PROJECT_FILE).exists()
    }

    /// Write the project descriptor and initial backlog. Refuses to run twice.
    pub fn initialize(
        &self,
        project_id: &str,
        backlog: &mut Backlog,
    ) -> Result<ProjectDescriptor, PipelineError> {
        if self.is_initialized() {
            return Err(PipelineError::AlreadyInitialized(
                self.root.display().to_string(),
            ));
        }
        let descriptor = ProjectDescriptor {
            project_id: project_id.to_string(),
            total_items: backlog.total_items,
            meta_item_id: backlog.meta_item_id.clone(),
            created_at: Utc::now(),
        };
        self.save_backlog(backlog)?;
        write_json(&self.path(PROJECT_FILE), &descriptor)?;
        Ok(descriptor)
    }

    pub fn load_project(&self) -> Result<ProjectDescriptor, PipelineError> {
        read_json(&self.path(PROJECT_FILE))?.ok_or(PipelineError::NotInitialized)
    }

    /// Load the backlog and check it against the descriptor's declared total.
    pub fn load_backlog(&self, project: &ProjectDescriptor) -> Result<Backlog, PipelineError> {
        let backlog: Backlog =
            read_json(&self.path(BACKLOG_FILE))?.ok_or(PipelineError::NotInitialized)?;
        if backlog.total_items != project.total_items
            || backlog.meta_item_id != project.meta_item_id
        {
            return Err(PipelineError::Invariant(format!(
                "backlog declares {} items (meta {}), project declares {} (meta {})",
                backlog.total_items,
                backlog.meta_item_id,
                project.total_items,
                project.meta_item_id
            )));
        }
        backlog.check_invariants()?;
        Ok(backlog)
    }

    pub fn save_backlog(&self, backlog: &mut Backlog) -> Result<(), PipelineError> {
        save_document(&self.path(BACKLOG_FILE), backlog)
    }

    /// Load the run state, or an idle one when none has been written yet.
    pub fn load_run_state(&self) -> Result<RunState, PipelineError> {
        Ok(read_json(&self.path(RUN_STATE_FILE))?.unwrap_or_else(RunState::idle))
    }

    pub fn save_run_state(&self, run: &mut RunState) -> Result<(), PipelineError> {
        save_document(&self.path(RUN_STATE_FILE), run)
    }

    pub fn load_learnings(&self) -> Result<Learnings, PipelineError> {
        Ok(read_json(&self.path(LEARNINGS_FILE))?.unwrap_or_default())
    }

    /// Merge `additions` into the on-disk learnings by append and return the result.
    pub fn append_learnings(&self, additions: &Learnings) -> Result<Learnings, PipelineError> {
        let mut current = self.load_learnings()?;
        if additions.is_empty() {
            return Ok(current);
        }
        current.merge(additions);
        save_document(&self.path(LEARNINGS_FILE), &mut current)?;
        Ok(current)
    }
}

fn save_document<T: Revisioned>(path: &Path, doc: &mut T) -> Result<(), PipelineError> {
    let on_disk = read_json::<RevisionOnly>(path)?
        .map(|r| r.revision)
        .unwrap_or(0);
    if on_disk != doc.revision() {
        return Err(PipelineError::RevisionConflict {
            document: T::NAME.to_string(),
            expected: doc.revision(),
            found: on_disk,
        });
    }
    doc.set_revision(on_disk + 1);
    debug!(document = T::NAME, revision = on_disk + 1, "saving document");
    if let Err(e) = write_json(path, doc) {
        doc.set_revision(on_disk);
        return Err(e);
    }
    Ok(())
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PipelineError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&contents)?))
}

/// Atomically write JSON (temp file + rename).
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learnings::LearningCategory;
    use crate::state_machine::{Step, WorkItem};
    use tempfile::TempDir;

    fn sample_backlog() -> Backlog {
        Backlog::new(
            "META",
            vec![
                WorkItem::new("META", "Session log", 0),
                WorkItem::new("F-1", "Login", 1),
                WorkItem::new("F-2", "Logout", 2),
            ],
        )
        .unwrap()
    }

    fn initialized() -> (TempDir, SessionStore, ProjectDescriptor) {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path().join(".gatework"));
        let mut backlog = sample_backlog();
        let project = store.initialize("demo", &mut backlog).unwrap();
        (tmp, store, project)
    }

    #[test]
    fn initialize_writes_descriptor_once() {
        let (_tmp, store, project) = initialized();
        assert_eq!(project.total_items, 2);
        assert_eq!(project.meta_item_id, "META");
        assert_eq!(store.load_project().unwrap(), project);

        let mut again = sample_backlog();
        let err = store.initialize("demo", &mut again).unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyInitialized(_)));
    }

    #[test]
    fn load_project_before_init_fails() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());
        assert!(matches!(
            store.load_project().unwrap_err(),
            PipelineError::NotInitialized
        ));
    }

    #[test]
    fn backlog_roundtrip_bumps_revision() {
        let (_tmp, store, project) = initialized();
        let mut backlog = store.load_backlog(&project).unwrap();
        assert_eq!(backlog.revision, 1);

        store.save_backlog(&mut backlog).unwrap();
        assert_eq!(backlog.revision, 2);
        assert_eq!(store.load_backlog(&project).unwrap().revision, 2);
    }

    #[test]
    fn stale_writer_is_rejected() {
        let (_tmp, store, project) = initialized();
        let mut first = store.load_backlog(&project).unwrap();
        let mut second = store.load_backlog(&project).unwrap();

        store.save_backlog(&mut first).unwrap();
        let err = store.save_backlog(&mut second).unwrap_err();
        match err {
            PipelineError::RevisionConflict {
                expected, found, ..
            } => {
                assert_eq!(expected, 1);
                assert_eq!(found, 2);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(second.revision, 1);
    }

    #[test]
    fn backlog_total_mismatch_is_rejected() {
        let (_tmp, store, mut project) = initialized();
        project.total_items = 5;
        assert!(matches!(
            store.load_backlog(&project).unwrap_err(),
            PipelineError::Invariant(_)
        ));
    }

    #[test]
    fn run_state_defaults_to_idle_then_persists() {
        let (_tmp, store, _) = initialized();
        let mut run = store.load_run_state().unwrap();
        assert!(!run.is_active());

        run.begin("F-1");
        run.current_step = Step::Review;
        run.merge_files(&["src/login.rs".into()]);
        store.save_run_state(&mut run).unwrap();

        let loaded = store.load_run_state().unwrap();
        assert_eq!(loaded.current_step, Step::Review);
        assert_eq!(loaded.files_changed, vec!["src/login.rs"]);
        assert_eq!(loaded.revision, 1);
    }

    #[test]
    fn learnings_merge_by_append() {
        let (_tmp, store, _) = initialized();
        let mut first = Learnings::default();
        first.append(LearningCategory::Pattern, "first", None);
        store.append_learnings(&first).unwrap();

        let mut second = Learnings::default();
        second.append(LearningCategory::Pattern, "second", None);
        let merged = store.append_learnings(&second).unwrap();

        let texts: Vec<&str> = merged
            .get(LearningCategory::Pattern)
            .iter()
            .map(|n| n.text.as_str())
            .collect();
        assert_eq!(texts, vec!["first", "second"]);
        assert_eq!(store.load_learnings().unwrap().len(), 2);
    }

    #[test]
    fn write_leaves_no_temp_file() {
        let (_tmp, store, _) = initialized();
        assert!(store.root().join("backlog.json").exists());
        assert!(!store.root().join("backlog.json.tmp").exists());
    }
}
