//! Typed request/response contract between the engine and its task executors.
//!
//! Every external collaborator is reached through [`TaskExecutor::invoke`] with a
//! [`CapabilityRequest`]. The engine never depends on how an executor does its
//! work, only on the [`ExecutionResult`] it hands back.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ExecutorError;
use crate::gate::Finding;
use crate::learnings::LearningCategory;
use crate::state_machine::WorkItem;

/// A named category of external task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Implement,
    Verify,
    Review,
    Track,
    Publish,
    Notify,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::Implement,
        Capability::Verify,
        Capability::Review,
        Capability::Track,
        Capability::Publish,
        Capability::Notify,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Implement => "implement",
            Capability::Verify => "verify",
            Capability::Review => "review",
            Capability::Track => "track",
            Capability::Publish => "publish",
            Capability::Notify => "notify",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an `implement` invocation is asked to change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImplementScope {
    /// Build the target item.
    Item,
    /// Repair a regression in previously finished work, not the target item.
    FixRegression,
    /// Address findings raised by review or post-verification of the target item.
    AddressFindings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementRequest {
    pub item: WorkItem,
    pub scope: ImplementScope,
    #[serde(default)]
    pub findings: Vec<Finding>,
    /// Files already touched by earlier passes on this item.
    #[serde(default)]
    pub files_changed: Vec<String>,
    /// Rendered learnings context, empty when there is nothing to share.
    #[serde(default)]
    pub learnings: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyPurpose {
    /// Regression baseline over finished items before new work starts.
    Baseline,
    /// The new item plus a sample of finished items.
    Feature,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub purpose: VerifyPurpose,
    pub targets: Vec<WorkItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub item: WorkItem,
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub learnings: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TrackRequest {
    /// Move the item to Done in the tracker.
    MarkDone { item_id: String, summary: String },
    /// Append narrative to an item (the meta item in practice).
    Narrative { item_id: String, text: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PublishRequest {
    /// Commit the work for one item.
    Commit {
        item_id: String,
        title: String,
        category: String,
        files_changed: Vec<String>,
    },
    /// Publish the end-of-backlog summary.
    Summary { text: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyRequest {
    pub text: String,
}

/// One typed message per capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "capability", content = "request", rename_all = "snake_case")]
pub enum CapabilityRequest {
    Implement(ImplementRequest),
    Verify(VerifyRequest),
    Review(ReviewRequest),
    Track(TrackRequest),
    Publish(PublishRequest),
    Notify(NotifyRequest),
}

impl CapabilityRequest {
    pub fn capability(&self) -> Capability {
        match self {
            CapabilityRequest::Implement(_) => Capability::Implement,
            CapabilityRequest::Verify(_) => Capability::Verify,
            CapabilityRequest::Review(_) => Capability::Review,
            CapabilityRequest::Track(_) => Capability::Track,
            CapabilityRequest::Publish(_) => Capability::Publish,
            CapabilityRequest::Notify(_) => Capability::Notify,
        }
    }
}

/// A learning an executor wants carried into future sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedLearning {
    pub category: LearningCategory,
    pub text: String,
}

/// Structured result of one capability invocation.
///
/// Every field defaults so executors only report what applies to them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default)]
    pub files_changed: Vec<String>,
    /// Artifact references (screenshots, logs) backing the result.
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub learnings: Vec<ReportedLearning>,
    #[serde(default)]
    pub summary: String,
    /// External reference produced by the invocation, e.g. a commit hash.
    #[serde(default)]
    pub reference: Option<String>,
    /// Set by `track` once the tracker write is durable.
    #[serde(default)]
    pub confirmed: bool,
}

/// An external collaborator that performs bounded units of work.
#[allow(async_fn_in_trait)]
pub trait TaskExecutor {
    /// Capabilities this executor can serve.
    fn capabilities(&self) -> Vec<Capability>;

    async fn invoke(&self, request: &CapabilityRequest) -> Result<ExecutionResult, ExecutorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_reports_its_capability() {
        let req = CapabilityRequest::Notify(NotifyRequest { text: "hi".into() });
        assert_eq!(req.capability(), Capability::Notify);

        let req = CapabilityRequest::Track(TrackRequest::MarkDone {
            item_id: "F-1".into(),
            summary: "done".into(),
        });
        assert_eq!(req.capability(), Capability::Track);
    }

    #[test]
    fn request_wire_format_is_tagged() {
        let req = CapabilityRequest::Publish(PublishRequest::Summary {
            text: "all done".into(),
        });
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["capability"], "publish");
        assert_eq!(json["request"]["action"], "summary");
        assert_eq!(json["request"]["text"], "all done");
    }

    #[test]
    fn execution_result_fields_default() {
        let result: ExecutionResult = serde_json::from_str(r#"{"summary":"ok"}"#).unwrap();
        assert_eq!(result.summary, "ok");
        assert!(result.files_changed.is_empty());
        assert!(result.evidence.is_empty());
        assert!(!result.confirmed);
        assert_eq!(result.reference, None);
    }

    #[test]
    fn execution_result_parses_findings_and_learnings() {
        let json = r#"{
            "files_changed": ["src/app.tsx"],
            "findings": [{"severity": "low", "message": "unused import"}],
            "learnings": [{"category": "pattern", "text": "components live in src/ui"}]
        }"#;
        let result: ExecutionResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.files_changed, vec!["src/app.tsx"]);
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.learnings[0].category, LearningCategory::Pattern);
    }

    #[test]
    fn capability_display() {
        let names: Vec<String> = Capability::ALL.iter().map(|c| c.to_string()).collect();
        assert_eq!(
            names,
            vec!["implement", "verify", "review", "track", "publish", "notify"]
        );
    }
}
