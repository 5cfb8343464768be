//! Gate policy: classifies an executor result as Pass, Warn or Fail.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capability::{Capability, ExecutionResult};

/// Finding code attached when a verification result carries no evidence.
pub const EVIDENCE_MISSING: &str = "evidence-missing";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High and critical findings block the gate.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A structured issue reported by an executor or raised by the gate itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Finding {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            code: None,
            location: None,
        }
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }

    fn evidence_missing(capability: Capability) -> Self {
        Finding::new(
            Severity::High,
            format!("{capability} result claims success without evidence"),
        )
        .with_code(EVIDENCE_MISSING)
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.message)?;
        if let Some(location) = &self.location {
            write!(f, " ({location})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Warn => write!(f, "WARN"),
            Verdict::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub verdict: Verdict,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl GateResult {
    /// A passing verdict with no findings.
    pub fn pass(evidence: Vec<String>) -> Self {
        Self {
            verdict: Verdict::Pass,
            evidence,
            findings: Vec::new(),
        }
    }

    /// A failing verdict carrying a single finding.
    pub fn fail(finding: Finding) -> Self {
        Self {
            verdict: Verdict::Fail,
            evidence: Vec::new(),
            findings: vec![finding],
        }
    }

    /// Pass backed by at least one evidence reference.
    pub fn is_verified(&self) -> bool {
        self.verdict == Verdict::Pass && !self.evidence.is_empty()
    }

    /// One-line summary of the blocking findings, for logs and retry reasons.
    pub fn reason(&self) -> String {
        let blocking: Vec<String> = self
            .findings
            .iter()
            .filter(|f| f.severity.is_blocking())
            .map(|f| f.to_string())
            .collect();
        if blocking.is_empty() {
            format!("gate returned {}", self.verdict)
        } else {
            blocking.join("; ")
        }
    }
}

/// Interprets executor results against the pass/warn/fail policy.
pub struct GateEvaluator;

impl GateEvaluator {
    /// Fail on any critical/high finding, warn on medium/low only, pass otherwise.
    ///
    /// A `verify` result must carry evidence: a clean result without any is a Fail
    /// with an [`EVIDENCE_MISSING`] finding, never a silent pass.
    pub fn evaluate(capability: Capability, result: &ExecutionResult) -> GateResult {
        let mut findings = result.findings.clone();

        let mut verdict = match findings.iter().map(|f| f.severity).max() {
            Some(s) if s.is_blocking() => Verdict::Fail,
            Some(_) => Verdict::Warn,
            None => Verdict::Pass,
        };

        if capability == Capability::Verify && result.evidence.is_empty() {
            findings.push(Finding::evidence_missing(capability));
            verdict = Verdict::Fail;
        }

        GateResult {
            verdict,
            evidence: result.evidence.clone(),
            findings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(findings: Vec<Finding>, evidence: &[&str]) -> ExecutionResult {
        ExecutionResult {
            findings,
            evidence: evidence.iter().map(|e| e.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn critical_review_finding_fails() {
        let result = result_with(vec![Finding::new(Severity::Critical, "SQL injection")], &[]);
        let gate = GateEvaluator::evaluate(Capability::Review, &result);
        assert_eq!(gate.verdict, Verdict::Fail);
        assert_eq!(gate.reason(), "[critical] SQL injection");
    }

    #[test]
    fn high_finding_fails() {
        let result = result_with(vec![Finding::new(Severity::High, "XSS")], &[]);
        assert_eq!(
            GateEvaluator::evaluate(Capability::Review, &result).verdict,
            Verdict::Fail
        );
    }

    #[test]
    fn low_findings_warn() {
        let result = result_with(
            vec![
                Finding::new(Severity::Low, "naming"),
                Finding::new(Severity::Medium, "missing test"),
            ],
            &[],
        );
        let gate = GateEvaluator::evaluate(Capability::Review, &result);
        assert_eq!(gate.verdict, Verdict::Warn);
        assert_eq!(gate.findings.len(), 2);
    }

    #[test]
    fn clean_review_passes_without_evidence() {
        let gate = GateEvaluator::evaluate(Capability::Review, &ExecutionResult::default());
        assert_eq!(gate.verdict, Verdict::Pass);
        assert!(gate.findings.is_empty());
    }

    #[test]
    fn verify_without_evidence_fails() {
        let gate = GateEvaluator::evaluate(Capability::Verify, &ExecutionResult::default());
        assert_eq!(gate.verdict, Verdict::Fail);
        assert_eq!(gate.findings[0].code.as_deref(), Some(EVIDENCE_MISSING));
        assert!(!gate.is_verified());
    }

    #[test]
    fn verify_with_evidence_passes() {
        let result = result_with(vec![], &["screenshots/login.png"]);
        let gate = GateEvaluator::evaluate(Capability::Verify, &result);
        assert!(gate.is_verified());
        assert_eq!(gate.evidence, vec!["screenshots/login.png"]);
    }

    #[test]
    fn verify_with_low_findings_and_evidence_warns() {
        let result = result_with(vec![Finding::new(Severity::Low, "slow render")], &["a.png"]);
        let gate = GateEvaluator::evaluate(Capability::Verify, &result);
        assert_eq!(gate.verdict, Verdict::Warn);
        assert!(!gate.is_verified());
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Medium > Severity::Low);
        assert!(!Severity::Medium.is_blocking());
    }

    #[test]
    fn finding_display_includes_location() {
        let mut f = Finding::new(Severity::Medium, "magic number");
        f.location = Some("src/lib.rs:10".into());
        assert_eq!(f.to_string(), "[medium] magic number (src/lib.rs:10)");
    }
}
