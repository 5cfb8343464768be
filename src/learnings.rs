//! Append-only learnings carried across sessions.
//!
//! Notes are grouped by [`LearningCategory`] and only ever appended. The
//! rendered form from [`Learnings::render`] is handed to `implement` and
//! `review` invocations so earlier sessions bias later ones.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const RECENT_PATTERNS: usize = 5;
const RECENT_MISTAKES: usize = 5;
const RECENT_FINDINGS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningCategory {
    Pattern,
    Mistake,
    Finding,
}

impl fmt::Display for LearningCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LearningCategory::Pattern => write!(f, "pattern"),
            LearningCategory::Mistake => write!(f, "mistake"),
            LearningCategory::Finding => write!(f, "finding"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Learnings {
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub notes: BTreeMap<LearningCategory, Vec<Note>>,
}

impl Learnings {
    pub fn append(&mut self, category: LearningCategory, text: impl Into<String>, item_id: Option<&str>) {
        self.notes.entry(category).or_default().push(Note {
            text: text.into(),
            item_id: item_id.map(str::to_string),
            recorded_at: Utc::now(),
        });
    }

    /// Append every note of `other` after the existing ones. Duplicates are kept.
    pub fn merge(&mut self, other: &Learnings) {
        for (category, notes) in &other.notes {
            self.notes
                .entry(*category)
                .or_default()
                .extend(notes.iter().cloned());
        }
    }

    pub fn get(&self, category: LearningCategory) -> &[Note] {
        self.notes.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.notes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Markdown context section for executor prompts. Empty when there are no notes.
    pub fn render(&self) -> String {
        let mut sections = Vec::new();

        let sources = [
            (LearningCategory::Pattern, "Effective Patterns", RECENT_PATTERNS),
            (LearningCategory::Mistake, "Common Mistakes to Avoid", RECENT_MISTAKES),
            (LearningCategory::Finding, "Recent Review Findings", RECENT_FINDINGS),
        ];
        for (category, heading, limit) in sources {
            let notes = self.get(category);
            if notes.is_empty() {
                continue;
            }
            let recent = &notes[notes.len().saturating_sub(limit)..];
            let lines: Vec<String> = recent.iter().map(|n| format!("- {}", n.text)).collect();
            sections.push(format!("### {heading}\n{}", lines.join("\n")));
        }

        if sections.is_empty() {
            return String::new();
        }
        format!("## Codebase context (from past sessions)\n\n{}", sections.join("\n\n"))
    }
}
