//! Triage classifier.
//!
//! Decides the first destination of a newly received item from its content
//! alone. Rules are evaluated in order and the first match wins:
//!
//! 1. "DONE" or "COMPLETED" as a whole word -> Archived
//! 2. contains a question mark -> Working
//! 3. contains an action verb -> Working
//! 4. has an unchecked checklist entry -> Working
//! 5. has a checklist with every entry checked -> Archived
//! 6. anything else -> Working

use regex::Regex;

use foreman_core::types::{parse_checklist, Stage};

use crate::rules::RuleTable;

/// Verbs that mark content as something to act on.
pub const ACTION_VERBS: &[&str] = &[
    "send", "create", "update", "fix", "add", "remove", "delete", "change", "implement",
    "deploy", "review",
];

/// Where an item goes and which rule sent it there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriageDecision {
    pub destination: Stage,
    pub rule_id: u8,
}

/// Pure content classifier backed by an ordered rule table.
pub struct TriageClassifier {
    table: RuleTable<str, Stage>,
}

impl Default for TriageClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl TriageClassifier {
    pub fn new() -> Self {
        let done = Regex::new(r"(?i)\b(?:done|completed)\b").expect("Invalid done regex");
        let verbs = verb_regex();

        let table = RuleTable::new()
            .when(1, "marked_done", move |c: &str| done.is_match(c), Stage::Archived)
            .when(2, "question", |c: &str| c.contains('?'), Stage::Working)
            .when(3, "action_verb", move |c: &str| verbs.is_match(c), Stage::Working)
            .when(
                4,
                "open_checklist",
                |c: &str| parse_checklist(c).iter().any(|e| !e.checked),
                Stage::Working,
            )
            .when(
                5,
                "checklist_complete",
                |c: &str| {
                    let entries = parse_checklist(c);
                    !entries.is_empty() && entries.iter().all(|e| e.checked)
                },
                Stage::Archived,
            )
            .when(6, "default", |_: &str| true, Stage::Working);

        Self { table }
    }

    /// Classify item content. Same input, same answer.
    pub fn classify(&self, content: &str) -> TriageDecision {
        match self.table.evaluate(content) {
            Some(m) => TriageDecision {
                destination: m.outcome,
                rule_id: m.rule_id,
            },
            // Unreachable while the default rule is last.
            None => TriageDecision {
                destination: Stage::Working,
                rule_id: 6,
            },
        }
    }
}

/// Whole-word, case-insensitive match of any action verb.
pub(crate) fn verb_regex() -> Regex {
    Regex::new(&format!(r"(?i)\b(?:{})\b", ACTION_VERBS.join("|"))).expect("Invalid verb regex")
}
