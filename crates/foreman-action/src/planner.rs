//! Plan generator.
//!
//! Turns item content into a structured plan: an objective, 3 to 8 ordered
//! steps, a priority, and whether a human must approve before execution.
//! Generation is a pure function of the content; the timestamp only feeds
//! the plan's metadata.

use std::collections::HashMap;

use regex::Regex;

use foreman_core::types::{parse_checklist, ItemId, Plan, PlanStep, Priority, Timestamp, WorkItem};

use crate::rules::RuleTable;
use crate::triage::verb_regex;

pub const URGENCY_WORDS: &[&str] = &[
    "urgent", "asap", "critical", "overdue", "immediately", "deadline", "emergency", "blocker",
    "breaking", "p0", "p1",
];
const FINANCIAL_WORDS: &[&str] = &["payment", "invoice", "money", "cost", "budget", "spend"];
const SECURITY_WORDS: &[&str] = &[
    "security", "password", "credential", "credentials", "permission", "permissions", "access",
    "breach", "vulnerability",
];
const OUTAGE_WORDS: &[&str] = &["outage", "incident", "downtime", "crash", "crashed"];
const PUBLIC_WORDS: &[&str] = &["homepage", "website", "banner", "public", "client", "customer"];
const DESTRUCTIVE_WORDS: &[&str] = &["delete", "remove", "drop", "purge", "erase", "archive"];

pub const VERIFY_STEP: &str = "Verify the result meets the task requirements";
pub const ARCHIVE_STEP: &str = "Archive the completed task";
const MERGED_PREFIX: &str = "Complete remaining items: ";

/// Plan generator with its keyword tables compiled once.
pub struct PlanGenerator {
    priority: RuleTable<str, (Priority, String)>,
    approval: RuleTable<str, String>,
    verbs: Regex,
    clause_sep: Regex,
    and_verb: Regex,
    bold: Regex,
    italic: Regex,
    link: Regex,
    list_marker: Regex,
}

impl Default for PlanGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanGenerator {
    pub fn new() -> Self {
        let urgency = keyword_regex(URGENCY_WORDS);
        let financial = financial_regex();
        let security = keyword_regex(SECURITY_WORDS);
        let outage = keyword_regex(OUTAGE_WORDS);
        let verbs = verb_regex();

        let priority = {
            let verbs = verbs.clone();
            let financial = financial.clone();
            let security = security.clone();
            RuleTable::new()
                .rule(1, "urgency", move |c: &str| {
                    first_keyword(&urgency, c).map(|w| {
                        (Priority::High, format!("Contains urgency indicator: \"{}\"", w))
                    })
                })
                .rule(2, "financial", move |c: &str| {
                    first_keyword(&financial, c)
                        .map(|w| (Priority::High, format!("Involves financial content: \"{}\"", w)))
                })
                .rule(3, "security", move |c: &str| {
                    first_keyword(&security, c)
                        .map(|w| (Priority::High, format!("Touches security or access: \"{}\"", w)))
                })
                .rule(4, "outage", move |c: &str| {
                    first_keyword(&outage, c)
                        .map(|w| (Priority::High, format!("Reports an outage: \"{}\"", w)))
                })
                .when(
                    5,
                    "action_verb",
                    move |c: &str| verbs.is_match(c),
                    (
                        Priority::Medium,
                        "Contains action verbs with no urgency signals".to_string(),
                    ),
                )
                .when(
                    6,
                    "question",
                    |c: &str| c.contains('?'),
                    (
                        Priority::Low,
                        "Informational or exploratory, contains questions only".to_string(),
                    ),
                )
                .when(
                    7,
                    "default",
                    |_: &str| true,
                    (
                        Priority::Medium,
                        "Default priority for actionable content".to_string(),
                    ),
                )
        };

        let public = keyword_regex(PUBLIC_WORDS);
        let destructive = keyword_regex(DESTRUCTIVE_WORDS);
        let approval = RuleTable::new()
            .rule(1, "financial", move |c: &str| {
                first_keyword(&financial, c)
                    .map(|w| format!("Involves financial content (\"{}\")", w))
            })
            .rule(2, "public_facing", move |c: &str| {
                first_keyword(&public, c).map(|w| format!("Public-facing change (\"{}\")", w))
            })
            .rule(3, "destructive", move |c: &str| {
                first_keyword(&destructive, c).map(|w| format!("Destructive action (\"{}\")", w))
            })
            .rule(4, "security", move |c: &str| {
                first_keyword(&security, c)
                    .map(|w| format!("Security or credential change (\"{}\")", w))
            })
            .rule(5, "insufficient", |c: &str| {
                match c.lines().filter(|l| !l.trim().is_empty()).count() {
                    0 => Some("Task is empty and needs clarification".to_string()),
                    1 => Some("Task is too brief and may need clarification".to_string()),
                    _ => None,
                }
            });

        Self {
            priority,
            approval,
            verbs,
            clause_sep: Regex::new(r"(?i)\s*;\s*(?:then\s+)?|\s*,?\s+and then\s+|\s*,?\s+then\s+")
                .expect("Invalid clause regex"),
            and_verb: Regex::new(&format!(
                r"(?i)\s+and\s+((?:{})\b)",
                crate::triage::ACTION_VERBS.join("|")
            ))
            .expect("Invalid conjunction regex"),
            bold: Regex::new(r"\*\*(.+?)\*\*").expect("Invalid bold regex"),
            italic: Regex::new(r"\*(.+?)\*").expect("Invalid italic regex"),
            link: Regex::new(r"\[(.+?)\]\(.*?\)").expect("Invalid link regex"),
            list_marker: Regex::new(r"^(?:\d+[.)]\s*|[-*+]\s+(?:\[[ xX]\]\s*)?)")
                .expect("Invalid list marker regex"),
        }
    }

    /// Generate the plan for one item.
    pub fn generate(&self, item_id: &ItemId, title: &str, content: &str, now: Timestamp) -> Plan {
        let title = collapse(title);
        let (priority, priority_reason) = self
            .priority
            .evaluate(content)
            .map(|m| m.outcome)
            .unwrap_or((Priority::Medium, "Default priority for actionable content".into()));
        let approval = self.approval.evaluate(content);

        Plan {
            item_id: item_id.clone(),
            objective: self.objective(&title, content),
            steps: self.steps(&title, content),
            priority,
            priority_reason,
            approval_required: approval.is_some(),
            approval_reason: approval.map(|m| m.outcome).unwrap_or_else(|| {
                "Task is clear and does not involve sensitive operations".to_string()
            }),
            suggested_output: suggested_output(&title, content),
            created_at: now,
        }
    }

    pub fn generate_for(&self, item: &WorkItem, now: Timestamp) -> Plan {
        self.generate(&item.id, &item.title, &item.body, now)
    }

    // =========================================================================
    // Objective
    // =========================================================================

    fn objective(&self, title: &str, content: &str) -> String {
        let lines = self.meaningful_lines(content);

        if let Some(sentence) = self.verb_sentence(&lines) {
            return sentence;
        }
        if let Some(line) = lines.iter().find(|l| l.chars().count() > 10) {
            return line.clone();
        }
        format!("Complete the task: {}", title)
    }

    /// "<Verb> <object>." built from the most frequent action verb.
    fn verb_sentence(&self, lines: &[String]) -> Option<String> {
        let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
        let mut order = 0;
        for line in lines {
            for m in self.verbs.find_iter(line) {
                let entry = counts
                    .entry(m.as_str().to_lowercase())
                    .or_insert((0, order));
                entry.0 += 1;
                order += 1;
            }
        }
        let (verb, _) = counts
            .iter()
            .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then(b.1 .1.cmp(&a.1 .1)))?;

        for line in lines {
            let found = self
                .verbs
                .find_iter(line)
                .find(|m| m.as_str().eq_ignore_ascii_case(verb));
            let Some(m) = found else { continue };

            let rest = &line[m.end()..];
            let end = rest.find(['.', '?', '!', ';']).unwrap_or(rest.len());
            let object = rest[..end].trim().trim_end_matches([',', ':']).trim();
            if object.is_empty() {
                continue;
            }
            return Some(format!("{} {}.", capitalize(verb), object));
        }
        None
    }

    // =========================================================================
    // Steps
    // =========================================================================

    /// Action steps with the checklist positions each one covers. Blank
    /// checklist entries get no step.
    fn steps(&self, title: &str, content: &str) -> Vec<PlanStep> {
        let checklist = parse_checklist(content);
        let actions: Vec<PlanStep> = if checklist.is_empty() {
            self.meaningful_lines(content)
                .iter()
                .flat_map(|line| self.clauses(line))
                .map(PlanStep::new)
                .collect()
        } else {
            checklist
                .iter()
                .enumerate()
                .filter(|(_, e)| !e.checked)
                .map(|(pos, e)| (pos, collapse(&e.text)))
                .filter(|(_, text)| !text.is_empty())
                .map(|(pos, text)| PlanStep::new(text).covering(vec![pos]))
                .collect()
        };
        clamp_steps(title, actions)
    }

    /// Split one line into action clauses.
    fn clauses(&self, line: &str) -> Vec<String> {
        let mut out = Vec::new();
        for piece in self.clause_sep.split(line) {
            let mut start = 0;
            for caps in self.and_verb.captures_iter(piece) {
                let (Some(whole), Some(verb)) = (caps.get(0), caps.get(1)) else {
                    continue;
                };
                push_clause(&mut out, &piece[start..whole.start()]);
                start = verb.start();
            }
            push_clause(&mut out, &piece[start..]);
        }
        out
    }

    /// Non-empty, non-heading lines with list markers and inline markup removed.
    fn meaningful_lines(&self, content: &str) -> Vec<String> {
        content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| {
                let l = self.list_marker.replace(l, "");
                let l = self.bold.replace_all(&l, "$1");
                let l = self.italic.replace_all(&l, "$1");
                let l = self.link.replace_all(&l, "$1");
                collapse(&l)
            })
            .filter(|l| !l.is_empty())
            .collect()
    }
}

/// Clamp action steps so the plan has 3 to 8 steps and always ends with the
/// verification and archive steps.
fn clamp_steps(title: &str, mut actions: Vec<PlanStep>) -> Vec<PlanStep> {
    let closing = [VERIFY_STEP, ARCHIVE_STEP];
    let max_actions = Plan::MAX_STEPS - closing.len();

    if actions.len() > max_actions {
        let overflow = actions.split_off(max_actions - 1);
        let texts: Vec<&str> = overflow.iter().map(|s| s.description.as_str()).collect();
        let covers = overflow.iter().flat_map(|s| s.covers.iter().copied()).collect();
        actions.push(
            PlanStep::new(format!("{}{}", MERGED_PREFIX, texts.join("; "))).covering(covers),
        );
    }
    if actions.len() + closing.len() < Plan::MIN_STEPS {
        actions.insert(0, PlanStep::new(format!("Review the task: \"{}\"", title)));
    }

    actions
        .into_iter()
        .chain(closing.iter().map(|s| PlanStep::new(*s)))
        .collect()
}

fn suggested_output(title: &str, content: &str) -> String {
    if content.trim().is_empty() {
        return "A clarified task description with actionable details.".to_string();
    }
    let open: Vec<String> = parse_checklist(content)
        .into_iter()
        .filter(|e| !e.checked && !e.text.trim().is_empty())
        .take(3)
        .map(|e| collapse(&e.text))
        .collect();
    if open.is_empty() {
        format!("Completed task: \"{}\" with all requirements fulfilled.", title)
    } else {
        format!("Completed deliverables: {}.", open.join(", "))
    }
}

fn push_clause(out: &mut Vec<String>, raw: &str) {
    let clause = raw.trim().trim_end_matches(['.', ',']).trim();
    if !clause.is_empty() {
        out.push(clause.to_string());
    }
}

fn keyword_regex(words: &[&str]) -> Regex {
    Regex::new(&format!(r"(?i)\b({})\b", words.join("|"))).expect("Invalid keyword regex")
}

fn financial_regex() -> Regex {
    Regex::new(&format!(
        r"(?i)(\$\s?\d[\d,]*(?:\.\d+)?|\b(?:{})\b)",
        FINANCIAL_WORDS.join("|")
    ))
    .expect("Invalid financial regex")
}

fn first_keyword(re: &Regex, content: &str) -> Option<String> {
    re.captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::document::{parse_plan_document, render_plan_document};

    const T0: Timestamp = Timestamp(1_700_000_000);

    fn plan(title: &str, content: &str) -> Plan {
        PlanGenerator::new().generate(&ItemId::derive("inbox", "t.md"), title, content, T0)
    }

    fn descriptions(plan: &Plan) -> Vec<&str> {
        plan.steps.iter().map(|s| s.description.as_str()).collect()
    }

    #[test]
    fn test_invoice_overdue_is_high_and_needs_approval() {
        let p = plan(
            "Vendor invoice",
            "The $5,000 invoice from Acme is overdue.\nPay it this week.",
        );
        assert_eq!(p.priority, Priority::High);
        assert!(p.priority_reason.contains("overdue"));
        assert!(p.approval_required);
        assert!(p.approval_reason.contains("$5,000"));
    }

    #[test]
    fn test_action_verb_is_medium() {
        let p = plan("Docs", "Update the onboarding docs\nwith the new screenshots");
        assert_eq!(p.priority, Priority::Medium);
        assert_eq!(p.priority_reason, "Contains action verbs with no urgency signals");
        assert!(!p.approval_required);
    }

    #[test]
    fn test_question_only_is_low() {
        let p = plan("Question", "What is our policy on this?\nJust curious.");
        assert_eq!(p.priority, Priority::Low);
    }

    #[test]
    fn test_brief_content_needs_approval() {
        let p = plan("Short", "Look into the thing");
        assert!(p.approval_required);
        assert!(p.approval_reason.contains("too brief"));
    }

    #[test]
    fn test_public_and_destructive_need_approval() {
        assert!(plan("Site", "Change the homepage banner\nto the new one").approval_required);
        let p = plan("Cleanup", "Delete the staging tables\nafter the migration");
        assert!(p.approval_required);
        assert!(p.approval_reason.contains("delete"));
    }

    #[test]
    fn test_checklist_steps_are_unchecked_entries() {
        let p = plan(
            "Release",
            "# Release\n- [x] tag build\n- [ ] write notes\n- [ ] publish notes",
        );
        assert_eq!(
            descriptions(&p),
            vec!["write notes", "publish notes", VERIFY_STEP, ARCHIVE_STEP]
        );
        assert_eq!(
            p.suggested_output,
            "Completed deliverables: write notes, publish notes."
        );
    }

    #[test]
    fn test_clauses_split_on_conjunctions() {
        let p = plan(
            "Deploy",
            "Fix the config and deploy to staging\nRun the smoke tests; then notify the team",
        );
        assert_eq!(
            descriptions(&p),
            vec![
                "Fix the config",
                "deploy to staging",
                "Run the smoke tests",
                "notify the team",
                VERIFY_STEP,
                ARCHIVE_STEP
            ]
        );
    }

    #[test]
    fn test_and_without_verb_does_not_split() {
        let p = plan("Pair", "Buy bread and butter\nfor the office");
        assert_eq!(p.steps[0].description, "Buy bread and butter");
    }

    #[test]
    fn test_short_plan_gets_review_step() {
        let p = plan("Tiny", "");
        assert_eq!(p.steps.len(), 3);
        assert_eq!(p.steps[0].description, "Review the task: \"Tiny\"");
        assert_eq!(p.objective, "Complete the task: Tiny");
        assert_eq!(
            p.suggested_output,
            "A clarified task description with actionable details."
        );
    }

    #[test]
    fn test_overflow_is_merged_and_closing_steps_survive() {
        let body: String = (1..=10).map(|i| format!("- [ ] item {}\n", i)).collect();
        let p = plan("Many", &body);
        assert_eq!(p.steps.len(), Plan::MAX_STEPS);
        assert_eq!(
            p.steps[5].description,
            "Complete remaining items: item 6; item 7; item 8; item 9; item 10"
        );
        assert_eq!(p.steps[6].description, VERIFY_STEP);
        assert_eq!(p.steps[7].description, ARCHIVE_STEP);
        assert_eq!(p.steps[5].covers, vec![5, 6, 7, 8, 9]);
        assert!(p.steps[7].covers.is_empty());
    }

    #[test]
    fn test_steps_record_checklist_positions() {
        let p = plan("Chores", "- [x] sweep
- [ ] water plants
- [ ]
- [ ] buy milk; eggs
");
        assert_eq!(
            descriptions(&p),
            vec!["water plants", "buy milk; eggs", VERIFY_STEP, ARCHIVE_STEP]
        );
        assert_eq!(p.steps[0].covers, vec![1]);
        assert_eq!(p.steps[1].covers, vec![3]);
    }

    #[test]
    fn test_objective_from_dominant_verb() {
        let p = plan(
            "Bugs",
            "Please fix the login redirect.\nAlso fix the logout button.\nAdd a test.",
        );
        assert_eq!(p.objective, "Fix the login redirect.");
    }

    #[test]
    fn test_objective_falls_back_to_first_meaningful_line() {
        let p = plan("Notes", "# Heading\nok\nQuarterly planning notes for **team**");
        assert_eq!(p.objective, "Quarterly planning notes for team");
    }

    #[test]
    fn test_generate_is_pure_in_content() {
        let generator = PlanGenerator::new();
        let id = ItemId::derive("inbox", "t.md");
        let a = generator.generate(&id, "T", "Fix it\nnow please", T0);
        let b = generator.generate(&id, "T", "Fix it\nnow please", T0.plus_secs(3600));
        assert!(a.same_content(&b));
    }

    #[test]
    fn test_generated_plan_round_trips_through_document() {
        let content = "## Context\nFix the report and send it to finance\n- not a checklist";
        let p = plan("Report", content);
        let doc = render_plan_document(&p, content);
        let parsed = parse_plan_document(&p.item_id, &doc, T0).unwrap();
        assert!(parsed.same_content(&p));
    }
}
