use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Enums
// =============================================================================

/// Lifecycle stage of a work item.
///
/// Stages only ever advance: Received -> Working -> Archived, with
/// Received -> Archived allowed when triage finds the item already done.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Working,
    Archived,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Received, Stage::Working, Stage::Archived];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Working => "working",
            Stage::Archived => "archived",
        }
    }

    /// Whether moving from `self` to `to` is a forward transition.
    pub fn can_advance_to(&self, to: Stage) -> bool {
        to > *self
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Stage::Received),
            "working" => Ok(Stage::Working),
            "archived" => Ok(Stage::Archived),
            _ => Err(format!("Unknown stage: {}", s)),
        }
    }
}

/// Processing status of a work item inside its stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Eligible for automatic execution.
    #[default]
    Open,
    /// Plan requires a human decision before anything runs.
    AwaitingApproval,
    /// Approved by an operator; execution may proceed.
    Approved,
    /// Rejected by an operator; archived with the outcome recorded.
    Rejected,
    /// No decision arrived before the approval timeout.
    TimedOut,
    /// Excluded from automatic attempts until reset.
    Blocked,
    /// All steps done and archived.
    Completed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Open => "open",
            ItemStatus::AwaitingApproval => "awaiting_approval",
            ItemStatus::Approved => "approved",
            ItemStatus::Rejected => "rejected",
            ItemStatus::TimedOut => "timed_out",
            ItemStatus::Blocked => "blocked",
            ItemStatus::Completed => "completed",
        }
    }

    /// Whether the loop may execute steps for an item in this status.
    pub fn is_executable(&self) -> bool {
        matches!(self, ItemStatus::Open | ItemStatus::Approved)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(ItemStatus::Open),
            "awaiting_approval" => Ok(ItemStatus::AwaitingApproval),
            "approved" => Ok(ItemStatus::Approved),
            "rejected" => Ok(ItemStatus::Rejected),
            "timed_out" => Ok(ItemStatus::TimedOut),
            "blocked" => Ok(ItemStatus::Blocked),
            "completed" => Ok(ItemStatus::Completed),
            _ => Err(format!("Unknown item status: {}", s)),
        }
    }
}

/// Plan priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "High"),
            Priority::Medium => write!(f, "Medium"),
            Priority::Low => write!(f, "Low"),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// Lifecycle of a failed-task record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedTaskStatus {
    Pending,
    Retrying,
    Failed,
    Resolved,
}

impl FailedTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailedTaskStatus::Pending => "pending",
            FailedTaskStatus::Retrying => "retrying",
            FailedTaskStatus::Failed => "failed",
            FailedTaskStatus::Resolved => "resolved",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FailedTaskStatus::Failed | FailedTaskStatus::Resolved)
    }
}

impl fmt::Display for FailedTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailedTaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FailedTaskStatus::Pending),
            "retrying" => Ok(FailedTaskStatus::Retrying),
            "failed" => Ok(FailedTaskStatus::Failed),
            "resolved" => Ok(FailedTaskStatus::Resolved),
            _ => Err(format!("Unknown failed-task status: {}", s)),
        }
    }
}

// =============================================================================
// Newtype Wrappers
// =============================================================================

/// Unix timestamp in seconds (UTC).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp())
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.0, 0).unwrap_or_default()
    }

    pub fn plus_secs(&self, secs: i64) -> Self {
        Self(self.0.saturating_add(secs))
    }

    /// Seconds elapsed from `earlier` to `self` (negative if `earlier` is later).
    pub fn seconds_since(&self, earlier: Timestamp) -> i64 {
        self.0 - earlier.0
    }

    /// Human-readable form used in documents and notes.
    pub fn display(&self) -> String {
        self.to_datetime().format("%Y-%m-%d %H:%M:%S UTC").to_string()
    }
}

/// Stable identity of a work item, derived from its origin and name.
///
/// Identity never changes after assignment, even when the item's entry is
/// renamed by collision suffixing.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(String);

impl ItemId {
    pub fn derive(origin: &str, name: &str) -> Self {
        Self(format!("{}/{}", origin.trim().trim_matches('/'), name.trim()))
    }

    /// Wrap an identity read back from storage or supplied by an operator.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The source name this identity was derived from, given its origin.
    pub fn source_name(&self, origin: &str) -> Option<&str> {
        let origin = origin.trim().trim_matches('/');
        self.0
            .strip_prefix(origin)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|name| !name.is_empty())
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Checklists
// =============================================================================

/// One `- [ ]` / `- [x]` line of an item body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistEntry {
    pub text: String,
    pub checked: bool,
}

/// Split a line into its checklist marker state and text, if it is one.
fn checklist_marker(line: &str) -> Option<(bool, &str)> {
    let trimmed = line.trim_start();
    let rest = trimmed
        .strip_prefix("- ")
        .or_else(|| trimmed.strip_prefix("* "))?;
    if let Some(text) = rest.strip_prefix("[ ]") {
        return Some((false, text.trim()));
    }
    if let Some(text) = rest
        .strip_prefix("[x]")
        .or_else(|| rest.strip_prefix("[X]"))
    {
        return Some((true, text.trim()));
    }
    None
}

/// Parse every checklist entry in `body`, in document order.
pub fn parse_checklist(body: &str) -> Vec<ChecklistEntry> {
    body.lines()
        .filter_map(checklist_marker)
        .map(|(checked, text)| ChecklistEntry {
            text: text.to_string(),
            checked,
        })
        .collect()
}

/// Check the checklist entry at `position` (in `parse_checklist` order).
///
/// Only the marker characters change; every other byte of the body is kept.
/// Returns `None` when there is no such entry or it is already checked.
pub fn check_entry_at(body: &str, position: usize) -> Option<String> {
    let mut seen = 0;
    let mut done = false;
    let mut out = String::with_capacity(body.len());
    for line in body.split_inclusive('\n') {
        if !done {
            if let Some((checked, _)) = checklist_marker(line.trim_end_matches(['\r', '\n'])) {
                if seen == position && !checked {
                    if let Some(pos) = line.find("[ ]") {
                        out.push_str(&line[..pos]);
                        out.push_str("[x]");
                        out.push_str(&line[pos + 3..]);
                        done = true;
                        continue;
                    }
                }
                seen += 1;
            }
        }
        out.push_str(line);
    }
    done.then_some(out)
}

// =============================================================================
// Aggregates
// =============================================================================

/// A notification that a new item has arrived.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewItem {
    /// Where the item came from (inbox name, mailbox, feed).
    pub origin: String,
    /// Entry name within the origin, e.g. a file name.
    pub name: String,
    pub title: String,
    pub body: String,
}

impl NewItem {
    pub fn id(&self) -> ItemId {
        ItemId::derive(&self.origin, &self.name)
    }
}

/// One unit of work tracked through the lifecycle stages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    pub origin: String,
    pub stage: Stage,
    /// Entry name in the current stage (may carry a collision suffix).
    pub entry_name: String,
    pub title: String,
    pub body: String,
    /// Rule that produced the current stage, once triaged.
    pub triage_rule: Option<u8>,
    pub status: ItemStatus,
    pub failure_count: u32,
    pub blocked_reason: Option<String>,
    pub approval_requested_at: Option<Timestamp>,
    /// Append-only notes (completion records, approval outcomes).
    pub notes: Vec<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl WorkItem {
    pub fn checklist(&self) -> Vec<ChecklistEntry> {
        parse_checklist(&self.body)
    }

    pub fn has_checklist(&self) -> bool {
        !self.checklist().is_empty()
    }

    /// True when there is no unchecked checklist entry left. Blank entries
    /// (`- [ ]` with no text) carry no work and are ignored.
    pub fn checklist_complete(&self) -> bool {
        self.checklist()
            .iter()
            .all(|e| e.checked || e.text.is_empty())
    }
}

/// One ordered step of a plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub description: String,
    pub done: bool,
    /// Positions of the checklist entries this step accounts for, in
    /// `parse_checklist` order.
    #[serde(default)]
    pub covers: Vec<usize>,
}

impl PlanStep {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            done: false,
            covers: Vec::new(),
        }
    }

    pub fn covering(mut self, positions: Vec<usize>) -> Self {
        self.covers = positions;
        self
    }
}

/// Generated execution plan for exactly one work item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub item_id: ItemId,
    pub objective: String,
    pub steps: Vec<PlanStep>,
    pub priority: Priority,
    pub priority_reason: String,
    pub approval_required: bool,
    pub approval_reason: String,
    pub suggested_output: String,
    /// Metadata only; not part of plan equality for duplicate checks.
    pub created_at: Timestamp,
}

impl Plan {
    pub const MIN_STEPS: usize = 3;
    pub const MAX_STEPS: usize = 8;

    /// Index and step of every step not yet done, in order.
    pub fn undone_steps(&self) -> impl Iterator<Item = (usize, &PlanStep)> {
        self.steps.iter().enumerate().filter(|(_, s)| !s.done)
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.done)
    }

    /// Plan content equality ignoring the creation timestamp.
    pub fn same_content(&self, other: &Plan) -> bool {
        self.item_id == other.item_id
            && self.objective == other.objective
            && self.steps == other.steps
            && self.priority == other.priority
            && self.approval_required == other.approval_required
            && self.suggested_output == other.suggested_output
    }
}

/// Durable record of a failing task awaiting retry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailedTaskRecord {
    pub task_id: String,
    pub source: String,
    pub error: String,
    pub retry_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: Timestamp,
    pub status: FailedTaskStatus,
    pub context: serde_json::Map<String, serde_json::Value>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl FailedTaskRecord {
    /// Whether a retry may be attempted at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        !self.status.is_terminal() && self.next_retry_at <= now
    }
}

/// Per-source sliding error counter used for alert throttling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertWindowState {
    pub source: String,
    pub error_count: u32,
    pub window_start: Timestamp,
    pub last_alert_fired: Option<Timestamp>,
}

impl AlertWindowState {
    pub fn new(source: impl Into<String>, now: Timestamp) -> Self {
        Self {
            source: source.into(),
            error_count: 0,
            window_start: now,
            last_alert_fired: None,
        }
    }
}
