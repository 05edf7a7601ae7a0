//! Rendering and parsing of the item and plan documents.
//!
//! The plan document is the stored form of a plan: the store writes it and
//! reads it back through `parse_plan_document`, so any drift in the format
//! shows up as a validation error instead of a silently wrong plan.

use crate::error::{ForemanError, Result};
use crate::types::{ItemId, Plan, PlanStep, Priority, Timestamp, WorkItem};

const ORIGINAL_TASK: &str = "## Original Task";
const OBJECTIVE: &str = "## Objective";
const STEPS: &str = "## Step-by-Step Plan";
const PRIORITY: &str = "## Priority";
const APPROVAL: &str = "## Requires Approval";
const SUGGESTED_OUTPUT: &str = "## Suggested Output";

/// Render the stored form of a work item: metadata, body, then notes.
pub fn render_item_document(item: &WorkItem) -> String {
    let rule = item
        .triage_rule
        .map(|r| format!("#{}", r))
        .unwrap_or_else(|| "pending".to_string());

    let mut doc = format!(
        "# {}\n\n## Metadata\n- **Source:** {}\n- **Received:** {}\n- **Stage:** {}\n- **Triage rule:** {}\n- **Status:** {}\n",
        item.title,
        item.id,
        item.created_at.display(),
        item.stage,
        rule,
        item.status,
    );
    if let Some(reason) = &item.blocked_reason {
        doc.push_str(&format!("- **Blocked:** {}\n", one_line(reason)));
    }

    doc.push_str("\n## Original Task\n");
    doc.push_str(&item.body);
    if !item.body.ends_with('\n') {
        doc.push('\n');
    }

    if !item.notes.is_empty() {
        doc.push_str("\n## Notes\n");
        for note in &item.notes {
            doc.push_str(&format!("- {}\n", one_line(note)));
        }
    }
    doc
}

/// Render a plan in its fixed section order.
pub fn render_plan_document(plan: &Plan, original_task: &str) -> String {
    let mut doc = String::new();

    doc.push_str(ORIGINAL_TASK);
    doc.push('\n');
    doc.push_str(original_task.trim_end());
    doc.push_str("\n\n");

    doc.push_str(OBJECTIVE);
    doc.push('\n');
    doc.push_str(&one_line(&plan.objective));
    doc.push_str("\n\n");

    doc.push_str(STEPS);
    doc.push('\n');
    for (i, step) in plan.steps.iter().enumerate() {
        let mark = if step.done { "x" } else { " " };
        doc.push_str(&format!("{}. [{}] {}\n", i + 1, mark, one_line(&step.description)));
    }
    doc.push('\n');

    doc.push_str(PRIORITY);
    doc.push('\n');
    doc.push_str(&format!(
        "**{}** - {}\n\n",
        plan.priority,
        one_line(&plan.priority_reason)
    ));

    doc.push_str(APPROVAL);
    doc.push('\n');
    let approval = if plan.approval_required { "Yes" } else { "No" };
    doc.push_str(&format!(
        "**{}** - {}\n\n",
        approval,
        one_line(&plan.approval_reason)
    ));

    doc.push_str(SUGGESTED_OUTPUT);
    doc.push('\n');
    doc.push_str(&one_line(&plan.suggested_output));
    doc.push('\n');

    doc
}

/// Parse a stored plan document back into a `Plan`.
///
/// Sections are located from the end of the document so that headings
/// inside the verbatim original task cannot confuse the parser.
pub fn parse_plan_document(item_id: &ItemId, doc: &str, created_at: Timestamp) -> Result<Plan> {
    let body = doc
        .strip_prefix(ORIGINAL_TASK)
        .ok_or_else(|| invalid(item_id, "document must start with the Original Task section"))?;

    let (rest, suggested) = split_last(item_id, body, SUGGESTED_OUTPUT)?;
    let (rest, approval) = split_last(item_id, rest, APPROVAL)?;
    let (rest, priority) = split_last(item_id, rest, PRIORITY)?;
    let (rest, steps) = split_last(item_id, rest, STEPS)?;
    let (_original, objective) = split_last(item_id, rest, OBJECTIVE)?;

    let objective = objective.trim();
    if objective.is_empty() {
        return Err(invalid(item_id, "objective is empty"));
    }

    let steps = steps
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| parse_step(item_id, line))
        .collect::<Result<Vec<_>>>()?;
    if !(Plan::MIN_STEPS..=Plan::MAX_STEPS).contains(&steps.len()) {
        return Err(invalid(
            item_id,
            &format!("plan has {} steps, expected 3 to 8", steps.len()),
        ));
    }

    let (priority_label, priority_reason) = parse_flagged(item_id, priority)?;
    let priority = priority_label
        .parse::<Priority>()
        .map_err(|e| invalid(item_id, &e))?;

    let (approval_label, approval_reason) = parse_flagged(item_id, approval)?;
    let approval_required = match approval_label.as_str() {
        "Yes" => true,
        "No" => false,
        other => return Err(invalid(item_id, &format!("approval must be Yes or No, got {}", other))),
    };

    Ok(Plan {
        item_id: item_id.clone(),
        objective: objective.to_string(),
        steps,
        priority,
        priority_reason,
        approval_required,
        approval_reason,
        suggested_output: suggested.trim().to_string(),
        created_at,
    })
}

fn split_last<'a>(item_id: &ItemId, text: &'a str, heading: &str) -> Result<(&'a str, &'a str)> {
    let marker = format!("\n{}\n", heading);
    match text.rfind(&marker) {
        Some(pos) => Ok((&text[..pos], &text[pos + marker.len()..])),
        None => Err(invalid(item_id, &format!("missing section {:?}", heading))),
    }
}

fn parse_step(item_id: &ItemId, line: &str) -> Result<PlanStep> {
    let (_, rest) = line
        .split_once(". ")
        .ok_or_else(|| invalid(item_id, &format!("malformed step line {:?}", line)))?;
    let (done, description) = if let Some(d) = rest.strip_prefix("[x] ") {
        (true, d)
    } else if let Some(d) = rest.strip_prefix("[ ] ") {
        (false, d)
    } else {
        return Err(invalid(item_id, &format!("step without marker {:?}", line)));
    };
    Ok(PlanStep {
        description: description.trim().to_string(),
        done,
        covers: Vec::new(),
    })
}

/// Parse `**Label** - reason`.
fn parse_flagged(item_id: &ItemId, section: &str) -> Result<(String, String)> {
    let line = section.trim();
    let rest = line
        .strip_prefix("**")
        .ok_or_else(|| invalid(item_id, &format!("malformed flag line {:?}", line)))?;
    let (label, reason) = rest
        .split_once("**")
        .ok_or_else(|| invalid(item_id, &format!("malformed flag line {:?}", line)))?;
    let reason = reason.trim().trim_start_matches('-').trim();
    Ok((label.to_string(), reason.to_string()))
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn invalid(item_id: &ItemId, msg: &str) -> ForemanError {
    ForemanError::Validation(format!("plan for {}: {}", item_id, msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ItemStatus, Stage};

    fn sample_plan() -> Plan {
        Plan {
            item_id: ItemId::derive("inbox", "invoice.md"),
            objective: "Send the invoice to the client.".into(),
            steps: vec![
                PlanStep::new("Send the invoice"),
                PlanStep {
                    description: "Verify the result meets the task requirements".into(),
                    done: true,
                    covers: Vec::new(),
                },
                PlanStep::new("Archive the completed task"),
            ],
            priority: Priority::High,
            priority_reason: "Contains urgency indicator: \"overdue\"".into(),
            approval_required: true,
            approval_reason: "Involves financial content: \"invoice\"".into(),
            suggested_output: "Completed task: \"invoice\" with all requirements fulfilled.".into(),
            created_at: Timestamp(1_700_000_000),
        }
    }

    #[test]
    fn test_plan_sections_in_fixed_order() {
        let doc = render_plan_document(&sample_plan(), "Send the $5,000 invoice.");
        let positions: Vec<usize> = [ORIGINAL_TASK, OBJECTIVE, STEPS, PRIORITY, APPROVAL, SUGGESTED_OUTPUT]
            .iter()
            .map(|h| doc.find(h).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(doc.matches("\n## ").count(), 5);
        assert!(doc.starts_with(ORIGINAL_TASK));
        assert!(doc.contains("1. [ ] Send the invoice\n"));
        assert!(doc.contains("2. [x] Verify"));
        assert!(doc.contains("**High** - Contains urgency"));
        assert!(doc.contains("**Yes** - Involves financial"));
    }

    #[test]
    fn test_plan_document_parses_back() {
        let plan = sample_plan();
        let doc = render_plan_document(&plan, "Send the $5,000 invoice.\nIt is overdue.");
        let parsed = parse_plan_document(&plan.item_id, &doc, plan.created_at).unwrap();
        assert_eq!(parsed, plan);
    }

    #[test]
    fn test_parse_survives_headings_in_original_task() {
        let plan = sample_plan();
        let tricky = "## Objective\nnot the real one\n## Priority\n**Low** - fake";
        let doc = render_plan_document(&plan, tricky);
        let parsed = parse_plan_document(&plan.item_id, &doc, plan.created_at).unwrap();
        assert_eq!(parsed.objective, plan.objective);
        assert_eq!(parsed.priority, Priority::High);
    }

    #[test]
    fn test_parse_rejects_missing_section() {
        let plan = sample_plan();
        let doc = render_plan_document(&plan, "task").replace(SUGGESTED_OUTPUT, "## Output");
        let err = parse_plan_document(&plan.item_id, &doc, plan.created_at).unwrap_err();
        assert!(matches!(err, ForemanError::Validation(_)));
    }

    #[test]
    fn test_parse_rejects_too_few_steps() {
        let mut plan = sample_plan();
        plan.steps.truncate(2);
        let doc = render_plan_document(&plan, "task");
        let err = parse_plan_document(&plan.item_id, &doc, plan.created_at).unwrap_err();
        assert!(err.to_string().contains("2 steps"));
    }

    #[test]
    fn test_item_document_metadata_and_notes() {
        let item = WorkItem {
            id: ItemId::derive("inbox", "task.md"),
            origin: "inbox".into(),
            stage: Stage::Working,
            entry_name: "task.md".into(),
            title: "Fix login".into(),
            body: "- [x] reproduce\n- [ ] fix".into(),
            triage_rule: Some(3),
            status: ItemStatus::Blocked,
            failure_count: 3,
            blocked_reason: Some("3 consecutive failures".into()),
            approval_requested_at: None,
            notes: vec!["Completed at 2023-11-14".into()],
            created_at: Timestamp(1_700_000_000),
            updated_at: Timestamp(1_700_000_000),
        };
        let doc = render_item_document(&item);
        assert!(doc.starts_with("# Fix login\n"));
        assert!(doc.contains("- **Source:** inbox/task.md"));
        assert!(doc.contains("- **Stage:** working"));
        assert!(doc.contains("- **Triage rule:** #3"));
        assert!(doc.contains("- **Status:** blocked"));
        assert!(doc.contains("- **Blocked:** 3 consecutive failures"));
        assert!(doc.contains("- [x] reproduce\n- [ ] fix\n"));
        assert!(doc.ends_with("## Notes\n- Completed at 2023-11-14\n"));
    }
}
