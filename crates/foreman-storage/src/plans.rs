//! Plan persistence.
//!
//! A plan is stored as its rendered document. Every write renders the plan
//! and parses it back before committing, and every read parses the stored
//! document, so the document format is the single source of truth.

use rusqlite::OptionalExtension;
use tracing::{debug, info};

use foreman_core::document::{parse_plan_document, render_plan_document};
use foreman_core::error::ForemanError;
use foreman_core::types::{ItemId, Plan, Timestamp};

use crate::db::storage_err;
use crate::items::ItemStore;

/// Result of `insert_plan`.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanInsert {
    Inserted,
    /// A plan already existed for the item; the stored plan is returned.
    Duplicate(Plan),
}

impl ItemStore {
    /// Look up the plan generated for `item_id`.
    pub fn find_by_source(&self, item_id: &ItemId) -> Result<Option<Plan>, ForemanError> {
        self.db.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT document, created_at, step_entries FROM plans WHERE item_id = ?1",
                    [item_id.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()
                .map_err(storage_err)?;

            let Some((doc, created_at, entries)) = row else {
                return Ok(None);
            };
            let mut plan = parse_plan_document(item_id, &doc, Timestamp(created_at))?;
            let covers: Vec<Vec<usize>> = serde_json::from_str(&entries)?;
            if covers.len() == plan.steps.len() {
                for (step, positions) in plan.steps.iter_mut().zip(covers) {
                    step.covers = positions;
                }
            } else if !covers.is_empty() {
                return Err(ForemanError::Validation(format!(
                    "plan for {}: {} step entry lists for {} steps",
                    item_id,
                    covers.len(),
                    plan.steps.len()
                )));
            }
            Ok(Some(plan))
        })
    }

    /// Raw stored document of a plan.
    pub fn plan_document(&self, item_id: &ItemId) -> Result<Option<String>, ForemanError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT document FROM plans WHERE item_id = ?1",
                [item_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)
        })
    }

    /// Store a new plan. At most one plan exists per item; a second insert
    /// leaves the first untouched.
    pub fn insert_plan(
        &self,
        plan: &Plan,
        original_task: &str,
        now: Timestamp,
    ) -> Result<PlanInsert, ForemanError> {
        let document = render_plan_document(plan, original_task);
        parse_plan_document(&plan.item_id, &document, plan.created_at)?;
        let covers: Vec<&Vec<usize>> = plan.steps.iter().map(|s| &s.covers).collect();
        let step_entries = serde_json::to_string(&covers)?;

        let inserted = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO plans (item_id, original_task, document, step_entries, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    plan.item_id.as_str(),
                    original_task,
                    document,
                    step_entries,
                    plan.created_at.0,
                    now.0
                ],
            )
            .map_err(|e| ForemanError::Storage(format!("Failed to insert plan: {}", e)))
        })?;

        if inserted == 0 {
            let existing = self.find_by_source(&plan.item_id)?.ok_or_else(|| {
                ForemanError::Storage(format!("plan for {} vanished during insert", plan.item_id))
            })?;
            debug!(item_id = %plan.item_id, "Plan already exists; insert ignored");
            return Ok(PlanInsert::Duplicate(existing));
        }

        info!(item_id = %plan.item_id, steps = plan.steps.len(), "Plan stored");
        Ok(PlanInsert::Inserted)
    }

    /// Persist the done flags of `plan`.
    ///
    /// Only step completion may change after creation; any other difference
    /// from the stored plan is rejected.
    pub fn update_plan_steps(&self, plan: &Plan, now: Timestamp) -> Result<(), ForemanError> {
        self.db.with_tx(|tx| {
            let (original_task, doc, created_at): (String, String, i64) = tx
                .query_row(
                    "SELECT original_task, document, created_at FROM plans WHERE item_id = ?1",
                    [plan.item_id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
                .map_err(storage_err)?
                .ok_or_else(|| ForemanError::NotFound(format!("plan for {}", plan.item_id)))?;

            let stored = parse_plan_document(&plan.item_id, &doc, Timestamp(created_at))?;
            let same_shape = stored.steps.len() == plan.steps.len()
                && stored
                    .steps
                    .iter()
                    .zip(&plan.steps)
                    .all(|(a, b)| a.description == b.description);
            if !same_shape || stored.objective != plan.objective {
                return Err(ForemanError::Validation(format!(
                    "plan for {}: only step completion may change",
                    plan.item_id
                )));
            }
            if stored.steps.iter().zip(&plan.steps).any(|(a, b)| a.done && !b.done) {
                return Err(ForemanError::Validation(format!(
                    "plan for {}: completed steps cannot be reopened",
                    plan.item_id
                )));
            }

            let updated = Plan {
                steps: plan.steps.clone(),
                ..stored
            };
            tx.execute(
                "UPDATE plans SET document = ?2, updated_at = ?3 WHERE item_id = ?1",
                rusqlite::params![
                    plan.item_id.as_str(),
                    render_plan_document(&updated, &original_task),
                    now.0
                ],
            )
            .map_err(storage_err)?;
            Ok(())
        })
    }
}
