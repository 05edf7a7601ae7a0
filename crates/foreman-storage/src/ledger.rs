//! Last-run ledger for scheduled jobs.

use std::sync::Arc;

use rusqlite::OptionalExtension;

use foreman_core::error::ForemanError;
use foreman_core::types::Timestamp;

use crate::db::{storage_err, Database};

pub struct JobLedger {
    db: Arc<Database>,
}

impl JobLedger {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn last_run(&self, job: &str) -> Result<Option<Timestamp>, ForemanError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT last_run FROM job_runs WHERE job = ?1",
                [job],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map(|r| r.map(Timestamp))
            .map_err(storage_err)
        })
    }

    pub fn record_run(&self, job: &str, at: Timestamp) -> Result<(), ForemanError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO job_runs (job, last_run) VALUES (?1, ?2)
                 ON CONFLICT(job) DO UPDATE SET last_run = excluded.last_run",
                rusqlite::params![job, at.0],
            )
            .map_err(storage_err)?;
            Ok(())
        })
    }
}
