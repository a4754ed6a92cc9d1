use anyhow::{Context, Result};
use rusqlite::params;
use serde_json::to_string;

use crate::db::Database;
use crate::models::QueryRun;

impl Database {
    /// Query runs are written once, after the run reaches a terminal
    /// state; there is no update surface.
    pub async fn insert_query_run(&self, run: &QueryRun) -> Result<()> {
        let record = run.clone();
        self.execute(move |conn| {
            let citations_json =
                to_string(&record.citations).context("failed to serialize citations")?;
            let paths_json =
                to_string(&record.candidate_paths).context("failed to serialize paths")?;
            conn.execute(
                "INSERT INTO query_runs (
                    query_run_id, query_text, resolved_intent, winning_path_id,
                    answer_text, confidence_label, no_evidence,
                    citations_json, paths_json, state, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.query_run_id,
                    record.query_text,
                    record.resolved_intent,
                    record.winning_path_id,
                    record.answer_text,
                    record.confidence_label.as_str(),
                    record.winning_path_id.is_none() as i64,
                    citations_json,
                    paths_json,
                    record.state.as_str(),
                    record.created_at.to_rfc3339(),
                ],
            )
            .with_context(|| "failed to insert query run")?;
            Ok(())
        })
        .await
    }

    pub async fn count_query_runs(&self) -> Result<i64> {
        self.execute(|conn| {
            let count = conn.query_row("SELECT COUNT(*) FROM query_runs", [], |row| row.get(0))?;
            Ok(count)
        })
        .await
    }
}
