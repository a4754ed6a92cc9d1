//! Candidate path assembly.
//!
//! Each path is one self-contained evidence bundle pulled from the
//! persisted store: a structured path over typed records of the latest
//! extracted frame, and a fallback text-retrieval path over record
//! bodies. Pixels are never re-read at query time.

use anyhow::Result;

use crate::db::Database;
use crate::models::{CanonicalRecord, RecordBody};
use crate::query::planner::{Intent, QueryPlan};

const TEXT_SCAN_LIMIT: usize = 20;

/// An unscored evidence bundle; arbitration turns these into persisted
/// `CandidatePath`s.
#[derive(Debug, Clone)]
pub struct PathCandidate {
    pub path_id: String,
    pub stage_sequence: Vec<String>,
    pub records: Vec<CanonicalRecord>,
}

pub struct CandidateGenerator<'a> {
    db: &'a Database,
}

impl<'a> CandidateGenerator<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub async fn generate(&self, plan: &QueryPlan) -> Result<Vec<PathCandidate>> {
        if plan.intent == Intent::Unknown {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        paths.push(self.structured_path(plan).await?);
        paths.push(self.text_scan_path(plan).await?);
        Ok(paths)
    }

    /// Typed records of the required kinds, restricted to the most
    /// recently extracted frame and filtered per intent.
    async fn structured_path(&self, plan: &QueryPlan) -> Result<PathCandidate> {
        let mut records: Vec<CanonicalRecord> = Vec::new();

        if let Some(frame) = self.db.latest_extracted_frame().await? {
            for kind in &plan.required_kinds {
                let mut batch = self
                    .db
                    .get_records_by_kind(*kind, Some(frame.frame_id.clone()))
                    .await?;
                records.append(&mut batch);
            }
        }

        records.retain(|record| intent_accepts(&plan.intent, record));
        records.sort_by(|a, b| a.record_id.cmp(&b.record_id));

        Ok(PathCandidate {
            path_id: "path-00-structured".to_string(),
            stage_sequence: vec!["store_lookup".to_string(), "structured".to_string()],
            records,
        })
    }

    /// Substring retrieval over record bodies across all frames, the
    /// lower-fidelity fallback when structured state is missing.
    async fn text_scan_path(&self, plan: &QueryPlan) -> Result<PathCandidate> {
        let mut records: Vec<CanonicalRecord> = Vec::new();
        for token in &plan.salient_tokens {
            let hits = self.db.search_record_text(token, TEXT_SCAN_LIMIT).await?;
            for hit in hits {
                if !records.iter().any(|r| r.record_id == hit.record_id) {
                    records.push(hit);
                }
            }
        }
        records.retain(|record| {
            plan.required_kinds.is_empty() || plan.required_kinds.contains(&record.kind())
        });
        records.sort_by(|a, b| a.record_id.cmp(&b.record_id));

        Ok(PathCandidate {
            path_id: "path-01-textscan".to_string(),
            stage_sequence: vec!["text_search".to_string(), "retrieval".to_string()],
            records,
        })
    }
}

/// Intent-specific evidence filter applied to structured records.
fn intent_accepts(intent: &Intent, record: &CanonicalRecord) -> bool {
    match intent {
        Intent::CountWindows { app_class } => match (&record.body, app_class) {
            (RecordBody::Window { .. }, None) => true,
            (RecordBody::Window { app_class, .. }, Some(wanted)) => {
                app_class.as_deref() == Some(wanted.as_str())
            }
            _ => false,
        },
        Intent::FocusedApp => {
            matches!(&record.body, RecordBody::Window { is_focused, .. } if *is_focused)
        }
        Intent::ConsoleErrors => match &record.body {
            RecordBody::ConsoleLine { text } => {
                let lower = text.to_lowercase();
                lower.contains("error") || lower.contains("failed") || lower.contains("panic")
            }
            _ => false,
        },
        _ => true,
    }
}
