//! Deterministic scoring and selection among candidate paths.
//!
//! Three signals: citation validity (a binary gate), evidence coverage,
//! and cross-source consistency, combined with fixed weights. No
//! randomness, no model calls; ties break on the lowest path id.

use anyhow::Result;

use crate::db::Database;
use crate::error::PipelineError;
use crate::models::{CandidatePath, RecordKind};
use crate::query::generator::PathCandidate;

/// Fixed arbitration constants. Coverage dominates; consistency breaks
/// quality apart among covered paths.
pub const WEIGHT_COVERAGE: f64 = 0.6;
pub const WEIGHT_CONSISTENCY: f64 = 0.4;
/// A path below this coverage is never selected.
pub const MIN_COVERAGE: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct ScoredPath {
    pub candidate: PathCandidate,
    pub coverage: f64,
    pub consistency: f64,
    pub score: f64,
}

pub struct ArbitrationScorer<'a> {
    db: &'a Database,
}

impl<'a> ArbitrationScorer<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Scores every path and picks a winner, or none when no path clears
    /// the coverage gate. A citation that does not resolve to a stored
    /// record is a fatal contract violation, never a downgraded answer.
    pub async fn select(
        &self,
        required_kinds: &[RecordKind],
        candidates: Vec<PathCandidate>,
    ) -> Result<(Vec<ScoredPath>, Option<String>)> {
        let mut scored = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            self.verify_citations(&candidate).await?;
            let coverage = coverage_score(required_kinds, &candidate);
            let consistency = consistency_score(&candidate);
            let score = WEIGHT_COVERAGE * coverage + WEIGHT_CONSISTENCY * consistency;
            scored.push(ScoredPath {
                candidate,
                coverage,
                consistency,
                score,
            });
        }

        let winner = scored
            .iter()
            .filter(|path| path.coverage >= MIN_COVERAGE && !path.candidate.records.is_empty())
            .max_by(|a, b| {
                a.score
                    .total_cmp(&b.score)
                    // Lowest path id wins ties.
                    .then_with(|| b.candidate.path_id.cmp(&a.candidate.path_id))
            })
            .map(|path| path.candidate.path_id.clone());

        Ok((scored, winner))
    }

    /// Every evidence id must resolve to a stored record whose frame
    /// matches. Generators only read the store, so a miss here means a
    /// broken invariant, not missing data.
    async fn verify_citations(&self, candidate: &PathCandidate) -> Result<()> {
        let ids: Vec<String> = candidate
            .records
            .iter()
            .map(|r| r.record_id.clone())
            .collect();
        let stored = self.db.get_records_by_ids(ids.clone()).await?;
        if stored.len() != ids.len() {
            return Err(PipelineError::ContractViolation(format!(
                "path {} cites {} records but only {} resolve in the store",
                candidate.path_id,
                ids.len(),
                stored.len()
            ))
            .into());
        }
        for (cited, found) in candidate.records.iter().zip(stored.iter()) {
            if cited.frame_id != found.frame_id {
                return Err(PipelineError::ContractViolation(format!(
                    "citation {} resolved to a record from a different frame",
                    cited.record_id
                ))
                .into());
            }
        }
        Ok(())
    }
}

/// Fraction of required record kinds with at least one piece of
/// evidence.
fn coverage_score(required_kinds: &[RecordKind], candidate: &PathCandidate) -> f64 {
    if required_kinds.is_empty() {
        return if candidate.records.is_empty() { 0.0 } else { 1.0 };
    }
    let satisfied = required_kinds
        .iter()
        .filter(|kind| candidate.records.iter().any(|r| r.kind() == **kind))
        .count();
    satisfied as f64 / required_kinds.len() as f64
}

/// Agreement between independently derived facts, measured as the share
/// of evidence agreeing with the modal frame. Evidence scattered across
/// frames describes different moments and scores lower.
fn consistency_score(candidate: &PathCandidate) -> f64 {
    if candidate.records.is_empty() {
        return 0.0;
    }
    let mut counts: std::collections::BTreeMap<&str, usize> = std::collections::BTreeMap::new();
    for record in &candidate.records {
        *counts.entry(record.frame_id.as_str()).or_insert(0) += 1;
    }
    let modal = counts.values().copied().max().unwrap_or(0);
    modal as f64 / candidate.records.len() as f64
}

/// Converts a scored path into its persisted form.
pub fn to_candidate_path(path: &ScoredPath, selected: bool) -> CandidatePath {
    CandidatePath {
        path_id: path.candidate.path_id.clone(),
        stage_sequence: path.candidate.stage_sequence.clone(),
        evidence_record_ids: path
            .candidate
            .records
            .iter()
            .map(|r| r.record_id.clone())
            .collect(),
        citation_count: path.candidate.records.len(),
        coverage_score: path.coverage,
        consistency_score: path.consistency,
        selected,
    }
}
