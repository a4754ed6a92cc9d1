//! Query-time data model.
//!
//! A `QueryRun` is the immutable audit record of one `answer()` call,
//! including the candidate paths that lost arbitration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-query state machine. `Answered` and `Indeterminate` are the only
/// successful terminal states; contract violations abort the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Planned,
    CandidatesGenerated,
    Scored,
    Answered,
    Indeterminate,
    ContractViolation,
}

impl QueryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryState::Planned => "planned",
            QueryState::CandidatesGenerated => "candidates_generated",
            QueryState::Scored => "scored",
            QueryState::Answered => "answered",
            QueryState::Indeterminate => "indeterminate",
            QueryState::ContractViolation => "contract_violation",
        }
    }
}

/// Coarse confidence bucket attached to a rendered answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLabel {
    High,
    Medium,
    Low,
}

impl ConfidenceLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLabel::High => "high",
            ConfidenceLabel::Medium => "medium",
            ConfidenceLabel::Low => "low",
        }
    }

    /// Fixed cut-offs over the winning path score.
    pub fn from_score(score: f64) -> ConfidenceLabel {
        if score >= 0.8 {
            ConfidenceLabel::High
        } else if score >= 0.6 {
            ConfidenceLabel::Medium
        } else {
            ConfidenceLabel::Low
        }
    }
}

/// One scored evidence bundle within a query run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePath {
    pub path_id: String,
    /// Pipeline stages the evidence passed through, e.g.
    /// `["store_lookup", "structured"]`.
    pub stage_sequence: Vec<String>,
    pub evidence_record_ids: Vec<String>,
    pub citation_count: usize,
    pub coverage_score: f64,
    pub consistency_score: f64,
    pub selected: bool,
}

/// What the query interface hands back to the caller. Always structured;
/// `no_evidence` is a normal outcome, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer_text: String,
    pub citations: Vec<String>,
    pub confidence_label: ConfidenceLabel,
    pub no_evidence: bool,
}

/// Immutable audit record of one query execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRun {
    pub query_run_id: String,
    pub query_text: String,
    pub resolved_intent: String,
    pub candidate_paths: Vec<CandidatePath>,
    pub winning_path_id: Option<String>,
    pub answer_text: String,
    pub citations: Vec<String>,
    pub confidence_label: ConfidenceLabel,
    pub state: QueryState,
    pub created_at: DateTime<Utc>,
}
