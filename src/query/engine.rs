//! Query execution: plan, generate, score, render, persist.
//!
//! One `answer()` call walks the run through its states and writes an
//! immutable `QueryRun` before returning. Answers come exclusively from
//! the persisted store; an empty store yields an indeterminate response,
//! never a fabricated one.

use anyhow::Result;
use chrono::Utc;
use uuid::Uuid;

use crate::db::Database;
use crate::error::PipelineError;
use crate::models::{ConfidenceLabel, QueryResponse, QueryRun, QueryState};
use crate::query::arbitration::{to_candidate_path, ArbitrationScorer, ScoredPath};
use crate::query::generator::{CandidateGenerator, PathCandidate};
use crate::query::planner::{QueryPlan, QueryPlanner};
use crate::query::renderer::{render_answer, render_indeterminate};
use crate::log_info;

const ENABLE_LOGS: bool = true;

pub struct QueryEngine<'a> {
    db: &'a Database,
    planner: QueryPlanner,
}

impl<'a> QueryEngine<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self {
            db,
            planner: QueryPlanner::new(),
        }
    }

    /// Answers a free-text question from persisted records.
    ///
    /// Errors only on infrastructure failure or a broken citation
    /// contract; "no evidence" is a successful `QueryResponse` with
    /// `no_evidence` set and zero citations.
    pub async fn answer(&self, query_text: &str) -> Result<QueryResponse> {
        let started = std::time::Instant::now();
        let mut state = QueryState::Planned;
        let plan = self.planner.plan(query_text);
        log_info!(
            "query {}: intent={} salient_tokens={}",
            state.as_str(),
            plan.intent.name(),
            plan.salient_tokens.len()
        );

        let candidates = CandidateGenerator::new(self.db).generate(&plan).await?;
        state = QueryState::CandidatesGenerated;
        log_info!("query {}: {} paths", state.as_str(), candidates.len());

        let (scored, winner) = self.score_candidates(query_text, &plan, candidates).await?;
        state = QueryState::Scored;
        log_info!("query {}: winner={:?}", state.as_str(), winner);

        let response = match &winner {
            Some(path_id) => {
                // The winner id came out of `scored`, so the lookup
                // cannot miss.
                let winning = scored
                    .iter()
                    .find(|p| &p.candidate.path_id == path_id)
                    .ok_or_else(|| anyhow::anyhow!("winning path {path_id} missing from scores"))?;
                render_answer(&plan.intent, &winning.candidate.records, winning.score)
            }
            None => render_indeterminate(),
        };

        state = if winner.is_some() {
            QueryState::Answered
        } else {
            QueryState::Indeterminate
        };
        let run = QueryRun {
            query_run_id: format!("qr-{}", Uuid::new_v4()),
            query_text: query_text.to_string(),
            resolved_intent: plan.intent.name().to_string(),
            candidate_paths: scored
                .iter()
                .map(|p| to_candidate_path(p, winner.as_deref() == Some(p.candidate.path_id.as_str())))
                .collect(),
            winning_path_id: winner,
            answer_text: response.answer_text.clone(),
            citations: response.citations.clone(),
            confidence_label: response.confidence_label,
            state,
            created_at: Utc::now(),
        };
        self.db.insert_query_run(&run).await?;

        log_info!(
            "query {} in {}ms: state={} citations={}",
            run.query_run_id,
            started.elapsed().as_millis(),
            run.state.as_str(),
            run.citations.len()
        );
        Ok(response)
    }

    /// Scores candidates, persisting a `contract_violation` audit row
    /// when arbitration finds a citation that does not resolve. The
    /// error still aborts the run.
    async fn score_candidates(
        &self,
        query_text: &str,
        plan: &QueryPlan,
        candidates: Vec<PathCandidate>,
    ) -> Result<(Vec<ScoredPath>, Option<String>)> {
        let scorer = ArbitrationScorer::new(self.db);
        match scorer.select(&plan.required_kinds, candidates).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let fatal = err
                    .downcast_ref::<PipelineError>()
                    .is_some_and(|e| e.is_contract_violation());
                if fatal {
                    let run = QueryRun {
                        query_run_id: format!("qr-{}", Uuid::new_v4()),
                        query_text: query_text.to_string(),
                        resolved_intent: plan.intent.name().to_string(),
                        candidate_paths: Vec::new(),
                        winning_path_id: None,
                        answer_text: String::new(),
                        citations: Vec::new(),
                        confidence_label: ConfidenceLabel::Low,
                        state: QueryState::ContractViolation,
                        created_at: Utc::now(),
                    };
                    self.db.insert_query_run(&run).await?;
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CanonicalRecord, ConfidenceLabel, Frame, FrameStatus, RecordBody};
    use crate::query::generator::tests::{browser_window, make_record};

    async fn seed(db: &Database, marker: &[u8], bodies: Vec<RecordBody>) {
        let frame = Frame::from_capture(marker, 1920, 1080, Utc::now());
        db.insert_frame(&frame).await.unwrap();
        let records: Vec<CanonicalRecord> = bodies
            .into_iter()
            .enumerate()
            .map(|(i, body)| make_record(&frame.frame_id, body, (i as u32) * 500))
            .collect();
        db.commit_frame_records(&frame.frame_id, records, FrameStatus::Extracted)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn counts_browser_windows_with_one_citation_each() {
        let db = Database::open_in_memory().unwrap();
        seed(
            &db,
            b"f1",
            vec![
                browser_window("docs"),
                browser_window("mail"),
                browser_window("ci"),
            ],
        )
        .await;

        let engine = QueryEngine::new(&db);
        let response = engine
            .answer("how many browser windows are open?")
            .await
            .unwrap();

        assert_eq!(response.answer_text, "3");
        assert_eq!(response.citations.len(), 3);
        assert!(!response.no_evidence);
        assert_eq!(response.confidence_label, ConfidenceLabel::High);
        assert_eq!(db.count_query_runs().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn absent_content_is_indeterminate_not_invented() {
        let db = Database::open_in_memory().unwrap();
        // Only window evidence exists; the question asks about music.
        seed(&db, b"f1", vec![browser_window("docs")]).await;

        let engine = QueryEngine::new(&db);
        let response = engine.answer("what song is playing?").await.unwrap();

        assert!(response.no_evidence);
        assert!(response.citations.is_empty());
        assert_eq!(response.confidence_label, ConfidenceLabel::Low);
        // The indeterminate run is still audited.
        assert_eq!(db.count_query_runs().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn paraphrased_queries_produce_the_same_answer() {
        let db = Database::open_in_memory().unwrap();
        seed(
            &db,
            b"f1",
            vec![RecordBody::TimelineEntry {
                label: "Holiday - Turnstile".into(),
                time_text: Some("0:42".into()),
            }],
        )
        .await;

        let engine = QueryEngine::new(&db);
        let a = engine.answer("which song is playing").await.unwrap();
        let b = engine
            .answer("what track is currently playing?")
            .await
            .unwrap();

        assert_eq!(a.answer_text, "Holiday - Turnstile");
        assert_eq!(a.answer_text, b.answer_text);
        assert_eq!(a.citations, b.citations);
    }

    #[tokio::test]
    async fn contract_violation_is_audited_before_aborting() {
        let db = Database::open_in_memory().unwrap();
        let engine = QueryEngine::new(&db);

        let plan = QueryPlanner::new().plan("how many windows are open");
        // A citation that resolves to nothing in the store.
        let ghost = PathCandidate {
            path_id: "path-00-structured".to_string(),
            stage_sequence: vec!["store_lookup".to_string()],
            records: vec![make_record("frm-ghost", browser_window("phantom"), 0)],
        };

        let err = engine
            .score_candidates("how many windows are open", &plan, vec![ghost])
            .await
            .unwrap_err();
        assert!(err
            .downcast_ref::<PipelineError>()
            .is_some_and(|e| e.is_contract_violation()));
        // The aborted run still left an audit row.
        assert_eq!(db.count_query_runs().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unrelated_question_ends_indeterminate() {
        let db = Database::open_in_memory().unwrap();
        let engine = QueryEngine::new(&db);
        let response = engine.answer("recite a limerick").await.unwrap();
        assert!(response.no_evidence);
        assert!(response.citations.is_empty());
    }
}
