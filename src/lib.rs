//! Screenshot memory: extraction of canonical screen state from captured
//! frames, and a query engine that answers questions from the persisted
//! records with verifiable citations.
//!
//! The extraction side runs a two-pass vision pipeline (thumbnail ROI
//! proposal, then high-resolution per-region parsing), reconciles the
//! results into deduplicated records, and commits each frame's state
//! atomically. The query side never touches pixels: it plans an intent,
//! pulls evidence bundles from the store, scores them deterministically,
//! and either answers with citations or reports that no evidence exists.

pub mod config;
pub mod db;
pub mod error;
pub mod extraction;
pub mod geometry;
pub mod models;
pub mod ocr;
pub mod query;
pub mod utils;
pub mod vision;

pub use config::{ExtractionConfig, VisionConfig};
pub use db::Database;
pub use error::{PipelineError, PipelineResult};
pub use extraction::{ExtractionController, FrameCapture, PipelineContext};
pub use models::{QueryResponse, QueryRun};
pub use query::QueryEngine;
pub use vision::{HttpVisionClient, VisionBackend};
