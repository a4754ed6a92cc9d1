//! Tunable configuration for the extraction pipeline and the vision
//! inference endpoint.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Configuration for the extraction pipeline with tunable thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Longest edge of the pass-1 thumbnail, in pixels.
    pub thumbnail_max_edge: u32,

    /// Hard cap on ROIs per frame; lowest-confidence proposals beyond the
    /// cap are dropped.
    pub max_rois_per_frame: usize,

    /// Minimum normalized area for a proposal; smaller boxes are rejected
    /// as degenerate.
    pub min_roi_area: f64,

    /// Longest crop edge the parser sends in one call; larger crops are
    /// re-tiled.
    pub max_crop_edge: u32,

    /// IoU above which two detections of compatible type merge into one
    /// record.
    pub merge_iou_threshold: f64,

    /// Grid (pixels) record-id bboxes are snapped to before hashing.
    pub record_id_grid: u32,

    /// Maximum concurrent vision-model calls.
    pub max_inflight_calls: usize,

    /// Retry cap for transient parse failures.
    pub parse_retry_cap: u32,

    /// Base backoff between retries, milliseconds (exponential, jittered).
    pub retry_backoff_base_ms: u64,

    /// Whole-frame extraction budget; on expiry partial results are
    /// discarded, never persisted.
    pub frame_timeout_secs: u64,

    /// Hamming distance below which a frame is treated as a duplicate of
    /// the previously extracted one and skipped.
    pub duplicate_phash_threshold: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            thumbnail_max_edge: 1024,
            max_rois_per_frame: 24,
            min_roi_area: 4e-4,
            max_crop_edge: 1536,
            merge_iou_threshold: 0.55,
            record_id_grid: 8,
            max_inflight_calls: 4,
            parse_retry_cap: 3,
            retry_backoff_base_ms: 250,
            frame_timeout_secs: 120,
            duplicate_phash_threshold: 6,
        }
    }
}

/// Configuration for the local vision inference endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    /// Base URL of the chat-completion endpoint. Must resolve to the local
    /// host; anything else is a fatal configuration error.
    pub endpoint: String,

    /// Model identifier passed through to the backend and stamped into
    /// record provenance.
    pub model_id: String,

    /// Per-call request timeout.
    pub request_timeout_secs: u64,

    /// Output token budget per call.
    pub max_output_tokens: u32,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:11434/v1/chat/completions".to_string(),
            model_id: "qwen2.5-vl".to_string(),
            request_timeout_secs: 60,
            max_output_tokens: 2048,
        }
    }
}

impl VisionConfig {
    /// Reject any endpoint that does not bind to the local host.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let host = host_of(&self.endpoint).ok_or_else(|| {
            PipelineError::ContractViolation(format!(
                "inference endpoint '{}' is not a valid URL",
                self.endpoint
            ))
        })?;

        if is_local_host(&host) {
            Ok(())
        } else {
            Err(PipelineError::ContractViolation(format!(
                "inference endpoint host '{host}' is not local; refusing to send frames off-machine"
            )))
        }
    }
}

fn host_of(endpoint: &str) -> Option<String> {
    let rest = endpoint
        .strip_prefix("http://")
        .or_else(|| endpoint.strip_prefix("https://"))?;
    let authority = rest.split('/').next()?;
    // Strip an IPv6 bracket form or a trailing port.
    if let Some(stripped) = authority.strip_prefix('[') {
        return stripped.split(']').next().map(|h| h.to_string());
    }
    Some(authority.split(':').next()?.to_string())
}

fn is_local_host(host: &str) -> bool {
    host == "localhost" || host == "::1" || host.starts_with("127.")
}
