//! Scripted vision backend for tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::{PipelineError, PipelineResult};
use crate::vision::client::{VisionBackend, VisionRequest};

/// Returns canned replies in order, repeating the last entry once the
/// script runs out.
pub struct ScriptedBackend {
    replies: Vec<PipelineResult<String>>,
    cursor: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<PipelineResult<String>>) -> Self {
        assert!(!replies.is_empty(), "script needs at least one reply");
        Self {
            replies,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Backend that answers every call with the same JSON payload.
    pub fn always(reply: &str) -> Self {
        Self::new(vec![Ok(reply.to_string())])
    }

    /// Backend that fails every call as unreachable.
    pub fn unreachable() -> Self {
        Self::new(vec![Err(PipelineError::Transient(
            "connection refused".to_string(),
        ))])
    }

    pub fn calls(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }
}

fn clone_result(result: &PipelineResult<String>) -> PipelineResult<String> {
    match result {
        Ok(text) => Ok(text.clone()),
        Err(PipelineError::Transient(m)) => Err(PipelineError::Transient(m.clone())),
        Err(PipelineError::MalformedOutput(m)) => Err(PipelineError::MalformedOutput(m.clone())),
        Err(PipelineError::ContractViolation(m)) => {
            Err(PipelineError::ContractViolation(m.clone()))
        }
        Err(PipelineError::Endpoint { status, message }) => Err(PipelineError::Endpoint {
            status: *status,
            message: message.clone(),
        }),
    }
}

#[async_trait]
impl VisionBackend for ScriptedBackend {
    async fn complete(&self, _request: VisionRequest) -> PipelineResult<String> {
        let index = self
            .cursor
            .fetch_add(1, Ordering::SeqCst)
            .min(self.replies.len() - 1);
        clone_result(&self.replies[index])
    }

    fn model_id(&self) -> &str {
        "scripted-model"
    }
}
