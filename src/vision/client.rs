//! Local vision inference client.
//!
//! Speaks a chat-completion style HTTP API with one image part per
//! request. Decoding parameters are pinned (temperature 0, fixed seed) so
//! repeated calls on identical input are reproducible, which the
//! deterministic-record-id guarantee depends on.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

use crate::config::VisionConfig;
use crate::error::{PipelineError, PipelineResult};

/// Fixed sampling seed sent with every request.
const DECODE_SEED: u64 = 7;

/// One inference call: an image plus an instruction prompt requesting
/// JSON output.
#[derive(Debug, Clone)]
pub struct VisionRequest {
    pub prompt: String,
    pub image_png: Vec<u8>,
}

/// The seam between the pipeline and the inference backend. Production
/// uses [`HttpVisionClient`]; tests script responses.
#[async_trait]
pub trait VisionBackend: Send + Sync {
    /// Returns the raw text content of the model's reply.
    async fn complete(&self, request: VisionRequest) -> PipelineResult<String>;

    /// Model identifier stamped into provenance.
    fn model_id(&self) -> &str;
}

/// Chat-completion response shape, the subset this crate reads.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// HTTP client for a local chat-completion endpoint.
#[derive(Debug)]
pub struct HttpVisionClient {
    http: reqwest::Client,
    config: VisionConfig,
}

impl HttpVisionClient {
    /// Fails fast when the configured endpoint is not local; sending
    /// frames off-machine is a contract violation, not a degraded mode.
    pub fn new(config: VisionConfig) -> PipelineResult<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|err| PipelineError::Transient(format!("http client init failed: {err}")))?;
        Ok(Self { http, config })
    }

    fn request_body(&self, request: &VisionRequest) -> serde_json::Value {
        let image_uri = format!("data:image/png;base64,{}", BASE64.encode(&request.image_png));
        json!({
            "model": self.config.model_id,
            "temperature": 0.0,
            "top_p": 1.0,
            "seed": DECODE_SEED,
            "max_tokens": self.config.max_output_tokens,
            "response_format": { "type": "json_object" },
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": request.prompt },
                    { "type": "image_url", "image_url": { "url": image_uri } }
                ]
            }]
        })
    }
}

#[async_trait]
impl VisionBackend for HttpVisionClient {
    async fn complete(&self, request: VisionRequest) -> PipelineResult<String> {
        let body = self.request_body(&request);
        let response = self
            .http
            .post(&self.config.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    PipelineError::Transient(format!("inference request timed out: {err}"))
                } else {
                    PipelineError::Transient(format!("inference request failed: {err}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PipelineError::Endpoint {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|err| {
            PipelineError::MalformedOutput(format!("inference response was not valid JSON: {err}"))
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| {
                PipelineError::MalformedOutput("inference response had no choices".to_string())
            })
    }

    fn model_id(&self) -> &str {
        &self.config.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_pins_deterministic_decoding() {
        let client = HttpVisionClient::new(VisionConfig::default()).unwrap();
        let body = client.request_body(&VisionRequest {
            prompt: "list regions".into(),
            image_png: vec![1, 2, 3],
        });
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["top_p"], 1.0);
        assert_eq!(body["seed"], DECODE_SEED);
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn non_local_endpoint_is_rejected_at_construction() {
        let config = VisionConfig {
            endpoint: "http://inference.internal:8080/v1/chat/completions".into(),
            ..VisionConfig::default()
        };
        let err = HttpVisionClient::new(config).unwrap_err();
        assert!(err.is_contract_violation());
    }
}
