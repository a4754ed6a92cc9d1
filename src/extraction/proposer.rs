//! Pass 1: thumbnail ROI proposal.
//!
//! One structured-output vision call on a downscaled frame proposes
//! candidate regions with class hints. Proposals are ephemeral; they only
//! steer the pass-2 crops and survive as provenance.

use std::io::Cursor;

use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat};
use serde::Deserialize;

use crate::config::ExtractionConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::geometry::NormalizedBox;
use crate::models::{CandidateRoi, Frame, RoiClass};
use crate::vision::{with_backoff, VisionBackend, VisionRequest};

const PROPOSAL_PROMPT: &str = "\
You are given a downscaled desktop screenshot. List every region that \
contains a meaningful UI surface. Respond with JSON only, shaped as \
{\"regions\":[{\"class\":\"window|tab_strip|panel|table|calendar|chat|console|browser_chrome\",\
\"bbox\":{\"x\":0.0,\"y\":0.0,\"width\":0.0,\"height\":0.0},\"confidence\":0.0}]}. \
Coordinates are normalized to [0,1] relative to this image. Do not invent \
regions you cannot see.";

const STRICT_PROPOSAL_PROMPT: &str = "\
Return ONLY a JSON object with a single key \"regions\", an array of \
objects with exactly the keys \"class\" (one of window, tab_strip, panel, \
table, calendar, chat, console, browser_chrome), \"bbox\" (object with \
numeric x, y, width, height in [0,1]) and \"confidence\" (number in \
[0,1]). No prose, no markdown fences, no other keys.";

/// Result of pass 1 for a frame.
#[derive(Debug)]
pub enum ProposalOutcome {
    Proposed(Vec<CandidateRoi>),
    /// Both attempts produced unusable output; the frame is kept with
    /// zero ROIs and flagged, never failed outright.
    Degraded,
}

#[derive(Debug, Deserialize)]
struct ProposalDoc {
    regions: Vec<RawProposal>,
}

#[derive(Debug, Deserialize)]
struct RawProposal {
    class: String,
    bbox: NormalizedBox,
    confidence: f64,
}

pub struct ThumbnailProposer<'a> {
    backend: &'a dyn VisionBackend,
    config: &'a ExtractionConfig,
}

impl<'a> ThumbnailProposer<'a> {
    pub fn new(backend: &'a dyn VisionBackend, config: &'a ExtractionConfig) -> Self {
        Self { backend, config }
    }

    pub async fn propose(
        &self,
        frame: &Frame,
        full_image: &DynamicImage,
    ) -> PipelineResult<ProposalOutcome> {
        let thumbnail = encode_thumbnail(full_image, self.config.thumbnail_max_edge)
            .map_err(|err| PipelineError::Transient(format!("thumbnail encode failed: {err}")))?;

        match self.attempt(PROPOSAL_PROMPT, &thumbnail, frame).await {
            Ok(rois) => Ok(ProposalOutcome::Proposed(rois)),
            Err(PipelineError::MalformedOutput(first)) => {
                log::warn!(
                    "frame {}: malformed proposal output, retrying with strict schema prompt: {first}",
                    frame.frame_id
                );
                match self.attempt(STRICT_PROPOSAL_PROMPT, &thumbnail, frame).await {
                    Ok(rois) => Ok(ProposalOutcome::Proposed(rois)),
                    Err(PipelineError::MalformedOutput(second)) => {
                        log::warn!(
                            "frame {}: strict proposal retry also malformed, degrading: {second}",
                            frame.frame_id
                        );
                        Ok(ProposalOutcome::Degraded)
                    }
                    Err(other) => Err(other),
                }
            }
            Err(other) => Err(other),
        }
    }

    async fn attempt(
        &self,
        prompt: &str,
        thumbnail: &[u8],
        frame: &Frame,
    ) -> PipelineResult<Vec<CandidateRoi>> {
        let raw = with_backoff(
            self.config.parse_retry_cap,
            self.config.retry_backoff_base_ms,
            || {
                self.backend.complete(VisionRequest {
                    prompt: prompt.to_string(),
                    image_png: thumbnail.to_vec(),
                })
            },
        )
        .await?;

        let doc: ProposalDoc = serde_json::from_str(raw.trim()).map_err(|err| {
            PipelineError::MalformedOutput(format!("proposal output failed validation: {err}"))
        })?;

        Ok(self.sanitize(doc, frame))
    }

    /// Drop degenerate and unknown-class proposals, cap the count, and
    /// assign deterministic roi ids in reading order.
    fn sanitize(&self, doc: ProposalDoc, frame: &Frame) -> Vec<CandidateRoi> {
        let mut accepted: Vec<(RoiClass, NormalizedBox, f64)> = Vec::new();
        for raw in doc.regions {
            let Some(class) = parse_class(&raw.class) else {
                log::warn!(
                    "frame {}: dropping proposal with unknown class '{}'",
                    frame.frame_id,
                    raw.class
                );
                continue;
            };
            let bbox = raw.bbox.clamped();
            if bbox.area() < self.config.min_roi_area {
                continue;
            }
            accepted.push((class, bbox, raw.confidence.clamp(0.0, 1.0)));
        }

        // Keep the most confident proposals up to the cap.
        accepted.sort_by(|a, b| b.2.total_cmp(&a.2));
        accepted.truncate(self.config.max_rois_per_frame);

        // Ids follow reading order so identical proposal sets always get
        // identical ids regardless of model output order.
        accepted.sort_by(|a, b| {
            (a.1.y, a.1.x, a.1.width, a.1.height)
                .partial_cmp(&(b.1.y, b.1.x, b.1.width, b.1.height))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        accepted
            .into_iter()
            .enumerate()
            .map(|(index, (class, bbox, confidence))| CandidateRoi {
                roi_id: format!("{}-roi{index:03}", frame.frame_id),
                frame_id: frame.frame_id.clone(),
                bbox,
                proposed_class: class,
                confidence,
                producer_model_id: self.backend.model_id().to_string(),
            })
            .collect()
    }
}

fn parse_class(value: &str) -> Option<RoiClass> {
    match value {
        "window" => Some(RoiClass::Window),
        "tab_strip" => Some(RoiClass::TabStrip),
        "panel" => Some(RoiClass::Panel),
        "table" => Some(RoiClass::Table),
        "calendar" => Some(RoiClass::Calendar),
        "chat" => Some(RoiClass::Chat),
        "console" => Some(RoiClass::Console),
        "browser_chrome" => Some(RoiClass::BrowserChrome),
        _ => None,
    }
}

fn encode_thumbnail(full_image: &DynamicImage, max_edge: u32) -> Result<Vec<u8>> {
    let thumb = if full_image.width().max(full_image.height()) > max_edge {
        full_image.thumbnail(max_edge, max_edge)
    } else {
        full_image.clone()
    };
    let mut buffer = Cursor::new(Vec::new());
    thumb
        .write_to(&mut buffer, ImageFormat::Png)
        .context("failed to encode thumbnail PNG")?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::mock::ScriptedBackend;
    use chrono::Utc;

    fn test_frame() -> Frame {
        Frame::from_capture(b"pixels", 1920, 1080, Utc::now())
    }

    fn blank_image() -> DynamicImage {
        DynamicImage::new_rgb8(64, 36)
    }

    fn region(class: &str, x: f64, y: f64, w: f64, h: f64, conf: f64) -> String {
        format!(
            "{{\"class\":\"{class}\",\"bbox\":{{\"x\":{x},\"y\":{y},\"width\":{w},\"height\":{h}}},\"confidence\":{conf}}}"
        )
    }

    #[tokio::test]
    async fn proposals_are_parsed_filtered_and_id_assigned() {
        let reply = format!(
            "{{\"regions\":[{},{},{}]}}",
            region("window", 0.1, 0.5, 0.4, 0.4, 0.8),
            region("console", 0.1, 0.1, 0.3, 0.3, 0.9),
            // Degenerate: below the minimum area.
            region("panel", 0.0, 0.0, 0.001, 0.001, 0.99),
        );
        let backend = ScriptedBackend::new(vec![Ok(reply)]);
        let config = ExtractionConfig::default();
        let frame = test_frame();

        let outcome = ThumbnailProposer::new(&backend, &config)
            .propose(&frame, &blank_image())
            .await
            .unwrap();
        let rois = match outcome {
            ProposalOutcome::Proposed(rois) => rois,
            ProposalOutcome::Degraded => panic!("should not degrade"),
        };
        assert_eq!(rois.len(), 2);
        // Reading order: the console region sits higher on screen.
        assert_eq!(rois[0].proposed_class, RoiClass::Console);
        assert_eq!(rois[0].roi_id, format!("{}-roi000", frame.frame_id));
        assert_eq!(rois[1].roi_id, format!("{}-roi001", frame.frame_id));
    }

    #[tokio::test]
    async fn roi_cap_keeps_highest_confidence() {
        let regions: Vec<String> = (0..30)
            .map(|i| {
                region(
                    "window",
                    0.0,
                    f64::from(i) * 0.03,
                    0.5,
                    0.02,
                    0.5 + f64::from(i) * 0.01,
                )
            })
            .collect();
        let reply = format!("{{\"regions\":[{}]}}", regions.join(","));
        let backend = ScriptedBackend::new(vec![Ok(reply)]);
        let config = ExtractionConfig::default();
        let frame = test_frame();

        let outcome = ThumbnailProposer::new(&backend, &config)
            .propose(&frame, &blank_image())
            .await
            .unwrap();
        let rois = match outcome {
            ProposalOutcome::Proposed(rois) => rois,
            ProposalOutcome::Degraded => panic!("should not degrade"),
        };
        assert_eq!(rois.len(), config.max_rois_per_frame);
        // The lowest-confidence proposals (smallest i) were dropped.
        assert!(rois.iter().all(|r| r.confidence > 0.55));
    }

    #[tokio::test]
    async fn malformed_then_valid_uses_strict_retry() {
        let valid = format!("{{\"regions\":[{}]}}", region("chat", 0.2, 0.2, 0.5, 0.5, 0.7));
        let backend =
            ScriptedBackend::new(vec![Ok("this is not json".to_string()), Ok(valid)]);
        let config = ExtractionConfig::default();
        let frame = test_frame();

        let outcome = ThumbnailProposer::new(&backend, &config)
            .propose(&frame, &blank_image())
            .await
            .unwrap();
        assert!(matches!(outcome, ProposalOutcome::Proposed(rois) if rois.len() == 1));
    }

    #[tokio::test]
    async fn repeated_malformed_output_degrades_without_error() {
        let backend = ScriptedBackend::new(vec![
            Ok("garbage".to_string()),
            Ok("{\"regions\": \"still wrong\"}".to_string()),
        ]);
        let config = ExtractionConfig::default();
        let frame = test_frame();

        let outcome = ThumbnailProposer::new(&backend, &config)
            .propose(&frame, &blank_image())
            .await
            .unwrap();
        assert!(matches!(outcome, ProposalOutcome::Degraded));
    }
}
