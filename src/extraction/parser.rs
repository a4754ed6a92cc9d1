//! Pass 2: full-resolution ROI parsing.
//!
//! Each candidate ROI is cropped from the original frame pixels and sent
//! through one structured-output vision call (or several, when the crop
//! exceeds the model's input budget and gets re-tiled). OCR tokens inside
//! the region ride along as auxiliary prompt context only.

use std::io::Cursor;

use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::config::ExtractionConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::geometry::PixelBox;
use crate::models::frame::hex_encode;
use crate::models::{CandidateRoi, Frame, ParsedElement, RecordBody, RoiClass, RoiParseResult};
use crate::ocr::{context_lines, OcrToken};
use crate::vision::{with_backoff, VisionBackend, VisionRequest};

const OCR_CONTEXT_MAX_LINES: usize = 40;

const STRICT_SUFFIX: &str = "\nReturn ONLY the JSON object described above. No prose, no \
markdown fences, no additional keys. Omit any element you are not certain about.";

/// Result of pass 2 for one ROI.
#[derive(Debug)]
pub enum ParseOutcome {
    Parsed(RoiParseResult),
    /// Retries exhausted; the ROI is excluded from merge rather than
    /// contributing an empty or invented record.
    Failed { roi_id: String },
}

#[derive(Debug, Deserialize)]
struct ElementDoc {
    elements: Vec<RawElement>,
}

#[derive(Debug, Deserialize)]
struct RawElement {
    body: RecordBody,
    bbox: PixelBox,
    confidence: f64,
}

pub struct HiResParser<'a> {
    backend: &'a dyn VisionBackend,
    config: &'a ExtractionConfig,
}

impl<'a> HiResParser<'a> {
    pub fn new(backend: &'a dyn VisionBackend, config: &'a ExtractionConfig) -> Self {
        Self { backend, config }
    }

    pub async fn parse_roi(
        &self,
        frame: &Frame,
        full_image: &DynamicImage,
        roi: &CandidateRoi,
        ocr_tokens: &[OcrToken],
    ) -> PipelineResult<ParseOutcome> {
        let crop_region = roi.bbox.to_pixels(frame.width, frame.height);
        let prompt = element_prompt(roi.proposed_class, ocr_tokens, &crop_region);
        let prompt_hash = hash_prompt(&prompt);

        let mut elements: Vec<ParsedElement> = Vec::new();
        for tile in tile_regions(&crop_region, self.config.max_crop_edge) {
            let tile_png = encode_crop(full_image, &tile).map_err(|err| {
                PipelineError::Transient(format!("crop encode failed: {err}"))
            })?;

            match self.parse_tile(&prompt, &tile_png, &tile).await {
                Ok(mut tile_elements) => elements.append(&mut tile_elements),
                Err(err) if err.is_contract_violation() => return Err(err),
                Err(err) => {
                    log::warn!(
                        "roi {}: parse failed after retries, excluding from merge: {err}",
                        roi.roi_id
                    );
                    return Ok(ParseOutcome::Failed {
                        roi_id: roi.roi_id.clone(),
                    });
                }
            }
        }

        // Reading order keeps repeated runs byte-identical.
        elements.sort_by_key(|e| (e.bbox.y, e.bbox.x, e.bbox.width, e.bbox.height));

        let confidence = if elements.is_empty() {
            roi.confidence
        } else {
            elements.iter().map(|e| e.confidence).sum::<f64>() / elements.len() as f64
        };

        Ok(ParseOutcome::Parsed(RoiParseResult {
            roi_id: roi.roi_id.clone(),
            global_bbox: crop_region,
            elements,
            confidence,
            model_id: self.backend.model_id().to_string(),
            prompt_hash,
        }))
    }

    /// One tile: bounded transient retries, then a single stricter-prompt
    /// retry when the output is malformed.
    async fn parse_tile(
        &self,
        prompt: &str,
        tile_png: &[u8],
        tile: &PixelBox,
    ) -> PipelineResult<Vec<ParsedElement>> {
        match self.attempt(prompt, tile_png, tile).await {
            Err(PipelineError::MalformedOutput(first)) => {
                log::warn!("malformed element output, retrying with strict prompt: {first}");
                let strict = format!("{prompt}{STRICT_SUFFIX}");
                self.attempt(&strict, tile_png, tile).await
            }
            other => other,
        }
    }

    async fn attempt(
        &self,
        prompt: &str,
        tile_png: &[u8],
        tile: &PixelBox,
    ) -> PipelineResult<Vec<ParsedElement>> {
        let raw = with_backoff(
            self.config.parse_retry_cap,
            self.config.retry_backoff_base_ms,
            || {
                self.backend.complete(VisionRequest {
                    prompt: prompt.to_string(),
                    image_png: tile_png.to_vec(),
                })
            },
        )
        .await?;

        let doc: ElementDoc = serde_json::from_str(raw.trim()).map_err(|err| {
            PipelineError::MalformedOutput(format!("element output failed validation: {err}"))
        })?;

        Ok(doc
            .elements
            .into_iter()
            .filter_map(|raw| to_global_element(raw, tile))
            .collect())
    }
}

/// Tile-local element to global coordinates, dropping anything that falls
/// entirely outside its tile.
fn to_global_element(raw: RawElement, tile: &PixelBox) -> Option<ParsedElement> {
    if raw.bbox.x >= tile.width || raw.bbox.y >= tile.height {
        return None;
    }
    let clamped = PixelBox::new(
        raw.bbox.x,
        raw.bbox.y,
        raw.bbox.width.min(tile.width - raw.bbox.x).max(1),
        raw.bbox.height.min(tile.height - raw.bbox.y).max(1),
    );
    Some(ParsedElement {
        body: raw.body,
        bbox: clamped.offset_by(tile.x, tile.y),
        confidence: raw.confidence.clamp(0.0, 1.0),
    })
}

/// Splits a crop into a grid of tiles, each edge at most `max_edge`.
/// A crop that already fits comes back as a single region.
pub fn tile_regions(crop: &PixelBox, max_edge: u32) -> Vec<PixelBox> {
    let cols = crop.width.div_ceil(max_edge).max(1);
    let rows = crop.height.div_ceil(max_edge).max(1);
    let tile_w = crop.width.div_ceil(cols);
    let tile_h = crop.height.div_ceil(rows);

    let mut tiles = Vec::with_capacity((cols * rows) as usize);
    for row in 0..rows {
        for col in 0..cols {
            let x = crop.x + col * tile_w;
            let y = crop.y + row * tile_h;
            let width = tile_w.min(crop.right() - x);
            let height = tile_h.min(crop.bottom() - y);
            if width == 0 || height == 0 {
                continue;
            }
            tiles.push(PixelBox::new(x, y, width, height));
        }
    }
    tiles
}

fn element_prompt(class: RoiClass, ocr_tokens: &[OcrToken], region: &PixelBox) -> String {
    let mut prompt = format!(
        "This image is a cropped region of a desktop screenshot, proposed as \
a '{}' surface. Extract every typed element you can actually see. Respond \
with JSON only, shaped as {{\"elements\":[{{\"body\":{{...}},\"bbox\":{{\"x\":0,\
\"y\":0,\"width\":0,\"height\":0}},\"confidence\":0.0}}]}}. The body object \
carries a \"kind\" key, one of: {}. Coordinates are pixels relative to this \
image. Do not invent elements.",
        class.as_str(),
        expected_kinds(class),
    );

    let lines = context_lines(ocr_tokens, region, OCR_CONTEXT_MAX_LINES);
    if !lines.is_empty() {
        prompt.push_str(
            "\nText recognized in this region (auxiliary context only, may \
contain recognition errors):\n",
        );
        for line in lines {
            prompt.push_str("- ");
            prompt.push_str(&line);
            prompt.push('\n');
        }
    }
    prompt
}

/// Element kinds the parser asks for, given the ROI's proposed class.
fn expected_kinds(class: RoiClass) -> &'static str {
    match class {
        RoiClass::Window => "window, focus_evidence, action_element",
        RoiClass::TabStrip | RoiClass::BrowserChrome => "browser_chrome, action_element",
        RoiClass::Panel => "window, timeline_entry, action_element",
        RoiClass::Table => "table_row",
        RoiClass::Calendar => "calendar_item",
        RoiClass::Chat => "chat_message",
        RoiClass::Console => "console_line",
    }
}

fn hash_prompt(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hex_encode(&hasher.finalize())[..16].to_string()
}

fn encode_crop(full_image: &DynamicImage, region: &PixelBox) -> Result<Vec<u8>> {
    let crop = full_image.crop_imm(region.x, region.y, region.width, region.height);
    let mut buffer = Cursor::new(Vec::new());
    crop.write_to(&mut buffer, ImageFormat::Png)
        .context("failed to encode crop PNG")?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::NormalizedBox;
    use crate::vision::mock::ScriptedBackend;
    use chrono::Utc;

    fn test_frame() -> Frame {
        Frame::from_capture(b"pixels", 1920, 1080, Utc::now())
    }

    fn test_roi(frame: &Frame) -> CandidateRoi {
        CandidateRoi {
            roi_id: format!("{}-roi000", frame.frame_id),
            frame_id: frame.frame_id.clone(),
            bbox: NormalizedBox {
                x: 0.25,
                y: 0.25,
                width: 0.5,
                height: 0.5,
            },
            proposed_class: RoiClass::Console,
            confidence: 0.8,
            producer_model_id: "scripted-model".into(),
        }
    }

    fn blank_image() -> DynamicImage {
        DynamicImage::new_rgb8(1920, 1080)
    }

    #[test]
    fn small_crop_is_a_single_tile() {
        let crop = PixelBox::new(100, 100, 800, 600);
        assert_eq!(tile_regions(&crop, 1536), vec![crop]);
    }

    #[test]
    fn oversized_crop_tiles_cover_exactly() {
        let crop = PixelBox::new(0, 0, 3200, 1600);
        let tiles = tile_regions(&crop, 1536);
        assert_eq!(tiles.len(), 3 * 2);
        let covered: u64 = tiles.iter().map(|t| t.area()).sum();
        assert_eq!(covered, crop.area());
        for tile in &tiles {
            assert!(tile.width <= 1536 && tile.height <= 1536);
            assert!(tile.right() <= crop.right() && tile.bottom() <= crop.bottom());
        }
    }

    #[tokio::test]
    async fn elements_map_to_global_coordinates() {
        let reply = r#"{"elements":[{"body":{"kind":"console_line","text":"$ cargo test"},"bbox":{"x":10,"y":20,"width":300,"height":16},"confidence":0.9}]}"#;
        let backend = ScriptedBackend::always(reply);
        let config = ExtractionConfig::default();
        let frame = test_frame();
        let roi = test_roi(&frame);

        let outcome = HiResParser::new(&backend, &config)
            .parse_roi(&frame, &blank_image(), &roi, &[])
            .await
            .unwrap();
        let result = match outcome {
            ParseOutcome::Parsed(result) => result,
            ParseOutcome::Failed { .. } => panic!("parse should succeed"),
        };
        assert_eq!(result.elements.len(), 1);
        // Crop origin is (480, 270) for a 0.25-offset ROI on 1920x1080.
        assert_eq!(result.elements[0].bbox.x, 490);
        assert_eq!(result.elements[0].bbox.y, 290);
        assert_eq!(result.roi_id, roi.roi_id);
        assert!(!result.prompt_hash.is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_yield_failed_outcome() {
        let backend = ScriptedBackend::unreachable();
        let config = ExtractionConfig {
            parse_retry_cap: 1,
            retry_backoff_base_ms: 1,
            ..ExtractionConfig::default()
        };
        let frame = test_frame();
        let roi = test_roi(&frame);

        let outcome = HiResParser::new(&backend, &config)
            .parse_roi(&frame, &blank_image(), &roi, &[])
            .await
            .unwrap();
        assert!(matches!(outcome, ParseOutcome::Failed { roi_id } if roi_id == roi.roi_id));
    }

    #[tokio::test]
    async fn malformed_then_strict_retry_succeeds() {
        let valid = r#"{"elements":[{"body":{"kind":"console_line","text":"ok"},"bbox":{"x":0,"y":0,"width":100,"height":14},"confidence":0.8}]}"#;
        let backend = ScriptedBackend::new(vec![
            Ok("```json not actually json".to_string()),
            Ok(valid.to_string()),
        ]);
        let config = ExtractionConfig::default();
        let frame = test_frame();
        let roi = test_roi(&frame);

        let outcome = HiResParser::new(&backend, &config)
            .parse_roi(&frame, &blank_image(), &roi, &[])
            .await
            .unwrap();
        assert!(matches!(outcome, ParseOutcome::Parsed(r) if r.elements.len() == 1));
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn elements_outside_tile_are_dropped() {
        let reply = r#"{"elements":[{"body":{"kind":"console_line","text":"ghost"},"bbox":{"x":5000,"y":5000,"width":10,"height":10},"confidence":0.9}]}"#;
        let backend = ScriptedBackend::always(reply);
        let config = ExtractionConfig::default();
        let frame = test_frame();
        let roi = test_roi(&frame);

        let outcome = HiResParser::new(&backend, &config)
            .parse_roi(&frame, &blank_image(), &roi, &[])
            .await
            .unwrap();
        assert!(matches!(outcome, ParseOutcome::Parsed(r) if r.elements.is_empty()));
    }
}
