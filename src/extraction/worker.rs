//! Per-frame extraction pipeline and its background loop.
//!
//! Frames arrive from an external capture collaborator over a channel.
//! Extraction only runs while the host is idle (the activity signal is
//! consumed, never produced, here) and each frame runs under a hard
//! timeout; a timed-out frame discards all partial results.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use image::DynamicImage;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::ExtractionConfig;
use crate::db::Database;
use crate::error::PipelineError;
use crate::extraction::merge::reconcile;
use crate::extraction::parser::{HiResParser, ParseOutcome};
use crate::extraction::phash::{frame_phash, is_duplicate};
use crate::extraction::proposer::{ProposalOutcome, ThumbnailProposer};
use crate::models::{Frame, FrameStatus, RoiParseResult};
use crate::ocr::{OcrEngine, OcrToken};
use crate::vision::VisionBackend;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// Everything the pipeline needs, passed explicitly instead of living in
/// a global.
#[derive(Clone)]
pub struct PipelineContext {
    pub vision: Arc<dyn VisionBackend>,
    pub ocr: Arc<dyn OcrEngine>,
    pub db: Database,
    pub config: ExtractionConfig,
    inflight: Arc<Semaphore>,
}

impl PipelineContext {
    pub fn new(
        vision: Arc<dyn VisionBackend>,
        ocr: Arc<dyn OcrEngine>,
        db: Database,
        config: ExtractionConfig,
    ) -> Self {
        let inflight = Arc::new(Semaphore::new(config.max_inflight_calls.max(1)));
        Self {
            vision,
            ocr,
            db,
            config,
            inflight,
        }
    }
}

/// One frame handed over by the capture boundary.
#[derive(Debug, Clone)]
pub struct FrameCapture {
    pub png_bytes: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

pub async fn extraction_loop(
    ctx: PipelineContext,
    mut frames: mpsc::Receiver<FrameCapture>,
    activity_rx: watch::Receiver<bool>,
    cancel_token: CancellationToken,
    drain_rx: watch::Receiver<bool>,
) {
    let mut last_phash: Option<String> = None;

    loop {
        tokio::select! {
            maybe_capture = frames.recv() => {
                let Some(capture) = maybe_capture else {
                    log_info!("frame channel closed, extraction loop exiting");
                    break;
                };

                // Hold off while the host is in active foreground use.
                if let Err(err) = wait_until_idle(activity_rx.clone(), &cancel_token).await {
                    log_info!("extraction loop cancelled while waiting for idle: {err}");
                    break;
                }

                match extract_frame(&ctx, capture, &mut last_phash).await {
                    Ok(status) => {
                        log_info!("frame extraction finished with status {}", status.as_str());
                    }
                    Err(err) => log_error!("frame extraction failed: {err:?}"),
                }

                if *drain_rx.borrow() {
                    log_info!("drain requested, extraction loop exiting after current frame");
                    break;
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("extraction loop shutting down");
                break;
            }
        }
    }
}

async fn wait_until_idle(
    mut activity_rx: watch::Receiver<bool>,
    cancel_token: &CancellationToken,
) -> Result<()> {
    while *activity_rx.borrow() {
        tokio::select! {
            changed = activity_rx.changed() => {
                changed.context("activity signal sender dropped")?;
            }
            _ = cancel_token.cancelled() => {
                return Err(anyhow!("cancelled"));
            }
        }
    }
    Ok(())
}

/// Runs the full two-pass pipeline for one frame. Returns the final frame
/// status; partial results are never persisted.
pub async fn extract_frame(
    ctx: &PipelineContext,
    capture: FrameCapture,
    last_phash: &mut Option<String>,
) -> Result<FrameStatus> {
    let frame_start = Instant::now();
    let png_bytes = Arc::new(capture.png_bytes);

    let decode_start = Instant::now();
    let image = tokio::task::spawn_blocking({
        let bytes = Arc::clone(&png_bytes);
        move || image::load_from_memory(&bytes).context("failed to decode frame PNG")
    })
    .await
    .context("frame decode worker join failed")??;
    let decode_duration_ms = decode_start.elapsed().as_millis();

    let frame = Frame::from_capture(&png_bytes, image.width(), image.height(), capture.captured_at);

    let phash = tokio::task::spawn_blocking({
        let bytes = Arc::clone(&png_bytes);
        move || frame_phash(&bytes)
    })
    .await
    .context("phash worker join failed")??;

    match ctx.db.get_frame(&frame.frame_id).await? {
        // A frame that never produced records is retried wholesale on
        // the next ingest of the same bytes.
        Some(existing)
            if matches!(
                existing.status,
                FrameStatus::ExtractionFailed | FrameStatus::Pending
            ) =>
        {
            log_info!(
                "frame {} previously {}, retrying extraction",
                frame.frame_id,
                existing.status.as_str()
            );
        }
        Some(existing) => {
            log_info!(
                "frame {} already ingested ({}), skipping",
                frame.frame_id,
                existing.status.as_str()
            );
            return Ok(FrameStatus::SkippedDuplicate);
        }
        None => {
            ctx.db.insert_frame(&frame).await?;
            if is_duplicate(
                &phash,
                last_phash.as_deref(),
                ctx.config.duplicate_phash_threshold,
            ) {
                log_info!(
                    "frame {} is a near-duplicate of the previous frame, skipping extraction",
                    frame.frame_id
                );
                ctx.db
                    .mark_frame_status(&frame.frame_id, FrameStatus::SkippedDuplicate)
                    .await?;
                return Ok(FrameStatus::SkippedDuplicate);
            }
        }
    }

    let budget = Duration::from_secs(ctx.config.frame_timeout_secs);
    let status = match tokio::time::timeout(
        budget,
        run_extraction(ctx, &frame, &image, &png_bytes),
    )
    .await
    {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => {
            log_error!("frame {} extraction errored: {err:?}", frame.frame_id);
            ctx.db
                .mark_frame_status(&frame.frame_id, FrameStatus::ExtractionFailed)
                .await?;
            FrameStatus::ExtractionFailed
        }
        Err(_) => {
            log_warn!(
                "frame {} extraction timed out (> {}s), discarding partial results",
                frame.frame_id,
                ctx.config.frame_timeout_secs
            );
            ctx.db
                .mark_frame_status(&frame.frame_id, FrameStatus::ExtractionFailed)
                .await?;
            FrameStatus::ExtractionFailed
        }
    };

    // Only a successful extraction advances the duplicate-skip baseline;
    // a failed or degraded frame must stay eligible for recapture.
    if status == FrameStatus::Extracted {
        *last_phash = Some(phash);
    }

    log_info!(
        "frame {} finished in {}ms (decode: {}ms, status: {})",
        frame.frame_id,
        frame_start.elapsed().as_millis(),
        decode_duration_ms,
        status.as_str()
    );
    Ok(status)
}

async fn run_extraction(
    ctx: &PipelineContext,
    frame: &Frame,
    image: &DynamicImage,
    png_bytes: &Arc<Vec<u8>>,
) -> Result<FrameStatus> {
    let proposal_start = Instant::now();
    let proposer = ThumbnailProposer::new(ctx.vision.as_ref(), &ctx.config);
    let rois = match proposer.propose(frame, image).await {
        Ok(ProposalOutcome::Proposed(rois)) => rois,
        Ok(ProposalOutcome::Degraded) => {
            ctx.db
                .commit_frame_records(&frame.frame_id, Vec::new(), FrameStatus::ProposalDegraded)
                .await?;
            return Ok(FrameStatus::ProposalDegraded);
        }
        Err(err) => return Err(err).context("roi proposal failed"),
    };
    let proposal_duration_ms = proposal_start.elapsed().as_millis();
    log_info!(
        "frame {}: {} rois proposed in {}ms",
        frame.frame_id,
        rois.len(),
        proposal_duration_ms
    );

    if rois.is_empty() {
        ctx.db
            .commit_frame_records(&frame.frame_id, Vec::new(), FrameStatus::Extracted)
            .await?;
        return Ok(FrameStatus::Extracted);
    }

    // OCR runs once over the full frame; tokens are sliced per ROI as
    // prompt context.
    let ocr_tokens: Vec<OcrToken> = match tokio::task::spawn_blocking({
        let ocr = Arc::clone(&ctx.ocr);
        let bytes = Arc::clone(png_bytes);
        move || ocr.recognize(&bytes)
    })
    .await
    .context("ocr worker join failed")?
    {
        Ok(tokens) => tokens,
        Err(err) => {
            log_warn!("frame {}: ocr failed, continuing without: {err}", frame.frame_id);
            Vec::new()
        }
    };

    // Fan out one parse task per ROI, bounded by the inflight cap;
    // the merge below is the join point for all of them.
    let parse_start = Instant::now();
    let parser = HiResParser::new(ctx.vision.as_ref(), &ctx.config);
    let outcomes = join_all(rois.iter().map(|roi| {
        let inflight = Arc::clone(&ctx.inflight);
        let parser = &parser;
        let ocr_tokens = &ocr_tokens;
        async move {
            let _permit = inflight
                .acquire()
                .await
                .map_err(|_| PipelineError::Transient("inference permit pool closed".to_string()))?;
            parser.parse_roi(frame, image, roi, ocr_tokens).await
        }
    }))
    .await;
    let parse_duration_ms = parse_start.elapsed().as_millis();

    let mut results: Vec<RoiParseResult> = Vec::new();
    let mut failed = 0usize;
    for outcome in outcomes {
        match outcome {
            Ok(ParseOutcome::Parsed(result)) => results.push(result),
            Ok(ParseOutcome::Failed { roi_id }) => {
                log_warn!("frame {}: roi {} marked parse_failed", frame.frame_id, roi_id);
                failed += 1;
            }
            // Contract violations abort the frame with no fallback.
            Err(err) => return Err(err).context("roi parse aborted"),
        }
    }

    if results.is_empty() {
        log_warn!(
            "frame {}: all {} rois failed to parse, committing nothing",
            frame.frame_id,
            failed
        );
        ctx.db
            .commit_frame_records(&frame.frame_id, Vec::new(), FrameStatus::ExtractionFailed)
            .await?;
        return Ok(FrameStatus::ExtractionFailed);
    }

    let merge_start = Instant::now();
    let records = reconcile(frame, &results, &ctx.config, Utc::now());
    let record_count = records.len();
    ctx.db
        .commit_frame_records(&frame.frame_id, records, FrameStatus::Extracted)
        .await?;

    log_info!(
        "frame {}: committed {} records ({} rois parsed, {} failed; parse: {}ms, merge+commit: {}ms)",
        frame.frame_id,
        record_count,
        results.len(),
        failed,
        parse_duration_ms,
        merge_start.elapsed().as_millis()
    );
    Ok(FrameStatus::Extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordKind;
    use crate::ocr::NullOcr;
    use crate::vision::mock::ScriptedBackend;
    use std::io::Cursor;

    fn png_frame(seed: u8) -> Vec<u8> {
        let mut img = image::RgbImage::new(320, 180);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            *pixel = image::Rgb([seed.wrapping_add(x as u8), y as u8, seed]);
        }
        let mut buffer = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut buffer, image::ImageFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    fn context(backend: ScriptedBackend) -> PipelineContext {
        let _ = env_logger::builder().is_test(true).try_init();
        PipelineContext::new(
            Arc::new(backend),
            Arc::new(NullOcr),
            Database::open_in_memory().unwrap(),
            ExtractionConfig {
                parse_retry_cap: 1,
                retry_backoff_base_ms: 1,
                ..ExtractionConfig::default()
            },
        )
    }

    const PROPOSAL: &str = r#"{"regions":[{"class":"window","bbox":{"x":0.1,"y":0.1,"width":0.6,"height":0.6},"confidence":0.9}]}"#;
    const ELEMENTS: &str = r#"{"elements":[{"body":{"kind":"window","app_name":"firefox","title":"Inbox","app_class":"browser","is_focused":true},"bbox":{"x":0,"y":0,"width":150,"height":90},"confidence":0.9}]}"#;

    #[tokio::test]
    async fn happy_path_commits_records_and_marks_extracted() {
        let backend = ScriptedBackend::new(vec![
            Ok(PROPOSAL.to_string()),
            Ok(ELEMENTS.to_string()),
        ]);
        let ctx = context(backend);
        let capture = FrameCapture {
            png_bytes: png_frame(1),
            captured_at: Utc::now(),
        };

        let mut last_phash = None;
        let status = extract_frame(&ctx, capture, &mut last_phash).await.unwrap();
        assert_eq!(status, FrameStatus::Extracted);

        let frame = ctx.db.latest_extracted_frame().await.unwrap().unwrap();
        let records = ctx.db.get_records_for_frame(&frame.frame_id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind(), RecordKind::Window);
    }

    #[tokio::test]
    async fn unreachable_endpoint_commits_nothing_and_flags_frame() {
        let backend = ScriptedBackend::new(vec![
            Ok(PROPOSAL.to_string()),
            Err(PipelineError::Transient("connection refused".into())),
        ]);
        let ctx = context(backend);
        let capture = FrameCapture {
            png_bytes: png_frame(2),
            captured_at: Utc::now(),
        };

        let mut last_phash = None;
        let status = extract_frame(&ctx, capture, &mut last_phash).await.unwrap();
        assert_eq!(status, FrameStatus::ExtractionFailed);

        // Zero records, frame flagged, never silently complete.
        assert!(ctx.db.latest_extracted_frame().await.unwrap().is_none());
        let frames_status = {
            let frame_id = Frame::from_capture(&png_frame(2), 320, 180, Utc::now()).frame_id;
            ctx.db.get_frame(&frame_id).await.unwrap().unwrap().status
        };
        assert_eq!(frames_status, FrameStatus::ExtractionFailed);
    }

    #[tokio::test]
    async fn degraded_proposal_keeps_frame_without_records() {
        let backend = ScriptedBackend::new(vec![
            Ok("not json".to_string()),
            Ok("also not json".to_string()),
        ]);
        let ctx = context(backend);
        let capture = FrameCapture {
            png_bytes: png_frame(3),
            captured_at: Utc::now(),
        };

        let mut last_phash = None;
        let status = extract_frame(&ctx, capture, &mut last_phash).await.unwrap();
        assert_eq!(status, FrameStatus::ProposalDegraded);
    }

    #[tokio::test]
    async fn failed_frame_is_re_extracted_on_next_ingest() {
        let db = Database::open_in_memory().unwrap();
        let config = ExtractionConfig {
            parse_retry_cap: 1,
            retry_backoff_base_ms: 1,
            ..ExtractionConfig::default()
        };
        let bad_ctx = PipelineContext::new(
            Arc::new(ScriptedBackend::new(vec![
                Ok(PROPOSAL.to_string()),
                Err(PipelineError::Transient("connection refused".into())),
            ])),
            Arc::new(NullOcr),
            db.clone(),
            config.clone(),
        );
        let good_ctx = PipelineContext::new(
            Arc::new(ScriptedBackend::new(vec![
                Ok(PROPOSAL.to_string()),
                Ok(ELEMENTS.to_string()),
            ])),
            Arc::new(NullOcr),
            db.clone(),
            config,
        );
        let bytes = png_frame(6);

        let mut last_phash = None;
        let status = extract_frame(
            &bad_ctx,
            FrameCapture {
                png_bytes: bytes.clone(),
                captured_at: Utc::now(),
            },
            &mut last_phash,
        )
        .await
        .unwrap();
        assert_eq!(status, FrameStatus::ExtractionFailed);
        // A failed frame never becomes the duplicate-skip baseline.
        assert!(last_phash.is_none());

        // Same bytes again once the endpoint is back: retried wholesale.
        let status = extract_frame(
            &good_ctx,
            FrameCapture {
                png_bytes: bytes,
                captured_at: Utc::now(),
            },
            &mut last_phash,
        )
        .await
        .unwrap();
        assert_eq!(status, FrameStatus::Extracted);

        let frame = db.latest_extracted_frame().await.unwrap().unwrap();
        let records = db.get_records_for_frame(&frame.frame_id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(last_phash.is_some());
    }

    #[tokio::test]
    async fn identical_consecutive_frame_is_skipped() {
        let backend = ScriptedBackend::new(vec![
            Ok(PROPOSAL.to_string()),
            Ok(ELEMENTS.to_string()),
        ]);
        let ctx = context(backend);

        let mut last_phash = None;
        let first = FrameCapture {
            png_bytes: png_frame(4),
            captured_at: Utc::now(),
        };
        extract_frame(&ctx, first, &mut last_phash).await.unwrap();

        // Same pixels again: same frame id, short-circuits before any
        // model call.
        let second = FrameCapture {
            png_bytes: png_frame(4),
            captured_at: Utc::now(),
        };
        let status = extract_frame(&ctx, second, &mut last_phash).await.unwrap();
        assert_eq!(status, FrameStatus::SkippedDuplicate);
    }

    #[tokio::test]
    async fn re_extraction_produces_identical_record_ids() {
        let replies = || vec![Ok(PROPOSAL.to_string()), Ok(ELEMENTS.to_string())];
        let bytes = png_frame(5);

        let ctx_a = context(ScriptedBackend::new(replies()));
        let ctx_b = context(ScriptedBackend::new(replies()));

        let mut phash_a = None;
        let mut phash_b = None;
        extract_frame(
            &ctx_a,
            FrameCapture {
                png_bytes: bytes.clone(),
                captured_at: Utc::now(),
            },
            &mut phash_a,
        )
        .await
        .unwrap();
        extract_frame(
            &ctx_b,
            FrameCapture {
                png_bytes: bytes,
                captured_at: Utc::now(),
            },
            &mut phash_b,
        )
        .await
        .unwrap();

        let frame_a = ctx_a.db.latest_extracted_frame().await.unwrap().unwrap();
        let frame_b = ctx_b.db.latest_extracted_frame().await.unwrap().unwrap();
        assert_eq!(frame_a.frame_id, frame_b.frame_id);

        let ids_a: Vec<String> = ctx_a
            .db
            .get_records_for_frame(&frame_a.frame_id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.record_id)
            .collect();
        let ids_b: Vec<String> = ctx_b
            .db
            .get_records_for_frame(&frame_b.frame_id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.record_id)
            .collect();
        assert_eq!(ids_a, ids_b);
        assert!(!ids_a.is_empty());
    }
}
