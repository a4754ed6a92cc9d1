//! Reconciliation of pass-2 results into canonical records.
//!
//! Overlapping detections of the same record type collapse into one
//! record; everything about the pass is deterministic so that merging the
//! same parse results twice yields byte-identical record sets.

use chrono::{DateTime, Utc};

use crate::config::ExtractionConfig;
use crate::geometry::PixelBox;
use crate::models::record::{record_id, ProducerStage};
use crate::models::{CanonicalRecord, Frame, Provenance, RecordBody, RoiParseResult};

/// One detection in flight during reconciliation.
#[derive(Debug, Clone)]
struct Detection {
    body: RecordBody,
    bbox: PixelBox,
    confidence: f64,
    model_id: String,
    prompt_hash: String,
    source_roi_ids: Vec<String>,
}

impl Detection {
    /// Lexicographically smallest contributing roi id, the reproducible
    /// tie-break key when confidences are equal.
    fn min_roi_id(&self) -> &str {
        self.source_roi_ids
            .iter()
            .min()
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// Merges all parse results for one frame into a commit-ready batch.
///
/// The batch is sorted by record id; callers persist it atomically or not
/// at all.
pub fn reconcile(
    frame: &Frame,
    results: &[RoiParseResult],
    config: &ExtractionConfig,
    created_at: DateTime<Utc>,
) -> Vec<CanonicalRecord> {
    let mut detections: Vec<Detection> = Vec::new();
    for result in results {
        for element in &result.elements {
            detections.push(Detection {
                body: element.body.clone(),
                bbox: element.bbox,
                confidence: element.confidence,
                model_id: result.model_id.clone(),
                prompt_hash: result.prompt_hash.clone(),
                source_roi_ids: vec![result.roi_id.clone()],
            });
        }
    }

    // Stable working order regardless of roi arrival order.
    detections.sort_by(|a, b| {
        (a.body.kind().as_str(), a.min_roi_id(), a.bbox.y, a.bbox.x).cmp(&(
            b.body.kind().as_str(),
            b.min_roi_id(),
            b.bbox.y,
            b.bbox.x,
        ))
    });

    // Pairwise merge until no overlapping compatible pair remains.
    loop {
        let mut merged_any = false;
        'outer: for i in 0..detections.len() {
            for j in (i + 1)..detections.len() {
                if !compatible(&detections[i], &detections[j]) {
                    continue;
                }
                if detections[i].bbox.iou(&detections[j].bbox) <= config.merge_iou_threshold {
                    continue;
                }
                let loser = detections.remove(j);
                let winner = &mut detections[i];
                merge_into(winner, loser);
                merged_any = true;
                break 'outer;
            }
        }
        if !merged_any {
            break;
        }
    }

    let mut records: Vec<CanonicalRecord> = detections
        .into_iter()
        .map(|detection| {
            let merged = detection.source_roi_ids.len() > 1;
            let mut source_roi_ids = detection.source_roi_ids;
            source_roi_ids.sort();
            source_roi_ids.dedup();
            CanonicalRecord {
                record_id: record_id(
                    &frame.frame_id,
                    detection.body.kind(),
                    &detection.bbox,
                    config.record_id_grid,
                ),
                frame_id: frame.frame_id.clone(),
                global_bbox: detection.bbox,
                body: detection.body,
                confidence: detection.confidence,
                provenance: Provenance {
                    producer_stage: if merged {
                        ProducerStage::Merge
                    } else {
                        ProducerStage::RoiParser
                    },
                    model_id: detection.model_id,
                    prompt_hash: detection.prompt_hash,
                    source_roi_ids,
                },
                supersedes: None,
                created_at,
            }
        })
        .collect();

    records.sort_by(|a, b| a.record_id.cmp(&b.record_id));

    // Snapped bboxes can collide even below the IoU threshold; identical
    // ids must collapse before commit or the batch would violate the
    // primary key.
    records.dedup_by(|b, a| {
        if a.record_id != b.record_id {
            return false;
        }
        if b.confidence > a.confidence {
            std::mem::swap(a, b);
        }
        true
    });

    records
}

fn compatible(a: &Detection, b: &Detection) -> bool {
    a.body.kind() == b.body.kind()
}

/// Keeps the higher-confidence detection's fields; ties go to the
/// lexicographically lower roi id so repeated runs pick the same winner.
fn merge_into(winner: &mut Detection, loser: Detection) {
    let loser_wins = loser.confidence > winner.confidence
        || (loser.confidence == winner.confidence && loser.min_roi_id() < winner.min_roi_id());

    let union_bbox = winner.bbox.union(&loser.bbox);
    let mut roi_ids = std::mem::take(&mut winner.source_roi_ids);
    roi_ids.extend(loser.source_roi_ids.iter().cloned());

    if loser_wins {
        winner.body = loser.body;
        winner.confidence = loser.confidence;
        winner.model_id = loser.model_id;
        winner.prompt_hash = loser.prompt_hash;
    }
    winner.bbox = union_bbox;
    winner.source_roi_ids = roi_ids;
}
