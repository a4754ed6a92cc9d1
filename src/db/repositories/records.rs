use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde_json::{from_str, to_string};

use crate::db::{
    helpers::{parse_datetime, to_u32},
    Database,
};
use crate::geometry::PixelBox;
use crate::models::record::ProducerStage;
use crate::models::{CanonicalRecord, FrameStatus, Provenance, RecordBody, RecordKind};

impl Database {
    /// Commits one frame's reconciled records and its final status as a
    /// single transaction: either every record lands or none do.
    pub async fn commit_frame_records(
        &self,
        frame_id: &str,
        records: Vec<CanonicalRecord>,
        final_status: FrameStatus,
    ) -> Result<()> {
        let frame_id = frame_id.to_string();
        self.execute(move |conn| {
            let tx = conn
                .transaction()
                .context("failed to open commit transaction")?;

            for record in &records {
                if record.frame_id != frame_id {
                    return Err(anyhow!(
                        "record {} belongs to frame {}, refusing cross-frame commit",
                        record.record_id,
                        record.frame_id
                    ));
                }
                insert_record(&tx, record)?;
            }

            let changed = tx
                .execute(
                    "UPDATE frames SET status = ?1 WHERE frame_id = ?2",
                    params![final_status.as_str(), frame_id],
                )
                .with_context(|| "failed to finalize frame status")?;
            if changed == 0 {
                return Err(anyhow!("frame {frame_id} not found"));
            }

            tx.commit().context("failed to commit frame records")?;
            Ok(())
        })
        .await
    }

    pub async fn get_records_by_ids(&self, ids: Vec<String>) -> Result<Vec<CanonicalRecord>> {
        self.execute(move |conn| {
            let mut out = Vec::with_capacity(ids.len());
            let mut stmt = conn.prepare(&format!("SELECT {RECORD_COLUMNS} FROM records WHERE record_id = ?1"))?;
            for id in &ids {
                let mut rows = stmt.query(params![id])?;
                if let Some(row) = rows.next()? {
                    out.push(record_from_row(row)?);
                }
            }
            Ok(out)
        })
        .await
    }

    pub async fn get_records_by_kind(
        &self,
        kind: RecordKind,
        frame_id: Option<String>,
    ) -> Result<Vec<CanonicalRecord>> {
        self.execute(move |conn| {
            let mut out = Vec::new();
            match frame_id {
                Some(frame) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {RECORD_COLUMNS} FROM records
                         WHERE kind = ?1 AND frame_id = ?2
                         ORDER BY record_id ASC"
                    ))?;
                    let mut rows = stmt.query(params![kind.as_str(), frame])?;
                    while let Some(row) = rows.next()? {
                        out.push(record_from_row(row)?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {RECORD_COLUMNS} FROM records
                         WHERE kind = ?1
                         ORDER BY created_at DESC, record_id ASC"
                    ))?;
                    let mut rows = stmt.query(params![kind.as_str()])?;
                    while let Some(row) = rows.next()? {
                        out.push(record_from_row(row)?);
                    }
                }
            }
            Ok(out)
        })
        .await
    }

    pub async fn get_records_for_frame(&self, frame_id: &str) -> Result<Vec<CanonicalRecord>> {
        let frame_id = frame_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM records
                 WHERE frame_id = ?1 ORDER BY record_id ASC"
            ))?;
            let mut rows = stmt.query(params![frame_id])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(record_from_row(row)?);
            }
            Ok(out)
        })
        .await
    }

    /// Records whose bbox intersects the given region of a frame.
    pub async fn get_records_in_region(
        &self,
        frame_id: &str,
        region: PixelBox,
    ) -> Result<Vec<CanonicalRecord>> {
        let frame_id = frame_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM records
                 WHERE frame_id = ?1
                   AND bbox_x < ?2 AND bbox_x + bbox_w > ?3
                   AND bbox_y < ?4 AND bbox_y + bbox_h > ?5
                 ORDER BY record_id ASC"
            ))?;
            let mut rows = stmt.query(params![
                frame_id,
                region.right(),
                region.x,
                region.bottom(),
                region.y,
            ])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(record_from_row(row)?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn get_records_in_time_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CanonicalRecord>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM records r
                 WHERE EXISTS (
                     SELECT 1 FROM frames f
                     WHERE f.frame_id = r.frame_id
                       AND f.captured_at >= ?1 AND f.captured_at <= ?2
                 )
                 ORDER BY r.created_at ASC, r.record_id ASC"
            ))?;
            let mut rows = stmt.query(params![from.to_rfc3339(), to.to_rfc3339()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(record_from_row(row)?);
            }
            Ok(out)
        })
        .await
    }

    /// Case-insensitive substring scan over record bodies, the auxiliary
    /// retrieval path for queries with no structured match.
    pub async fn search_record_text(
        &self,
        needle: &str,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>> {
        let pattern = format!("%{}%", needle.to_lowercase());
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM records
                 WHERE lower(body_json) LIKE ?1
                 ORDER BY created_at DESC, record_id ASC
                 LIMIT ?2"
            ))?;
            let mut rows = stmt.query(params![pattern, limit as i64])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(record_from_row(row)?);
            }
            Ok(out)
        })
        .await
    }
}

const RECORD_COLUMNS: &str = "record_id, frame_id, kind, bbox_x, bbox_y, bbox_w, bbox_h, \
     body_json, confidence, producer_stage, model_id, prompt_hash, \
     source_roi_ids_json, supersedes, created_at";

fn insert_record(tx: &rusqlite::Transaction<'_>, record: &CanonicalRecord) -> Result<()> {
    let body_json = to_string(&record.body).context("failed to serialize record body")?;
    let roi_ids_json = to_string(&record.provenance.source_roi_ids)
        .context("failed to serialize source roi ids")?;
    tx.execute(
        "INSERT INTO records (
            record_id, frame_id, kind,
            bbox_x, bbox_y, bbox_w, bbox_h,
            body_json, confidence,
            producer_stage, model_id, prompt_hash, source_roi_ids_json,
            supersedes, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            record.record_id,
            record.frame_id,
            record.kind().as_str(),
            record.global_bbox.x,
            record.global_bbox.y,
            record.global_bbox.width,
            record.global_bbox.height,
            body_json,
            record.confidence,
            record.provenance.producer_stage.as_str(),
            record.provenance.model_id,
            record.provenance.prompt_hash,
            roi_ids_json,
            record.supersedes,
            record.created_at.to_rfc3339(),
        ],
    )
    .with_context(|| format!("failed to insert record {}", record.record_id))?;
    Ok(())
}

fn record_from_row(row: &rusqlite::Row<'_>) -> Result<CanonicalRecord> {
    let kind_str: String = row.get(2)?;
    let kind = RecordKind::parse(&kind_str)
        .ok_or_else(|| anyhow!("unknown record kind '{kind_str}'"))?;
    let body: RecordBody =
        from_str(&row.get::<_, String>(7)?).context("failed to parse record body")?;
    if body.kind() != kind {
        return Err(anyhow!(
            "record kind column '{kind_str}' disagrees with body payload"
        ));
    }
    let stage_str: String = row.get(9)?;
    let producer_stage = match stage_str.as_str() {
        "roi_parser" => ProducerStage::RoiParser,
        "merge" => ProducerStage::Merge,
        other => return Err(anyhow!("unknown producer stage '{other}'")),
    };
    let source_roi_ids: Vec<String> =
        from_str(&row.get::<_, String>(12)?).context("failed to parse source roi ids")?;

    Ok(CanonicalRecord {
        record_id: row.get(0)?,
        frame_id: row.get(1)?,
        global_bbox: PixelBox::new(
            to_u32(row.get::<_, i64>(3)?, "bbox_x")?,
            to_u32(row.get::<_, i64>(4)?, "bbox_y")?,
            to_u32(row.get::<_, i64>(5)?, "bbox_w")?,
            to_u32(row.get::<_, i64>(6)?, "bbox_h")?,
        ),
        body,
        confidence: row.get(8)?,
        provenance: Provenance {
            producer_stage,
            model_id: row.get(10)?,
            prompt_hash: row.get(11)?,
            source_roi_ids,
        },
        supersedes: row.get(13)?,
        created_at: parse_datetime(&row.get::<_, String>(14)?, "created_at")?,
    })
}
