use anyhow::{anyhow, Context, Result};
use rusqlite::params;

use crate::db::{
    helpers::{parse_datetime, to_u32},
    Database,
};
use crate::models::{Frame, FrameStatus};

impl Database {
    pub async fn insert_frame(&self, frame: &Frame) -> Result<()> {
        let record = frame.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO frames (frame_id, captured_at, width, height, content_checksum, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.frame_id,
                    record.captured_at.to_rfc3339(),
                    record.width,
                    record.height,
                    record.content_checksum,
                    record.status.as_str(),
                    record.created_at.to_rfc3339(),
                ],
            )
            .with_context(|| "failed to insert frame")?;
            Ok(())
        })
        .await
    }

    /// Frame status is the one sanctioned mutation in the store; the
    /// pixel-derived columns never change.
    pub async fn mark_frame_status(&self, frame_id: &str, status: FrameStatus) -> Result<()> {
        let frame_id = frame_id.to_string();
        self.execute(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE frames SET status = ?1 WHERE frame_id = ?2",
                    params![status.as_str(), frame_id],
                )
                .with_context(|| "failed to update frame status")?;
            if changed == 0 {
                return Err(anyhow!("frame {frame_id} not found"));
            }
            Ok(())
        })
        .await
    }

    pub async fn get_frame(&self, frame_id: &str) -> Result<Option<Frame>> {
        let frame_id = frame_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT frame_id, captured_at, width, height, content_checksum, status, created_at
                 FROM frames WHERE frame_id = ?1",
            )?;
            let mut rows = stmt.query(params![frame_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(frame_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Most recently captured frame that produced records.
    pub async fn latest_extracted_frame(&self) -> Result<Option<Frame>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT frame_id, captured_at, width, height, content_checksum, status, created_at
                 FROM frames WHERE status = 'extracted'
                 ORDER BY captured_at DESC LIMIT 1",
            )?;
            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => Ok(Some(frame_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await
    }
}

fn frame_from_row(row: &rusqlite::Row<'_>) -> Result<Frame> {
    let status_str: String = row.get(5)?;
    Ok(Frame {
        frame_id: row.get(0)?,
        captured_at: parse_datetime(&row.get::<_, String>(1)?, "captured_at")?,
        width: to_u32(row.get::<_, i64>(2)?, "width")?,
        height: to_u32(row.get::<_, i64>(3)?, "height")?,
        content_checksum: row.get(4)?,
        status: FrameStatus::parse(&status_str)
            .ok_or_else(|| anyhow!("unknown frame status '{status_str}'"))?,
        created_at: parse_datetime(&row.get::<_, String>(6)?, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn insert_and_fetch_frame_round_trips() {
        let db = Database::open_in_memory().unwrap();
        let frame = Frame::from_capture(b"abc", 1920, 1080, Utc::now());
        db.insert_frame(&frame).await.unwrap();

        let fetched = db.get_frame(&frame.frame_id).await.unwrap().unwrap();
        assert_eq!(fetched.frame_id, frame.frame_id);
        assert_eq!(fetched.width, 1920);
        assert_eq!(fetched.status, FrameStatus::Pending);
    }

    #[tokio::test]
    async fn status_transition_and_latest_extracted() {
        let db = Database::open_in_memory().unwrap();
        let older = Frame::from_capture(b"one", 800, 600, Utc::now() - chrono::Duration::minutes(5));
        let newer = Frame::from_capture(b"two", 800, 600, Utc::now());
        db.insert_frame(&older).await.unwrap();
        db.insert_frame(&newer).await.unwrap();

        assert!(db.latest_extracted_frame().await.unwrap().is_none());

        db.mark_frame_status(&older.frame_id, FrameStatus::Extracted)
            .await
            .unwrap();
        db.mark_frame_status(&newer.frame_id, FrameStatus::ExtractionFailed)
            .await
            .unwrap();

        let latest = db.latest_extracted_frame().await.unwrap().unwrap();
        assert_eq!(latest.frame_id, older.frame_id);
    }

    #[tokio::test]
    async fn marking_missing_frame_fails() {
        let db = Database::open_in_memory().unwrap();
        assert!(db
            .mark_frame_status("frm-none", FrameStatus::Extracted)
            .await
            .is_err());
    }
}
