//! Frame data model.
//!
//! A frame is one captured screenshot. It is created once at ingest and
//! never deleted; extraction outcomes are recorded as status transitions,
//! the pixel payload itself is not retained here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Outcome of extraction for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameStatus {
    /// Ingested, extraction not yet attempted or still in flight.
    Pending,
    /// Records committed.
    Extracted,
    /// Pass-1 proposal failed twice; frame kept with zero records.
    ProposalDegraded,
    /// Every ROI parse failed; zero records committed.
    ExtractionFailed,
    /// Visually identical to the previously extracted frame; skipped.
    SkippedDuplicate,
}

impl FrameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameStatus::Pending => "pending",
            FrameStatus::Extracted => "extracted",
            FrameStatus::ProposalDegraded => "proposal_degraded",
            FrameStatus::ExtractionFailed => "extraction_failed",
            FrameStatus::SkippedDuplicate => "skipped_duplicate",
        }
    }

    pub fn parse(value: &str) -> Option<FrameStatus> {
        match value {
            "pending" => Some(FrameStatus::Pending),
            "extracted" => Some(FrameStatus::Extracted),
            "proposal_degraded" => Some(FrameStatus::ProposalDegraded),
            "extraction_failed" => Some(FrameStatus::ExtractionFailed),
            "skipped_duplicate" => Some(FrameStatus::SkippedDuplicate),
            _ => None,
        }
    }
}

/// One captured screenshot, immutable after ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub frame_id: String,
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub content_checksum: String,
    pub status: FrameStatus,
    pub created_at: DateTime<Utc>,
}

impl Frame {
    /// Build a frame from raw capture bytes. The id is a pure function of
    /// the pixel content so re-ingesting identical bytes yields the same
    /// frame identity.
    pub fn from_capture(
        png_bytes: &[u8],
        width: u32,
        height: u32,
        captured_at: DateTime<Utc>,
    ) -> Self {
        let checksum = content_checksum(png_bytes);
        let frame_id = format!("frm-{}", &checksum[..16]);
        Self {
            frame_id,
            captured_at,
            width,
            height,
            content_checksum: checksum,
            status: FrameStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

pub fn content_checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_id_is_deterministic_over_content() {
        let now = Utc::now();
        let a = Frame::from_capture(b"pixels", 1920, 1080, now);
        let b = Frame::from_capture(b"pixels", 1920, 1080, now);
        assert_eq!(a.frame_id, b.frame_id);
        assert_eq!(a.content_checksum, b.content_checksum);

        let c = Frame::from_capture(b"other pixels", 1920, 1080, now);
        assert_ne!(a.frame_id, c.frame_id);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            FrameStatus::Pending,
            FrameStatus::Extracted,
            FrameStatus::ProposalDegraded,
            FrameStatus::ExtractionFailed,
            FrameStatus::SkippedDuplicate,
        ] {
            assert_eq!(FrameStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(FrameStatus::parse("bogus"), None);
    }
}
