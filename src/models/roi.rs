//! Pass-1 and pass-2 intermediate models.
//!
//! Candidate ROIs and parse results are ephemeral: they exist between the
//! two vision passes and the merge, and survive only as provenance
//! metadata on the canonical records they produce.

use serde::{Deserialize, Serialize};

use crate::geometry::{NormalizedBox, PixelBox};
use crate::models::record::RecordBody;

/// Class hint attached to a proposed region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoiClass {
    Window,
    TabStrip,
    Panel,
    Table,
    Calendar,
    Chat,
    Console,
    BrowserChrome,
}

impl RoiClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoiClass::Window => "window",
            RoiClass::TabStrip => "tab_strip",
            RoiClass::Panel => "panel",
            RoiClass::Table => "table",
            RoiClass::Calendar => "calendar",
            RoiClass::Chat => "chat",
            RoiClass::Console => "console",
            RoiClass::BrowserChrome => "browser_chrome",
        }
    }
}

/// One pass-1 region proposal, in normalized thumbnail coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRoi {
    pub roi_id: String,
    pub frame_id: String,
    pub bbox: NormalizedBox,
    pub proposed_class: RoiClass,
    pub confidence: f64,
    pub producer_model_id: String,
}

/// One typed element extracted by the pass-2 parser, already mapped to
/// global pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedElement {
    pub body: RecordBody,
    pub bbox: PixelBox,
    pub confidence: f64,
}

/// Everything the pass-2 parser produced for one ROI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoiParseResult {
    pub roi_id: String,
    pub global_bbox: PixelBox,
    pub elements: Vec<ParsedElement>,
    pub confidence: f64,
    pub model_id: String,
    pub prompt_hash: String,
}
