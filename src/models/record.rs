//! Canonical record data model.
//!
//! A canonical record is the persisted unit of truth: one typed,
//! provenance-tagged fact extracted from a frame. Records are immutable
//! once written; a correction is a new record carrying a `supersedes`
//! pointer to the one it replaces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::geometry::PixelBox;
use crate::models::frame::hex_encode;

/// The closed set of record types the pipeline can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Window,
    FocusEvidence,
    TableRow,
    TimelineEntry,
    CalendarItem,
    ChatMessage,
    ConsoleLine,
    BrowserChrome,
    ActionElement,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Window => "window",
            RecordKind::FocusEvidence => "focus_evidence",
            RecordKind::TableRow => "table_row",
            RecordKind::TimelineEntry => "timeline_entry",
            RecordKind::CalendarItem => "calendar_item",
            RecordKind::ChatMessage => "chat_message",
            RecordKind::ConsoleLine => "console_line",
            RecordKind::BrowserChrome => "browser_chrome",
            RecordKind::ActionElement => "action_element",
        }
    }

    pub fn parse(value: &str) -> Option<RecordKind> {
        match value {
            "window" => Some(RecordKind::Window),
            "focus_evidence" => Some(RecordKind::FocusEvidence),
            "table_row" => Some(RecordKind::TableRow),
            "timeline_entry" => Some(RecordKind::TimelineEntry),
            "calendar_item" => Some(RecordKind::CalendarItem),
            "chat_message" => Some(RecordKind::ChatMessage),
            "console_line" => Some(RecordKind::ConsoleLine),
            "browser_chrome" => Some(RecordKind::BrowserChrome),
            "action_element" => Some(RecordKind::ActionElement),
            _ => None,
        }
    }
}

/// Type-specific payload of a canonical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordBody {
    Window {
        app_name: String,
        title: String,
        /// Window class as reported by the model, e.g. "browser",
        /// "terminal", "editor".
        app_class: Option<String>,
        is_focused: bool,
    },
    FocusEvidence {
        app_name: String,
        detail: String,
    },
    TableRow {
        cells: Vec<String>,
        table_caption: Option<String>,
    },
    TimelineEntry {
        label: String,
        time_text: Option<String>,
    },
    CalendarItem {
        title: String,
        time_text: Option<String>,
    },
    ChatMessage {
        sender: String,
        text: String,
    },
    ConsoleLine {
        text: String,
    },
    BrowserChrome {
        url: Option<String>,
        active_tab: Option<String>,
        tab_titles: Vec<String>,
    },
    ActionElement {
        role: String,
        label: String,
    },
}

impl RecordBody {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordBody::Window { .. } => RecordKind::Window,
            RecordBody::FocusEvidence { .. } => RecordKind::FocusEvidence,
            RecordBody::TableRow { .. } => RecordKind::TableRow,
            RecordBody::TimelineEntry { .. } => RecordKind::TimelineEntry,
            RecordBody::CalendarItem { .. } => RecordKind::CalendarItem,
            RecordBody::ChatMessage { .. } => RecordKind::ChatMessage,
            RecordBody::ConsoleLine { .. } => RecordKind::ConsoleLine,
            RecordBody::BrowserChrome { .. } => RecordKind::BrowserChrome,
            RecordBody::ActionElement { .. } => RecordKind::ActionElement,
        }
    }

    /// Free-text view of the body, used by the fallback text-retrieval
    /// path at query time.
    pub fn searchable_text(&self) -> String {
        match self {
            RecordBody::Window {
                app_name,
                title,
                app_class,
                ..
            } => {
                let class = app_class.as_deref().unwrap_or_default();
                format!("{app_name} {title} {class}")
            }
            RecordBody::FocusEvidence { app_name, detail } => format!("{app_name} {detail}"),
            RecordBody::TableRow {
                cells,
                table_caption,
            } => {
                let caption = table_caption.as_deref().unwrap_or_default();
                format!("{caption} {}", cells.join(" "))
            }
            RecordBody::TimelineEntry { label, time_text } => {
                format!("{label} {}", time_text.as_deref().unwrap_or_default())
            }
            RecordBody::CalendarItem { title, time_text } => {
                format!("{title} {}", time_text.as_deref().unwrap_or_default())
            }
            RecordBody::ChatMessage { sender, text } => format!("{sender} {text}"),
            RecordBody::ConsoleLine { text } => text.clone(),
            RecordBody::BrowserChrome {
                url,
                active_tab,
                tab_titles,
            } => format!(
                "{} {} {}",
                url.as_deref().unwrap_or_default(),
                active_tab.as_deref().unwrap_or_default(),
                tab_titles.join(" ")
            ),
            RecordBody::ActionElement { role, label } => format!("{role} {label}"),
        }
    }
}

/// Which pipeline stage produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerStage {
    RoiParser,
    Merge,
}

impl ProducerStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProducerStage::RoiParser => "roi_parser",
            ProducerStage::Merge => "merge",
        }
    }
}

/// Metadata recording which model, prompt, and source ROIs produced a
/// record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub producer_stage: ProducerStage,
    pub model_id: String,
    pub prompt_hash: String,
    pub source_roi_ids: Vec<String>,
}

/// An immutable, typed, provenance-tagged fact extracted from a frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub record_id: String,
    pub frame_id: String,
    pub global_bbox: PixelBox,
    pub body: RecordBody,
    pub confidence: f64,
    pub provenance: Provenance,
    pub supersedes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CanonicalRecord {
    pub fn kind(&self) -> RecordKind {
        self.body.kind()
    }
}

/// Deterministic record identity: identical frame content, record type,
/// and (grid-snapped) position always hash to the same id, which is what
/// makes re-extraction idempotent.
pub fn record_id(frame_id: &str, kind: RecordKind, bbox: &PixelBox, grid: u32) -> String {
    let snapped = bbox.snapped(grid);
    let mut hasher = Sha256::new();
    hasher.update(frame_id.as_bytes());
    hasher.update(b"|");
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(
        format!(
            "{}:{}:{}:{}",
            snapped.x, snapped.y, snapped.width, snapped.height
        )
        .as_bytes(),
    );
    format!("rec-{}", &hex_encode(&hasher.finalize())[..16])
}
