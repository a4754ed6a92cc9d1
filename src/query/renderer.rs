//! Rendering the winning path into a citation-backed answer.
//!
//! Pure formatting over already-fetched evidence: no store access, no
//! model calls, no retries. When arbitration selected nothing, the
//! explicit indeterminate response is rendered instead of a guess.

use crate::models::{CanonicalRecord, ConfidenceLabel, QueryResponse, RecordBody};
use crate::query::planner::Intent;

/// Renders the winner. `records` is the winning path's evidence in
/// stable (record-id) order.
pub fn render_answer(intent: &Intent, records: &[CanonicalRecord], score: f64) -> QueryResponse {
    let citations: Vec<String> = records.iter().map(|r| r.record_id.clone()).collect();
    let answer_text = answer_text(intent, records);
    QueryResponse {
        answer_text,
        citations,
        confidence_label: ConfidenceLabel::from_score(score),
        no_evidence: false,
    }
}

/// The required indeterminate outcome: no citations, no fabricated
/// answer.
pub fn render_indeterminate() -> QueryResponse {
    QueryResponse {
        answer_text: "No evidence found for this question.".to_string(),
        citations: Vec::new(),
        confidence_label: ConfidenceLabel::Low,
        no_evidence: true,
    }
}

fn answer_text(intent: &Intent, records: &[CanonicalRecord]) -> String {
    match intent {
        Intent::CountWindows { .. } => records.len().to_string(),
        Intent::FocusedApp => records
            .iter()
            .find_map(|r| match &r.body {
                RecordBody::Window {
                    app_name,
                    is_focused: true,
                    ..
                } => Some(app_name.clone()),
                _ => None,
            })
            .unwrap_or_else(|| first_text(records)),
        Intent::NowPlaying => records
            .iter()
            .find_map(|r| match &r.body {
                RecordBody::TimelineEntry { label, .. } => Some(label.clone()),
                _ => None,
            })
            .unwrap_or_else(|| first_text(records)),
        Intent::ActiveBrowserTab => records
            .iter()
            .find_map(|r| match &r.body {
                RecordBody::BrowserChrome {
                    active_tab: Some(tab),
                    ..
                } => Some(tab.clone()),
                RecordBody::BrowserChrome { url: Some(url), .. } => Some(url.clone()),
                _ => None,
            })
            .unwrap_or_else(|| first_text(records)),
        Intent::UpcomingCalendarItem => records
            .iter()
            .find_map(|r| match &r.body {
                RecordBody::CalendarItem { title, time_text } => Some(match time_text {
                    Some(time) => format!("{title} ({time})"),
                    None => title.clone(),
                }),
                _ => None,
            })
            .unwrap_or_else(|| first_text(records)),
        Intent::LatestChatMessage => records
            .iter()
            .find_map(|r| match &r.body {
                RecordBody::ChatMessage { sender, text } => Some(format!("{sender}: {text}")),
                _ => None,
            })
            .unwrap_or_else(|| first_text(records)),
        Intent::ConsoleErrors => {
            let lines: Vec<&str> = records
                .iter()
                .filter_map(|r| match &r.body {
                    RecordBody::ConsoleLine { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            match lines.first() {
                Some(first) if lines.len() == 1 => format!("1 error line: {first}"),
                Some(first) => format!("{} error lines, first: {first}", lines.len()),
                None => first_text(records),
            }
        }
        Intent::Unknown => String::new(),
    }
}

fn first_text(records: &[CanonicalRecord]) -> String {
    records
        .first()
        .map(|r| r.body.searchable_text().trim().to_string())
        .unwrap_or_default()
}
