//! Intent resolution for free-text queries.
//!
//! Resolution goes through a capability registry: query tokens map to
//! concept tags via a synonym table, and each registered intent declares
//! the concepts it requires and the record kinds it reads. Paraphrases
//! that hit the same concepts resolve to the same intent; there is no
//! branching on literal question strings.

use crate::models::RecordKind;

/// Concept tags a query can express. The synonym table below is the only
/// place query wording is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Concept {
    Count,
    Window,
    Browser,
    Media,
    Focus,
    Calendar,
    Chat,
    Console,
    Error,
}

const SYNONYMS: &[(Concept, &[&str])] = &[
    (Concept::Count, &["how", "many", "count", "number"]),
    (
        Concept::Window,
        &["window", "windows", "open", "app", "apps", "application", "applications"],
    ),
    (
        Concept::Browser,
        &["browser", "browsers", "chrome", "firefox", "safari", "tab", "tabs", "url", "website", "page", "site"],
    ),
    (
        Concept::Media,
        &["song", "track", "music", "playing", "listening", "audio", "player"],
    ),
    (
        Concept::Focus,
        &["focused", "focus", "active", "using", "foreground", "working"],
    ),
    (
        Concept::Calendar,
        &["meeting", "meetings", "calendar", "event", "events", "appointment", "schedule"],
    ),
    (
        Concept::Chat,
        &["chat", "message", "messages", "conversation", "said", "dm", "slack"],
    ),
    (
        Concept::Console,
        &["terminal", "console", "shell", "command", "commands"],
    ),
    (Concept::Error, &["error", "errors", "failed", "failure", "crash"]),
];

/// Resolved query intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Count open windows, optionally restricted to an app class such as
    /// "browser".
    CountWindows { app_class: Option<String> },
    FocusedApp,
    NowPlaying,
    ActiveBrowserTab,
    UpcomingCalendarItem,
    LatestChatMessage,
    ConsoleErrors,
    /// Nothing in the registry matched; the run ends indeterminate.
    Unknown,
}

impl Intent {
    pub fn name(&self) -> &'static str {
        match self {
            Intent::CountWindows { .. } => "count_windows",
            Intent::FocusedApp => "focused_app",
            Intent::NowPlaying => "now_playing",
            Intent::ActiveBrowserTab => "active_browser_tab",
            Intent::UpcomingCalendarItem => "upcoming_calendar_item",
            Intent::LatestChatMessage => "latest_chat_message",
            Intent::ConsoleErrors => "console_errors",
            Intent::Unknown => "unknown",
        }
    }

    /// Record kinds this intent needs evidence from.
    pub fn required_kinds(&self) -> Vec<RecordKind> {
        match self {
            Intent::CountWindows { .. } => vec![RecordKind::Window],
            Intent::FocusedApp => vec![RecordKind::Window],
            Intent::NowPlaying => vec![RecordKind::TimelineEntry],
            Intent::ActiveBrowserTab => vec![RecordKind::BrowserChrome],
            Intent::UpcomingCalendarItem => vec![RecordKind::CalendarItem],
            Intent::LatestChatMessage => vec![RecordKind::ChatMessage],
            Intent::ConsoleErrors => vec![RecordKind::ConsoleLine],
            Intent::Unknown => Vec::new(),
        }
    }
}

/// One registry row: the concepts an intent requires, the extra concepts
/// that strengthen the match, and the intent it resolves to.
struct Capability {
    required: &'static [Concept],
    boosting: &'static [Concept],
    build: fn(&[Concept]) -> Intent,
}

/// Registry order is the deterministic tie-break.
fn registry() -> Vec<Capability> {
    vec![
        Capability {
            required: &[Concept::Count, Concept::Window],
            boosting: &[Concept::Browser],
            build: |concepts| Intent::CountWindows {
                app_class: concepts
                    .contains(&Concept::Browser)
                    .then(|| "browser".to_string()),
            },
        },
        Capability {
            required: &[Concept::Media],
            boosting: &[],
            build: |_| Intent::NowPlaying,
        },
        Capability {
            required: &[Concept::Browser],
            boosting: &[Concept::Focus],
            build: |_| Intent::ActiveBrowserTab,
        },
        Capability {
            required: &[Concept::Console, Concept::Error],
            boosting: &[],
            build: |_| Intent::ConsoleErrors,
        },
        Capability {
            required: &[Concept::Calendar],
            boosting: &[],
            build: |_| Intent::UpcomingCalendarItem,
        },
        Capability {
            required: &[Concept::Chat],
            boosting: &[],
            build: |_| Intent::LatestChatMessage,
        },
        Capability {
            required: &[Concept::Focus],
            boosting: &[Concept::Window],
            build: |_| Intent::FocusedApp,
        },
    ]
}

/// The plan handed to candidate generation.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub intent: Intent,
    pub required_kinds: Vec<RecordKind>,
    /// Salient (non-stopword) tokens, kept for the text-retrieval path.
    pub salient_tokens: Vec<String>,
}

pub struct QueryPlanner {
    capabilities: Vec<Capability>,
}

impl QueryPlanner {
    /// Builds the capability table once; resolution itself is pure.
    pub fn new() -> Self {
        Self {
            capabilities: registry(),
        }
    }

    pub fn plan(&self, query_text: &str) -> QueryPlan {
        let tokens = tokenize(query_text);
        let concepts = concepts_of(&tokens);

        let mut best: Option<(usize, &Capability)> = None;
        for capability in &self.capabilities {
            if !capability
                .required
                .iter()
                .all(|concept| concepts.contains(concept))
            {
                continue;
            }
            let score = capability.required.len()
                + capability
                    .boosting
                    .iter()
                    .filter(|concept| concepts.contains(concept))
                    .count();
            // Strictly-greater keeps the first (registry-order) winner on
            // ties.
            if best.map_or(true, |(best_score, _)| score > best_score) {
                best = Some((score, capability));
            }
        }

        let intent = match best {
            Some((_, capability)) => (capability.build)(&concepts),
            None => Intent::Unknown,
        };
        let required_kinds = intent.required_kinds();

        QueryPlan {
            intent,
            required_kinds,
            salient_tokens: salient(&tokens),
        }
    }
}

impl Default for QueryPlanner {
    fn default() -> Self {
        Self::new()
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

fn concepts_of(tokens: &[String]) -> Vec<Concept> {
    let mut found = Vec::new();
    for (concept, words) in SYNONYMS {
        if tokens.iter().any(|t| words.contains(&t.as_str())) && !found.contains(concept) {
            found.push(*concept);
        }
    }
    found
}

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "what", "which", "who", "whats", "how", "do",
    "does", "did", "my", "me", "i", "on", "in", "of", "to", "currently", "right", "now", "there",
];

fn salient(tokens: &[String]) -> Vec<String> {
    tokens
        .iter()
        .filter(|t| !STOPWORDS.contains(&t.as_str()) && t.len() > 2)
        .cloned()
        .collect()
}
