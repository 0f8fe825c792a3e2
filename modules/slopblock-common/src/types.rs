use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Items
// =============================================================================

/// Engagement counters scraped from a post's action bar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Engagement {
    pub likes: u64,
    pub reposts: u64,
    pub replies: u64,
}

impl Engagement {
    pub fn total(&self) -> u64 {
        self.likes + self.reposts + self.replies
    }
}

/// One normalized post. Only `identifier` ever outlives a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Permalink status id when present, content hash otherwise.
    pub identifier: String,
    pub text: String,
    /// Handle without the leading `@`, or [`UNKNOWN_AUTHOR`].
    pub author: String,
    pub engagement: Option<Engagement>,
}

pub const UNKNOWN_AUTHOR: &str = "unknown";

impl Item {
    pub fn new(identifier: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            text: text.into(),
            author: UNKNOWN_AUTHOR.to_string(),
            engagement: None,
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_engagement(mut self, engagement: Engagement) -> Self {
        self.engagement = Some(engagement);
        self
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Category of a content pattern in the heuristic rule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternCategory {
    Narrative,
    Sales,
    EngagementBait,
    ListStructure,
}

impl fmt::Display for PatternCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternCategory::Narrative => write!(f, "narrative"),
            PatternCategory::Sales => write!(f, "sales"),
            PatternCategory::EngagementBait => write!(f, "engagement_bait"),
            PatternCategory::ListStructure => write!(f, "list_structure"),
        }
    }
}

/// A heuristic signal that fired, in evaluation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum SlopSignal {
    AiSelfIdentification,
    BlockedKeyword { keyword: String },
    Pattern { category: PatternCategory, label: String },
    KeywordDensity { hits: usize },
    EmojiCap { count: usize },
    LineBreakCap { count: usize },
    HashtagCap { count: usize },
    AllCapsTokens { count: usize },
    NumericDensity { ratio_pct: u32 },
    ZeroEngagementLongText { chars: usize },
}

impl fmt::Display for SlopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlopSignal::AiSelfIdentification => write!(f, "AI self-identification"),
            SlopSignal::BlockedKeyword { keyword } => write!(f, "blocked keyword \"{keyword}\""),
            SlopSignal::Pattern { category, label } => write!(f, "{category} pattern: {label}"),
            SlopSignal::KeywordDensity { hits } => write!(f, "slop vocabulary x{hits}"),
            SlopSignal::EmojiCap { count } => write!(f, "{count} emoji"),
            SlopSignal::LineBreakCap { count } => write!(f, "{count} line breaks"),
            SlopSignal::HashtagCap { count } => write!(f, "{count} hashtags"),
            SlopSignal::AllCapsTokens { count } => write!(f, "{count} ALL-CAPS tokens"),
            SlopSignal::NumericDensity { ratio_pct } => write!(f, "{ratio_pct}% numeric tokens"),
            SlopSignal::ZeroEngagementLongText { chars } => {
                write!(f, "{chars} chars with no engagement")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub is_slop: bool,
    /// Clamped to [0, 1].
    pub confidence: f64,
    pub reasons: Vec<SlopSignal>,
}

impl ClassificationResult {
    /// Verdict for allow-listed authors: never slop, no reasons.
    pub fn allowed() -> Self {
        Self {
            is_slop: false,
            confidence: 0.0,
            reasons: Vec::new(),
        }
    }

    pub fn reason_labels(&self) -> Vec<String> {
        self.reasons.iter().map(ToString::to_string).collect()
    }
}

/// One entry of the remote classifier's `results` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemoteVerdict {
    /// Position of the text in the submitted batch.
    pub id: usize,
    pub is_slop: bool,
    /// 0.0 to 1.0.
    #[serde(default)]
    pub confidence: f64,
}

/// Where a collapse verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    Heuristic,
    Remote,
}

impl fmt::Display for VerdictSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerdictSource::Heuristic => write!(f, "heuristic"),
            VerdictSource::Remote => write!(f, "remote"),
        }
    }
}

// =============================================================================
// Policy
// =============================================================================

/// How a flagged post is suppressed on screen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Replace the content with a compact summary control.
    #[default]
    Collapse,
    /// Keep the content but mark the node blurred.
    Blur,
    /// Keep the content but mark the node hidden.
    Hide,
}

impl FilterMode {
    /// Class applied to the node for marker-only modes.
    pub fn css_class(&self) -> Option<&'static str> {
        match self {
            FilterMode::Collapse => None,
            FilterMode::Blur => Some("slop-blurred"),
            FilterMode::Hide => Some("slop-hidden"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_verdict_uses_camel_case_wire_names() {
        let v: RemoteVerdict =
            serde_json::from_str(r#"{"id": 3, "isSlop": true, "confidence": 0.8}"#).unwrap();
        assert_eq!(v.id, 3);
        assert!(v.is_slop);
    }

    #[test]
    fn remote_verdict_confidence_defaults_to_zero() {
        let v: RemoteVerdict = serde_json::from_str(r#"{"id": 0, "isSlop": false}"#).unwrap();
        assert_eq!(v.confidence, 0.0);
    }

    #[test]
    fn filter_mode_round_trips_lowercase() {
        let mode: FilterMode = serde_json::from_str("\"blur\"").unwrap();
        assert_eq!(mode, FilterMode::Blur);
        assert_eq!(FilterMode::default(), FilterMode::Collapse);
        assert_eq!(FilterMode::Hide.css_class(), Some("slop-hidden"));
    }

    #[test]
    fn engagement_total_sums_counters() {
        let e = Engagement {
            likes: 2,
            reposts: 3,
            replies: 5,
        };
        assert_eq!(e.total(), 10);
    }

    #[test]
    fn signals_render_readable_reasons() {
        let result = ClassificationResult {
            is_slop: true,
            confidence: 1.0,
            reasons: vec![SlopSignal::AiSelfIdentification, SlopSignal::EmojiCap { count: 4 }],
        };
        assert_eq!(
            result.reason_labels(),
            vec!["AI self-identification".to_string(), "4 emoji".to_string()]
        );
    }
}
