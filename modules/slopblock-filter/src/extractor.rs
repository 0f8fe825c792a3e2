//! Normalizes a post node into an [`Item`].
//!
//! Body text is found by a fallback chain (canonical body element, then
//! `lang`-attributed blocks, then secondary text selectors, then every text
//! leaf minus boilerplate). The identifier is the permalink status id when
//! one is present, else a hash of the text.

use std::sync::LazyLock;

use regex::Regex;

use slopblock_common::{Engagement, FilterConfig, Item, UNKNOWN_AUTHOR};

use crate::dom::{NodeRef, Query};

/// A post in the feed.
pub const ITEM_QUERY: Query<'static> = Query::TestId("tweet");

const BODY_QUERY: Query<'static> = Query::TestId("tweetText");
const LANG_QUERY: Query<'static> = Query::HasAttr("lang");
const SECONDARY_QUERIES: [Query<'static>; 2] = [
    Query::TestId("tweetTextInline"),
    Query::AttrEquals("dir", "auto"),
];
const AUTHOR_QUERY: Query<'static> = Query::TestId("User-Name");
const PERMALINK_QUERY: Query<'static> = Query::LinkContaining("/status/");
const MEDIA_QUERIES: [Query<'static>; 6] = [
    Query::TestId("tweetPhoto"),
    Query::TestId("videoPlayer"),
    Query::TestId("videoComponent"),
    Query::TestId("cardPoll"),
    Query::TestId("card.wrapper"),
    Query::TestId("quoteTweet"),
];

static STATUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/status/(\d+)").expect("static regex"));
static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\d+[hms]|[A-Z][a-z]{2} \d{1,2}(?:, \d{4})?)$").expect("static regex")
});
static BARE_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\d.,]+[kKmM]?$").expect("static regex"));
static HANDLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@\w{1,30}$").expect("static regex"));
static SEPARATOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[·•|\-–—/]+$").expect("static regex"));
static NAV_PHRASES: &[&str] = &[
    "Replying to",
    "Show this thread",
    "Show more",
    "Translate post",
    "Promoted",
];

/// Outcome of extracting one node.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Ok(Item),
    /// The node may still be rendering; try again on a later scan.
    SkipRetry(String),
    /// The node will never be processed (policy exclusion).
    SkipPermanent(String),
}

#[derive(Debug, Clone)]
pub struct Extractor {
    min_lang_text_len: usize,
    exclude_media: bool,
}

impl Extractor {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            min_lang_text_len: config.min_lang_text_len,
            exclude_media: config.exclude_media,
        }
    }

    pub fn extract(&self, node: &NodeRef) -> Extraction {
        if self.exclude_media && has_media(node) {
            return Extraction::SkipPermanent("media attachment".to_string());
        }

        let text = self.body_text(node);
        if text.is_empty() {
            return Extraction::SkipRetry("no text extracted".to_string());
        }

        let identifier = permalink_id(node).unwrap_or_else(|| content_hash_id(&text));

        Extraction::Ok(Item {
            identifier,
            author: author(node),
            engagement: Some(engagement(node)),
            text,
        })
    }

    fn body_text(&self, node: &NodeRef) -> String {
        if let Some(body) = node.select(&BODY_QUERY) {
            let text = body.text().trim().to_string();
            if !text.is_empty() {
                return text;
            }
        }

        if let Some(text) = self.first_long_candidate(node, &LANG_QUERY) {
            return text;
        }

        for query in &SECONDARY_QUERIES {
            if let Some(text) = self.first_long_candidate(node, query) {
                return text;
            }
        }

        node.text_leaves()
            .iter()
            .map(|leaf| leaf.trim())
            .filter(|leaf| !leaf.is_empty() && !is_boilerplate(leaf))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn first_long_candidate(&self, node: &NodeRef, query: &Query<'_>) -> Option<String> {
        node.select_all(query)
            .iter()
            .map(|candidate| candidate.text().trim().to_string())
            .find(|text| text.chars().count() > self.min_lang_text_len && !looks_like_chrome(text))
    }
}

/// Links, handles, separators and timestamps are never body text.
fn looks_like_chrome(text: &str) -> bool {
    text.starts_with("http")
        || HANDLE_RE.is_match(text)
        || SEPARATOR_RE.is_match(text)
        || TIMESTAMP_RE.is_match(text)
}

fn is_boilerplate(leaf: &str) -> bool {
    looks_like_chrome(leaf)
        || BARE_NUMBER_RE.is_match(leaf)
        || NAV_PHRASES.iter().any(|p| leaf.starts_with(p))
}

fn has_media(node: &NodeRef) -> bool {
    MEDIA_QUERIES.iter().any(|q| node.select(q).is_some())
}

fn permalink_id(node: &NodeRef) -> Option<String> {
    node.select_all(&PERMALINK_QUERY)
        .iter()
        .filter_map(|link| link.attr("href"))
        .find_map(|href| status_id_from_href(&href))
}

/// `"/alice/status/123?s=20"` → `"123"`.
pub fn status_id_from_href(href: &str) -> Option<String> {
    STATUS_RE
        .captures(href)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Deterministic 64-bit polynomial rolling hash over the text, so the same
/// text without a permalink always maps to the same identifier.
pub fn content_hash_id(text: &str) -> String {
    let hash = text
        .chars()
        .fold(0u64, |acc, ch| acc.wrapping_mul(31).wrapping_add(ch as u64));
    format!("h{hash:016x}")
}

fn author(node: &NodeRef) -> String {
    let Some(block) = node.select(&AUTHOR_QUERY) else {
        return UNKNOWN_AUTHOR.to_string();
    };

    if let Some(handle) = block
        .text_leaves()
        .iter()
        .map(|leaf| leaf.trim())
        .find(|leaf| leaf.starts_with('@') && leaf.len() > 1)
    {
        return handle.trim_start_matches('@').to_string();
    }

    block
        .select_all(&Query::LinkContaining("/"))
        .iter()
        .filter_map(|link| link.attr("href"))
        .map(|href| href.trim_matches('/').to_string())
        .find(|path| !path.is_empty() && !path.contains('/'))
        .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string())
}

fn engagement(node: &NodeRef) -> Engagement {
    let count = |id: &str| {
        node.select(&Query::TestId(id))
            .map(|button| parse_engagement_count(&button.text()))
            .unwrap_or(0)
    };

    Engagement {
        likes: count("like"),
        reposts: count("retweet"),
        replies: count("reply"),
    }
}

/// Parse abbreviated counters: `1.2k` → 1200, `3M` → 3000000, `42` → 42,
/// anything unparseable → 0.
pub fn parse_engagement_count(text: &str) -> u64 {
    let normalized = text.trim().to_lowercase().replace(',', "");
    if normalized.is_empty() {
        return 0;
    }

    let (number, multiplier) = match normalized.chars().last() {
        Some('k') => (&normalized[..normalized.len() - 1], 1_000.0),
        Some('m') => (&normalized[..normalized.len() - 1], 1_000_000.0),
        _ => (normalized.as_str(), 1.0),
    };

    match number.trim().parse::<f64>() {
        Ok(n) if n.is_finite() && n >= 0.0 => (n * multiplier).round() as u64,
        _ => 0,
    }
}
