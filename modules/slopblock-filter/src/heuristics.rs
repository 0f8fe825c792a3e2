//! Local heuristic classifier.
//!
//! A pure, deterministic scoring function: each signal that fires adds its
//! configured weight, the sum is clamped to [0, 1], and the post is slop when
//! the score is strictly above the threshold. Signals are reported in
//! evaluation order.

use std::sync::LazyLock;

use regex::Regex;

use slopblock_common::{
    ClassificationResult, Engagement, HeuristicConfig, Item, PatternCategory, SlopSignal,
};

struct ContentPattern {
    category: PatternCategory,
    label: &'static str,
    regex: Regex,
    /// Matches needed before the pattern counts (list structure needs several lines).
    min_matches: usize,
}

impl ContentPattern {
    fn new(category: PatternCategory, label: &'static str, pattern: &str) -> Self {
        Self::repeated(category, label, pattern, 1)
    }

    fn repeated(
        category: PatternCategory,
        label: &'static str,
        pattern: &str,
        min_matches: usize,
    ) -> Self {
        Self {
            category,
            label,
            regex: Regex::new(pattern).expect("static regex"),
            min_matches,
        }
    }

    fn fires(&self, text: &str) -> bool {
        if self.min_matches <= 1 {
            return self.regex.is_match(text);
        }
        self.regex.find_iter(text).count() >= self.min_matches
    }
}

static AI_SELF_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bas an ai\b|\bi am an ai\b|\bi'm an ai\b|\bai[- ]generated\b|\bas a (?:large )?language model\b")
        .expect("static regex")
});

static PATTERNS: LazyLock<Vec<ContentPattern>> = LazyLock::new(|| {
    use PatternCategory::*;
    vec![
        // Narrative
        ContentPattern::new(Narrative, "mindset is everything", r"(?i)\bmindset is everything\b"),
        ContentPattern::new(Narrative, "follow your dreams", r"(?i)\bfollow your (?:dreams|passion)\b"),
        ContentPattern::new(Narrative, "here's what I learned", r"(?i)\bhere'?s what (?:i|we) learned\b"),
        ContentPattern::new(Narrative, "things nobody tells you", r"(?i)\b\d+ (?:things|lessons|truths) (?:nobody|no one) tells you\b"),
        ContentPattern::new(Narrative, "let that sink in", r"(?i)\blet that sink in\b"),
        ContentPattern::new(Narrative, "unpopular opinion", r"(?i)\bunpopular opinion\b"),
        ContentPattern::new(Narrative, "hustle harder", r"(?i)\b(?:hustle|grind) harder\b"),
        ContentPattern::new(Narrative, "changed my life", r"(?i)\b(?:changed|transformed) my life\b"),
        ContentPattern::new(Narrative, "dramatic em dash", "\u{2014}"),
        // Sales
        ContentPattern::new(Sales, "income claim", r"(?i)\$\d[\d,.]*k?\s*(?:/|per |a )\s*(?:month|mo|week|day)\b"),
        ContentPattern::new(Sales, "passive income", r"(?i)\bpassive income\b"),
        ContentPattern::new(Sales, "financial freedom", r"(?i)\bfinancial freedom\b"),
        ContentPattern::new(Sales, "DM me", r"(?i)\bdm me\b"),
        ContentPattern::new(Sales, "link in bio", r"(?i)\blink in (?:my )?bio\b"),
        ContentPattern::new(Sales, "limited time", r"(?i)\blimited[- ]time\b"),
        ContentPattern::new(Sales, "exclusive access", r"(?i)\bexclusive access\b"),
        // Engagement bait
        ContentPattern::new(EngagementBait, "like if you agree", r"(?i)\blike if you agree\b"),
        ContentPattern::new(EngagementBait, "retweet if", r"(?i)\b(?:retweet|rt|repost) if\b"),
        ContentPattern::new(EngagementBait, "comment below", r"(?i)\bcomment below\b"),
        ContentPattern::new(EngagementBait, "thread marker", r"(?i)\x{1F9F5}|\ba thread\b|\bthread:"),
        ContentPattern::new(EngagementBait, "follow for more", r"(?i)\bfollow (?:me )?for more\b"),
        // List structure
        ContentPattern::repeated(ListStructure, "numbered list", r"(?m)^\s*\d+[.)]\s+\S", 3),
        ContentPattern::repeated(ListStructure, "bullet list", r"(?m)^\s*[-*\x{2022}\x{2192}]\s+\S", 3),
    ]
});

static SLOP_VOCABULARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:game[- ]changer|unlock(?:ed|ing)?|leverag(?:e|ing)|delve|revolutioniz(?:e|ing)|transformative|synergy|elevate|empower(?:ing)?|journey|mindset|hustle|grind|10x|unleash|seamless(?:ly)?|cutting[- ]edge|supercharge|dive in|skyrocket)\b",
    )
    .expect("static regex")
});

static EMOJI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\p{Extended_Pictographic}").expect("static regex"));
static HASHTAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#\w+").expect("static regex"));
static ALL_CAPS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z]{3,}\b").expect("static regex"));
static NUMERIC_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[$€£]?\d[\d,.]*[%kKmMxX+]?[.,!?:;]*$").expect("static regex")
});

/// User policy applied on top of the scoring rules.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentPolicy {
    pub allow_list: Vec<String>,
    pub blocked_keywords: Vec<String>,
}

impl ContentPolicy {
    pub fn is_allow_listed(&self, author: &str) -> bool {
        is_allow_listed(author, &self.allow_list)
    }
}

fn normalize_handle(handle: &str) -> String {
    handle.trim().trim_start_matches('@').to_lowercase()
}

/// Case-insensitive exact match on the handle, ignoring a leading `@`.
pub fn is_allow_listed(author: &str, allow_list: &[String]) -> bool {
    let author = normalize_handle(author);
    if author.is_empty() {
        return false;
    }
    allow_list.iter().any(|entry| normalize_handle(entry) == author)
}

#[derive(Debug, Clone, Default)]
pub struct HeuristicClassifier {
    config: HeuristicConfig,
}

impl HeuristicClassifier {
    pub fn new(config: HeuristicConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HeuristicConfig {
        &self.config
    }

    /// Classify an item under `policy`. Allow-listed authors are never slop.
    pub fn classify_item(&self, item: &Item, policy: &ContentPolicy) -> ClassificationResult {
        if policy.is_allow_listed(&item.author) {
            return ClassificationResult::allowed();
        }
        self.classify(&item.text, item.engagement.as_ref(), &policy.blocked_keywords)
    }

    pub fn classify(
        &self,
        text: &str,
        engagement: Option<&Engagement>,
        blocked_keywords: &[String],
    ) -> ClassificationResult {
        let cfg = &self.config;
        let mut score: f64 = 0.0;
        let mut reasons = Vec::new();

        if AI_SELF_ID.is_match(text) {
            score += cfg.ai_self_id_weight;
            reasons.push(SlopSignal::AiSelfIdentification);
        }

        let lowered = text.to_lowercase();
        for keyword in blocked_keywords {
            let keyword = keyword.trim();
            if !keyword.is_empty() && lowered.contains(&keyword.to_lowercase()) {
                score += cfg.blocked_keyword_weight;
                reasons.push(SlopSignal::BlockedKeyword {
                    keyword: keyword.to_string(),
                });
            }
        }

        for pattern in PATTERNS.iter() {
            if pattern.fires(text) {
                score += self.category_weight(pattern.category);
                reasons.push(SlopSignal::Pattern {
                    category: pattern.category,
                    label: pattern.label.to_string(),
                });
            }
        }

        let hits = SLOP_VOCABULARY.find_iter(text).count();
        if hits >= cfg.keyword_min_hits {
            score += (hits as f64 * cfg.keyword_weight_per_hit).min(cfg.keyword_max_contribution);
            reasons.push(SlopSignal::KeywordDensity { hits });
        }

        let emoji = EMOJI.find_iter(text).count();
        if emoji > cfg.emoji_cap {
            score += cfg.emoji_weight;
            reasons.push(SlopSignal::EmojiCap { count: emoji });
        }

        let line_breaks = text.matches('\n').count();
        if line_breaks > cfg.line_break_cap {
            score += cfg.line_break_weight;
            reasons.push(SlopSignal::LineBreakCap { count: line_breaks });
        }

        let hashtags = HASHTAG.find_iter(text).count();
        if hashtags > cfg.hashtag_cap {
            score += cfg.hashtag_weight;
            reasons.push(SlopSignal::HashtagCap { count: hashtags });
        }

        let caps = ALL_CAPS.find_iter(text).count();
        if caps > cfg.all_caps_cap {
            score += cfg.all_caps_weight;
            reasons.push(SlopSignal::AllCapsTokens { count: caps });
        }

        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.len() >= cfg.numeric_min_tokens {
            let numeric = tokens.iter().filter(|t| NUMERIC_TOKEN.is_match(t)).count();
            let ratio = numeric as f64 / tokens.len() as f64;
            if ratio > cfg.numeric_density_cap {
                score += cfg.numeric_weight;
                reasons.push(SlopSignal::NumericDensity {
                    ratio_pct: (ratio * 100.0).round() as u32,
                });
            }
        }

        let chars = text.chars().count();
        if engagement.is_some_and(|e| e.total() == 0) && chars > cfg.zero_engagement_min_chars {
            score += cfg.zero_engagement_weight;
            reasons.push(SlopSignal::ZeroEngagementLongText { chars });
        }

        let confidence = score.clamp(0.0, 1.0);
        ClassificationResult {
            is_slop: confidence > cfg.threshold,
            confidence,
            reasons,
        }
    }

    fn category_weight(&self, category: PatternCategory) -> f64 {
        match category {
            PatternCategory::Narrative => self.config.narrative_weight,
            PatternCategory::Sales => self.config.sales_weight,
            PatternCategory::EngagementBait => self.config.engagement_bait_weight,
            PatternCategory::ListStructure => self.config.list_structure_weight,
        }
    }
}
