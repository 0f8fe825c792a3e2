use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::SlopBlockError;

// =============================================================================
// FilterConfig: every tunable of the pipeline in one place
// =============================================================================

/// Pipeline tunables. Loadable from TOML; every field has a default so a
/// partial file only overrides what it names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterConfig {
    /// Cap on each persisted history set.
    pub max_history_items: usize,
    /// Oldest entries dropped in one go when a history set is full.
    pub history_drop_count: usize,
    /// Queue length that triggers a remote flush.
    pub batch_size: usize,
    /// Window over which mutation notifications are coalesced.
    pub coalesce_window_ms: u64,
    /// Delay before rescanning after a client-side navigation.
    pub navigation_settle_ms: u64,
    /// Skip posts carrying photos, video, polls, quotes or cards.
    pub exclude_media: bool,
    /// Minimum length for a `lang`-attributed block to count as body text.
    pub min_lang_text_len: usize,
    pub heuristics: HeuristicConfig,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_history_items: 200,
            history_drop_count: 10,
            batch_size: 10,
            coalesce_window_ms: 100,
            navigation_settle_ms: 1000,
            exclude_media: false,
            min_lang_text_len: 20,
            heuristics: HeuristicConfig::default(),
        }
    }
}

impl FilterConfig {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    pub fn navigation_settle(&self) -> Duration {
        Duration::from_millis(self.navigation_settle_ms)
    }

    /// Reject combinations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), SlopBlockError> {
        if self.max_history_items == 0 {
            return Err(SlopBlockError::Config(
                "max_history_items must be positive".into(),
            ));
        }
        if self.history_drop_count == 0 || self.history_drop_count > self.max_history_items {
            return Err(SlopBlockError::Config(format!(
                "history_drop_count must be in 1..={}",
                self.max_history_items
            )));
        }
        if self.batch_size == 0 {
            return Err(SlopBlockError::Config("batch_size must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.heuristics.threshold) {
            return Err(SlopBlockError::Config(
                "heuristics.threshold must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Weights, caps and the decision threshold of the heuristic classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeuristicConfig {
    /// A post is slop when its score is strictly greater than this.
    pub threshold: f64,

    pub narrative_weight: f64,
    pub sales_weight: f64,
    pub engagement_bait_weight: f64,
    pub list_structure_weight: f64,

    /// Slop-vocabulary hits needed before density counts.
    pub keyword_min_hits: usize,
    pub keyword_weight_per_hit: f64,
    pub keyword_max_contribution: f64,

    pub emoji_cap: usize,
    pub emoji_weight: f64,
    pub line_break_cap: usize,
    pub line_break_weight: f64,
    pub hashtag_cap: usize,
    pub hashtag_weight: f64,
    pub all_caps_cap: usize,
    pub all_caps_weight: f64,
    /// Fraction of tokens that are numbers, above which the signal fires.
    pub numeric_density_cap: f64,
    pub numeric_min_tokens: usize,
    pub numeric_weight: f64,

    pub ai_self_id_weight: f64,
    pub blocked_keyword_weight: f64,

    pub zero_engagement_min_chars: usize,
    pub zero_engagement_weight: f64,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            narrative_weight: 0.3,
            sales_weight: 0.3,
            engagement_bait_weight: 0.3,
            list_structure_weight: 0.2,
            keyword_min_hits: 3,
            keyword_weight_per_hit: 0.1,
            keyword_max_contribution: 0.4,
            emoji_cap: 3,
            emoji_weight: 0.15,
            line_break_cap: 6,
            line_break_weight: 0.1,
            hashtag_cap: 3,
            hashtag_weight: 0.15,
            all_caps_cap: 3,
            all_caps_weight: 0.1,
            numeric_density_cap: 0.3,
            numeric_min_tokens: 5,
            numeric_weight: 0.1,
            ai_self_id_weight: 0.9,
            blocked_keyword_weight: 1.0,
            zero_engagement_min_chars: 200,
            zero_engagement_weight: 0.1,
        }
    }
}

/// Load and validate a TOML filter config file.
pub fn load_filter_config(path: &Path) -> Result<FilterConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: FilterConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

// =============================================================================
// AppConfig: secrets and provider selection from the environment
// =============================================================================

/// Environment-derived settings for the command-line host.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// `groq`, `openrouter`, or an OpenAI-compatible base URL.
    pub provider: String,
    pub groq_api_key: Option<String>,
    pub openrouter_api_key: Option<String>,
    pub model: Option<String>,
    pub config_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, SlopBlockError> {
        dotenvy::dotenv().ok();

        let config = Self {
            provider: std::env::var("SLOPBLOCK_PROVIDER").unwrap_or_else(|_| "groq".to_string()),
            groq_api_key: non_empty_env("GROQ_API_KEY"),
            openrouter_api_key: non_empty_env("OPENROUTER_API_KEY"),
            model: non_empty_env("SLOPBLOCK_MODEL"),
            config_path: non_empty_env("SLOPBLOCK_CONFIG").map(PathBuf::from),
        };

        if config.provider.trim().is_empty() {
            return Err(SlopBlockError::Config(
                "SLOPBLOCK_PROVIDER must not be blank".into(),
            ));
        }

        config.log_keys();
        Ok(config)
    }

    /// The key matching the selected provider, if one is set.
    pub fn api_key(&self) -> Option<&str> {
        match self.provider.trim().to_lowercase().as_str() {
            "openrouter" => self.openrouter_api_key.as_deref(),
            "groq" => self.groq_api_key.as_deref(),
            _ => self
                .openrouter_api_key
                .as_deref()
                .or(self.groq_api_key.as_deref()),
        }
    }

    fn log_keys(&self) {
        fn preview_opt(val: &Option<String>) -> String {
            match val {
                Some(v) if !v.is_empty() => {
                    let n = v.char_indices().nth(4).map(|(i, _)| i).unwrap_or(v.len());
                    format!("{}...({} chars)", &v[..n], v.len())
                }
                _ => "<not set>".to_string(),
            }
        }

        tracing::info!("Config loaded:");
        tracing::info!("  SLOPBLOCK_PROVIDER: {}", self.provider);
        tracing::info!("  GROQ_API_KEY: {}", preview_opt(&self.groq_api_key));
        tracing::info!("  OPENROUTER_API_KEY: {}", preview_opt(&self.openrouter_api_key));
        tracing::info!(
            "  SLOPBLOCK_CONFIG: {}",
            self.config_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<defaults>".to_string())
        );
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
