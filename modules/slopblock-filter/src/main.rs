use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ai_client::{ChatClient, Provider};
use slopblock_common::{load_filter_config, AppConfig, Engagement, FilterConfig, Item};
use slopblock_filter::dispatcher::{dispatch, DispatchOutcome};
use slopblock_filter::extractor::content_hash_id;
use slopblock_filter::store::DEFAULT_SYSTEM_PROMPT;
use slopblock_filter::{ContentPolicy, HeuristicClassifier, LlmClassifier};

/// Classify feed posts offline, one post per input line.
///
/// A line is either a JSON object (`{"id", "author", "text", "engagement"}`,
/// only `text` required) or plain post text.
#[derive(Parser)]
#[command(name = "slopblock", version)]
struct Cli {
    /// TOML file overriding the built-in filter config.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Author handle to never flag. Repeatable.
    #[arg(long = "allow", global = true)]
    allow_list: Vec<String>,

    /// Keyword that always flags a post. Repeatable.
    #[arg(long = "block", global = true)]
    blocked_keywords: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the local heuristic classifier.
    Classify {
        /// Input file; stdin when omitted.
        file: Option<PathBuf>,
    },
    /// Send posts to the remote classifier in batches.
    Remote {
        /// Input file; stdin when omitted.
        file: Option<PathBuf>,
    },
}

#[derive(Deserialize)]
struct PostLine {
    id: Option<String>,
    author: Option<String>,
    text: String,
    engagement: Option<Engagement>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VerdictLine<'a> {
    id: &'a str,
    author: &'a str,
    is_slop: bool,
    confidence: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    reasons: Vec<String>,
    source: &'static str,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("slopblock=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let app = AppConfig::from_env()?;

    let config_path = cli.config.clone().or_else(|| app.config_path.clone());
    let config = match &config_path {
        Some(path) => load_filter_config(path)?,
        None => FilterConfig::default(),
    };
    let policy = ContentPolicy {
        allow_list: cli.allow_list.clone(),
        blocked_keywords: cli.blocked_keywords.clone(),
    };

    match &cli.command {
        Command::Classify { file } => {
            let items = read_items(file.as_deref())?;
            classify_local(&items, &config, &policy)?;
        }
        Command::Remote { file } => {
            let items = read_items(file.as_deref())?;
            classify_remote(items, &config, &policy, &app).await?;
        }
    }
    Ok(())
}

fn read_items(file: Option<&Path>) -> Result<Vec<Item>> {
    let input = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read stdin")?;
            buf
        }
    };

    let items: Vec<Item> = input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(parse_line)
        .collect();
    info!(items = items.len(), "Posts loaded");
    Ok(items)
}

fn parse_line(line: &str) -> Option<Item> {
    let post = match serde_json::from_str::<PostLine>(line) {
        Ok(post) => post,
        Err(_) if line.starts_with('{') => {
            warn!(line, "Skipping malformed JSON line");
            return None;
        }
        Err(_) => PostLine {
            id: None,
            author: None,
            text: line.to_string(),
            engagement: None,
        },
    };

    let text = post.text.trim();
    if text.is_empty() {
        return None;
    }
    let id = post.id.unwrap_or_else(|| content_hash_id(text));
    let mut item = Item::new(id, text);
    if let Some(author) = post.author {
        item = item.with_author(author.trim_start_matches('@'));
    }
    if let Some(engagement) = post.engagement {
        item = item.with_engagement(engagement);
    }
    Some(item)
}

fn classify_local(items: &[Item], config: &FilterConfig, policy: &ContentPolicy) -> Result<()> {
    let classifier = HeuristicClassifier::new(config.heuristics.clone());
    let mut flagged = 0;
    for item in items {
        let result = classifier.classify_item(item, policy);
        if result.is_slop {
            flagged += 1;
        }
        print_line(&VerdictLine {
            id: &item.identifier,
            author: &item.author,
            is_slop: result.is_slop,
            confidence: result.confidence,
            reasons: result.reason_labels(),
            source: "heuristic",
        })?;
    }
    info!(total = items.len(), flagged, "Heuristic classification complete");
    Ok(())
}

async fn classify_remote(
    items: Vec<Item>,
    config: &FilterConfig,
    policy: &ContentPolicy,
    app: &AppConfig,
) -> Result<()> {
    let provider: Provider = app.provider.parse()?;
    let Some(api_key) = app.api_key() else {
        bail!("No API key set for provider {}", app.provider);
    };
    provider.validate_key(api_key)?;

    let mut client = ChatClient::new(provider, api_key).with_app_name("SlopBlock");
    if let Some(model) = &app.model {
        client = client.with_model(model.clone());
    }
    info!(model = client.model(), batch_size = config.batch_size, "Remote classifier ready");
    let classifier = LlmClassifier::new(client);

    let (allowed, queued): (Vec<Item>, Vec<Item>) = items
        .into_iter()
        .partition(|item| policy.is_allow_listed(&item.author));
    for item in &allowed {
        print_line(&VerdictLine {
            id: &item.identifier,
            author: &item.author,
            is_slop: false,
            confidence: 0.0,
            reasons: vec!["allow-listed".to_string()],
            source: "policy",
        })?;
    }

    let mut flagged = 0;
    let mut failed = 0;
    for (index, chunk) in queued.chunks(config.batch_size).enumerate() {
        match dispatch(chunk.to_vec(), DEFAULT_SYSTEM_PROMPT, &classifier).await {
            DispatchOutcome::Classified(pairs) => {
                for (item, verdict) in pairs {
                    if verdict.is_slop {
                        flagged += 1;
                    }
                    print_line(&VerdictLine {
                        id: &item.identifier,
                        author: &item.author,
                        is_slop: verdict.is_slop,
                        confidence: verdict.confidence,
                        reasons: Vec::new(),
                        source: "remote",
                    })?;
                }
            }
            DispatchOutcome::Unavailable(reason) => {
                failed += 1;
                warn!(batch = index, size = chunk.len(), reason = %reason, "Batch failed, no verdicts");
            }
        }
    }
    info!(total = queued.len(), flagged, failed_batches = failed, "Remote classification complete");
    Ok(())
}

fn print_line(line: &VerdictLine<'_>) -> Result<()> {
    println!("{}", serde_json::to_string(line)?);
    Ok(())
}
