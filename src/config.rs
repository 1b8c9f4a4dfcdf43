use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub run: RunConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    #[serde(default = "default_listing_url")]
    pub url: String,
    /// Consecutive scrolls without page growth before the page counts as settled.
    #[serde(default = "default_idle_checks")]
    pub idle_checks: u32,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_render_timeout_secs")]
    pub render_timeout_secs: u64,
    #[serde(default = "default_discovery_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    #[serde(default)]
    pub chrome_executable: Option<PathBuf>,
    /// Regex with exactly one capture group yielding the identifier.
    #[serde(default = "default_link_pattern")]
    pub link_pattern: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            url: default_listing_url(),
            idle_checks: default_idle_checks(),
            settle_ms: default_settle_ms(),
            render_timeout_secs: default_render_timeout_secs(),
            retries: default_discovery_retries(),
            retry_backoff_secs: default_retry_backoff_secs(),
            chrome_executable: None,
            link_pattern: default_link_pattern(),
        }
    }
}

fn default_listing_url() -> String {
    "https://store.steampowered.com/sale/nextfest".to_string()
}
fn default_idle_checks() -> u32 {
    3
}
fn default_settle_ms() -> u64 {
    2000
}
fn default_render_timeout_secs() -> u64 {
    300
}
fn default_discovery_retries() -> u32 {
    2
}
fn default_retry_backoff_secs() -> u64 {
    30
}
fn default_link_pattern() -> String {
    r"/app/(\d+)".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    #[serde(default = "default_details_url")]
    pub details_url: String,
    /// Concurrent-player endpoint. An empty string disables the interest metric.
    #[serde(default = "default_players_url")]
    pub players_url: Option<String>,
    /// Review-summary endpoint; the identifier is appended as a path segment.
    /// An empty string disables the review counters.
    #[serde(default = "default_reviews_url")]
    pub reviews_url: Option<String>,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            details_url: default_details_url(),
            players_url: default_players_url(),
            reviews_url: default_reviews_url(),
            locale: default_locale(),
            country: None,
            min_interval_ms: default_min_interval_ms(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_details_url() -> String {
    "https://store.steampowered.com/api/appdetails".to_string()
}
fn default_players_url() -> Option<String> {
    Some(
        "https://api.steampowered.com/ISteamUserStats/GetNumberOfCurrentPlayers/v1/".to_string(),
    )
}
fn default_reviews_url() -> Option<String> {
    Some("https://store.steampowered.com/appreviews".to_string())
}
fn default_locale() -> String {
    "english".to_string()
}
fn default_min_interval_ms() -> u64 {
    1500
}
fn default_max_retries() -> u32 {
    4
}
fn default_backoff_base_ms() -> u64 {
    2000
}
fn default_timeout_secs() -> u64 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunConfig {
    /// Wall-clock budget for the whole run, discovery included. Once spent,
    /// discovery is not retried and remaining titles are skipped.
    #[serde(default = "default_budget_secs")]
    pub budget_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            budget_secs: default_budget_secs(),
        }
    }
}

fn default_budget_secs() -> u64 {
    3 * 60 * 60
}

impl DiscoveryConfig {
    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

impl RunConfig {
    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.budget_secs)
    }
}

impl Config {
    /// Configuration with every default and the given database path.
    pub fn with_db(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            discovery: DiscoveryConfig::default(),
            enrichment: EnrichmentConfig::default(),
            run: RunConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate discovery
    url::Url::parse(&config.discovery.url)
        .with_context(|| format!("discovery.url is not a valid URL: {}", config.discovery.url))?;
    if config.discovery.idle_checks == 0 {
        anyhow::bail!("discovery.idle_checks must be >= 1");
    }
    if config.discovery.render_timeout_secs == 0 {
        anyhow::bail!("discovery.render_timeout_secs must be >= 1");
    }
    let pattern = regex::Regex::new(&config.discovery.link_pattern)
        .with_context(|| "discovery.link_pattern is not a valid regex")?;
    if pattern.captures_len() != 2 {
        anyhow::bail!(
            "discovery.link_pattern must have exactly one capture group, found {}",
            pattern.captures_len() - 1
        );
    }

    // Validate enrichment
    url::Url::parse(&config.enrichment.details_url).with_context(|| {
        format!(
            "enrichment.details_url is not a valid URL: {}",
            config.enrichment.details_url
        )
    })?;
    for (key, value) in [
        ("players_url", &config.enrichment.players_url),
        ("reviews_url", &config.enrichment.reviews_url),
    ] {
        if let Some(u) = value.as_ref().filter(|u| !u.trim().is_empty()) {
            url::Url::parse(u)
                .with_context(|| format!("enrichment.{} is not a valid URL: {}", key, u))?;
        }
    }
    if config.enrichment.locale.trim().is_empty() {
        anyhow::bail!("enrichment.locale must not be empty");
    }

    if config.run.budget_secs == 0 {
        anyhow::bail!("run.budget_secs must be >= 1");
    }

    Ok(())
}
