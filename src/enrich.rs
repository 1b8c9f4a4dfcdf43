//! Per-title enrichment against the storefront metadata API.
//!
//! For each identifier the enricher issues a details request and, when
//! configured, a concurrent-player request and a review-summary request. It
//! validates the loosely shaped
//! JSON into typed optional fields, and produces an [`EnrichedRecord`].
//!
//! # Pacing
//!
//! Every outbound request, retries included, passes through one shared
//! [`Pacer`] that enforces a minimum interval between calls. Requests are
//! spread evenly rather than sent in bursts.
//!
//! # Retry Strategy
//!
//! - HTTP 429 and 5xx, transport errors → retry with exponential backoff
//! - Other 4xx, malformed bodies, `success: false` → fail immediately
//! - Backoff: base, 2×base, 4×base, … (capped at 2^5 × base)
//!
//! Failures are per title. The caller records them and moves on.

use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::EnrichmentConfig;
use crate::error::{EnrichError, FetchError};
use crate::fetcher::{JsonDocument, JsonSource};
use crate::models::{EnrichedRecord, ReviewSummary, TitleMetadata};

// ═══════════════════════════════════════════════════════════════════════
// Settings
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff_base * (1u32 << attempt.saturating_sub(1).min(5))
    }
}

/// Everything the enricher needs, fixed at construction.
#[derive(Debug, Clone)]
pub struct EnricherSettings {
    pub details_url: String,
    pub players_url: Option<String>,
    pub reviews_url: Option<String>,
    pub locale: String,
    pub country: Option<String>,
    pub min_interval: Duration,
    pub retry: RetryPolicy,
}

impl EnricherSettings {
    pub fn from_config(config: &EnrichmentConfig) -> Self {
        Self {
            details_url: config.details_url.clone(),
            players_url: config.players_url.clone().filter(|u| !u.trim().is_empty()),
            reviews_url: config.reviews_url.clone().filter(|u| !u.trim().is_empty()),
            locale: config.locale.clone(),
            country: config.country.clone(),
            min_interval: Duration::from_millis(config.min_interval_ms),
            retry: RetryPolicy {
                max_retries: config.max_retries,
                backoff_base: Duration::from_millis(config.backoff_base_ms),
            },
        }
    }
}

/// Fixed-interval gate shared by all requests of one enricher.
#[derive(Debug)]
pub struct Pacer {
    min_interval: Duration,
    last: Option<Instant>,
}

impl Pacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    /// Wait until at least `min_interval` has passed since the previous call.
    pub async fn wait(&mut self) {
        if let Some(last) = self.last {
            tokio::time::sleep_until(last + self.min_interval).await;
        }
        self.last = Some(Instant::now());
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Enricher
// ═══════════════════════════════════════════════════════════════════════

pub struct Enricher {
    source: Arc<dyn JsonSource>,
    settings: EnricherSettings,
    pacer: Mutex<Pacer>,
}

impl Enricher {
    pub fn new(source: Arc<dyn JsonSource>, settings: EnricherSettings) -> Self {
        let pacer = Mutex::new(Pacer::new(settings.min_interval));
        Self {
            source,
            settings,
            pacer,
        }
    }

    /// Fetch and normalize one title.
    pub async fn enrich(&self, identifier: &str) -> Result<EnrichedRecord, EnrichError> {
        let mut params = vec![
            ("appids", identifier.to_string()),
            ("l", self.settings.locale.clone()),
        ];
        if let Some(cc) = &self.settings.country {
            params.push(("cc", cc.clone()));
        }

        let doc = self
            .fetch_with_retry(&self.settings.details_url, &params)
            .await?;
        let details = parse_details(identifier, &doc.value)?;

        let interest_metric = match &self.settings.players_url {
            Some(url) => self.current_players(url, identifier).await,
            None => None,
        };
        let reviews = match &self.settings.reviews_url {
            Some(url) => self.review_summary(url, identifier).await,
            None => ReviewSummary::default(),
        };

        Ok(EnrichedRecord {
            identifier: identifier.to_string(),
            follower_count: details
                .recommendations
                .as_ref()
                .and_then(|r| r.total),
            metadata: normalize(details),
            interest_metric,
            reviews,
            raw_payload_digest: Some(digest(&doc.raw)),
        })
    }

    /// Concurrent players right now. Any failure leaves the metric absent.
    async fn current_players(&self, url: &str, identifier: &str) -> Option<i64> {
        let params = [("appid", identifier.to_string())];
        match self.fetch_with_retry(url, &params).await {
            Ok(doc) => parse_player_count(&doc.value),
            Err(e) => {
                tracing::warn!(identifier, error = %e, "player count unavailable");
                None
            }
        }
    }

    /// Review counters across all languages. Any failure leaves them absent.
    async fn review_summary(&self, base: &str, identifier: &str) -> ReviewSummary {
        let url = format!("{}/{}", base.trim_end_matches('/'), identifier);
        let params = [
            ("json", "1".to_string()),
            ("num_per_page", "0".to_string()),
            ("language", "all".to_string()),
            ("purchase_type", "all".to_string()),
        ];
        match self.fetch_with_retry(&url, &params).await {
            Ok(doc) => parse_review_summary(&doc.value).unwrap_or_default(),
            Err(e) => {
                tracing::warn!(identifier, error = %e, "review summary unavailable");
                ReviewSummary::default()
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<JsonDocument, EnrichError> {
        let retry = &self.settings.retry;
        let mut attempt = 0u32;

        loop {
            self.pacer.lock().await.wait().await;

            match self.source.get_json(url, params).await {
                Ok(doc) => return Ok(doc),
                Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                    attempt += 1;
                    let delay = retry.delay(attempt);
                    tracing::debug!(url, attempt, ?delay, error = %e, "retrying request");
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    return Err(EnrichError::Exhausted {
                        attempts: attempt + 1,
                        last: e,
                    })
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn digest(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ═══════════════════════════════════════════════════════════════════════
// Upstream response model
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct DetailsEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct AppDetails {
    name: Option<String>,
    developers: Option<Vec<String>>,
    publishers: Option<Vec<String>>,
    genres: Option<Vec<Described>>,
    categories: Option<Vec<Described>>,
    tags: Option<TagList>,
    release_date: Option<ReleaseDate>,
    supported_languages: Option<String>,
    is_free: Option<bool>,
    price_overview: Option<PriceOverview>,
    recommendations: Option<Recommendations>,
}

#[derive(Debug, Deserialize)]
struct Described {
    description: Option<String>,
}

/// Tags arrive either ranked as a list or as an `{id: name}` object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TagList {
    Ranked(Vec<Described>),
    Named(serde_json::Map<String, Value>),
}

#[derive(Debug, Deserialize)]
struct ReleaseDate {
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PriceOverview {
    currency: Option<String>,
    initial: Option<i64>,
    #[serde(rename = "final")]
    final_price: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Recommendations {
    total: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PlayersEnvelope {
    response: Option<PlayersResponse>,
}

#[derive(Debug, Deserialize)]
struct PlayersResponse {
    player_count: Option<i64>,
    result: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ReviewsEnvelope {
    success: Option<i64>,
    query_summary: Option<QuerySummary>,
}

#[derive(Debug, Deserialize)]
struct QuerySummary {
    review_score_desc: Option<String>,
    total_positive: Option<i64>,
    total_negative: Option<i64>,
    total_reviews: Option<i64>,
}

fn parse_details(identifier: &str, body: &Value) -> Result<AppDetails, EnrichError> {
    let entry = body.get(identifier).ok_or_else(|| {
        FetchError::DecodeError(format!("response has no entry for {}", identifier))
    })?;
    let envelope: DetailsEnvelope = serde_json::from_value(entry.clone())
        .map_err(|e| FetchError::DecodeError(e.to_string()))?;

    if !envelope.success {
        return Err(EnrichError::Rejected(identifier.to_string()));
    }

    match envelope.data {
        Some(data) => {
            serde_json::from_value(data).map_err(|e| FetchError::DecodeError(e.to_string()).into())
        }
        None => Ok(AppDetails::default()),
    }
}

fn parse_player_count(body: &Value) -> Option<i64> {
    let envelope: PlayersEnvelope = serde_json::from_value(body.clone()).ok()?;
    let response = envelope.response?;
    match response.result {
        Some(1) => response.player_count,
        _ => None,
    }
}

fn parse_review_summary(body: &Value) -> Option<ReviewSummary> {
    let envelope: ReviewsEnvelope = serde_json::from_value(body.clone()).ok()?;
    if envelope.success != Some(1) {
        return None;
    }
    let q = envelope.query_summary?;
    Some(ReviewSummary {
        total_reviews: q.total_reviews,
        total_positive: q.total_positive,
        total_negative: q.total_negative,
        review_score_desc: non_empty(q.review_score_desc),
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Normalization
// ═══════════════════════════════════════════════════════════════════════

fn normalize(details: AppDetails) -> TitleMetadata {
    let categories = described_set(details.categories.as_deref());
    let ai_disclosure = ai_disclosure(&categories);

    let (price_initial, price_final, price_currency) = match details.price_overview {
        Some(p) => (p.initial, p.final_price, non_empty(p.currency)),
        None if details.is_free == Some(true) => (Some(0), Some(0), None),
        None => (None, None, None),
    };

    TitleMetadata {
        name: non_empty(details.name),
        developers: string_set(details.developers),
        publishers: string_set(details.publishers),
        genres: described_set(details.genres.as_deref()),
        categories,
        tags: tag_list(details.tags),
        supported_languages: details
            .supported_languages
            .as_deref()
            .map(parse_languages)
            .unwrap_or_default(),
        planned_release_date: details.release_date.and_then(|r| non_empty(r.date)),
        ai_disclosure,
        price_initial,
        price_final,
        price_currency,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn string_set(values: Option<Vec<String>>) -> BTreeSet<String> {
    values
        .unwrap_or_default()
        .into_iter()
        .filter_map(|s| non_empty(Some(s)))
        .collect()
}

fn described_set(values: Option<&[Described]>) -> BTreeSet<String> {
    values
        .unwrap_or_default()
        .iter()
        .filter_map(|d| non_empty(d.description.clone()))
        .collect()
}

fn tag_list(tags: Option<TagList>) -> Vec<String> {
    let raw: Vec<String> = match tags {
        Some(TagList::Ranked(list)) => list.into_iter().filter_map(|d| d.description).collect(),
        Some(TagList::Named(map)) => map
            .into_iter()
            .filter_map(|(_, v)| v.as_str().map(str::to_string))
            .collect(),
        None => Vec::new(),
    };

    let mut seen = BTreeSet::new();
    raw.into_iter()
        .filter_map(|t| non_empty(Some(t)))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Categories that declare AI-generated content, joined; `None` if none do.
fn ai_disclosure(categories: &BTreeSet<String>) -> Option<String> {
    let hits: Vec<&str> = categories
        .iter()
        .filter(|c| c.contains("AI") || c.to_lowercase().contains("ai generated"))
        .map(String::as_str)
        .collect();
    if hits.is_empty() {
        None
    } else {
        Some(hits.join("; "))
    }
}

fn markup_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"<[^>]*>").expect("static regex"))
}

fn line_break_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"(?i)<br\s*/?>").expect("static regex"))
}

/// Parse storefront language markup into plain language names.
///
/// Everything after the first line break is a footnote legend and is
/// dropped, as are inline tags and `*` markers.
fn parse_languages(raw: &str) -> BTreeSet<String> {
    let first_line = line_break_re().split(raw).next().unwrap_or_default();
    let plain = markup_re().replace_all(first_line, "");
    plain
        .split(',')
        .map(|lang| lang.replace('*', "").trim().to_string())
        .filter(|lang| !lang.is_empty())
        .collect()
}
