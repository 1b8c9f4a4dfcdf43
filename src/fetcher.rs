//! Retrieval seam between the pipeline and the outside world.
//!
//! Two capabilities, each behind its own trait so discovery and enrichment
//! can be driven by deterministic stubs in tests:
//!
//! - [`Renderer`] — render a JavaScript-driven page to completion and return
//!   the final document.
//! - [`JsonSource`] — a single GET against a JSON endpoint.
//!
//! Neither retries; the caller owns retry policy.
//!
//! # Completion detection
//!
//! ```text
//! scroll ─▶ settle ─▶ measure ──grew──▶ reset idle counter ─┐
//!   ▲                    │                                   │
//!   │                    └─same──▶ idle += 1 ── < N ─────────┤
//!   └────────────────────────────────────────────────────────┘
//!                              idle == N ─▶ document
//! ```
//!
//! The whole loop sits under a wall-clock ceiling; a page that keeps growing
//! forever ends in [`FetchError::RenderTimeout`].

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::error::FetchError;

/// When a rendered page counts as complete.
#[derive(Debug, Clone)]
pub struct ScrollPolicy {
    /// Consecutive scrolls without growth that end the loop.
    pub idle_checks: u32,
    /// Pause after each scroll to let lazy content load.
    pub settle: Duration,
    /// Global ceiling for the whole render.
    pub timeout: Duration,
}

impl ScrollPolicy {
    pub fn from_config(config: &crate::config::DiscoveryConfig) -> Self {
        Self {
            idle_checks: config.idle_checks,
            settle: Duration::from_millis(config.settle_ms),
            timeout: config.render_timeout(),
        }
    }
}

/// A JSON response together with its raw body.
#[derive(Debug, Clone)]
pub struct JsonDocument {
    pub raw: String,
    pub value: Value,
}

/// Render-and-extract capability.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Load `url`, scroll until the page stops growing, and return the
    /// rendered markup.
    async fn render(&self, url: &str, policy: &ScrollPolicy) -> Result<String, FetchError>;
}

/// Request-and-parse capability.
#[async_trait]
pub trait JsonSource: Send + Sync {
    /// Issue one GET with `params` as the query string and decode the body.
    async fn get_json(&self, url: &str, params: &[(&str, String)])
        -> Result<JsonDocument, FetchError>;
}

/// A live page the scroll loop can drive.
#[async_trait]
pub trait ScrollSurface: Send {
    async fn content_height(&mut self) -> Result<i64, FetchError>;
    async fn scroll_to_bottom(&mut self) -> Result<(), FetchError>;
    async fn document(&mut self) -> Result<String, FetchError>;
}

/// Scroll `surface` until `policy.idle_checks` consecutive scrolls produce
/// no growth, then return the document.
pub async fn scroll_until_idle<S>(surface: &mut S, policy: &ScrollPolicy) -> Result<String, FetchError>
where
    S: ScrollSurface + ?Sized,
{
    let work = async {
        let mut last_height = surface.content_height().await?;
        let mut idle = 0u32;
        let mut scrolls = 0u32;

        while idle < policy.idle_checks {
            surface.scroll_to_bottom().await?;
            tokio::time::sleep(policy.settle).await;
            scrolls += 1;

            let height = surface.content_height().await?;
            if height > last_height {
                last_height = height;
                idle = 0;
            } else {
                idle += 1;
            }
        }

        tracing::debug!(scrolls, height = last_height, "page settled");
        surface.document().await
    };

    match tokio::time::timeout(policy.timeout, work).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::RenderTimeout(policy.timeout)),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// HTTP
// ═══════════════════════════════════════════════════════════════════════

/// [`JsonSource`] over a shared reqwest client.
pub struct HttpJsonSource {
    client: reqwest::Client,
}

impl HttpJsonSource {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fest-tracker/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl JsonSource for HttpJsonSource {
    async fn get_json(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<JsonDocument, FetchError> {
        let transport = |e: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = self
            .client
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpError {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let raw = response.text().await.map_err(transport)?;
        let value = serde_json::from_str(&raw).map_err(|e| FetchError::DecodeError(e.to_string()))?;
        Ok(JsonDocument { raw, value })
    }
}
