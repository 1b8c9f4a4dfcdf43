//! Discovery of participating titles from the festival listing page.
//!
//! Discovery is read-only: it renders the page, collects every identifier
//! referenced by a title link, and returns the de-duplicated set. Deciding
//! what to do with the set is the orchestrator's job.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DiscoveryConfig;
use crate::error::FetchError;
use crate::fetcher::{Renderer, ScrollPolicy};
use crate::models::Identifier;

/// Extra time the outer guard allows on top of the scroll ceiling, covering
/// browser launch, navigation, and teardown.
pub const DEFAULT_RENDER_GRACE: Duration = Duration::from_secs(10);

pub struct Discoverer {
    renderer: Arc<dyn Renderer>,
    url: String,
    policy: ScrollPolicy,
    pattern: Regex,
    grace: Duration,
}

impl Discoverer {
    pub fn new(
        renderer: Arc<dyn Renderer>,
        url: impl Into<String>,
        policy: ScrollPolicy,
        pattern: Regex,
    ) -> Self {
        Self {
            renderer,
            url: url.into(),
            policy,
            pattern,
            grace: DEFAULT_RENDER_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn from_config(renderer: Arc<dyn Renderer>, config: &DiscoveryConfig) -> anyhow::Result<Self> {
        Ok(Self::new(
            renderer,
            config.url.clone(),
            ScrollPolicy::from_config(config),
            Regex::new(&config.link_pattern)?,
        ))
    }

    /// Render the listing and return every distinct identifier on it.
    ///
    /// An empty page is not an error; it is logged as a warning. The
    /// renderer enforces the policy's ceiling itself and cleans up; this
    /// outer guard, ceiling plus grace, only catches a renderer that never
    /// returns.
    pub async fn discover(&self) -> Result<BTreeSet<Identifier>, FetchError> {
        let limit = self.policy.timeout + self.grace;
        let rendered = tokio::time::timeout(limit, self.renderer.render(&self.url, &self.policy))
            .await
            .map_err(|_| {
                tracing::error!(?limit, "renderer ignored its ceiling, abandoning render");
                FetchError::RenderTimeout(self.policy.timeout)
            })??;

        let ids = extract_identifiers(&self.pattern, &rendered);
        if ids.is_empty() {
            tracing::warn!(url = %self.url, "listing rendered but no title identifiers were found");
        } else {
            tracing::info!(count = ids.len(), "discovered titles");
        }
        Ok(ids)
    }
}

/// Collect the first capture group of every match, collapsing repeats.
pub fn extract_identifiers(pattern: &Regex, document: &str) -> BTreeSet<Identifier> {
    pattern
        .captures_iter(document)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}
