//! Headless Chromium [`Renderer`].
//!
//! Launches a fresh browser per render over the DevTools protocol, loads
//! the listing page, and hands the live page to
//! [`scroll_until_idle`](crate::fetcher::scroll_until_idle). The browser is
//! closed before returning, whether the render succeeded or not; the
//! discoverer's outer guard leaves a grace period for this.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use std::path::PathBuf;

use crate::error::FetchError;
use crate::fetcher::{scroll_until_idle, Renderer, ScrollPolicy, ScrollSurface};

pub struct ChromiumRenderer {
    executable: Option<PathBuf>,
}

impl ChromiumRenderer {
    pub fn new(executable: Option<PathBuf>) -> Self {
        Self { executable }
    }
}

fn render_err(e: impl std::fmt::Display) -> FetchError {
    FetchError::RenderError(e.to_string())
}

struct PageSurface {
    page: Page,
}

#[async_trait]
impl ScrollSurface for PageSurface {
    async fn content_height(&mut self) -> Result<i64, FetchError> {
        let height: f64 = self
            .page
            .evaluate("document.body.scrollHeight")
            .await
            .map_err(render_err)?
            .into_value()
            .map_err(render_err)?;
        Ok(height as i64)
    }

    async fn scroll_to_bottom(&mut self) -> Result<(), FetchError> {
        self.page
            .evaluate("window.scrollTo(0, document.body.scrollHeight)")
            .await
            .map_err(render_err)?;
        Ok(())
    }

    async fn document(&mut self) -> Result<String, FetchError> {
        self.page.content().await.map_err(render_err)
    }
}

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn render(&self, url: &str, policy: &ScrollPolicy) -> Result<String, FetchError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-dev-shm-usage");
        if let Some(path) = &self.executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(FetchError::RenderError)?;

        let (mut browser, mut handler) = Browser::launch(config).await.map_err(render_err)?;
        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        tracing::info!(url, "rendering listing page");
        // Navigation and scrolling share the ceiling so teardown below still runs.
        let work = async {
            let page = browser.new_page(url).await.map_err(render_err)?;
            page.wait_for_navigation().await.map_err(render_err)?;
            let mut surface = PageSurface { page };
            scroll_until_idle(&mut surface, policy).await
        };
        let result = match tokio::time::timeout(policy.timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::RenderTimeout(policy.timeout)),
        };

        if let Err(e) = browser.close().await {
            tracing::warn!(error = %e, "browser did not close cleanly");
        }
        if let Err(e) = browser.wait().await {
            tracing::warn!(error = %e, "browser process did not exit cleanly");
        }
        events.abort();

        result
    }
}
