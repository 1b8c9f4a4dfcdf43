//! The daily collection run.
//!
//! ```text
//! Discovering ──ok──▶ Diffing ──▶ Enriching ──▶ Persisting ──▶ Done
//!      │
//!      └──retries exhausted──▶ Failed
//! ```
//!
//! Only discovery can fail the run: without a trustworthy listing nothing
//! downstream means anything, so a failed discovery ends the run before
//! any write. Everything after that fails per title and is collected into
//! the [`RunSummary`].
//!
//! Every run re-enriches all titles ever seen (known ∪ discovered), so the
//! series covers the whole event and not just the day a title appeared.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::Config;
use crate::discover::Discoverer;
use crate::enrich::{Enricher, EnricherSettings};
use crate::error::{FetchError, StoreError};
use crate::fetcher::{HttpJsonSource, Renderer};
use crate::models::{EnrichedRecord, Identifier, ItemFailure};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Discovering,
    Diffing,
    Enriching,
    Persisting,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Three-valued result for the external scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Partial,
    Failed,
}

impl RunOutcome {
    pub fn exit_code(self) -> u8 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::Failed => 1,
            RunOutcome::Partial => 3,
        }
    }
}

/// What happened during one run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub collected_at: DateTime<Utc>,
    pub state: RunState,
    pub discovered: usize,
    pub new_titles: usize,
    pub targets: usize,
    pub enriched: usize,
    pub snapshots_written: usize,
    pub duplicate_snapshots: usize,
    /// Titles never attempted because the run budget ran out.
    pub skipped: usize,
    pub failures: Vec<ItemFailure>,
    pub warnings: Vec<String>,
    pub fatal: Option<String>,
}

impl RunSummary {
    fn new(collected_at: DateTime<Utc>) -> Self {
        Self {
            collected_at,
            state: RunState::Discovering,
            discovered: 0,
            new_titles: 0,
            targets: 0,
            enriched: 0,
            snapshots_written: 0,
            duplicate_snapshots: 0,
            skipped: 0,
            failures: Vec::new(),
            warnings: Vec::new(),
            fatal: None,
        }
    }

    pub fn outcome(&self) -> RunOutcome {
        if self.state == RunState::Failed {
            RunOutcome::Failed
        } else if self.failures.is_empty() && self.skipped == 0 {
            RunOutcome::Success
        } else {
            RunOutcome::Partial
        }
    }

    /// Record a failure. Only the first reason per identifier is kept, so
    /// `failures.len()` is the number of failed titles.
    fn fail(&mut self, identifier: &str, kind: &str, message: impl Into<String>) {
        if self.failures.iter().any(|f| f.identifier == identifier) {
            return;
        }
        self.failures.push(ItemFailure {
            identifier: identifier.to_string(),
            kind: kind.to_string(),
            message: message.into(),
        });
    }

    /// Print the human-readable report.
    pub fn print(&self) {
        println!("run {}", self.collected_at.format("%Y-%m-%d %H:%M:%SZ"));
        println!("  state: {}", self.state);
        if let Some(reason) = &self.fatal {
            println!("  fatal: {}", reason);
        }
        println!("  discovered: {} ({} new)", self.discovered, self.new_titles);
        println!("  targets: {}", self.targets);
        println!("  enriched: {}", self.enriched);
        println!("  failed: {}", self.failures.len());
        println!("  snapshots written: {}", self.snapshots_written);
        if self.duplicate_snapshots > 0 {
            println!("  already collected today: {}", self.duplicate_snapshots);
        }
        if self.skipped > 0 {
            println!("  skipped (budget): {}", self.skipped);
        }
        for w in &self.warnings {
            println!("  warning: {}", w);
        }
        if !self.failures.is_empty() {
            println!("  failures:");
            for f in &self.failures {
                println!("    {:<12} {:<18} {}", f.identifier, f.kind, f.message);
            }
        }
        match self.outcome() {
            RunOutcome::Success => println!("ok"),
            RunOutcome::Partial => println!("partial"),
            RunOutcome::Failed => println!("failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub discovery_retries: u32,
    pub discovery_backoff: Duration,
    pub budget: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            discovery_retries: config.discovery.retries,
            discovery_backoff: config.discovery.retry_backoff(),
            budget: config.run.budget(),
        }
    }
}

pub struct Pipeline {
    discoverer: Discoverer,
    enricher: Enricher,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(discoverer: Discoverer, enricher: Enricher, settings: PipelineSettings) -> Self {
        Self {
            discoverer,
            enricher,
            settings,
        }
    }

    /// Run once, stamped with the current time.
    pub async fn run(&self, store: &Store) -> RunSummary {
        self.run_at(store, Utc::now()).await
    }

    /// Run once with an explicit collection timestamp.
    pub async fn run_at(&self, store: &Store, collected_at: DateTime<Utc>) -> RunSummary {
        let mut summary = RunSummary::new(collected_at);
        let deadline = Instant::now() + self.settings.budget;
        tracing::info!(%collected_at, budget = ?self.settings.budget, "collection run started");

        // Discovering
        let discovered = match self.discover_with_retry(deadline).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "discovery failed, aborting run");
                summary.fatal = Some(format!("{}: {}", e.kind(), e));
                summary.state = RunState::Failed;
                return summary;
            }
        };
        summary.discovered = discovered.len();
        if discovered.is_empty() {
            summary
                .warnings
                .push("listing contained no title identifiers".to_string());
        }

        // Diffing
        summary.state = RunState::Diffing;
        let known = match store.known_identifiers().await {
            Ok(known) => known,
            Err(e) => {
                tracing::warn!(error = %e, "could not read known titles, enriching discovered only");
                summary
                    .warnings
                    .push(format!("known titles unavailable: {}", e));
                BTreeSet::new()
            }
        };
        let (new_titles, targets) = diff(&known, &discovered);
        summary.new_titles = new_titles.len();
        summary.targets = targets.len();
        tracing::info!(
            known = known.len(),
            new = new_titles.len(),
            targets = targets.len(),
            "enrichment targets fixed"
        );

        // Enriching
        summary.state = RunState::Enriching;
        let records = self.enrich_all(&targets, deadline, &mut summary).await;

        // Persisting
        summary.state = RunState::Persisting;
        persist(store, &new_titles, &records, collected_at, &mut summary).await;

        summary.state = RunState::Done;
        tracing::info!(
            enriched = summary.enriched,
            failed = summary.failures.len(),
            snapshots = summary.snapshots_written,
            "collection run finished"
        );
        summary
    }

    /// Retry discovery with backoff. No retry starts once the run deadline
    /// would be reached before it.
    async fn discover_with_retry(
        &self,
        deadline: Instant,
    ) -> Result<BTreeSet<Identifier>, FetchError> {
        let mut attempt = 0u32;
        loop {
            match self.discoverer.discover().await {
                Ok(ids) => return Ok(ids),
                Err(e) if attempt < self.settings.discovery_retries => {
                    attempt += 1;
                    let delay = self.settings.discovery_backoff * (1u32 << (attempt - 1).min(5));
                    if Instant::now() + delay >= deadline {
                        tracing::warn!(attempt, error = %e, "run budget spent, not retrying discovery");
                        return Err(e);
                    }
                    tracing::warn!(attempt, ?delay, error = %e, "discovery failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn enrich_all(
        &self,
        targets: &BTreeSet<Identifier>,
        deadline: Instant,
        summary: &mut RunSummary,
    ) -> Vec<EnrichedRecord> {
        let mut records = Vec::with_capacity(targets.len());

        for (i, identifier) in targets.iter().enumerate() {
            // `timeout_at` polls the inner future first, so a spent budget is
            // checked up front.
            let attempt = if Instant::now() >= deadline {
                None
            } else {
                tokio::time::timeout_at(deadline, self.enricher.enrich(identifier))
                    .await
                    .ok()
            };
            match attempt {
                Some(Ok(record)) => {
                    tracing::debug!(identifier = %identifier, name = ?record.metadata.name, "enriched");
                    summary.enriched += 1;
                    records.push(record);
                }
                Some(Err(e)) => {
                    tracing::warn!(identifier = %identifier, error = %e, "enrichment failed");
                    summary.fail(identifier, e.kind(), e.to_string());
                }
                None => {
                    let remaining = targets.len() - i;
                    tracing::warn!(remaining, "run budget exhausted, skipping remaining titles");
                    summary.skipped = remaining;
                    summary.warnings.push(format!(
                        "run budget of {:?} exhausted; {} titles not enriched",
                        self.settings.budget, remaining
                    ));
                    break;
                }
            }
        }

        records
    }
}

/// New identifiers and the full enrichment target set.
pub fn diff(
    known: &BTreeSet<Identifier>,
    discovered: &BTreeSet<Identifier>,
) -> (BTreeSet<Identifier>, BTreeSet<Identifier>) {
    let new_titles = discovered.difference(known).cloned().collect();
    let targets = known.union(discovered).cloned().collect();
    (new_titles, targets)
}

async fn persist(
    store: &Store,
    new_titles: &BTreeSet<Identifier>,
    records: &[EnrichedRecord],
    collected_at: DateTime<Utc>,
    summary: &mut RunSummary,
) {
    // Every discovered title gets a master row, even if enrichment failed today.
    for identifier in new_titles {
        if let Err(e) = store.register_title(identifier, collected_at).await {
            tracing::error!(identifier = %identifier, error = %e, "could not register title");
            summary.fail(identifier, e.kind(), e.to_string());
        }
    }

    for record in records {
        let identifier = &record.identifier;

        if let Err(e) = store.upsert_title(&record.to_title(collected_at)).await {
            tracing::error!(identifier = %identifier, error = %e, "title write failed");
            summary.fail(identifier, e.kind(), e.to_string());
            continue;
        }

        match store.insert_snapshot(&record.to_snapshot(collected_at)).await {
            Ok(()) => summary.snapshots_written += 1,
            Err(StoreError::DuplicateSnapshot { day, .. }) => {
                tracing::info!(identifier = %identifier, day = %day, "snapshot already recorded for today");
                summary.duplicate_snapshots += 1;
            }
            Err(e) => {
                tracing::error!(identifier = %identifier, error = %e, "snapshot write failed");
                summary.fail(identifier, e.kind(), e.to_string());
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Entry point
// ═══════════════════════════════════════════════════════════════════════

/// Wire the production collaborators from `config`, run once, print the
/// report, and return the outcome for the process exit status.
pub async fn run_once(config: &Config) -> anyhow::Result<RunOutcome> {
    let store = Store::open(config).await?;

    let discoverer = Discoverer::from_config(renderer(config)?, &config.discovery)?;
    let source = Arc::new(HttpJsonSource::new(Duration::from_secs(
        config.enrichment.timeout_secs,
    ))?);
    let enricher = Enricher::new(source, EnricherSettings::from_config(&config.enrichment));
    let pipeline = Pipeline::new(discoverer, enricher, PipelineSettings::from_config(config));

    let summary = pipeline.run(&store).await;
    summary.print();

    store.close().await;
    Ok(summary.outcome())
}

#[cfg(feature = "browser")]
fn renderer(config: &Config) -> anyhow::Result<Arc<dyn Renderer>> {
    Ok(Arc::new(crate::browser::ChromiumRenderer::new(
        config.discovery.chrome_executable.clone(),
    )))
}

#[cfg(not(feature = "browser"))]
fn renderer(_config: &Config) -> anyhow::Result<Arc<dyn Renderer>> {
    anyhow::bail!("built without the `browser` feature; no page renderer available")
}
