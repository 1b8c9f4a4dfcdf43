//! End-to-end tests for the collection run.
//!
//! The listing page and the metadata API are replaced by in-process stubs
//! implementing `Renderer` and `JsonSource`; everything else (discovery,
//! enrichment with retry, SQLite persistence) is the real code.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use fest_tracker::config::Config;
use fest_tracker::discover::Discoverer;
use fest_tracker::enrich::{Enricher, EnricherSettings, RetryPolicy};
use fest_tracker::error::FetchError;
use fest_tracker::fetcher::{JsonDocument, JsonSource, Renderer, ScrollPolicy};
use fest_tracker::models::{ReviewSummary, Title};
use fest_tracker::pipeline::{Pipeline, PipelineSettings, RunOutcome, RunState};
use fest_tracker::store::Store;

const DETAILS_URL: &str = "http://api.test/appdetails";
const PLAYERS_URL: &str = "http://api.test/players";
const REVIEWS_URL: &str = "http://api.test/appreviews";

// ─── Stubs ──────────────────────────────────────────────────────────

/// Listing page linking to a fixed set of identifiers, each twice.
struct ListingStub {
    ids: Vec<&'static str>,
}

#[async_trait]
impl Renderer for ListingStub {
    async fn render(&self, _url: &str, _policy: &ScrollPolicy) -> Result<String, FetchError> {
        let cards: String = self
            .ids
            .iter()
            .map(|id| {
                format!(
                    "<a class=\"capsule\" href=\"https://store.test/app/{id}/\"><img></a>\
                     <a href=\"https://store.test/app/{id}/?snr=fest\">details</a>"
                )
            })
            .collect();
        Ok(format!("<html><body>{}</body></html>", cards))
    }
}

/// Listing that renders fine, but slowly.
struct SlowListing {
    delay: Duration,
    ids: Vec<&'static str>,
}

#[async_trait]
impl Renderer for SlowListing {
    async fn render(&self, url: &str, policy: &ScrollPolicy) -> Result<String, FetchError> {
        tokio::time::sleep(self.delay).await;
        ListingStub {
            ids: self.ids.clone(),
        }
        .render(url, policy)
        .await
    }
}

/// A page that never finishes rendering; counts attempts.
#[derive(Default)]
struct HangingRenderer {
    attempts: AtomicU32,
}

#[async_trait]
impl Renderer for HangingRenderer {
    async fn render(&self, _url: &str, _policy: &ScrollPolicy) -> Result<String, FetchError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

#[derive(Clone)]
enum Reply {
    Details(Value),
    Status(u16),
    /// Fail with the status `n` times, then answer with the details.
    Flaky(u16, u32, Value),
    Slow(Duration),
}

#[derive(Default)]
struct ApiStub {
    replies: HashMap<String, Reply>,
    players: HashMap<String, i64>,
    reviews: HashMap<String, Value>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ApiStub {
    fn with(mut self, id: &str, reply: Reply) -> Self {
        self.replies.insert(id.to_string(), reply);
        self
    }

    fn calls(&self, id: &str) -> u32 {
        self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

fn param<'a>(params: &'a [(&str, String)], key: &str) -> &'a str {
    params
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.as_str())
        .unwrap_or_default()
}

fn doc(value: Value) -> JsonDocument {
    JsonDocument {
        raw: value.to_string(),
        value,
    }
}

#[async_trait]
impl JsonSource for ApiStub {
    async fn get_json(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<JsonDocument, FetchError> {
        if url == PLAYERS_URL {
            let id = param(params, "appid");
            return match self.players.get(id) {
                Some(n) => Ok(doc(json!({"response": {"player_count": n, "result": 1}}))),
                None => Err(FetchError::HttpError {
                    status: 404,
                    url: url.to_string(),
                }),
            };
        }

        if let Some(id) = url.strip_prefix(REVIEWS_URL).map(|p| p.trim_start_matches('/')) {
            assert_eq!(param(params, "num_per_page"), "0");
            return match self.reviews.get(id) {
                Some(summary) => Ok(doc(json!({"success": 1, "query_summary": summary}))),
                None => Err(FetchError::Transport {
                    url: url.to_string(),
                    message: "connection reset".to_string(),
                }),
            };
        }

        assert_eq!(param(params, "l"), "english");
        let id = param(params, "appids").to_string();
        let n = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(id.clone()).or_insert(0);
            *n += 1;
            *n
        };

        let status = |status| FetchError::HttpError {
            status,
            url: url.to_string(),
        };
        let reply = self.replies.get(&id).cloned();
        match reply {
            Some(Reply::Details(data)) => Ok(details(&id, data)),
            Some(Reply::Status(code)) => Err(status(code)),
            Some(Reply::Flaky(code, times, _)) if n <= times => Err(status(code)),
            Some(Reply::Flaky(_, _, data)) => Ok(details(&id, data)),
            Some(Reply::Slow(delay)) => {
                tokio::time::sleep(delay).await;
                Err(status(503))
            }
            None => Ok(doc(entry(&id, json!({"success": false})))),
        }
    }
}

fn entry(id: &str, value: Value) -> Value {
    let mut body = serde_json::Map::new();
    body.insert(id.to_string(), value);
    Value::Object(body)
}

fn details(id: &str, data: Value) -> JsonDocument {
    doc(entry(id, json!({"success": true, "data": data})))
}

// ─── Harness ────────────────────────────────────────────────────────

struct Harness {
    _tmp: TempDir,
    store: Store,
}

async fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let config = Config::with_db(tmp.path().join("data/fest.sqlite"));
    let store = Store::open(&config).await.unwrap();
    Harness { _tmp: tmp, store }
}

fn pipeline(renderer: Arc<dyn Renderer>, api: Arc<ApiStub>, players: bool) -> Pipeline {
    pipeline_with_budget(renderer, api, players, Duration::from_secs(60))
}

fn pipeline_with_budget(
    renderer: Arc<dyn Renderer>,
    api: Arc<ApiStub>,
    players: bool,
    budget: Duration,
) -> Pipeline {
    build(
        renderer,
        api,
        EnrichOptions {
            players,
            reviews: false,
        },
        PipelineSettings {
            discovery_retries: 1,
            discovery_backoff: Duration::ZERO,
            budget,
        },
    )
}

struct EnrichOptions {
    players: bool,
    reviews: bool,
}

fn build(
    renderer: Arc<dyn Renderer>,
    api: Arc<ApiStub>,
    options: EnrichOptions,
    settings: PipelineSettings,
) -> Pipeline {
    let discoverer = Discoverer::new(
        renderer,
        "https://store.test/sale/fest",
        ScrollPolicy {
            idle_checks: 1,
            settle: Duration::ZERO,
            timeout: Duration::from_millis(200),
        },
        Regex::new(r"/app/(\d+)").unwrap(),
    )
    .with_grace(Duration::from_millis(20));
    let enricher = Enricher::new(
        api,
        EnricherSettings {
            details_url: DETAILS_URL.to_string(),
            players_url: options.players.then(|| PLAYERS_URL.to_string()),
            reviews_url: options.reviews.then(|| REVIEWS_URL.to_string()),
            locale: "english".to_string(),
            country: None,
            min_interval: Duration::ZERO,
            retry: RetryPolicy {
                max_retries: 2,
                backoff_base: Duration::ZERO,
            },
        },
    );
    Pipeline::new(discoverer, enricher, settings)
}

fn game(name: &str) -> Value {
    json!({
        "name": name,
        "developers": ["Lantern Works"],
        "publishers": ["Lantern Works"],
        "genres": [{"id": "23", "description": "Indie"}],
        "categories": [{"id": 2, "description": "Single-player"}],
        "release_date": {"coming_soon": true, "date": "Coming soon"},
        "supported_languages": "English<strong>*</strong>, German<br><strong>*</strong>languages with full audio support",
        "recommendations": {"total": 57}
    })
}

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, day, hour, 0, 0).unwrap()
}

async fn count(store: &Store, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(store.pool())
        .await
        .unwrap()
}

fn prior_title(id: &str, name: &str, seen: DateTime<Utc>) -> Title {
    Title {
        identifier: id.to_string(),
        name: Some(name.to_string()),
        developers: BTreeSet::new(),
        publishers: BTreeSet::new(),
        genres: BTreeSet::new(),
        categories: BTreeSet::new(),
        tags: Vec::new(),
        supported_languages: BTreeSet::new(),
        planned_release_date: Some("2026".to_string()),
        ai_disclosure: None,
        price_initial: None,
        price_final: None,
        price_currency: None,
        first_seen_at: seen,
        last_seen_at: seen,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_one_failure_out_of_two() {
    let h = harness().await;
    let prior = prior_title("200", "Beta (old)", at(8, 0));
    h.store.upsert_title(&prior).await.unwrap();

    let api = Arc::new(
        ApiStub::default()
            .with("100", Reply::Details(game("Alpha")))
            .with("200", Reply::Status(500)),
    );
    let p = pipeline(Arc::new(ListingStub { ids: vec!["100", "200"] }), api.clone(), false);

    let summary = p.run_at(&h.store, at(9, 0)).await;

    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.outcome(), RunOutcome::Partial);
    assert_eq!(summary.enriched, 1);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].identifier, "200");
    assert_eq!(summary.failures[0].kind, "HttpError");
    assert_eq!(summary.snapshots_written, 1);
    // initial attempt + 2 retries
    assert_eq!(api.calls("200"), 3);

    assert_eq!(count(&h.store, "titles").await, 2);
    assert_eq!(count(&h.store, "snapshots").await, 1);

    let alpha = h.store.get_title("100").await.unwrap().unwrap();
    assert_eq!(alpha.name.as_deref(), Some("Alpha"));
    assert_eq!(
        alpha.supported_languages.into_iter().collect::<Vec<_>>(),
        vec!["English", "German"]
    );
    assert_eq!(alpha.planned_release_date.as_deref(), Some("Coming soon"));

    let beta = h.store.get_title("200").await.unwrap().unwrap();
    assert_eq!(beta, prior);

    let series = h.store.snapshots_for("100").await.unwrap();
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].follower_count, Some(57));
    assert!(series[0].raw_payload_digest.as_ref().unwrap().len() == 64);
}

#[tokio::test]
async fn test_targets_include_every_known_title() {
    let h = harness().await;
    h.store.register_title("1", at(8, 0)).await.unwrap();
    h.store.register_title("2", at(8, 0)).await.unwrap();

    let api = Arc::new(
        ApiStub::default()
            .with("1", Reply::Details(game("One")))
            .with("2", Reply::Details(game("Two")))
            .with("3", Reply::Details(game("Three"))),
    );
    let p = pipeline(Arc::new(ListingStub { ids: vec!["2", "3"] }), api.clone(), false);

    let summary = p.run_at(&h.store, at(9, 0)).await;

    assert_eq!(summary.discovered, 2);
    assert_eq!(summary.new_titles, 1);
    assert_eq!(summary.targets, 3);
    assert_eq!(summary.outcome(), RunOutcome::Success);
    for id in ["1", "2", "3"] {
        assert_eq!(api.calls(id), 1, "title {} should be enriched once", id);
    }
    assert_eq!(count(&h.store, "snapshots").await, 3);
}

#[tokio::test]
async fn test_same_day_rerun_is_idempotent() {
    let h = harness().await;
    let api = Arc::new(
        ApiStub::default()
            .with("100", Reply::Details(game("Alpha")))
            .with("200", Reply::Details(game("Beta"))),
    );
    let p = pipeline(Arc::new(ListingStub { ids: vec!["100", "200"] }), api, false);

    let first = p.run_at(&h.store, at(9, 1)).await;
    assert_eq!(first.snapshots_written, 2);
    let before = h.store.get_title("100").await.unwrap().unwrap();

    let second = p.run_at(&h.store, at(9, 18)).await;
    assert_eq!(second.outcome(), RunOutcome::Success);
    assert_eq!(second.snapshots_written, 0);
    assert_eq!(second.duplicate_snapshots, 2);

    assert_eq!(count(&h.store, "snapshots").await, 2);
    assert_eq!(count(&h.store, "titles").await, 2);

    let after = h.store.get_title("100").await.unwrap().unwrap();
    assert_eq!(after.last_seen_at, at(9, 18));
    assert_eq!(
        Title {
            last_seen_at: before.last_seen_at,
            ..after
        },
        before
    );
}

#[tokio::test]
async fn test_first_seen_never_moves() {
    let h = harness().await;
    let api = Arc::new(ApiStub::default().with("100", Reply::Details(game("Alpha"))));
    let p = pipeline(Arc::new(ListingStub { ids: vec!["100"] }), api, false);

    for day in 9..=13 {
        p.run_at(&h.store, at(day, 0)).await;
    }

    let t = h.store.get_title("100").await.unwrap().unwrap();
    assert_eq!(t.first_seen_at, at(9, 0));
    assert_eq!(t.last_seen_at, at(13, 0));
    assert_eq!(h.store.snapshots_for("100").await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_title_absent_from_listing_is_still_tracked() {
    let h = harness().await;
    let api = Arc::new(
        ApiStub::default()
            .with("100", Reply::Details(game("Alpha")))
            .with("200", Reply::Details(game("Beta"))),
    );

    pipeline(Arc::new(ListingStub { ids: vec!["100", "200"] }), api.clone(), false)
        .run_at(&h.store, at(9, 0))
        .await;
    let summary = pipeline(Arc::new(ListingStub { ids: vec!["100"] }), api, false)
        .run_at(&h.store, at(10, 0))
        .await;

    assert_eq!(summary.targets, 2);
    assert_eq!(h.store.snapshots_for("200").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_hanging_render_fails_without_writes() {
    let h = harness().await;
    let api = Arc::new(ApiStub::default());
    let p = pipeline(Arc::new(HangingRenderer::default()), api.clone(), false);

    let started = std::time::Instant::now();
    let summary = p.run_at(&h.store, at(9, 0)).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(summary.state, RunState::Failed);
    assert_eq!(summary.outcome(), RunOutcome::Failed);
    assert!(summary.fatal.as_deref().unwrap().starts_with("RenderTimeout"));
    assert_eq!(count(&h.store, "titles").await, 0);
    assert_eq!(count(&h.store, "snapshots").await, 0);
    assert!(api.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_listing_completes_with_warning() {
    let h = harness().await;
    let p = pipeline(
        Arc::new(ListingStub { ids: vec![] }),
        Arc::new(ApiStub::default()),
        false,
    );

    let summary = p.run_at(&h.store, at(9, 0)).await;

    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.outcome(), RunOutcome::Success);
    assert_eq!(summary.warnings.len(), 1);
}

#[tokio::test]
async fn test_rate_limited_title_recovers() {
    let h = harness().await;
    let api = Arc::new(ApiStub::default().with("100", Reply::Flaky(429, 2, game("Alpha"))));
    let p = pipeline(Arc::new(ListingStub { ids: vec!["100"] }), api.clone(), false);

    let summary = p.run_at(&h.store, at(9, 0)).await;

    assert_eq!(summary.outcome(), RunOutcome::Success);
    assert_eq!(api.calls("100"), 3);
    assert_eq!(summary.snapshots_written, 1);
}

#[tokio::test]
async fn test_new_title_failing_enrichment_gets_bare_record() {
    let h = harness().await;
    let api = Arc::new(ApiStub::default().with("300", Reply::Status(404)));
    let p = pipeline(Arc::new(ListingStub { ids: vec!["300"] }), api.clone(), false);

    let summary = p.run_at(&h.store, at(9, 0)).await;

    // 404 is not retried
    assert_eq!(api.calls("300"), 1);
    assert_eq!(summary.failures.len(), 1);
    let bare = h.store.get_title("300").await.unwrap().unwrap();
    assert_eq!(bare.name, None);
    assert_eq!(bare.first_seen_at, at(9, 0));
    assert!(h.store.snapshots_for("300").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_title_is_reported() {
    let h = harness().await;
    let api = Arc::new(ApiStub::default().with("100", Reply::Details(game("Alpha"))));
    // "999" has no reply configured, so the stub answers success=false.
    let p = pipeline(Arc::new(ListingStub { ids: vec!["100", "999"] }), api, false);

    let summary = p.run_at(&h.store, at(9, 0)).await;

    assert_eq!(summary.enriched, 1);
    assert_eq!(summary.failures[0].kind, "Rejected");
}

#[tokio::test]
async fn test_interest_metric_from_player_counts() {
    let h = harness().await;
    let mut api = ApiStub::default()
        .with("100", Reply::Details(game("Alpha")))
        .with("200", Reply::Details(game("Beta")));
    api.players.insert("100".to_string(), 1234);
    let p = pipeline(Arc::new(ListingStub { ids: vec!["100", "200"] }), Arc::new(api), true);

    let summary = p.run_at(&h.store, at(9, 0)).await;

    // A missing player count is not an enrichment failure.
    assert_eq!(summary.outcome(), RunOutcome::Success);
    assert_eq!(
        h.store.snapshots_for("100").await.unwrap()[0].interest_metric,
        Some(1234)
    );
    assert_eq!(h.store.snapshots_for("200").await.unwrap()[0].interest_metric, None);
}

#[tokio::test]
async fn test_budget_exhaustion_keeps_finished_work() {
    let h = harness().await;
    let api = Arc::new(
        ApiStub::default()
            .with("100", Reply::Details(game("Alpha")))
            .with("200", Reply::Slow(Duration::from_secs(30)))
            .with("300", Reply::Details(game("Gamma"))),
    );
    let p = pipeline_with_budget(
        Arc::new(ListingStub { ids: vec!["100", "200", "300"] }),
        api,
        false,
        Duration::from_millis(300),
    );

    let summary = p.run_at(&h.store, at(9, 0)).await;

    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.outcome(), RunOutcome::Partial);
    assert_eq!(summary.enriched, 1);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.snapshots_written, 1);
    assert_eq!(count(&h.store, "titles").await, 3);
}

#[tokio::test]
async fn test_budget_counts_discovery_time() {
    let h = harness().await;
    let api = Arc::new(
        ApiStub::default()
            .with("100", Reply::Details(game("Alpha")))
            .with("200", Reply::Details(game("Beta"))),
    );
    // Discovery alone outlasts the run budget.
    let p = pipeline_with_budget(
        Arc::new(SlowListing {
            delay: Duration::from_millis(150),
            ids: vec!["100", "200"],
        }),
        api.clone(),
        false,
        Duration::from_millis(100),
    );

    let summary = p.run_at(&h.store, at(9, 0)).await;

    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.outcome(), RunOutcome::Partial);
    assert_eq!(summary.enriched, 0);
    assert_eq!(summary.skipped, 2);
    assert_eq!(api.calls("100") + api.calls("200"), 0);
    // Discovered titles are still registered.
    assert_eq!(count(&h.store, "titles").await, 2);
    assert_eq!(count(&h.store, "snapshots").await, 0);
}

#[tokio::test]
async fn test_discovery_retries_stop_at_budget() {
    let h = harness().await;
    let renderer = Arc::new(HangingRenderer::default());
    let p = build(
        renderer.clone(),
        Arc::new(ApiStub::default()),
        EnrichOptions {
            players: false,
            reviews: false,
        },
        PipelineSettings {
            discovery_retries: 5,
            discovery_backoff: Duration::ZERO,
            budget: Duration::from_millis(300),
        },
    );

    let summary = p.run_at(&h.store, at(9, 0)).await;

    assert_eq!(summary.outcome(), RunOutcome::Failed);
    let attempts = renderer.attempts.load(Ordering::SeqCst);
    assert!(attempts >= 1 && attempts < 6, "attempts = {}", attempts);
    assert_eq!(count(&h.store, "titles").await, 0);
}

#[tokio::test]
async fn test_review_counters_recorded_per_snapshot() {
    let h = harness().await;
    let mut api = ApiStub::default()
        .with("100", Reply::Details(game("Alpha")))
        .with("200", Reply::Details(game("Beta")));
    api.reviews.insert(
        "100".to_string(),
        json!({
            "num_reviews": 0,
            "review_score": 6,
            "review_score_desc": "Mostly Positive",
            "total_positive": 31,
            "total_negative": 9,
            "total_reviews": 40
        }),
    );
    let p = build(
        Arc::new(ListingStub { ids: vec!["100", "200"] }),
        Arc::new(api),
        EnrichOptions {
            players: false,
            reviews: true,
        },
        PipelineSettings {
            discovery_retries: 0,
            discovery_backoff: Duration::ZERO,
            budget: Duration::from_secs(60),
        },
    );

    let summary = p.run_at(&h.store, at(9, 0)).await;

    // An unavailable review summary is not an enrichment failure.
    assert_eq!(summary.outcome(), RunOutcome::Success);
    let alpha = &h.store.snapshots_for("100").await.unwrap()[0];
    assert_eq!(alpha.reviews.total_reviews, Some(40));
    assert_eq!(alpha.reviews.total_positive, Some(31));
    assert_eq!(alpha.reviews.total_negative, Some(9));
    assert_eq!(alpha.reviews.review_score_desc.as_deref(), Some("Mostly Positive"));
    let beta = &h.store.snapshots_for("200").await.unwrap()[0];
    assert_eq!(beta.reviews, ReviewSummary::default());
}

#[tokio::test]
async fn test_failed_title_reported_once_when_registration_also_fails() {
    let h = harness().await;
    sqlx::query(
        "CREATE TRIGGER reject_300 BEFORE INSERT ON titles WHEN NEW.identifier = '300' \
         BEGIN SELECT RAISE(ABORT, 'read-only title'); END",
    )
    .execute(h.store.pool())
    .await
    .unwrap();

    let api = Arc::new(
        ApiStub::default()
            .with("100", Reply::Details(game("Alpha")))
            .with("300", Reply::Status(404)),
    );
    let p = pipeline(Arc::new(ListingStub { ids: vec!["100", "300"] }), api, false);

    let summary = p.run_at(&h.store, at(9, 0)).await;

    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].identifier, "300");
    assert_eq!(summary.failures[0].kind, "HttpError");
    assert_eq!(summary.enriched, 1);
    assert!(h.store.get_title("300").await.unwrap().is_none());
}
