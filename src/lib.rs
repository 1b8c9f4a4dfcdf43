//! # Fest Tracker
//!
//! Daily collector for a storefront demo festival.
//!
//! Once per day the pipeline renders the festival listing, collects every
//! participating title, enriches each one through the storefront metadata
//! API, and appends the result to a SQLite dataset that supports both
//! "latest snapshot" and "change over time" queries.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌────────────┐   ┌──────────┐
//! │  Listing   │──▶│ Discoverer │──▶│  Enricher  │──▶│  SQLite  │
//! │ (headless) │   │  id set    │   │ paced GETs │   │  titles  │
//! └────────────┘   └────────────┘   └────────────┘   │ snapshots│
//!                         ▲                ▲         └────┬─────┘
//!                         └──── Pipeline (run once) ──────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! fest init                 # create database
//! fest run                  # one collection run (schedule daily)
//! fest stats                # dataset overview
//! fest history 1234560      # one title's series
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Title, Snapshot, enrichment records |
//! | [`fetcher`] | Renderer / JSON source traits, scroll loop, HTTP client |
//! | `browser` | Headless Chromium renderer (`browser` feature) |
//! | [`discover`] | Listing discovery |
//! | [`enrich`] | Metadata enrichment with pacing and retry |
//! | [`store`] | Title and snapshot persistence |
//! | [`pipeline`] | The daily run and its summary |
//! | [`stats`] | Dataset overview |
//! | [`history`] | Per-title series |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

#[cfg(feature = "browser")]
pub mod browser;
pub mod config;
pub mod db;
pub mod discover;
pub mod enrich;
pub mod error;
pub mod fetcher;
pub mod history;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod stats;
pub mod store;
