//! Core data models for the festival dataset.
//!
//! [`Title`] is the mutable master record, [`Snapshot`] the append-only
//! time-series fact. [`EnrichedRecord`] is what the enricher hands to the
//! store: the normalized metadata plus the point-in-time counters.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeSet;

/// Storefront identifier of a title (e.g. a Steam app id, kept as text).
pub type Identifier = String;

/// Master record of a title, one row per identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Title {
    pub identifier: Identifier,
    pub name: Option<String>,
    pub developers: BTreeSet<String>,
    pub publishers: BTreeSet<String>,
    pub genres: BTreeSet<String>,
    pub categories: BTreeSet<String>,
    /// Storefront-ranked, order is significant.
    pub tags: Vec<String>,
    pub supported_languages: BTreeSet<String>,
    pub planned_release_date: Option<String>,
    pub ai_disclosure: Option<String>,
    pub price_initial: Option<i64>,
    pub price_final: Option<i64>,
    pub price_currency: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// One immutable observation of a title on a collection day.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub identifier: Identifier,
    pub collected_at: DateTime<Utc>,
    pub follower_count: Option<i64>,
    pub interest_metric: Option<i64>,
    pub reviews: ReviewSummary,
    pub raw_payload_digest: Option<String>,
}

/// User-review counters as of one collection. All absent when the review
/// summary could not be fetched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewSummary {
    pub total_reviews: Option<i64>,
    pub total_positive: Option<i64>,
    pub total_negative: Option<i64>,
    /// Storefront wording such as "Very Positive".
    pub review_score_desc: Option<String>,
}

impl Snapshot {
    /// Collection day the uniqueness guard is keyed on (UTC).
    pub fn collected_on(&self) -> NaiveDate {
        self.collected_at.date_naive()
    }
}

/// Normalized metadata for a title, free of any timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TitleMetadata {
    pub name: Option<String>,
    pub developers: BTreeSet<String>,
    pub publishers: BTreeSet<String>,
    pub genres: BTreeSet<String>,
    pub categories: BTreeSet<String>,
    pub tags: Vec<String>,
    pub supported_languages: BTreeSet<String>,
    pub planned_release_date: Option<String>,
    pub ai_disclosure: Option<String>,
    pub price_initial: Option<i64>,
    pub price_final: Option<i64>,
    pub price_currency: Option<String>,
}

/// Successful enrichment of one identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedRecord {
    pub identifier: Identifier,
    pub metadata: TitleMetadata,
    pub follower_count: Option<i64>,
    pub interest_metric: Option<i64>,
    pub reviews: ReviewSummary,
    pub raw_payload_digest: Option<String>,
}

impl EnrichedRecord {
    /// Master record as of `seen_at`. The store keeps the original
    /// `first_seen_at` when the title already exists.
    pub fn to_title(&self, seen_at: DateTime<Utc>) -> Title {
        let m = self.metadata.clone();
        Title {
            identifier: self.identifier.clone(),
            name: m.name,
            developers: m.developers,
            publishers: m.publishers,
            genres: m.genres,
            categories: m.categories,
            tags: m.tags,
            supported_languages: m.supported_languages,
            planned_release_date: m.planned_release_date,
            ai_disclosure: m.ai_disclosure,
            price_initial: m.price_initial,
            price_final: m.price_final,
            price_currency: m.price_currency,
            first_seen_at: seen_at,
            last_seen_at: seen_at,
        }
    }

    pub fn to_snapshot(&self, collected_at: DateTime<Utc>) -> Snapshot {
        Snapshot {
            identifier: self.identifier.clone(),
            collected_at,
            follower_count: self.follower_count,
            interest_metric: self.interest_metric,
            reviews: self.reviews.clone(),
            raw_payload_digest: self.raw_payload_digest.clone(),
        }
    }
}

/// A title that could not be processed in this run, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub identifier: Identifier,
    pub kind: String,
    pub message: String,
}
