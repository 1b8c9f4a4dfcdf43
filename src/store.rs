//! SQLite persistence for titles and their snapshot series.
//!
//! Every write is its own statement; there is no run-wide transaction, so
//! one failed row never takes other titles down with it.
//!
//! Set-valued columns are stored as JSON arrays (`*_json`), timestamps as
//! Unix seconds. Snapshot uniqueness is keyed on the UTC collection day
//! (`collected_on`), not the exact timestamp, so a second run on the same
//! day cannot add a second point to any series.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;

use crate::config::Config;
use crate::db;
use crate::error::StoreError;
use crate::migrate;
use crate::models::{Identifier, ReviewSummary, Snapshot, Title};

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connect to the configured database and make sure the schema exists.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Record a freshly discovered identifier without any metadata.
    ///
    /// No-op when the title is already known. Returns whether a row was created.
    pub async fn register_title(
        &self,
        identifier: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO titles (identifier, first_seen_at, last_seen_at)
            VALUES (?, ?, ?)
            ON CONFLICT(identifier) DO NOTHING
            "#,
        )
        .bind(identifier)
        .bind(seen_at.timestamp())
        .bind(seen_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(StoreError::StoreWriteError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Insert or refresh a title's master record.
    ///
    /// `first_seen_at` is only written on insert. `last_seen_at` never moves
    /// backwards.
    pub async fn upsert_title(&self, title: &Title) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO titles (identifier, name, developers_json, publishers_json, genres_json,
                                categories_json, tags_json, languages_json, planned_release_date,
                                ai_disclosure, price_initial, price_final, price_currency,
                                first_seen_at, last_seen_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(identifier) DO UPDATE SET
                name = excluded.name,
                developers_json = excluded.developers_json,
                publishers_json = excluded.publishers_json,
                genres_json = excluded.genres_json,
                categories_json = excluded.categories_json,
                tags_json = excluded.tags_json,
                languages_json = excluded.languages_json,
                planned_release_date = excluded.planned_release_date,
                ai_disclosure = excluded.ai_disclosure,
                price_initial = excluded.price_initial,
                price_final = excluded.price_final,
                price_currency = excluded.price_currency,
                last_seen_at = MAX(titles.last_seen_at, excluded.last_seen_at)
            "#,
        )
        .bind(&title.identifier)
        .bind(&title.name)
        .bind(serde_json::to_string(&title.developers)?)
        .bind(serde_json::to_string(&title.publishers)?)
        .bind(serde_json::to_string(&title.genres)?)
        .bind(serde_json::to_string(&title.categories)?)
        .bind(serde_json::to_string(&title.tags)?)
        .bind(serde_json::to_string(&title.supported_languages)?)
        .bind(&title.planned_release_date)
        .bind(&title.ai_disclosure)
        .bind(title.price_initial)
        .bind(title.price_final)
        .bind(&title.price_currency)
        .bind(title.first_seen_at.timestamp())
        .bind(title.last_seen_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(StoreError::StoreWriteError)?;

        Ok(())
    }

    /// Append a snapshot.
    ///
    /// Fails with [`StoreError::DuplicateSnapshot`] and leaves the existing
    /// row untouched when the title already has a snapshot for that day.
    pub async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let day = snapshot.collected_on().format("%Y-%m-%d").to_string();

        let result = sqlx::query(
            r#"
            INSERT INTO snapshots (identifier, collected_at, collected_on, follower_count,
                                   interest_metric, total_reviews, total_positive,
                                   total_negative, review_score_desc, raw_payload_digest)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(identifier, collected_on) DO NOTHING
            "#,
        )
        .bind(&snapshot.identifier)
        .bind(snapshot.collected_at.timestamp())
        .bind(&day)
        .bind(snapshot.follower_count)
        .bind(snapshot.interest_metric)
        .bind(snapshot.reviews.total_reviews)
        .bind(snapshot.reviews.total_positive)
        .bind(snapshot.reviews.total_negative)
        .bind(&snapshot.reviews.review_score_desc)
        .bind(&snapshot.raw_payload_digest)
        .execute(&self.pool)
        .await
        .map_err(StoreError::StoreWriteError)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateSnapshot {
                identifier: snapshot.identifier.clone(),
                day,
            });
        }
        Ok(())
    }

    pub async fn known_identifiers(&self) -> Result<BTreeSet<Identifier>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT identifier FROM titles")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    /// Snapshot series of one title, oldest first.
    pub async fn snapshots_for(&self, identifier: &str) -> Result<Vec<Snapshot>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT identifier, collected_at, follower_count, interest_metric, total_reviews,
                   total_positive, total_negative, review_score_desc, raw_payload_digest
            FROM snapshots
            WHERE identifier = ?
            ORDER BY collected_at ASC
            "#,
        )
        .bind(identifier)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Snapshot, StoreError> {
                Ok(Snapshot {
                    identifier: row.try_get("identifier")?,
                    collected_at: from_ts(row.try_get("collected_at")?),
                    follower_count: row.try_get("follower_count")?,
                    interest_metric: row.try_get("interest_metric")?,
                    reviews: ReviewSummary {
                        total_reviews: row.try_get("total_reviews")?,
                        total_positive: row.try_get("total_positive")?,
                        total_negative: row.try_get("total_negative")?,
                        review_score_desc: row.try_get("review_score_desc")?,
                    },
                    raw_payload_digest: row.try_get("raw_payload_digest")?,
                })
            })
            .collect()
    }

    pub async fn get_title(&self, identifier: &str) -> Result<Option<Title>, StoreError> {
        let row = sqlx::query("SELECT * FROM titles WHERE identifier = ?")
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(title_from_row).transpose()
    }
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn json_column<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<T, StoreError> {
    let raw: String = row.try_get(column)?;
    Ok(serde_json::from_str(&raw)?)
}

fn title_from_row(row: &SqliteRow) -> Result<Title, StoreError> {
    Ok(Title {
        identifier: row.try_get("identifier")?,
        name: row.try_get("name")?,
        developers: json_column(row, "developers_json")?,
        publishers: json_column(row, "publishers_json")?,
        genres: json_column(row, "genres_json")?,
        categories: json_column(row, "categories_json")?,
        tags: json_column(row, "tags_json")?,
        supported_languages: json_column(row, "languages_json")?,
        planned_release_date: row.try_get("planned_release_date")?,
        ai_disclosure: row.try_get("ai_disclosure")?,
        price_initial: row.try_get("price_initial")?,
        price_final: row.try_get("price_final")?,
        price_currency: row.try_get("price_currency")?,
        first_seen_at: from_ts(row.try_get("first_seen_at")?),
        last_seen_at: from_ts(row.try_get("last_seen_at")?),
    })
}
