//! Dataset overview.
//!
//! Quick summary of what has been collected so far: title and snapshot
//! counts, collection days, AI-disclosure share, the most common genres,
//! and the titles with the highest interest on the latest day. Used by `fest stats` to confirm the
//! daily runs are landing.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::store::Store;

/// Headline numbers for the dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetStats {
    pub titles: i64,
    pub enriched_titles: i64,
    pub ai_disclosed: i64,
    pub free_titles: i64,
    pub snapshots: i64,
    pub collection_days: i64,
    pub latest_day: Option<String>,
}

/// One row of the interest ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterestRow {
    pub identifier: String,
    pub name: Option<String>,
    pub interest_metric: Option<i64>,
    pub follower_count: Option<i64>,
    pub total_reviews: Option<i64>,
    pub review_score_desc: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenreCount {
    pub genre: String,
    pub titles: i64,
}

pub async fn dataset_stats(pool: &SqlitePool) -> Result<DatasetStats> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS titles,
            COUNT(name) AS enriched_titles,
            COUNT(ai_disclosure) AS ai_disclosed,
            SUM(CASE WHEN price_final = 0 THEN 1 ELSE 0 END) AS free_titles
        FROM titles
        "#,
    )
    .fetch_one(pool)
    .await?;

    let snap = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS snapshots,
            COUNT(DISTINCT collected_on) AS collection_days,
            MAX(collected_on) AS latest_day
        FROM snapshots
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(DatasetStats {
        titles: row.get("titles"),
        enriched_titles: row.get("enriched_titles"),
        ai_disclosed: row.get("ai_disclosed"),
        free_titles: row.get::<Option<i64>, _>("free_titles").unwrap_or(0),
        snapshots: snap.get("snapshots"),
        collection_days: snap.get("collection_days"),
        latest_day: snap.get("latest_day"),
    })
}

/// Titles ranked by interest on `day`, highest first. Titles without a
/// metric sort last.
pub async fn top_by_interest(pool: &SqlitePool, day: &str, limit: i64) -> Result<Vec<InterestRow>> {
    let rows = sqlx::query(
        r#"
        SELECT t.identifier, t.name, s.interest_metric, s.follower_count,
               s.total_reviews, s.review_score_desc
        FROM snapshots s
        JOIN titles t ON t.identifier = s.identifier
        WHERE s.collected_on = ?
        ORDER BY s.interest_metric IS NULL, s.interest_metric DESC,
                 s.follower_count DESC, t.identifier
        LIMIT ?
        "#,
    )
    .bind(day)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| InterestRow {
            identifier: row.get("identifier"),
            name: row.get("name"),
            interest_metric: row.get("interest_metric"),
            follower_count: row.get("follower_count"),
            total_reviews: row.get("total_reviews"),
            review_score_desc: row.get("review_score_desc"),
        })
        .collect())
}

/// Genres by number of titles carrying them, most common first.
pub async fn top_genres(pool: &SqlitePool, limit: i64) -> Result<Vec<GenreCount>> {
    let rows = sqlx::query(
        r#"
        SELECT g.value AS genre, COUNT(*) AS titles
        FROM titles t, json_each(t.genres_json) g
        GROUP BY g.value
        ORDER BY titles DESC, genre
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| GenreCount {
            genre: row.get("genre"),
            titles: row.get("titles"),
        })
        .collect())
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let store = Store::open(config).await?;
    let stats = dataset_stats(store.pool()).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Festival dataset");
    println!("================");
    println!();
    println!("  Database:        {}", config.db.path.display());
    println!("  Size:            {}", format_bytes(db_size));
    println!();
    println!(
        "  Titles:          {} ({} with metadata)",
        stats.titles, stats.enriched_titles
    );
    println!(
        "  AI-disclosed:    {} ({}%)",
        stats.ai_disclosed,
        percent(stats.ai_disclosed, stats.enriched_titles)
    );
    println!("  Free:            {}", stats.free_titles);
    println!("  Snapshots:       {}", stats.snapshots);
    println!("  Collection days: {}", stats.collection_days);

    let genres = top_genres(store.pool(), 8).await?;
    if !genres.is_empty() {
        println!();
        println!("  Top genres:");
        for g in &genres {
            println!("    {:<28} {:>6}", truncate(&g.genre, 28), g.titles);
        }
    }

    if let Some(day) = &stats.latest_day {
        let top = top_by_interest(store.pool(), day, 10).await?;
        if !top.is_empty() {
            println!();
            println!("  Top by interest on {}:", day);
            println!(
                "  {:<12} {:<36} {:>10} {:>10} {:>10}  {}",
                "ID", "NAME", "PLAYERS", "FOLLOWERS", "REVIEWS", "SCORE"
            );
            println!("  {}", "-".repeat(100));
            for r in &top {
                println!(
                    "  {:<12} {:<36} {:>10} {:>10} {:>10}  {}",
                    r.identifier,
                    truncate(r.name.as_deref().unwrap_or("-"), 36),
                    display_opt(r.interest_metric),
                    display_opt(r.follower_count),
                    display_opt(r.total_reviews),
                    r.review_score_desc.as_deref().unwrap_or("-")
                );
            }
        }
    }

    println!();
    store.close().await;
    Ok(())
}

fn percent(part: i64, whole: i64) -> i64 {
    if whole > 0 {
        (part * 100) / whole
    } else {
        0
    }
}

fn display_opt(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max - 1).collect();
        format!("{}…", cut)
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
