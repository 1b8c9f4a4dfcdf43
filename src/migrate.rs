use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the database file and schema. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Master records, one per storefront identifier
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS titles (
            identifier TEXT PRIMARY KEY,
            name TEXT,
            developers_json TEXT NOT NULL DEFAULT '[]',
            publishers_json TEXT NOT NULL DEFAULT '[]',
            genres_json TEXT NOT NULL DEFAULT '[]',
            categories_json TEXT NOT NULL DEFAULT '[]',
            tags_json TEXT NOT NULL DEFAULT '[]',
            languages_json TEXT NOT NULL DEFAULT '[]',
            planned_release_date TEXT,
            ai_disclosure TEXT,
            price_initial INTEGER,
            price_final INTEGER,
            price_currency TEXT,
            first_seen_at INTEGER NOT NULL,
            last_seen_at INTEGER NOT NULL,
            CHECK (first_seen_at <= last_seen_at)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only observations; at most one per title per UTC day
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            identifier TEXT NOT NULL,
            collected_at INTEGER NOT NULL,
            collected_on TEXT NOT NULL,
            follower_count INTEGER,
            interest_metric INTEGER,
            total_reviews INTEGER,
            total_positive INTEGER,
            total_negative INTEGER,
            review_score_desc TEXT,
            raw_payload_digest TEXT,
            UNIQUE(identifier, collected_on),
            FOREIGN KEY (identifier) REFERENCES titles(identifier)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Databases created before the review counters existed
    for (column, ty) in [
        ("total_reviews", "INTEGER"),
        ("total_positive", "INTEGER"),
        ("total_negative", "INTEGER"),
        ("review_score_desc", "TEXT"),
    ] {
        add_column_if_missing(pool, "snapshots", column, ty).await?;
    }

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_snapshots_collected_on ON snapshots(collected_on)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_snapshots_identifier_at ON snapshots(identifier, collected_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn add_column_if_missing(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    ty: &str,
) -> Result<()> {
    let columns: Vec<String> =
        sqlx::query_scalar(&format!("SELECT name FROM pragma_table_info('{}')", table))
            .fetch_all(pool)
            .await?;
    if !columns.iter().any(|c| c == column) {
        sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, ty))
            .execute(pool)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_schema_upgrade_adds_review_columns() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db(tmp.path().join("old.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        sqlx::query(
            "CREATE TABLE snapshots (id INTEGER PRIMARY KEY, identifier TEXT NOT NULL, \
             collected_at INTEGER NOT NULL, collected_on TEXT NOT NULL)",
        )
        .execute(&pool)
        .await
        .unwrap();

        apply_schema(&pool).await.unwrap();
        apply_schema(&pool).await.unwrap();

        let columns: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info('snapshots')")
                .fetch_all(&pool)
                .await
                .unwrap();
        for c in ["total_reviews", "total_positive", "total_negative", "review_score_desc"] {
            assert!(columns.iter().any(|n| n == c), "missing column {}", c);
        }
    }
}
