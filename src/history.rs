//! Per-title view: master record plus its snapshot series.

use anyhow::{bail, Result};
use std::collections::BTreeSet;

use crate::config::Config;
use crate::store::Store;

pub async fn run_history(config: &Config, identifier: &str) -> Result<()> {
    let store = Store::open(config).await?;

    let title = match store.get_title(identifier).await? {
        Some(t) => t,
        None => {
            store.close().await;
            bail!("title not found: {}", identifier);
        }
    };
    let series = store.snapshots_for(identifier).await?;

    println!("{}  {}", title.identifier, title.name.as_deref().unwrap_or("(no metadata yet)"));
    println!("  first seen:    {}", title.first_seen_at.format("%Y-%m-%d %H:%M"));
    println!("  last seen:     {}", title.last_seen_at.format("%Y-%m-%d %H:%M"));
    println!("  developers:    {}", join(&title.developers));
    println!("  publishers:    {}", join(&title.publishers));
    println!("  genres:        {}", join(&title.genres));
    println!("  tags:          {}", title.tags.join(", "));
    println!("  languages:     {}", join(&title.supported_languages));
    println!(
        "  release:       {}",
        title.planned_release_date.as_deref().unwrap_or("not disclosed")
    );
    println!(
        "  AI disclosure: {}",
        title.ai_disclosure.as_deref().unwrap_or("not disclosed")
    );
    println!();

    if series.is_empty() {
        println!("  no snapshots");
    } else {
        println!(
            "  {:<12} {:>10} {:>10} {:>10} {:>8} {:>8}  {:<24} DIGEST",
            "DAY", "PLAYERS", "FOLLOWERS", "REVIEWS", "POS", "NEG", "SCORE"
        );
        for s in &series {
            println!(
                "  {:<12} {:>10} {:>10} {:>10} {:>8} {:>8}  {:<24} {}",
                s.collected_on().to_string(),
                opt(s.interest_metric),
                opt(s.follower_count),
                opt(s.reviews.total_reviews),
                opt(s.reviews.total_positive),
                opt(s.reviews.total_negative),
                s.reviews.review_score_desc.as_deref().unwrap_or("-"),
                s.raw_payload_digest
                    .as_deref()
                    .map(|d| &d[..d.len().min(12)])
                    .unwrap_or("-")
            );
        }
    }

    store.close().await;
    Ok(())
}

fn join(set: &BTreeSet<String>) -> String {
    if set.is_empty() {
        "-".to_string()
    } else {
        set.iter().cloned().collect::<Vec<_>>().join(", ")
    }
}

fn opt(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".into())
}
