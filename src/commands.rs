//! `cms` subcommand implementations.
//!
//! Each `run_*` function opens the engine from the loaded config, does its
//! work and prints a human-readable report to stdout.

use anyhow::{Context, Result};
use content_engine_core::entity::Record;

use crate::config::Config;
use crate::demo;
use crate::engine::Engine;
use crate::repository::{Order, QueryOptions};
use crate::users::PASSWORD;
use content_engine_core::Registry;

/// The registry the `cms` binary serves: built-in uploads plus the demo
/// types.
pub fn default_registry() -> Result<Registry> {
    let mut registry = Registry::new();
    demo::register(&mut registry)?;
    Ok(registry)
}

pub async fn open(config: &Config) -> Result<Engine> {
    let engine = Engine::open(config.clone(), default_registry()?)
        .await
        .with_context(|| format!("Failed to open store at {}", config.store.system_db.display()))?;
    Ok(engine)
}

pub async fn run_init(config: &Config) -> Result<()> {
    let engine = open(config).await?;
    let types: Vec<&str> = engine.repo().registry().names().collect();
    let indexes = engine.repo().search_indexes().indexes();
    println!("Store initialized at {}", config.store.system_db.display());
    println!("  types:   {}", types.join(", "));
    println!(
        "  indexes: {}",
        if indexes.is_empty() {
            "(none)".to_string()
        } else {
            indexes.join(", ")
        }
    );
    engine.close().await;
    Ok(())
}

pub async fn run_search(
    config: &Config,
    type_name: &str,
    query: &str,
    count: i64,
    offset: i64,
) -> Result<()> {
    let engine = open(config).await?;
    let hits = engine.repo().search(type_name, query, count, offset).await?;

    if hits.is_empty() {
        println!("No results.");
    }
    for (i, record) in hits.iter().enumerate() {
        print_summary(i + 1, type_name, record.as_ref());
    }
    engine.close().await;
    Ok(())
}

pub async fn run_list(
    config: &Config,
    type_name: &str,
    count: i64,
    offset: i64,
    order: &str,
) -> Result<()> {
    let engine = open(config).await?;
    let repo = engine.repo();
    repo.sort_content(type_name).await?;

    let opts = QueryOptions {
        count,
        offset,
        order: Order::parse(order),
    };
    let bucket = content_engine_core::target::sorted_bucket(type_name);
    let (total, records) = repo.query(&bucket, opts).await?;

    println!("{} {} record(s)", total, type_name);
    for (i, record) in records.iter().enumerate() {
        print_summary(i + 1, type_name, record.as_ref());
    }
    engine.close().await;
    Ok(())
}

pub async fn run_get(config: &Config, target: &str) -> Result<()> {
    let engine = open(config).await?;
    let record = engine.repo().find_one_by_target(target).await?;
    println!("{}", serde_json::to_string_pretty(&record.to_json()?)?);
    engine.close().await;
    Ok(())
}

pub async fn run_reindex(config: &Config, type_name: &str) -> Result<()> {
    let engine = open(config).await?;
    let n = engine.repo().reindex(type_name).await?;
    println!("Reindexed {} document(s) for {}", n, type_name);
    engine.close().await;
    Ok(())
}

pub async fn run_user_add(config: &Config, email: &str, password: &str) -> Result<()> {
    let engine = open(config).await?;
    let users = engine.users();
    let user = users.create_user(email).await?;
    users.set_credential(user.id, PASSWORD, password).await?;
    println!("Created user {} (id {})", user.email, user.id);
    engine.close().await;
    Ok(())
}

pub async fn run_analytics(config: &Config) -> Result<()> {
    let engine = open(config).await?;
    let chart = engine.analytics().chart_data().await?;

    println!("Requests {} .. {}", chart.from, chart.to);
    println!("{:<6} {:>8} {:>8}", "date", "total", "unique");
    for ((date, total), unique) in chart.dates.iter().zip(&chart.total).zip(&chart.unique) {
        println!("{:<6} {:>8} {:>8}", date, total, unique);
    }
    engine.close().await;
    Ok(())
}

fn print_summary(rank: usize, type_name: &str, record: &dyn Record) {
    let item = record.item();
    println!(
        "{}. {}:{}  {}  (slug: {})",
        rank,
        type_name,
        item.id,
        record.display_name(),
        item.slug
    );
}
