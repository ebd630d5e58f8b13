//! End-to-end behaviour of the engine through its library API.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use content_engine::analytics::{self, AnalyticsStore};
use content_engine::config::{AnalyticsConfig, Config};
use content_engine::demo::Review;
use content_engine::kv::KvStore;
use content_engine::repository::{Order, QueryOptions};
use content_engine::{Engine, EngineError};
use content_engine_core::analytics::{date_label, RequestRecord};
use content_engine_core::entity::HookContext;
use content_engine_core::{FormValues, Registry};
use serde_json::Value;
use tempfile::TempDir;

async fn open_engine() -> (TempDir, Engine) {
    let tmp = TempDir::new().unwrap();
    let mut registry = Registry::new();
    content_engine::demo::register(&mut registry).unwrap();
    let engine = Engine::open(Config::minimal(tmp.path()), registry)
        .await
        .unwrap();
    (tmp, engine)
}

fn review(title: &str, body: &str) -> Review {
    Review {
        title: title.into(),
        body: body.into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_create_find_by_slug_and_search() {
    let (_tmp, engine) = open_engine().await;
    let repo = engine.repo();

    let id = repo
        .set_entity("Review", &mut review("Hello", "World"))
        .await
        .unwrap();
    assert_eq!(id, 1);

    let (type_name, record) = repo.find_one_by_slug("hello").await.unwrap();
    assert_eq!(type_name, "Review");
    assert_eq!(record.item().id, 1);

    let hits = repo.search("Review", "world", 10, 0).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(format!("Review:{}", hits[0].item().id), "Review:1");
}

#[tokio::test]
async fn test_duplicate_titles_get_numbered_slugs() {
    let (_tmp, engine) = open_engine().await;
    let repo = engine.repo();

    let mut first = review("Hello", "");
    let mut second = review("Hello", "");
    repo.set_entity("Review", &mut first).await.unwrap();
    repo.set_entity("Review", &mut second).await.unwrap();

    assert_eq!(first.item.slug, "hello");
    assert_eq!(second.item.slug, "hello-1");
}

#[tokio::test]
async fn test_sorted_paging() {
    let (_tmp, engine) = open_engine().await;
    let repo = engine.repo();

    let base = 1_700_000_000_000_i64;
    for i in 1..=11 {
        let mut r = review(&format!("Entry {}", i), "");
        r.item.timestamp = base + i * 1000;
        repo.set_entity("Review", &mut r).await.unwrap();
    }
    repo.sort_content("Review").await.unwrap();

    let page = |offset| QueryOptions {
        count: 10,
        offset,
        order: Order::Desc,
    };

    let (total, first) = repo.query("Review__sorted", page(0)).await.unwrap();
    assert_eq!(total, 11);
    let ids: Vec<u64> = first.iter().map(|r| r.item().id).collect();
    assert_eq!(ids, (2..=11).rev().collect::<Vec<u64>>());

    let (_, second) = repo.query("Review__sorted", page(1)).await.unwrap();
    let ids: Vec<u64> = second.iter().map(|r| r.item().id).collect();
    assert_eq!(ids, vec![1]);

    let (_, beyond) = repo.query("Review__sorted", page(2)).await.unwrap();
    assert!(beyond.is_empty());

    let all = QueryOptions {
        count: -1,
        offset: 0,
        order: Order::Desc,
    };
    let (_, everything) = repo.query("Review__sorted", all).await.unwrap();
    let stamps: Vec<i64> = everything.iter().map(|r| r.item().timestamp).collect();
    assert!(stamps.windows(2).all(|w| w[0] >= w[1]));
}

fn request_at(when: DateTime<Utc>, ip: &str) -> RequestRecord {
    RequestRecord {
        url: "/api/contents?type=Review".into(),
        http_method: "GET".into(),
        origin: String::new(),
        http_protocol: "HTTP/1.1".into(),
        ip_address: ip.into(),
        timestamp: when.timestamp_millis(),
        external: false,
    }
}

#[tokio::test]
async fn test_analytics_burst_and_aging() {
    let tmp = TempDir::new().unwrap();
    let kv = KvStore::open(&tmp.path().join("analytics.db")).await.unwrap();
    let store = AnalyticsStore::open(kv).await.unwrap();
    let config = AnalyticsConfig {
        insert_interval_secs: 1,
        channel_capacity: Some(1024),
        ..Default::default()
    };
    let (capture, recorder) = analytics::channel(store.clone(), &config);
    let handle = recorder.start();

    let burst_time = Utc::now();
    for i in 0..5000 {
        capture.record(request_at(burst_time, &format!("10.0.{}.{}", i / 256, i % 256)));
    }
    drop(capture);
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap();

    let persisted = store.request_count().await.unwrap();
    assert!((1..=5000).contains(&persisted), "persisted {}", persisted);

    // a week later, with older traffic mixed in
    let now = burst_time + chrono::Duration::days(7);
    let day = chrono::Duration::days(1);
    store
        .insert_batch(&[
            request_at(now - day * 20, "1.1.1.1"),
            request_at(now - day * 13, "1.1.1.1"),
            request_at(now - day * 3, "1.1.1.1"),
            request_at(now - day * 3, "2.2.2.2"),
        ])
        .await
        .unwrap();

    store.prune(now, 14).await.unwrap();
    let chart = store.chart_data_at(now).await.unwrap();
    assert_eq!(chart.dates.len(), 14);

    let oldest_kept = (now - day * 13).date_naive();
    let burst_label = date_label(burst_time.date_naive());
    let three_ago = date_label((now - day * 3).date_naive());

    let metrics = store.metrics().await.unwrap();
    let total_for = |label: &str| {
        metrics
            .iter()
            .find(|m| m.date == label)
            .map(|m| m.total)
            .unwrap_or(0)
    };
    assert_eq!(total_for(&burst_label), persisted);
    assert_eq!(total_for(&three_ago), 2);
    assert!(metrics
        .iter()
        .all(|m| m.date != date_label((now - day * 20).date_naive())));

    // only the record older than the retention window is gone
    assert_eq!(store.request_count().await.unwrap(), persisted + 3);
    assert_eq!(total_for(&date_label(oldest_kept)), 1);
}

#[tokio::test]
async fn test_delete_clears_slug_and_index() {
    let (_tmp, engine) = open_engine().await;
    let repo = engine.repo();
    repo.set_entity("Review", &mut review("Hello", "World"))
        .await
        .unwrap();

    repo.delete_entity("Review:1").await.unwrap();

    let err = repo.find_one_by_slug("hello").await.unwrap_err();
    assert!(err.is_not_found());
    let index = repo.search_indexes().get_index("Review").unwrap();
    assert!(!index.contains("Review:1").await.unwrap());
    assert!(repo.search("Review", "world", 10, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cache_invalidate_rotates_etag() {
    let (_tmp, engine) = open_engine().await;
    let settings = engine.settings();
    settings
        .put_config("etag", Value::from("stale"))
        .await
        .unwrap();

    let form = FormValues::from_pairs([("cache_invalidate", "invalidate")]);
    let updated = settings.set_config(&form).await.unwrap();

    let etag = settings.get_by_key("etag").unwrap();
    assert_ne!(etag, Value::from("stale"));
    assert_eq!(etag, Value::from(updated.etag.clone()));
    assert!(updated.cache_invalidate.is_empty());
    assert_eq!(
        settings.get_by_key("cache_invalidate"),
        Some(Value::Array(vec![]))
    );
}

#[tokio::test]
async fn test_concurrent_writes_get_distinct_slugs() {
    let (_tmp, engine) = open_engine().await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let repo = engine.repo().clone();
        tasks.push(tokio::spawn(async move {
            let mut r = review("Same Title", "");
            repo.set_entity("Review", &mut r).await.unwrap();
            r.item.slug
        }));
    }

    let mut slugs = HashSet::new();
    for task in tasks {
        assert!(slugs.insert(task.await.unwrap()));
    }
    assert_eq!(slugs.len(), 8);
    assert!(slugs.contains("same-title"));
}

#[tokio::test]
async fn test_submission_approval_flow() {
    let (_tmp, engine) = open_engine().await;
    let content = engine.content();

    let ctx = HookContext {
        form: FormValues::from_pairs([("title", "Fan mail"), ("rating", "5")]),
        ..Default::default()
    };
    let submission = content.api_create("Review", &ctx).await.unwrap();
    assert!(submission.id.is_none());

    // pending content stays out of the public views
    assert!(engine.repo().find_one_by_slug("fan-mail").await.is_err());
    assert!(engine
        .repo()
        .search("Review", "fan", 10, 0)
        .await
        .unwrap()
        .is_empty());

    let published = content
        .approve("Review__pending:1", &HookContext::default())
        .await
        .unwrap();
    assert_eq!(published.item().id, 1);
    assert_eq!(published.item().slug, "fan-mail");

    let err = engine
        .repo()
        .find_one_by_target("Review__pending:1")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
    assert_eq!(
        engine.repo().search("Review", "fan", 10, 0).await.unwrap().len(),
        1
    );
}
