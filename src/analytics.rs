//! Request analytics: capture, batching, retention and the 14-day chart.
//!
//! The HTTP layer calls [`Analytics::record`] for each API request. Records
//! go into a bounded channel and are dropped when it is full, so capture
//! never slows a request down. A [`Recorder`] task drains the channel on a
//! timer and writes each batch in one transaction to `__requests`. A second
//! timer prunes records older than the retention window.
//!
//! [`AnalyticsStore::chart_data_at`] rolls fully elapsed days up into
//! `__metrics` as it aggregates, so old request records can be discarded
//! without losing the chart.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::task::JoinHandle;

use content_engine_core::analytics::{
    aggregate, retention_cutoff_ms, ChartData, DailyMetric, RequestRecord,
};

use crate::config::AnalyticsConfig;
use crate::error::Result;
use crate::kv::KvStore;

pub const REQUESTS_BUCKET: &str = "__requests";
pub const METRICS_BUCKET: &str = "__metrics";

/// Builds the capture handle and its recorder.
pub fn channel(store: AnalyticsStore, config: &AnalyticsConfig) -> (Analytics, Recorder) {
    let capacity = config.capacity();
    let (tx, rx) = mpsc::channel(capacity);
    let analytics = Analytics {
        tx,
        store: store.clone(),
    };
    let recorder = Recorder {
        rx,
        store,
        capacity,
        insert_every: Duration::from_secs(config.insert_interval_secs),
        retention_days: config.retention_days,
    };
    (analytics, recorder)
}

// ============ Capture ============

/// Capture handle shared by request handlers. Cheap to clone.
#[derive(Clone)]
pub struct Analytics {
    tx: mpsc::Sender<RequestRecord>,
    store: AnalyticsStore,
}

impl Analytics {
    /// Queues a request record without waiting. Dropped when the queue is
    /// full or the recorder has stopped.
    pub fn record(&self, record: RequestRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => tracing::trace!("analytics queue full, record dropped"),
            Err(TrySendError::Closed(_)) => tracing::trace!("analytics recorder stopped"),
        }
    }

    pub fn store(&self) -> &AnalyticsStore {
        &self.store
    }

    pub async fn chart_data(&self) -> Result<ChartData> {
        self.store.chart_data_at(Utc::now()).await
    }
}

// ============ Recorder ============

pub struct Recorder {
    rx: mpsc::Receiver<RequestRecord>,
    store: AnalyticsStore,
    capacity: usize,
    insert_every: Duration,
    retention_days: i64,
}

impl Recorder {
    /// Spawns [`run`](Self::run) on the current runtime.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until every [`Analytics`] handle is dropped. Storage errors are
    /// logged and the loop carries on.
    pub async fn run(mut self) {
        let prune_every = Duration::from_secs((self.retention_days.max(2) as u64 / 2) * 86_400);
        let start = tokio::time::Instant::now();
        let mut insert = tokio::time::interval_at(start + self.insert_every, self.insert_every);
        let mut prune = tokio::time::interval_at(start + prune_every, prune_every);

        loop {
            tokio::select! {
                _ = insert.tick() => {
                    let (batch, closed) = self.drain();
                    self.persist(&batch).await;
                    if closed {
                        tracing::debug!("analytics recorder stopped");
                        return;
                    }
                }
                _ = prune.tick() => {
                    match self.store.prune(Utc::now(), self.retention_days).await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!(removed = n, "pruned analytics requests"),
                        Err(e) => tracing::error!(error = %e, "analytics prune failed"),
                    }
                }
            }
        }
    }

    /// Takes at most one channel's worth of queued records. The flag is
    /// set once every sender is gone.
    fn drain(&mut self) -> (Vec<RequestRecord>, bool) {
        let mut batch = Vec::new();
        while batch.len() < self.capacity {
            match self.rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(TryRecvError::Empty) => return (batch, false),
                Err(TryRecvError::Disconnected) => return (batch, true),
            }
        }
        (batch, false)
    }

    async fn persist(&self, batch: &[RequestRecord]) {
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.store.insert_batch(batch).await {
            tracing::error!(error = %e, records = batch.len(), "analytics insert failed");
        }
    }
}

// ============ Storage ============

/// Analytics buckets on their own store (or the system store). Cheap to clone.
#[derive(Clone)]
pub struct AnalyticsStore {
    kv: KvStore,
}

impl AnalyticsStore {
    pub async fn open(kv: KvStore) -> Result<Self> {
        kv.ensure_buckets(&[REQUESTS_BUCKET, METRICS_BUCKET]).await?;
        Ok(Self { kv })
    }

    /// Appends records under fresh sequence keys, in order, in one
    /// transaction.
    pub async fn insert_batch(&self, batch: &[RequestRecord]) -> Result<usize> {
        let mut txn = self.kv.begin_write().await?;
        txn.create_bucket_if_not_exists(REQUESTS_BUCKET).await?;
        for record in batch {
            let seq = txn.next_sequence(REQUESTS_BUCKET).await?;
            let value = serde_json::to_vec(record)?;
            txn.put(REQUESTS_BUCKET, request_key(seq).as_bytes(), &value)
                .await?;
        }
        txn.commit().await?;
        Ok(batch.len())
    }

    /// Deletes request records at or before UTC midnight `retention_days`
    /// ago. Unreadable records go too.
    pub async fn prune(&self, now: DateTime<Utc>, retention_days: i64) -> Result<usize> {
        let cutoff = retention_cutoff_ms(now, retention_days);
        let mut txn = self.kv.begin_write().await?;
        let mut removed = 0;
        for (key, value) in txn.entries(REQUESTS_BUCKET).await? {
            let expired = match serde_json::from_slice::<RequestRecord>(&value) {
                Ok(record) => record.timestamp <= cutoff,
                Err(_) => true,
            };
            if expired && txn.delete(REQUESTS_BUCKET, &key).await? {
                removed += 1;
            }
        }
        txn.commit().await?;
        Ok(removed)
    }

    /// Chart for the 14 days ending on `now`'s date.
    ///
    /// Requests from past days that are already summarized in `__metrics`
    /// are deleted; past days seen for the first time are summarized.
    pub async fn chart_data_at(&self, now: DateTime<Utc>) -> Result<ChartData> {
        let mut txn = self.kv.begin_write().await?;

        let mut rows = Vec::new();
        for (key, value) in txn.entries(REQUESTS_BUCKET).await? {
            match serde_json::from_slice::<RequestRecord>(&value) {
                Ok(record) => rows.push((key, record)),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable analytics record"),
            }
        }

        let mut metrics = BTreeMap::new();
        for (_, value) in txn.entries(METRICS_BUCKET).await? {
            let metric: DailyMetric = serde_json::from_slice(&value)?;
            metrics.insert(metric.date.clone(), metric);
        }

        let result = aggregate(now, &rows, &metrics);

        for key in &result.superseded {
            txn.delete(REQUESTS_BUCKET, key).await?;
        }
        for metric in &result.new_metrics {
            let value = serde_json::to_vec(metric)?;
            txn.put(METRICS_BUCKET, metric.date.as_bytes(), &value)
                .await?;
        }
        txn.commit().await?;

        if !result.new_metrics.is_empty() {
            tracing::debug!(days = result.new_metrics.len(), "analytics days summarized");
        }
        Ok(result.chart)
    }

    pub async fn request_count(&self) -> Result<u64> {
        let mut txn = self.kv.begin_read().await?;
        Ok(txn.count(REQUESTS_BUCKET).await?)
    }

    pub async fn metrics(&self) -> Result<Vec<DailyMetric>> {
        let mut txn = self.kv.begin_read().await?;
        txn.entries(METRICS_BUCKET)
            .await?
            .iter()
            .map(|(_, v)| serde_json::from_slice::<DailyMetric>(v).map_err(Into::into))
            .collect()
    }
}

/// Zero-padded so key order is insertion order.
fn request_key(seq: u64) -> String {
    format!("{:020}", seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    async fn store() -> (TempDir, AnalyticsStore) {
        let tmp = TempDir::new().unwrap();
        let kv = KvStore::open(&tmp.path().join("analytics.db")).await.unwrap();
        (tmp, AnalyticsStore::open(kv).await.unwrap())
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn request(when: DateTime<Utc>, ip: &str) -> RequestRecord {
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
    async fn test_empty_store_charts_zero_days() {
        let (_tmp, store) = store().await;
        let chart = store.chart_data_at(at(2024, 3, 15, 12)).await.unwrap();
        assert_eq!(chart.dates.len(), 14);
        assert_eq!(chart.from, "03/02");
        assert_eq!(chart.to, "03/15");
        assert!(chart.total.iter().all(|&t| t == 0));
        assert!(chart.unique.iter().all(|&u| u == 0));
    }

    #[tokio::test]
    async fn test_past_days_roll_up_into_metrics() {
        let (_tmp, store) = store().await;
        let yesterday = at(2024, 3, 14, 9);
        let today = at(2024, 3, 15, 8);
        store
            .insert_batch(&[
                request(yesterday, "1.1.1.1"),
                request(yesterday, "1.1.1.1"),
                request(yesterday, "2.2.2.2"),
                request(today, "3.3.3.3"),
            ])
            .await
            .unwrap();

        let now = at(2024, 3, 15, 12);
        let chart = store.chart_data_at(now).await.unwrap();
        assert_eq!(chart.total[12], 3);
        assert_eq!(chart.unique[12], 2);
        assert_eq!(chart.total[13], 1);
        assert_eq!(
            store.metrics().await.unwrap(),
            vec![DailyMetric {
                date: "03/14".into(),
                total: 3,
                unique: 2
            }]
        );

        // second pass drops the summarized requests but keeps the numbers
        let again = store.chart_data_at(now).await.unwrap();
        assert_eq!(again.total, chart.total);
        assert_eq!(store.request_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_prune_removes_old_requests() {
        let (_tmp, store) = store().await;
        store
            .insert_batch(&[
                request(at(2024, 2, 20, 10), "1.1.1.1"),
                request(at(2024, 3, 1, 0), "1.1.1.1"),
                request(at(2024, 3, 10, 10), "1.1.1.1"),
            ])
            .await
            .unwrap();

        let removed = store.prune(at(2024, 3, 15, 12), 14).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.request_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_full_channel_drops_records() {
        let (_tmp, store) = store().await;
        let config = AnalyticsConfig {
            channel_capacity: Some(2),
            ..Default::default()
        };
        let (analytics, mut recorder) = channel(store.clone(), &config);
        for _ in 0..5 {
            analytics.record(request(Utc::now(), "1.1.1.1"));
        }

        let (batch, closed) = recorder.drain();
        assert_eq!(batch.len(), 2);
        assert!(!closed);
        recorder.persist(&batch).await;
        assert_eq!(store.request_count().await.unwrap(), 2);

        drop(analytics);
        let (batch, closed) = recorder.drain();
        assert!(batch.is_empty());
        assert!(closed);
    }

    #[tokio::test]
    async fn test_recorder_flushes_on_timer_and_stops() {
        let (_tmp, store) = store().await;
        let config = AnalyticsConfig {
            insert_interval_secs: 1,
            channel_capacity: Some(16),
            ..Default::default()
        };
        let (analytics, recorder) = channel(store.clone(), &config);
        let handle = recorder.start();

        analytics.record(request(Utc::now(), "1.1.1.1"));
        analytics.record(request(Utc::now(), "2.2.2.2"));
        drop(analytics);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.request_count().await.unwrap(), 2);
    }
}
