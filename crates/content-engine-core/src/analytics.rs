//! Request analytics records and the 14-day chart aggregation.
//!
//! Everything here takes an explicit `now` so aggregation can be tested
//! without a clock. Days are UTC calendar days.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Number of days shown in the chart, today included.
pub const CHART_DAYS: usize = 14;

/// One API request, as captured by the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub url: String,
    pub http_method: String,
    pub origin: String,
    pub http_protocol: String,
    pub ip_address: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub external: bool,
}

/// Rolled-up counts for one fully elapsed day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyMetric {
    /// `MM/DD`.
    pub date: String,
    pub total: u64,
    pub unique: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChartData {
    /// `MM/DD` labels, oldest first.
    pub dates: Vec<String>,
    pub total: Vec<u64>,
    pub unique: Vec<u64>,
    pub from: String,
    pub to: String,
}

/// Result of one aggregation pass over the raw request rows.
#[derive(Debug, Clone)]
pub struct Aggregation<K> {
    pub chart: ChartData,
    /// Raw rows already covered by a stored daily metric.
    pub superseded: Vec<K>,
    /// Past days counted for the first time, to be stored.
    pub new_metrics: Vec<DailyMetric>,
}

pub fn date_label(day: NaiveDate) -> String {
    day.format("%m/%d").to_string()
}

/// UTC day of a millisecond timestamp.
pub fn day_of(timestamp_ms: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(timestamp_ms).map(|dt| dt.date_naive())
}

pub fn midnight_ms(day: NaiveDate) -> i64 {
    day.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or_default()
}

/// The chart window ending at `today`, oldest first.
pub fn chart_window(today: NaiveDate) -> Vec<NaiveDate> {
    (0..CHART_DAYS as i64)
        .rev()
        .map(|back| today - Duration::days(back))
        .collect()
}

/// Rows with a timestamp at or before this instant are pruned.
pub fn retention_cutoff_ms(now: DateTime<Utc>, retention_days: i64) -> i64 {
    midnight_ms(now.date_naive() - Duration::days(retention_days))
}

/// Counts requests per window day and decides which rows the stored
/// metrics already cover.
pub fn aggregate<K: Clone>(
    now: DateTime<Utc>,
    rows: &[(K, RequestRecord)],
    metrics: &BTreeMap<String, DailyMetric>,
) -> Aggregation<K> {
    let today = now.date_naive();
    let window = chart_window(today);
    let labels: Vec<String> = window.iter().map(|d| date_label(*d)).collect();

    let mut superseded = Vec::new();
    let mut counts: BTreeMap<String, (u64, HashSet<&str>)> = BTreeMap::new();

    for (key, record) in rows {
        let Some(day) = day_of(record.timestamp) else {
            continue;
        };
        let label = date_label(day);
        if day < today && metrics.contains_key(&label) {
            superseded.push(key.clone());
            continue;
        }
        if day < window[0] || day > today {
            continue;
        }
        let entry = counts.entry(label).or_default();
        entry.0 += 1;
        entry.1.insert(record.ip_address.as_str());
    }

    let mut total = Vec::with_capacity(CHART_DAYS);
    let mut unique = Vec::with_capacity(CHART_DAYS);
    let mut new_metrics = Vec::new();

    for (day, label) in window.iter().zip(&labels) {
        let (t, u) = counts
            .get(label)
            .map(|(t, ips)| (*t, ips.len() as u64))
            .unwrap_or((0, 0));

        if t == 0 {
            let cached = metrics.get(label);
            total.push(cached.map(|m| m.total).unwrap_or(0));
            unique.push(cached.map(|m| m.unique).unwrap_or(0));
            continue;
        }

        if *day < today && !metrics.contains_key(label) {
            new_metrics.push(DailyMetric {
                date: label.clone(),
                total: t,
                unique: u,
            });
        }
        total.push(t);
        unique.push(u);
    }

    Aggregation {
        chart: ChartData {
            from: labels.first().cloned().unwrap_or_default(),
            to: labels.last().cloned().unwrap_or_default(),
            dates: labels,
            total,
            unique,
        },
        superseded,
        new_metrics,
    }
}
