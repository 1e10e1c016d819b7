//! Per-endpoint usage statistics.
//!
//! A `StatsCollector` is created by whoever builds the gateway and handed
//! to the pipeline; there is no process-wide instance. Counters live in
//! memory, are mirrored into the collector's own Prometheus registry, and
//! daily deltas are flushed to an optional `StatsStorage`.

use anyhow::Result;
use parking_lot::Mutex;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Aggregated counters for one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub requests: u64,
    pub errors: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// RFC 3339 timestamp of the most recent request.
    pub last_used: Option<String>,
}

/// Point-in-time view of every counter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Always equal to the sum of per-endpoint `requests`.
    pub total_requests: u64,
    pub total_errors: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub active_streams: i64,
    pub endpoints: BTreeMap<String, EndpointStats>,
}

/// One persisted row: an endpoint's counters for one day (`YYYY-MM-DD`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredStat {
    pub endpoint: String,
    pub date: String,
    pub requests: u64,
    pub errors: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl StoredStat {
    fn merge(&mut self, other: &StoredStat) {
        self.requests += other.requests;
        self.errors += other.errors;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Storage-row → in-memory stats. The row's date becomes `last_used`
/// (midnight UTC) since rows carry no finer timestamp.
pub fn endpoint_stats_from_stored(stored: &StoredStat) -> EndpointStats {
    let last_used = chrono::NaiveDate::parse_from_str(&stored.date, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc().to_rfc3339());
    EndpointStats {
        requests: stored.requests,
        errors: stored.errors,
        input_tokens: stored.input_tokens,
        output_tokens: stored.output_tokens,
        last_used,
    }
}

/// Persistence for daily statistics, implemented outside the gateway.
pub trait StatsStorage: Send + Sync {
    /// Add `stat` to the row for its endpoint and date.
    fn record_daily_stat(&self, stat: &StoredStat) -> Result<()>;

    /// All-time totals, one row per endpoint; `date` is the latest active day.
    fn get_total_stats(&self) -> Result<Vec<StoredStat>>;

    /// Rows for one day.
    fn get_daily_stats(&self, date: &str) -> Result<Vec<StoredStat>>;
}

/// In-process storage, used by default and in tests.
#[derive(Debug, Default)]
pub struct MemoryStatsStorage {
    rows: Mutex<BTreeMap<(String, String), StoredStat>>,
}

impl MemoryStatsStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatsStorage for MemoryStatsStorage {
    fn record_daily_stat(&self, stat: &StoredStat) -> Result<()> {
        let mut rows = self.rows.lock();
        rows.entry((stat.date.clone(), stat.endpoint.clone()))
            .or_insert_with(|| StoredStat {
                endpoint: stat.endpoint.clone(),
                date: stat.date.clone(),
                ..Default::default()
            })
            .merge(stat);
        Ok(())
    }

    fn get_total_stats(&self) -> Result<Vec<StoredStat>> {
        let rows = self.rows.lock();
        let mut totals: BTreeMap<&str, StoredStat> = BTreeMap::new();
        // Keys iterate in date order, so the last date seen is the latest.
        for ((date, endpoint), row) in rows.iter() {
            let total = totals.entry(endpoint.as_str()).or_insert_with(|| StoredStat {
                endpoint: endpoint.clone(),
                ..Default::default()
            });
            total.merge(row);
            total.date = date.clone();
        }
        Ok(totals.into_values().collect())
    }

    fn get_daily_stats(&self, date: &str) -> Result<Vec<StoredStat>> {
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|((d, _), _)| d == date)
            .map(|(_, row)| row.clone())
            .collect())
    }
}

// ============================================================================
// Collector
// ============================================================================

#[derive(Debug, Default)]
struct StatsInner {
    endpoints: HashMap<String, EndpointStats>,
    /// Unflushed daily deltas keyed by (date, endpoint).
    pending: BTreeMap<(String, String), StoredStat>,
}

impl StatsInner {
    fn pending_row(&mut self, endpoint: &str) -> &mut StoredStat {
        let date = today();
        self.pending
            .entry((date.clone(), endpoint.to_string()))
            .or_insert_with(|| StoredStat {
                endpoint: endpoint.to_string(),
                date,
                ..Default::default()
            })
    }
}

fn today() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

/// Decrements the active-stream gauge when dropped.
#[derive(Debug)]
pub struct StreamGuard {
    gauge: IntGauge,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

pub struct StatsCollector {
    inner: Mutex<StatsInner>,
    storage: Option<Arc<dyn StatsStorage>>,
    registry: Registry,
    requests_total: IntCounterVec,
    errors_total: IntCounterVec,
    input_tokens_total: IntCounterVec,
    output_tokens_total: IntCounterVec,
    active_streams: IntGauge,
}

impl StatsCollector {
    pub fn new(storage: Option<Arc<dyn StatsStorage>>) -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("ccg_requests_total", "Upstream attempts per endpoint"),
            &["endpoint"],
        )?;
        let errors_total = IntCounterVec::new(
            Opts::new("ccg_errors_total", "Failed upstream attempts per endpoint and reason"),
            &["endpoint", "reason"],
        )?;
        let input_tokens_total = IntCounterVec::new(
            Opts::new("ccg_input_tokens_total", "Input tokens per endpoint"),
            &["endpoint"],
        )?;
        let output_tokens_total = IntCounterVec::new(
            Opts::new("ccg_output_tokens_total", "Output tokens per endpoint"),
            &["endpoint"],
        )?;
        let active_streams = IntGauge::new("ccg_active_streams", "Currently open SSE streams")?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(input_tokens_total.clone()))?;
        registry.register(Box::new(output_tokens_total.clone()))?;
        registry.register(Box::new(active_streams.clone()))?;

        Ok(Self {
            inner: Mutex::new(StatsInner::default()),
            storage,
            registry,
            requests_total,
            errors_total,
            input_tokens_total,
            output_tokens_total,
            active_streams,
        })
    }

    /// Seed in-memory totals from storage. Existing in-memory counters win.
    pub fn restore(&self) -> Result<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let rows = storage.get_total_stats()?;
        let mut inner = self.inner.lock();
        for row in &rows {
            inner
                .endpoints
                .entry(row.endpoint.clone())
                .or_insert_with(|| endpoint_stats_from_stored(row));
        }
        info!(endpoints = rows.len(), "restored stats from storage");
        Ok(rows.len())
    }

    pub fn record_request(&self, endpoint: &str) {
        {
            let mut inner = self.inner.lock();
            let stats = inner.endpoints.entry(endpoint.to_string()).or_default();
            stats.requests += 1;
            stats.last_used = Some(chrono::Utc::now().to_rfc3339());
            inner.pending_row(endpoint).requests += 1;
        }
        self.requests_total.with_label_values(&[endpoint]).inc();
    }

    pub fn record_error(&self, endpoint: &str, reason: &str) {
        {
            let mut inner = self.inner.lock();
            inner.endpoints.entry(endpoint.to_string()).or_default().errors += 1;
            inner.pending_row(endpoint).errors += 1;
        }
        self.errors_total.with_label_values(&[endpoint, reason]).inc();
        debug!(endpoint, reason, "recorded upstream error");
    }

    pub fn record_tokens(&self, endpoint: &str, input: u64, output: u64) {
        {
            let mut inner = self.inner.lock();
            let stats = inner.endpoints.entry(endpoint.to_string()).or_default();
            stats.input_tokens += input;
            stats.output_tokens += output;
            let row = inner.pending_row(endpoint);
            row.input_tokens += input;
            row.output_tokens += output;
        }
        self.input_tokens_total
            .with_label_values(&[endpoint])
            .inc_by(input);
        self.output_tokens_total
            .with_label_values(&[endpoint])
            .inc_by(output);
    }

    /// Count an open stream until the returned guard drops.
    pub fn track_stream(&self) -> StreamGuard {
        self.active_streams.inc();
        StreamGuard {
            gauge: self.active_streams.clone(),
        }
    }

    pub fn endpoint(&self, name: &str) -> Option<EndpointStats> {
        self.inner.lock().endpoints.get(name).cloned()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock();
        let mut snapshot = StatsSnapshot {
            active_streams: self.active_streams.get(),
            ..Default::default()
        };
        for (name, stats) in &inner.endpoints {
            snapshot.total_requests += stats.requests;
            snapshot.total_errors += stats.errors;
            snapshot.total_input_tokens += stats.input_tokens;
            snapshot.total_output_tokens += stats.output_tokens;
            snapshot.endpoints.insert(name.clone(), stats.clone());
        }
        snapshot
    }

    /// Rows for `date` from storage; empty when no storage is attached.
    pub fn daily(&self, date: &str) -> Result<Vec<StoredStat>> {
        match &self.storage {
            Some(storage) => storage.get_daily_stats(date),
            None => Ok(Vec::new()),
        }
    }

    /// Push pending daily deltas to storage. Rows that fail to write are
    /// kept and retried on the next flush.
    pub fn flush(&self) -> Result<usize> {
        let Some(storage) = &self.storage else {
            self.inner.lock().pending.clear();
            return Ok(0);
        };
        let pending = std::mem::take(&mut self.inner.lock().pending);
        let mut written = 0;
        let mut failed = BTreeMap::new();
        let mut last_error = None;
        for (key, row) in pending {
            match storage.record_daily_stat(&row) {
                Ok(()) => written += 1,
                Err(err) => {
                    failed.insert(key, row);
                    last_error = Some(err);
                }
            }
        }
        if !failed.is_empty() {
            let mut inner = self.inner.lock();
            for (key, row) in failed {
                inner
                    .pending
                    .entry(key)
                    .and_modify(|existing| existing.merge(&row))
                    .or_insert(row);
            }
        }
        if let Some(err) = last_error {
            warn!(error = %err, written, "stats flush partially failed");
            return Err(err);
        }
        debug!(rows = written, "flushed stats");
        Ok(written)
    }

    /// Prometheus text exposition of this collector's registry.
    pub fn render_metrics(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
