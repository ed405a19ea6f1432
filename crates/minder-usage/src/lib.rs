//! Per-LLM-call usage tracking.
//!
//! Every call is recorded in two in-memory indexes (by provider, by model)
//! and appended as one JSON line to a per-provider/per-day file under the
//! usage directory. Startup reloads everything inside the retention
//! horizon; an hourly sweeper evicts what ages out.

mod types;

pub use types::{Metric, ModelBreakdown, TokenUsage, UsageRecord, UsageStats};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use minder_core::Clock;
use minder_storage::Storage;

/// Interval between eviction passes.
const EVICTION_INTERVAL: StdDuration = StdDuration::from_secs(3600);

pub struct UsageTracker {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    dir: String,
    retention: Duration,
    enabled: bool,
    by_provider: DashMap<String, Vec<UsageRecord>>,
    by_model: DashMap<String, Vec<UsageRecord>>,
}

impl UsageTracker {
    pub fn new(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        dir: impl Into<String>,
        retention_days: i64,
        enabled: bool,
    ) -> Self {
        Self {
            storage,
            clock,
            dir: dir.into(),
            retention: Duration::days(retention_days),
            enabled,
            by_provider: DashMap::new(),
            by_model: DashMap::new(),
        }
    }

    /// Record one LLM call. Missing timestamps are stamped with the current
    /// time; a missing total is derived from input + output.
    ///
    /// The persistence append is best-effort: an I/O failure is logged and
    /// the in-memory indexes still gain the record.
    pub async fn record(&self, provider: &str, model: &str, usage: TokenUsage) {
        if !self.enabled {
            return;
        }

        let timestamp = usage.timestamp.unwrap_or_else(|| self.clock.now());
        let record = UsageRecord {
            provider: provider.to_string(),
            model: model.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage
                .total_tokens
                .unwrap_or(usage.input_tokens + usage.output_tokens),
            latency_ms: usage.latency_ms,
            timestamp,
        };

        let path = self.log_path(provider, timestamp);
        match serde_json::to_string(&record) {
            Ok(line) => {
                if let Err(e) = self.storage.append_text(&path, &format!("{line}\n")).await {
                    warn!(provider, error = %e, "usage: append failed, record kept in memory only");
                }
            }
            Err(e) => warn!(provider, error = %e, "usage: serialize failed"),
        }

        self.index(record);
    }

    /// Load persisted records under the usage directory, skipping files that
    /// aren't line-oriented text, malformed lines, and anything older than
    /// the retention horizon.
    pub async fn load(&self) -> usize {
        if !self.enabled {
            return 0;
        }

        let horizon = self.clock.now() - self.retention;
        let files = match self.storage.list(&self.dir).await {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "usage: listing usage directory failed");
                return 0;
            }
        };

        let mut loaded = 0usize;
        for name in files {
            let path = format!("{}/{}", self.dir, name);
            let text = match self.storage.get_text(&path).await {
                Ok(t) => t,
                Err(e) => {
                    debug!(file = %name, error = %e, "usage: skipping unreadable file");
                    continue;
                }
            };
            for record in parse_usage_text(&text) {
                if record.timestamp < horizon {
                    continue;
                }
                self.index(record);
                loaded += 1;
            }
        }
        info!(records = loaded, "usage: loaded persisted records");
        loaded
    }

    /// Remove in-memory records older than the retention horizon.
    /// Returns the number evicted.
    pub fn evict_expired(&self) -> usize {
        let horizon = self.clock.now() - self.retention;
        let mut evicted = 0usize;
        for mut entry in self.by_provider.iter_mut() {
            let before = entry.len();
            entry.retain(|r| r.timestamp >= horizon);
            evicted += before - entry.len();
        }
        for mut entry in self.by_model.iter_mut() {
            entry.retain(|r| r.timestamp >= horizon);
        }
        if evicted > 0 {
            debug!(evicted, "usage: evicted expired records");
        }
        evicted
    }

    /// Periodic eviction task. Runs until cancelled.
    pub async fn run_eviction_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(EVICTION_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.evict_expired();
                }
            }
        }
    }

    /// Aggregate stats for one provider over `[now - period, now)`.
    pub fn stats(&self, provider: &str, period: Duration) -> UsageStats {
        let records = self
            .by_provider
            .get(provider)
            .map(|r| self.filter_period(&r, period))
            .unwrap_or_default();
        aggregate(&records)
    }

    /// Aggregate stats across all providers.
    pub fn stats_all(&self, period: Duration) -> UsageStats {
        let mut records = Vec::new();
        for entry in self.by_provider.iter() {
            records.extend(self.filter_period(&entry, period));
        }
        aggregate(&records)
    }

    /// Per-model request/token breakdown across all providers.
    pub fn stats_by_model(&self, period: Duration) -> BTreeMap<String, ModelBreakdown> {
        let mut out = BTreeMap::new();
        for entry in self.by_model.iter() {
            let records = self.filter_period(&entry, period);
            if records.is_empty() {
                continue;
            }
            let breakdown = ModelBreakdown {
                requests: records.len() as u64,
                input_tokens: records.iter().map(|r| r.input_tokens).sum(),
                output_tokens: records.iter().map(|r| r.output_tokens).sum(),
                total_tokens: records.iter().map(|r| r.total_tokens).sum(),
            };
            out.insert(entry.key().clone(), breakdown);
        }
        out
    }

    /// Emit `(name, value, tags)` tuples for the metrics surface, tagged by
    /// provider and separately by model.
    pub fn export_metrics(&self) -> Vec<Metric> {
        let mut metrics = Vec::new();
        for entry in self.by_provider.iter() {
            let stats = aggregate(&entry);
            metrics.extend(stats.as_metrics("provider", entry.key()));
        }
        for entry in self.by_model.iter() {
            let stats = aggregate(&entry);
            metrics.extend(stats.as_metrics("model", entry.key()));
        }
        metrics
    }

    fn filter_period(&self, records: &[UsageRecord], period: Duration) -> Vec<UsageRecord> {
        let now = self.clock.now();
        let from = now - period;
        records
            .iter()
            .filter(|r| r.timestamp >= from && r.timestamp < now)
            .cloned()
            .collect()
    }

    fn index(&self, record: UsageRecord) {
        self.by_model
            .entry(record.model.clone())
            .or_default()
            .push(record.clone());
        self.by_provider
            .entry(record.provider.clone())
            .or_default()
            .push(record);
    }

    fn log_path(&self, provider: &str, ts: DateTime<Utc>) -> String {
        format!("{}/{}-{}.jsonl", self.dir, provider, ts.format("%Y-%m-%d"))
    }
}

/// Parse a persisted usage file: a JSON array, a single JSON object, or
/// newline-delimited JSON objects. Malformed lines are skipped.
fn parse_usage_text(text: &str) -> Vec<UsageRecord> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str::<Vec<UsageRecord>>(trimmed).unwrap_or_else(|e| {
            debug!(error = %e, "usage: malformed JSON array file");
            Vec::new()
        });
    }

    let mut records = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<UsageRecord>(line) {
            Ok(r) => records.push(r),
            Err(e) => debug!(error = %e, "usage: skipping malformed line"),
        }
    }
    records
}

fn aggregate(records: &[UsageRecord]) -> UsageStats {
    let mut by_model: BTreeMap<String, ModelBreakdown> = BTreeMap::new();
    let mut latency_sum = 0u64;
    let mut latency_count = 0u64;

    for r in records {
        let entry = by_model.entry(r.model.clone()).or_default();
        entry.requests += 1;
        entry.input_tokens += r.input_tokens;
        entry.output_tokens += r.output_tokens;
        entry.total_tokens += r.total_tokens;
        if let Some(ms) = r.latency_ms {
            latency_sum += ms;
            latency_count += 1;
        }
    }

    // Primary model: most requests, ties broken by smallest model id.
    let primary_model = by_model
        .iter()
        .max_by(|(a_name, a), (b_name, b)| {
            a.requests
                .cmp(&b.requests)
                .then_with(|| b_name.cmp(a_name))
        })
        .map(|(name, _)| name.clone());

    UsageStats {
        requests: records.len() as u64,
        input_tokens: records.iter().map(|r| r.input_tokens).sum(),
        output_tokens: records.iter().map(|r| r.output_tokens).sum(),
        total_tokens: records.iter().map(|r| r.total_tokens).sum(),
        avg_latency_ms: (latency_count > 0)
            .then(|| latency_sum as f64 / latency_count as f64),
        by_model,
        primary_model,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minder_core::ManualClock;
    use minder_storage::FsStorage;

    fn tracker(clock: ManualClock) -> (tempfile::TempDir, Arc<UsageTracker>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FsStorage::new(dir.path()));
        let tracker = Arc::new(UsageTracker::new(
            storage,
            Arc::new(clock),
            "usage",
            30,
            true,
        ));
        (dir, tracker)
    }

    fn usage(input: u64, output: u64) -> TokenUsage {
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: None,
            latency_ms: Some(250),
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn record_derives_total_and_stamps_time() {
        let clock = ManualClock::new(Utc::now());
        let (_dir, tracker) = tracker(clock);
        tracker.record("anthropic", "claude-sonnet-4-6", usage(100, 50)).await;

        let stats = tracker.stats("anthropic", Duration::days(1));
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.total_tokens, 150);
        assert_eq!(stats.avg_latency_ms, Some(250.0));
    }

    #[tokio::test]
    async fn stats_ignore_records_outside_period() {
        let now = Utc::now();
        let clock = ManualClock::new(now);
        let (_dir, tracker) = tracker(clock);

        let mut old = usage(10, 10);
        old.timestamp = Some(now - Duration::days(10));
        tracker.record("anthropic", "m", old).await;
        tracker.record("anthropic", "m", usage(1, 1)).await;

        let stats = tracker.stats("anthropic", Duration::days(1));
        assert_eq!(stats.requests, 1);
        let wide = tracker.stats("anthropic", Duration::days(20));
        assert_eq!(wide.requests, 2);
    }

    #[tokio::test]
    async fn avg_latency_ignores_records_without_latency() {
        let clock = ManualClock::new(Utc::now());
        let (_dir, tracker) = tracker(clock);
        let mut no_latency = usage(1, 1);
        no_latency.latency_ms = None;
        tracker.record("p", "m", no_latency).await;
        tracker.record("p", "m", usage(1, 1)).await;

        let stats = tracker.stats("p", Duration::days(1));
        assert_eq!(stats.avg_latency_ms, Some(250.0));
    }

    #[tokio::test]
    async fn primary_model_tie_breaks_lexicographically() {
        let clock = ManualClock::new(Utc::now());
        let (_dir, tracker) = tracker(clock);
        tracker.record("p", "model-b", usage(1, 1)).await;
        tracker.record("p", "model-a", usage(1, 1)).await;

        let stats = tracker.stats("p", Duration::days(1));
        assert_eq!(stats.primary_model.as_deref(), Some("model-a"));
    }

    #[tokio::test]
    async fn retention_reload_and_eviction_tick() {
        // Scenario: 100 records 40 days old + 100 recent; after reload and
        // one eviction pass only the recent 100 remain.
        let now = Utc::now();
        let clock = ManualClock::new(now);
        let (dir, tracker) = tracker(clock.clone());

        for _ in 0..100 {
            let mut old = usage(1, 1);
            old.timestamp = Some(now - Duration::days(40));
            tracker.record("p", "m", old).await;
        }
        for _ in 0..100 {
            tracker.record("p", "m", usage(1, 1)).await;
        }

        // Fresh tracker over the same directory simulates restart.
        let storage = Arc::new(FsStorage::new(dir.path()));
        let reloaded = UsageTracker::new(storage, Arc::new(clock), "usage", 30, true);
        let loaded = reloaded.load().await;
        assert_eq!(loaded, 100);

        reloaded.evict_expired();
        let stats = reloaded.stats_all(Duration::days(30));
        assert_eq!(stats.requests, 100);
    }

    #[tokio::test]
    async fn stats_survive_reload_identically() {
        let now = Utc::now();
        let clock = ManualClock::new(now);
        let (dir, tracker) = tracker(clock.clone());
        tracker.record("p", "m1", usage(100, 20)).await;
        tracker.record("p", "m2", usage(5, 5)).await;
        let before = tracker.stats("p", Duration::days(1));

        let storage = Arc::new(FsStorage::new(dir.path()));
        let reloaded = UsageTracker::new(storage, Arc::new(clock), "usage", 30, true);
        reloaded.load().await;
        let after = reloaded.stats("p", Duration::days(1));

        assert_eq!(before.requests, after.requests);
        assert_eq!(before.total_tokens, after.total_tokens);
        assert_eq!(before.by_model, after.by_model);
    }

    #[test]
    fn parser_accepts_array_object_and_ndjson() {
        let rec = r#"{"provider":"p","model":"m","input_tokens":1,"output_tokens":2,"total_tokens":3,"timestamp":"2026-07-01T00:00:00Z"}"#;
        assert_eq!(parse_usage_text(&format!("[{rec},{rec}]")).len(), 2);
        assert_eq!(parse_usage_text(rec).len(), 1);
        assert_eq!(parse_usage_text(&format!("{rec}\nnot json\n{rec}\n")).len(), 2);
    }

    #[tokio::test]
    async fn disabled_tracker_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FsStorage::new(dir.path()));
        let tracker = UsageTracker::new(
            storage.clone(),
            Arc::new(ManualClock::new(Utc::now())),
            "usage",
            30,
            false,
        );
        tracker.record("p", "m", usage(1, 1)).await;
        assert_eq!(tracker.stats_all(Duration::days(1)).requests, 0);
        assert!(storage.list("usage").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn export_metrics_tags_by_provider_and_model() {
        let clock = ManualClock::new(Utc::now());
        let (_dir, tracker) = tracker(clock);
        tracker.record("anthropic", "m1", usage(10, 5)).await;

        let metrics = tracker.export_metrics();
        let names: Vec<&str> = metrics.iter().map(|m| m.name.as_str()).collect();
        assert!(names.contains(&"requests.total"));
        assert!(names.contains(&"tokens.total"));
        assert!(names.contains(&"latency.avg_ms"));
        assert!(metrics
            .iter()
            .any(|m| m.tags.get("provider").map(String::as_str) == Some("anthropic")));
        assert!(metrics
            .iter()
            .any(|m| m.tags.get("model").map(String::as_str) == Some("m1")));
    }
}
