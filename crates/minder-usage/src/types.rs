use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token counts reported by a provider for one call. `total_tokens` and
/// `timestamp` may be absent; the tracker fills them in on record.
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: Option<u64>,
    pub latency_ms: Option<u64>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// One persisted usage record — one JSON line per LLM call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// Per-model slice of an aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelBreakdown {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// Aggregate over a set of records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageStats {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// Mean latency over records that reported one.
    pub avg_latency_ms: Option<f64>,
    pub by_model: BTreeMap<String, ModelBreakdown>,
    /// The model with the most requests in the window.
    pub primary_model: Option<String>,
}

/// A metric tuple for the export surface: `(name, value, tags)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub tags: BTreeMap<String, String>,
}

impl UsageStats {
    /// Expand this aggregate into the standard metric tuples, tagged with
    /// `tag_key=tag_value`.
    pub fn as_metrics(&self, tag_key: &str, tag_value: &str) -> Vec<Metric> {
        let tags: BTreeMap<String, String> =
            [(tag_key.to_string(), tag_value.to_string())].into();
        let mut metrics = vec![
            Metric {
                name: "requests.total".to_string(),
                value: self.requests as f64,
                tags: tags.clone(),
            },
            Metric {
                name: "tokens.input".to_string(),
                value: self.input_tokens as f64,
                tags: tags.clone(),
            },
            Metric {
                name: "tokens.output".to_string(),
                value: self.output_tokens as f64,
                tags: tags.clone(),
            },
            Metric {
                name: "tokens.total".to_string(),
                value: self.total_tokens as f64,
                tags: tags.clone(),
            },
        ];
        if let Some(avg) = self.avg_latency_ms {
            metrics.push(Metric {
                name: "latency.avg_ms".to_string(),
                value: avg,
                tags,
            });
        }
        metrics
    }
}
