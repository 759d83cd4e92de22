//! Statistics Types
//!
//! ## Sample
//!
//! One [`Sample`] is produced for every proxied pack request. It carries the pack
//! figures (items, volume, utilization, box types) and the API figures (status code,
//! latency, cache hit, error flags) for that single call.
//!
//! ## KeyStats
//!
//! [`KeyStats`] is the running summary for one keystem. Samples are folded in with
//! [`KeyStats::apply`]. Means are maintained incrementally, so a summary never needs
//! the samples it was built from:
//!
//! ```text
//! avg' = (avg * n + x) / (n + 1)        n = total_requests before the sample
//! ```
//!
//! Latency is special: cache hits never reached the upstream API, so they are left
//! out of both the latency mean and the latency maximum. The latency mean therefore
//! uses `n - cache_hits` as its sample count.
//!
//! ## CrossKeyStats
//!
//! [`CrossKeyStats`] is rebuilt on every read by folding each stored [`KeyStats`]
//! through [`CrossKeyStats::fold`]. Means combine as weighted averages, which is only
//! correct because every `KeyStats` carries its own `total_requests`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Statistics for a single proxied request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Sample {
    pub used_keystem: String,
    pub total_items: u64,
    pub total_volume: f64,
    pub volume_utilization: f64,
    pub box_types: BTreeMap<String, u64>,

    pub time_stamp: String,
    pub cache_hit: bool,
    pub request_error: bool,
    pub error_response: bool,
    pub status_code: String,
    pub latency: f64,
}

impl Sample {
    pub fn new(keystem: impl Into<String>) -> Self {
        Self {
            used_keystem: keystem.into(),
            ..Default::default()
        }
    }
}

/// Request to reset all statistics held for a keystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    pub used_keystem: String,
}

impl DeleteRequest {
    pub fn new(keystem: impl Into<String>) -> Self {
        Self {
            used_keystem: keystem.into(),
        }
    }
}

/// Highest observed non-cache-hit latency and when it was observed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaxLatency {
    pub latency: f64,
    pub time_stamp: String,
}

/// Running statistical summary for one keystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStats {
    pub used_keystem: String,
    pub total_items: u64,
    pub total_volume: f64,
    pub avg_items_per_pack: f64,
    pub avg_volume_utilization: f64,
    pub box_types: BTreeMap<String, u64>,

    pub total_requests: u64,
    pub status_codes: BTreeMap<String, u64>,
    pub request_error_count: u64,
    #[serde(rename = "errorCount", alias = "errorResponseCount")]
    pub error_response_count: u64,
    pub cache_hits: u64,
    #[serde(rename = "maxLatency")]
    pub highest_latency: MaxLatency,

    pub avg_latency: f64,
}

impl KeyStats {
    /// Create an empty summary for `keystem`.
    pub fn new(keystem: impl Into<String>) -> Self {
        Self {
            used_keystem: keystem.into(),
            ..Default::default()
        }
    }

    pub fn keystem(&self) -> &str {
        &self.used_keystem
    }

    /// Zero every statistic. The keystem is kept.
    pub fn reset(&mut self) {
        let keystem = std::mem::take(&mut self.used_keystem);
        *self = Self::new(keystem);
    }

    /// True when no sample has been applied since creation or the last reset.
    pub fn is_empty(&self) -> bool {
        *self == Self::new(self.used_keystem.clone())
    }

    /// Requests that reached the upstream API (everything except cache hits).
    pub fn uncached_requests(&self) -> u64 {
        self.total_requests.saturating_sub(self.cache_hits)
    }

    /// Fold one sample into the summary.
    ///
    /// `total_requests` grows by exactly one per call whatever the sample contains.
    /// A cache-hit sample leaves `avg_latency` and `highest_latency` untouched.
    pub fn apply(&mut self, sample: &Sample) {
        let n = self.total_requests as f64;

        self.total_items = self.total_items.saturating_add(sample.total_items);
        self.total_volume += sample.total_volume;
        self.avg_items_per_pack =
            (self.avg_items_per_pack * n + sample.total_items as f64) / (n + 1.0);
        self.avg_volume_utilization =
            (self.avg_volume_utilization * n + sample.volume_utilization) / (n + 1.0);
        add_counts(&mut self.box_types, &sample.box_types);

        if !sample.status_code.is_empty() {
            let count = self
                .status_codes
                .entry(sample.status_code.clone())
                .or_insert(0);
            *count = count.saturating_add(1);
        }
        self.request_error_count = self
            .request_error_count
            .saturating_add(u64::from(sample.request_error));
        self.error_response_count = self
            .error_response_count
            .saturating_add(u64::from(sample.error_response));

        if !sample.cache_hit {
            if sample.latency > self.highest_latency.latency {
                self.highest_latency = MaxLatency {
                    latency: sample.latency,
                    time_stamp: sample.time_stamp.clone(),
                };
            }
            let m = self.uncached_requests() as f64;
            self.avg_latency = (self.avg_latency * m + sample.latency) / (m + 1.0);
        }

        self.cache_hits = self.cache_hits.saturating_add(u64::from(sample.cache_hit));
        self.total_requests = self.total_requests.saturating_add(1);
    }
}

/// Highest single-sample latency across keystems and the keystem that saw it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeystemMaxLatency {
    pub latency: f64,
    pub used_keystem: String,
    pub time_stamp: String,
}

/// Highest per-keystem mean latency and the keystem that holds it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeystemAvgLatency {
    pub latency: f64,
    pub used_keystem: String,
}

/// Rollup of every keystem's [`KeyStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossKeyStats {
    pub total_items: u64,
    pub total_volume: f64,
    pub avg_items_per_pack: f64,
    pub avg_volume_utilization: f64,
    pub box_types: BTreeMap<String, u64>,

    pub total_requests: u64,
    pub status_codes: BTreeMap<String, u64>,
    pub request_error_count: u64,
    #[serde(rename = "errorCount", alias = "errorResponseCount")]
    pub error_response_count: u64,
    pub cache_hits: u64,
    pub max_latency: KeystemMaxLatency,

    pub avg_latency: f64,
    pub highest_avg_latency: KeystemAvgLatency,
}

impl CrossKeyStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the rollup by folding every summary in turn.
    pub fn from_key_stats<'a, I>(stats: I) -> Self
    where
        I: IntoIterator<Item = &'a KeyStats>,
    {
        let mut rollup = Self::new();
        for key_stats in stats {
            rollup.fold(key_stats);
        }
        rollup
    }

    /// Fold one keystem's summary into the rollup.
    ///
    /// Weighted means are skipped when both sides are empty so an empty rollup
    /// stays at zero instead of turning into NaN.
    pub fn fold(&mut self, key_stats: &KeyStats) {
        let m = self.total_requests as f64;
        let p = key_stats.total_requests as f64;

        self.total_items = self.total_items.saturating_add(key_stats.total_items);
        self.total_volume += key_stats.total_volume;
        if m + p > 0.0 {
            self.avg_items_per_pack =
                (self.avg_items_per_pack * m + key_stats.avg_items_per_pack * p) / (m + p);
            self.avg_volume_utilization = (self.avg_volume_utilization * m
                + key_stats.avg_volume_utilization * p)
                / (m + p);
        }
        add_counts(&mut self.box_types, &key_stats.box_types);

        add_counts(&mut self.status_codes, &key_stats.status_codes);
        self.request_error_count = self
            .request_error_count
            .saturating_add(key_stats.request_error_count);
        self.error_response_count = self
            .error_response_count
            .saturating_add(key_stats.error_response_count);

        if key_stats.highest_latency.latency > self.max_latency.latency {
            self.max_latency = KeystemMaxLatency {
                latency: key_stats.highest_latency.latency,
                used_keystem: key_stats.used_keystem.clone(),
                time_stamp: key_stats.highest_latency.time_stamp.clone(),
            };
        }
        if key_stats.avg_latency > self.highest_avg_latency.latency {
            self.highest_avg_latency = KeystemAvgLatency {
                latency: key_stats.avg_latency,
                used_keystem: key_stats.used_keystem.clone(),
            };
        }

        let mx = self.total_requests.saturating_sub(self.cache_hits) as f64;
        let px = key_stats.uncached_requests() as f64;
        if mx + px > 0.0 {
            self.avg_latency =
                (self.avg_latency * mx + key_stats.avg_latency * px) / (mx + px);
        }

        self.cache_hits = self.cache_hits.saturating_add(key_stats.cache_hits);
        self.total_requests = self.total_requests.saturating_add(key_stats.total_requests);
    }
}

fn add_counts(dest: &mut BTreeMap<String, u64>, source: &BTreeMap<String, u64>) {
    for (key, count) in source {
        let total = dest.entry(key.clone()).or_insert(0);
        *total = total.saturating_add(*count);
    }
}
