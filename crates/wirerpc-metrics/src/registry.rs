// Copyright 2025 WireRPC Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use wirerpc_common::{CallError, CallOutcome, ServiceId, StatusCode};

use crate::snapshot::{MetricsSnapshot, ProviderMetrics, ServiceMetrics};

const NUM_HISTOGRAM_BINS: usize = 100;

/// Limits on how many distinct keys a registry tracks.
///
/// Calls for keys beyond the limit still count towards the totals.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Maximum number of service ids tracked individually
    pub max_services: usize,
    /// Maximum number of provider addresses tracked individually
    pub max_providers: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_services: 1000,
            max_providers: 256,
        }
    }
}

/// Logarithmic latency histogram.
///
/// Each decade of microseconds is split into bins by its leading digit, so
/// bin `d * 10 + k` holds samples in `[k * 10^d, (k + 1) * 10^d)`. Zero
/// lands in bin 0. Anything past the last decade lands in the last bin.
#[derive(Debug)]
struct LatencyHistogram {
    bins: [AtomicU64; NUM_HISTOGRAM_BINS],
    total_latency: AtomicU64,
    sample_count: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_latency: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
        }
    }

    fn record(&self, latency_us: u64) {
        self.bins[Self::latency_to_bin(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.total_latency.fetch_add(latency_us, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
    }

    fn latency_to_bin(latency_us: u64) -> usize {
        if latency_us == 0 {
            return 0;
        }
        let decade = latency_us.ilog10() as usize;
        let leading = (latency_us / 10u64.pow(decade as u32)) as usize;
        (decade * 10 + leading).min(NUM_HISTOGRAM_BINS - 1)
    }

    /// Lower bound of a bin in microseconds.
    fn bin_lower(bin: usize) -> u64 {
        let decade = (bin / 10) as u32;
        let leading = (bin % 10) as u64;
        leading.saturating_mul(10u64.saturating_pow(decade))
    }

    fn bin_upper(bin: usize) -> u64 {
        let decade = (bin / 10) as u32;
        let leading = (bin % 10) as u64 + 1;
        leading.saturating_mul(10u64.saturating_pow(decade))
    }

    /// Estimates the latency at `percentile` (0-100), interpolating linearly
    /// inside the bin that holds the target rank.
    fn estimate_percentile(&self, percentile: u64) -> u64 {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        let target = ((total * percentile).div_ceil(100)).max(1);
        let mut cumulative = 0;

        for (idx, bin) in self.bins.iter().enumerate() {
            let count = bin.load(Ordering::Relaxed);
            if count > 0 && cumulative + count >= target {
                let lower = Self::bin_lower(idx);
                let upper = Self::bin_upper(idx);
                let fraction = (target - cumulative) as f64 / count as f64;
                return lower + (fraction * (upper - lower) as f64) as u64;
            }
            cumulative += count;
        }

        Self::bin_upper(NUM_HISTOGRAM_BINS - 1)
    }

    /// Returns `(avg, p50, p95, p99)` in microseconds.
    fn calculate_percentiles(&self) -> (u64, u64, u64, u64) {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return (0, 0, 0, 0);
        }
        let avg = self.total_latency.load(Ordering::Relaxed) / total;
        (
            avg,
            self.estimate_percentile(50),
            self.estimate_percentile(95),
            self.estimate_percentile(99),
        )
    }
}

#[derive(Debug)]
struct ServiceStats {
    call_count: AtomicU64,
    ok_count: AtomicU64,
    error_count: AtomicU64,
    latency: LatencyHistogram,
}

impl ServiceStats {
    fn new() -> Self {
        Self {
            call_count: AtomicU64::new(0),
            ok_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            latency: LatencyHistogram::new(),
        }
    }

    fn record(&self, ok: bool, latency_us: u64) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.ok_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
        self.latency.record(latency_us);
    }

    fn snapshot(&self) -> ServiceMetrics {
        let (avg, p50, p95, p99) = self.latency.calculate_percentiles();
        ServiceMetrics {
            call_count: self.call_count.load(Ordering::Relaxed),
            ok_count: self.ok_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            avg_latency_us: avg,
            p50_latency_us: p50,
            p95_latency_us: p95,
            p99_latency_us: p99,
        }
    }
}

/// Registry of call statistics.
///
/// Shared between tasks behind an `Arc`. Recording never blocks on other
/// recorders once the service id has been seen; [`snapshot`](Self::snapshot)
/// reads the counters without stopping them, so a snapshot taken under load
/// is approximate.
#[derive(Debug)]
pub struct CallMetrics {
    config: MetricsConfig,
    started_at: Instant,
    total_calls: AtomicU64,
    ok_calls: AtomicU64,
    timeouts: AtomicU64,
    connection_closed: AtomicU64,
    denied: AtomicU64,
    untracked_calls: AtomicU64,
    active_connections: AtomicU64,
    statuses: [AtomicU64; StatusCode::ALL.len()],
    services: RwLock<HashMap<ServiceId, Arc<ServiceStats>>>,
    providers: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl CallMetrics {
    pub fn new() -> Self {
        Self::with_config(MetricsConfig::default())
    }

    pub fn with_config(config: MetricsConfig) -> Self {
        Self {
            config,
            started_at: Instant::now(),
            total_calls: AtomicU64::new(0),
            ok_calls: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            connection_closed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            untracked_calls: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            statuses: std::array::from_fn(|_| AtomicU64::new(0)),
            services: RwLock::new(HashMap::new()),
            providers: RwLock::new(HashMap::new()),
        }
    }

    /// Records one finished call under its final status.
    pub fn record(&self, service_id: ServiceId, status: StatusCode, latency: Duration) {
        let latency_us = latency.as_micros().min(u64::MAX as u128) as u64;

        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if status.is_ok() {
            self.ok_calls.fetch_add(1, Ordering::Relaxed);
        }
        self.statuses[Self::status_index(status)].fetch_add(1, Ordering::Relaxed);

        match self.service_stats(service_id) {
            Some(stats) => stats.record(status.is_ok(), latency_us),
            None => {
                self.untracked_calls.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Records a client-side call outcome, classifying local failures.
    pub fn record_outcome(&self, service_id: ServiceId, outcome: &CallOutcome, latency: Duration) {
        let status = match outcome {
            Ok(response) => response.status,
            Err(err) => {
                let counter = match err {
                    CallError::Timeout => Some(&self.timeouts),
                    CallError::ConnectionClosed => Some(&self.connection_closed),
                    CallError::Denied(_) => Some(&self.denied),
                    CallError::NoProvider | CallError::Encode(_) | CallError::Decode(_) => None,
                };
                if let Some(counter) = counter {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                err.status()
            }
        };
        self.record(service_id, status, latency);
    }

    /// Records that a request was routed to `addr`.
    pub fn record_provider_request(&self, addr: &str) {
        if let Some(counter) = self.providers.read().get(addr) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut providers = self.providers.write();
        if !providers.contains_key(addr) && providers.len() >= self.config.max_providers {
            return;
        }
        providers
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturate at zero rather than wrap if close is reported twice.
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total_calls = self.total_calls.load(Ordering::Relaxed);
        let ok_calls = self.ok_calls.load(Ordering::Relaxed);

        let statuses = StatusCode::ALL
            .iter()
            .map(|status| {
                let count = self.statuses[Self::status_index(*status)].load(Ordering::Relaxed);
                (status.as_str().to_string(), count)
            })
            .filter(|(_, count)| *count > 0)
            .collect();

        let services = self
            .services
            .read()
            .iter()
            .map(|(id, stats)| (*id, stats.snapshot()))
            .collect();

        let providers = self
            .providers
            .read()
            .iter()
            .map(|(addr, count)| {
                (
                    addr.clone(),
                    ProviderMetrics {
                        addr: addr.clone(),
                        request_count: count.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            total_calls,
            ok_calls,
            failed_calls: total_calls.saturating_sub(ok_calls),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            connection_closed: self.connection_closed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            untracked_calls: self.untracked_calls.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            uptime_ms: self.uptime_ms(),
            statuses,
            services,
            providers,
        }
    }

    fn status_index(status: StatusCode) -> usize {
        (status.as_i8() - 1) as usize
    }

    fn service_stats(&self, service_id: ServiceId) -> Option<Arc<ServiceStats>> {
        if let Some(stats) = self.services.read().get(&service_id) {
            return Some(stats.clone());
        }

        let mut services = self.services.write();
        if let Some(stats) = services.get(&service_id) {
            return Some(stats.clone());
        }
        if services.len() >= self.config.max_services {
            return None;
        }
        let stats = Arc::new(ServiceStats::new());
        services.insert(service_id, stats.clone());
        Some(stats)
    }
}

impl Default for CallMetrics {
    fn default() -> Self {
        Self::new()
    }
}
