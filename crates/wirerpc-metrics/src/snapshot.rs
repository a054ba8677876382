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

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Statistics for a single service id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMetrics {
    pub call_count: u64,
    pub ok_count: u64,
    pub error_count: u64,
    pub avg_latency_us: u64,
    pub p50_latency_us: u64,
    pub p95_latency_us: u64,
    pub p99_latency_us: u64,
}

/// Request distribution for one provider address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMetrics {
    pub addr: String,
    pub request_count: u64,
}

/// Point-in-time view of a [`CallMetrics`](crate::CallMetrics) registry.
///
/// `statuses` is keyed by the status name (`"ok"`, `"timeout"`, ...) so the
/// JSON form is readable without the status table at hand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_calls: u64,
    pub ok_calls: u64,
    pub failed_calls: u64,
    pub timeouts: u64,
    pub connection_closed: u64,
    pub denied: u64,
    /// Calls counted in the totals whose service id was not tracked
    /// individually because the service limit was reached.
    pub untracked_calls: u64,
    pub active_connections: u64,
    pub uptime_ms: u64,
    pub statuses: BTreeMap<String, u64>,
    pub services: BTreeMap<i32, ServiceMetrics>,
    pub providers: BTreeMap<String, ProviderMetrics>,
}

impl MetricsSnapshot {
    /// Renders the snapshot as pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Fraction of calls that completed with OK, or `None` before any call.
    pub fn success_rate(&self) -> Option<f64> {
        if self.total_calls == 0 {
            None
        } else {
            Some(self.ok_calls as f64 / self.total_calls as f64)
        }
    }
}
