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

//! # WireRPC CLI
//!
//! Building blocks of the `wirerpc` binary:
//!
//! - [`builtin_registry`]: the services a `wirerpc serve` process exposes
//! - [`parse_providers`]: `ADDR[:WEIGHT]` arguments into providers
//! - [`run_bench`]: fixed-size load generation against an [`App`]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::future::join_all;
use wirerpc_client::{App, CallOptions, Provider};
use wirerpc_common::ServiceId;
use wirerpc_metrics::{CallMetrics, MetricsSnapshot};
use wirerpc_server::{HandlerError, ServiceRegistry};

/// Returns its parameters unchanged.
pub const ECHO_SERVICE: ServiceId = 1;

/// Returns the server's metrics snapshot as JSON.
pub const METRICS_SERVICE: ServiceId = 2;

pub fn builtin_registry(metrics: Arc<CallMetrics>) -> ServiceRegistry {
    let mut registry = ServiceRegistry::new();
    registry
        .register_fn(ECHO_SERVICE, |_, params| async move { Ok(params) })
        .register_fn(METRICS_SERVICE, move |_, _| {
            let snapshot = metrics.snapshot();
            async move {
                snapshot
                    .to_json()
                    .map(Bytes::from)
                    .map_err(|e| HandlerError::internal(e.to_string()))
            }
        });
    registry
}

/// Parses `ADDR[:WEIGHT]` arguments.
pub fn parse_providers(specs: &[String]) -> Result<Vec<Provider>> {
    specs
        .iter()
        .map(|arg| {
            arg.parse::<Provider>()
                .with_context(|| format!("invalid provider '{}'", arg))
        })
        .collect()
}

/// Fires `calls` calls from `concurrency` workers and returns the client's
/// metrics once every call has resolved.
pub async fn run_bench(
    app: Arc<App>,
    service_id: ServiceId,
    payload: Bytes,
    calls: usize,
    concurrency: usize,
) -> MetricsSnapshot {
    let issued = Arc::new(AtomicUsize::new(0));

    let workers = (0..concurrency.max(1)).map(|_| {
        let app = app.clone();
        let issued = issued.clone();
        let payload = payload.clone();
        async move {
            while issued.fetch_add(1, Ordering::Relaxed) < calls {
                let _ = app.call(service_id, payload.clone(), CallOptions::new()).await;
            }
        }
    });
    join_all(workers).await;

    app.metrics().snapshot()
}
