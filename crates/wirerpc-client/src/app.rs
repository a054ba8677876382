//! The client entry point.
//!
//! An [`App`] keeps a pool of multiplexed connections to the providers of
//! one remote application, publishes the usable ones to a load balancer, and
//! routes each call to the connection the balancer picks.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wirerpc_common::{
    CallContext, CallError, CallOutcome, ClientConfig, FilterDecision, Request, Result, ServiceId,
    Tracer, WireRpcError,
};
use wirerpc_metrics::CallMetrics;

use crate::balance::{Balancer, LoadBalancer};
use crate::connection::{Connection, ConnectionEvent, ConnectionId, ConnectionOptions};
use crate::discover::{Discover, DiscoverKey};
use crate::filter::{ClientFilter, FilterChain};
use crate::health::{ErrorThresholdPolicy, HealthPolicyFactory};
use crate::pending::ResponseFuture;
use crate::provider::Provider;
use crate::shared::TransportLease;

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Replaces the configured global timeout
    pub timeout: Option<Duration>,
    pub tracer: Option<Tracer>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = Some(tracer);
        self
    }
}

/// Builder for an [`App`] with non-default collaborators.
pub struct AppBuilder {
    config: ClientConfig,
    filters: FilterChain,
    health: HealthPolicyFactory,
    metrics: Option<Arc<CallMetrics>>,
}

impl AppBuilder {
    pub fn filter(mut self, filter: impl ClientFilter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn health_policy(mut self, factory: HealthPolicyFactory) -> Self {
        self.health = factory;
        self
    }

    pub fn metrics(mut self, metrics: Arc<CallMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validates the configuration, opens connections to `providers` and
    /// starts the maintenance task.
    ///
    /// Providers that cannot be reached right now do not fail the call;
    /// they are retried in the background.
    pub async fn connect(self, lease: TransportLease, providers: Vec<Provider>) -> Result<Arc<App>> {
        self.config.validate()?;

        let token = lease.token().child_token();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let app = Arc::new(App {
            balancer: Balancer::from_kind(self.config.load_balance),
            config: self.config,
            state: Mutex::new(AppState::default()),
            filters: self.filters,
            health: self.health,
            metrics: self.metrics.unwrap_or_default(),
            events: events_tx,
            updates: updates_tx,
            token: token.clone(),
            closed: AtomicBool::new(false),
            lease: SyncMutex::new(Some(lease)),
            next_conn_id: AtomicU64::new(1),
            maintenance: SyncMutex::new(None),
        });

        let handle = tokio::spawn(maintain(Arc::downgrade(&app), events_rx, updates_rx, token));
        *app.maintenance.lock() = Some(handle);

        app.set_providers(providers).await?;
        info!(
            group = %app.config.group,
            app = %app.config.app,
            connections = app.balancer.snapshot().len(),
            "client connected"
        );
        Ok(app)
    }
}

#[derive(Default)]
struct AppState {
    providers: HashMap<String, Provider>,
    connections: HashMap<ConnectionId, Arc<Connection>>,
}

/// Client connection to one remote application.
pub struct App {
    config: ClientConfig,
    balancer: Balancer<Arc<Connection>>,
    state: Mutex<AppState>,
    filters: FilterChain,
    health: HealthPolicyFactory,
    metrics: Arc<CallMetrics>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    updates: mpsc::UnboundedSender<Vec<Provider>>,
    token: CancellationToken,
    closed: AtomicBool,
    lease: SyncMutex<Option<TransportLease>>,
    next_conn_id: AtomicU64,
    maintenance: SyncMutex<Option<JoinHandle<()>>>,
}

impl App {
    pub fn builder(config: ClientConfig) -> AppBuilder {
        AppBuilder {
            config,
            filters: FilterChain::new(),
            health: ErrorThresholdPolicy::factory(),
            metrics: None,
        }
    }

    /// Connects with the default collaborators. See [`AppBuilder::connect`].
    pub async fn connect(
        config: ClientConfig,
        lease: TransportLease,
        providers: Vec<Provider>,
    ) -> Result<Arc<App>> {
        Self::builder(config).connect(lease, providers).await
    }

    /// Replaces the provider set.
    ///
    /// New providers get `connections_per_provider` connections, removed
    /// providers have their connections closed and drained, and changed
    /// weights apply to existing connections. The balancer snapshot is
    /// republished once at the end.
    pub async fn set_providers(self: &Arc<Self>, providers: Vec<Provider>) -> Result<()> {
        if self.is_closed() {
            return Err(WireRpcError::Closed);
        }

        let mut incoming = HashMap::new();
        for provider in providers {
            if provider.weight > 0 {
                incoming.insert(provider.addr.clone(), provider);
            } else {
                debug!(addr = %provider.addr, weight = provider.weight, "ignoring provider without weight");
            }
        }

        let mut retired = Vec::new();
        let mut failed = Vec::new();
        {
            let mut state = self.state.lock().await;

            state.providers.retain(|addr, _| incoming.contains_key(addr));
            let removed: Vec<ConnectionId> = state
                .connections
                .iter()
                .filter(|(_, conn)| !incoming.contains_key(conn.addr()))
                .map(|(id, _)| *id)
                .collect();
            for id in removed {
                if let Some(conn) = state.connections.remove(&id) {
                    retired.push(conn);
                }
            }

            for (addr, provider) in incoming {
                match state.providers.insert(addr.clone(), provider.clone()) {
                    Some(previous) if previous.weight != provider.weight => {
                        debug!(addr = %addr, from = previous.weight, to = provider.weight, "provider weight changed");
                        for conn in state.connections.values().filter(|c| c.addr() == addr) {
                            conn.set_weight(provider.weight);
                        }
                    }
                    Some(_) => {}
                    None => {
                        for _ in 0..self.config.connections_per_provider {
                            match self.open_connection(&provider).await {
                                Ok(conn) => {
                                    state.connections.insert(conn.id(), conn);
                                }
                                Err(e) => {
                                    warn!(addr = %addr, "failed to connect to provider: {}", e);
                                    failed.push(addr.clone());
                                }
                            }
                        }
                    }
                }
            }

            self.publish(&state);
        }

        for conn in retired {
            debug!(conn_id = conn.id(), addr = %conn.addr(), "closing connection to removed provider");
            conn.close().await;
        }
        for addr in failed {
            self.schedule_reconnect(addr);
        }
        Ok(())
    }

    /// Subscribes to `discover` for this client's group and app; every
    /// list it delivers is applied with [`set_providers`](Self::set_providers).
    pub fn attach_discover(&self, discover: &dyn Discover, protocol: &str) -> Result<()> {
        let key = DiscoverKey::new(&self.config.group, &self.config.app, protocol);
        let updates = self.updates.clone();
        discover.add_listener(
            key,
            Box::new(move |providers| {
                // Dropped once the client has shut down.
                let _ = updates.send(providers);
            }),
        )
    }

    /// Sends a call and returns the future of its outcome.
    ///
    /// Returns as soon as the request has been handed to a connection. Calls
    /// that cannot be dispatched (no provider, filter denial, client closed)
    /// come back already resolved.
    pub async fn submit(
        &self,
        service_id: ServiceId,
        params: impl Into<Bytes>,
        options: CallOptions,
    ) -> ResponseFuture {
        if self.is_closed() {
            return self.resolve_locally(service_id, Err(CallError::ConnectionClosed));
        }

        let timeout = options.timeout.unwrap_or_else(|| self.config.timeout());
        let expire_at = Instant::now() + timeout;

        let Some(conn) = self.balancer.select() else {
            return self.resolve_locally(service_id, Err(CallError::NoProvider));
        };

        let mut request = Request::new(service_id, params);
        if let Some(tracer) = options.tracer {
            request = request.with_tracer(tracer);
        }

        if !self.filters.is_empty() {
            let ctx = CallContext::new(service_id)
                .with_addrs(conn.local_addr(), conn.remote_addr())
                .with_deadline(expire_at.into_std())
                .with_tracer(request.tracer);
            if let FilterDecision::Deny(reason) = self.filters.apply(&ctx, &request) {
                debug!(service_id, reason = %reason, "call denied by client filter");
                return self.resolve_locally(service_id, Err(CallError::Denied(reason)));
            }
        }

        self.metrics.record_provider_request(conn.addr());
        conn.submit(request, expire_at).await
    }

    /// Sends a call and waits for its outcome.
    pub async fn call(
        &self,
        service_id: ServiceId,
        params: impl Into<Bytes>,
        options: CallOptions,
    ) -> CallOutcome {
        self.submit(service_id, params, options).await.await
    }

    /// Closes every connection, waits for their pending calls to resolve,
    /// and releases the transport lease.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();

        let connections: Vec<Arc<Connection>> = {
            let mut state = self.state.lock().await;
            state.providers.clear();
            state.connections.drain().map(|(_, conn)| conn).collect()
        };
        self.balancer.set_providers(Vec::new());
        for conn in connections {
            conn.close().await;
        }

        let maintenance = self.maintenance.lock().take();
        if let Some(handle) = maintenance {
            let _ = handle.await;
        }
        drop(self.lease.lock().take());
        info!(group = %self.config.group, app = %self.config.app, "client closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.token.is_cancelled()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<CallMetrics> {
        &self.metrics
    }

    /// Connections in the current balancer snapshot.
    pub fn available_connections(&self) -> Vec<Arc<Connection>> {
        self.balancer.snapshot().items().to_vec()
    }

    pub async fn providers(&self) -> Vec<Provider> {
        let state = self.state.lock().await;
        let mut providers: Vec<Provider> = state.providers.values().cloned().collect();
        providers.sort_by(|a, b| a.addr.cmp(&b.addr));
        providers
    }

    fn resolve_locally(&self, service_id: ServiceId, outcome: CallOutcome) -> ResponseFuture {
        self.metrics.record_outcome(service_id, &outcome, Duration::ZERO);
        ResponseFuture::ready(outcome)
    }

    async fn open_connection(&self, provider: &Provider) -> Result<Arc<Connection>> {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let options = ConnectionOptions::new(&self.config)
            .with_health((self.health)(&self.config))
            .with_metrics(self.metrics.clone())
            .with_events(self.events.clone())
            .with_shutdown(self.token.clone());
        Connection::open(id, provider.clone(), &self.config, options).await
    }

    fn publish(&self, state: &AppState) {
        let mut available: Vec<Arc<Connection>> = state
            .connections
            .values()
            .filter(|conn| conn.is_available())
            .cloned()
            .collect();
        available.sort_by_key(|conn| conn.id());

        debug!(
            available = available.len(),
            total = state.connections.len(),
            "publishing balancer snapshot"
        );
        self.balancer.set_providers(available);
    }

    async fn on_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Closed { id, addr } => {
                let reconnect = {
                    let mut state = self.state.lock().await;
                    let removed = state.connections.remove(&id).is_some();
                    self.publish(&state);
                    removed && state.providers.contains_key(&addr)
                };
                if reconnect && !self.is_closed() {
                    self.schedule_reconnect(addr);
                }
            }
            ConnectionEvent::Unhealthy { id } => {
                let (retired, reconnect) = {
                    let mut state = self.state.lock().await;
                    let retired = state.connections.remove(&id);
                    self.publish(&state);
                    let reconnect = retired
                        .as_ref()
                        .is_some_and(|conn| state.providers.contains_key(conn.addr()));
                    (retired, reconnect)
                };
                // An unhealthy connection gets no calls and so can never
                // prove itself healthy again; replace it with a fresh one.
                if let Some(conn) = retired {
                    let addr = conn.addr().to_string();
                    warn!(conn_id = id, addr = %addr, "replacing unhealthy connection");
                    tokio::spawn(async move { conn.close().await });
                    if reconnect && !self.is_closed() {
                        self.schedule_reconnect(addr);
                    }
                }
            }
            ConnectionEvent::Healthy { .. } => {
                let state = self.state.lock().await;
                self.publish(&state);
            }
        }
    }

    /// Keeps dialing `addr` every `reconnect_delay` until it is back to
    /// `connections_per_provider` connections or is no longer a provider.
    fn schedule_reconnect(self: &Arc<Self>, addr: String) {
        let app = Arc::downgrade(self);
        let token = self.token.clone();
        let delay = self.config.reconnect_delay();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                let Some(app) = app.upgrade() else {
                    return;
                };
                match app.reconnect(&addr).await {
                    Ok(()) => return,
                    Err(e) => warn!(addr = %addr, "reconnect failed: {}", e),
                }
            }
        });
    }

    async fn reconnect(&self, addr: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if self.is_closed() {
            return Ok(());
        }
        let Some(provider) = state.providers.get(addr).cloned() else {
            return Ok(());
        };

        let open = state.connections.values().filter(|c| c.addr() == addr).count();
        if open >= self.config.connections_per_provider {
            return Ok(());
        }

        let conn = self.open_connection(&provider).await?;
        info!(conn_id = conn.id(), addr = %addr, "reconnected to provider");
        state.connections.insert(conn.id(), conn);
        self.publish(&state);
        Ok(())
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("group", &self.config.group)
            .field("app", &self.config.app)
            .field("load_balance", &self.balancer.kind())
            .field("available", &self.balancer.snapshot().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn maintain(
    app: Weak<App>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    mut updates: mpsc::UnboundedReceiver<Vec<Provider>>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            Some(event) = events.recv() => {
                let Some(app) = app.upgrade() else { break };
                app.on_event(event).await;
            }
            Some(providers) = updates.recv() => {
                let Some(app) = app.upgrade() else { break };
                if let Err(e) = app.set_providers(providers).await {
                    debug!("dropping provider update: {}", e);
                }
            }
            else => break,
        }
    }
    debug!("client maintenance stopped");
}
