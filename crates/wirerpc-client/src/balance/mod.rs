//! Weighted provider selection.
//!
//! A balancer holds the current [`WeightableGroup`] behind an [`ArcSwap`].
//! `set_providers` builds a complete new group and swaps it in; `select`
//! loads whatever snapshot is current and never takes a lock.

mod group;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rand::Rng;
use wirerpc_common::LoadBalanceKind;

pub use group::{Weighted, WeightableGroup};

/// Selection strategy over a replaceable weighted snapshot.
pub trait LoadBalancer<T>: Send + Sync {
    /// Rebuilds the snapshot from `items` and publishes it atomically.
    fn set_providers(&self, items: Vec<T>);

    /// Picks one item, or `None` when the current snapshot is empty.
    fn select(&self) -> Option<T>;

    /// The snapshot `select` currently reads from.
    fn snapshot(&self) -> Arc<WeightableGroup<T>>;
}

/// Picks a uniformly random slot on every call.
#[derive(Debug)]
pub struct RandomLoadBalancer<T> {
    group: ArcSwap<WeightableGroup<T>>,
}

impl<T> RandomLoadBalancer<T> {
    pub fn new() -> Self {
        Self {
            group: ArcSwap::from_pointee(WeightableGroup::empty()),
        }
    }
}

impl<T> Default for RandomLoadBalancer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LoadBalancer<T> for RandomLoadBalancer<T>
where
    T: Weighted + Clone + Send + Sync,
{
    fn set_providers(&self, items: Vec<T>) {
        self.group.store(Arc::new(WeightableGroup::new(items)));
    }

    fn select(&self) -> Option<T> {
        let group = self.group.load();
        if group.is_empty() {
            return None;
        }
        let seed = rand::thread_rng().gen_range(0..group.sum());
        group.get(seed).cloned()
    }

    fn snapshot(&self) -> Arc<WeightableGroup<T>> {
        self.group.load_full()
    }
}

/// Walks the weighted ladder cyclically.
///
/// The shared counter only ever increments and is allowed to wrap. Each
/// ticket is reduced modulo the ladder sum, so `sum` consecutive selections
/// visit every slot once.
#[derive(Debug)]
pub struct RoundRobinLoadBalancer<T> {
    group: ArcSwap<WeightableGroup<T>>,
    counter: AtomicU64,
}

impl<T> RoundRobinLoadBalancer<T> {
    pub fn new() -> Self {
        Self {
            group: ArcSwap::from_pointee(WeightableGroup::empty()),
            counter: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    fn with_counter(start: u64) -> Self {
        Self {
            group: ArcSwap::from_pointee(WeightableGroup::empty()),
            counter: AtomicU64::new(start),
        }
    }
}

impl<T> Default for RoundRobinLoadBalancer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LoadBalancer<T> for RoundRobinLoadBalancer<T>
where
    T: Weighted + Clone + Send + Sync,
{
    fn set_providers(&self, items: Vec<T>) {
        self.group.store(Arc::new(WeightableGroup::new(items)));
    }

    fn select(&self) -> Option<T> {
        let group = self.group.load();
        if group.is_empty() {
            return None;
        }
        let ticket = self.counter.fetch_add(1, Ordering::Relaxed);
        group.get((ticket % group.sum() as u64) as i64).cloned()
    }

    fn snapshot(&self) -> Arc<WeightableGroup<T>> {
        self.group.load_full()
    }
}

/// Balancer chosen from configuration.
#[derive(Debug)]
pub enum Balancer<T> {
    Random(RandomLoadBalancer<T>),
    RoundRobin(RoundRobinLoadBalancer<T>),
}

impl<T> Balancer<T> {
    pub fn from_kind(kind: LoadBalanceKind) -> Self {
        match kind {
            LoadBalanceKind::Random => Balancer::Random(RandomLoadBalancer::new()),
            LoadBalanceKind::RoundRobin => Balancer::RoundRobin(RoundRobinLoadBalancer::new()),
        }
    }

    pub fn kind(&self) -> LoadBalanceKind {
        match self {
            Balancer::Random(_) => LoadBalanceKind::Random,
            Balancer::RoundRobin(_) => LoadBalanceKind::RoundRobin,
        }
    }
}

impl<T> LoadBalancer<T> for Balancer<T>
where
    T: Weighted + Clone + Send + Sync,
{
    fn set_providers(&self, items: Vec<T>) {
        match self {
            Balancer::Random(lb) => lb.set_providers(items),
            Balancer::RoundRobin(lb) => lb.set_providers(items),
        }
    }

    fn select(&self) -> Option<T> {
        match self {
            Balancer::Random(lb) => lb.select(),
            Balancer::RoundRobin(lb) => lb.select(),
        }
    }

    fn snapshot(&self) -> Arc<WeightableGroup<T>> {
        match self {
            Balancer::Random(lb) => lb.snapshot(),
            Balancer::RoundRobin(lb) => lb.snapshot(),
        }
    }
}
