//! Load balancing strategies.
//!
//! A [`LoadBalancer`] picks one [`Candidate`] for a route. Three strategies
//! are provided:
//! - [`RandomBalancer`]: uniform pick, stateless
//! - [`RoundRobinBalancer`]: per-route counter; a new candidate set starts
//!   again at index 0
//! - [`StickyBalancer`]: remembers the choice per client identity in a
//!   bounded LRU cache and defers to a fallback strategy on a miss

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rand::Rng;
use thiserror::Error;
use tracing::trace;

use crate::registry::{Candidate, RouteKey};

/// Default capacity of the sticky cache.
pub const DEFAULT_STICKY_CACHE_SIZE: usize = 1024;

/// Default number of routes round-robin keeps counters for.
pub const DEFAULT_ROUND_ROBIN_ROUTES: usize = 4096;

/// Candidate sets remembered per route by round-robin.
const ROUND_ROBIN_SETS_PER_ROUTE: usize = 4;

/// Lock stripes of the sticky cache.
const STICKY_STRIPES: usize = 16;

/// The candidate list was empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no candidates to choose from")]
pub struct NoCandidates;

/// Picks a backend among the candidates of a route.
pub trait LoadBalancer: Send + Sync + fmt::Debug {
    /// Strategy name for logs.
    fn name(&self) -> &'static str;

    /// Choose one candidate. Never panics on an empty list.
    fn choose(
        &self,
        route: &RouteKey,
        candidates: &[Candidate],
        sticky_key: Option<&str>,
    ) -> Result<Candidate, NoCandidates>;
}

/// Shared balancer handle.
pub type SharedBalancer = Arc<dyn LoadBalancer>;

/// Strategy selected by configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    Random,
    RoundRobin,
    Sticky {
        fallback: Box<Strategy>,
        cache_size: usize,
    },
}

impl Strategy {
    /// Parse `random`, `round-robin` (or `round_robin`) and `sticky`.
    ///
    /// `sticky` gets a random fallback and the default cache size; use
    /// [`Strategy::sticky`] to pick them.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "random" => Some(Strategy::Random),
            "round-robin" | "roundrobin" => Some(Strategy::RoundRobin),
            "sticky" => Some(Strategy::sticky(Strategy::Random, DEFAULT_STICKY_CACHE_SIZE)),
            _ => None,
        }
    }

    pub fn sticky(fallback: Strategy, cache_size: usize) -> Self {
        Strategy::Sticky {
            fallback: Box::new(fallback),
            cache_size,
        }
    }

    /// Instantiate the balancer.
    pub fn build(&self) -> SharedBalancer {
        match self {
            Strategy::Random => Arc::new(RandomBalancer),
            Strategy::RoundRobin => Arc::new(RoundRobinBalancer::new()),
            Strategy::Sticky {
                fallback,
                cache_size,
            } => Arc::new(StickyBalancer::new(fallback.build(), *cache_size)),
        }
    }
}

/// Uniform random choice.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomBalancer;

impl LoadBalancer for RandomBalancer {
    fn name(&self) -> &'static str {
        "random"
    }

    fn choose(
        &self,
        _route: &RouteKey,
        candidates: &[Candidate],
        _sticky_key: Option<&str>,
    ) -> Result<Candidate, NoCandidates> {
        if candidates.is_empty() {
            return Err(NoCandidates);
        }
        let idx = rand::rng().random_range(0..candidates.len());
        Ok(candidates[idx].clone())
    }
}

/// Counter state for one candidate set of a route.
#[derive(Debug)]
struct RotationState {
    fingerprint: u64,
    next: usize,
}

/// Rotation counters of one route.
#[derive(Debug, Default)]
struct RouteRotation {
    /// Most recently used set first.
    sets: Vec<RotationState>,
    last_used: u64,
}

/// Round-robin per (scheme, virtual host).
///
/// Counters are keyed by the exact candidate set, so a changed set starts
/// at index 0 and a retry over a reduced set does not disturb the rotation
/// of the full one. Virtual hosts come from clients, so at most
/// `max_routes` routes are tracked; the least recently used is dropped.
#[derive(Debug)]
pub struct RoundRobinBalancer {
    routes: DashMap<RouteKey, RouteRotation>,
    max_routes: usize,
    tick: AtomicU64,
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::with_max_routes(DEFAULT_ROUND_ROBIN_ROUTES)
    }
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_routes(max_routes: usize) -> Self {
        Self {
            routes: DashMap::new(),
            max_routes: max_routes.max(1),
            tick: AtomicU64::new(0),
        }
    }

    fn evict_least_recent(&self) {
        let oldest = self
            .routes
            .iter()
            .min_by_key(|entry| entry.value().last_used)
            .map(|entry| entry.key().clone());
        if let Some(oldest) = oldest {
            trace!(route = ?oldest, "Round-robin state evicted");
            self.routes.remove(&oldest);
        }
    }
}

fn fingerprint(candidates: &[Candidate]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for c in candidates {
        c.uri.hash(&mut hasher);
    }
    hasher.finish()
}

impl LoadBalancer for RoundRobinBalancer {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn choose(
        &self,
        route: &RouteKey,
        candidates: &[Candidate],
        _sticky_key: Option<&str>,
    ) -> Result<Candidate, NoCandidates> {
        if candidates.is_empty() {
            return Err(NoCandidates);
        }

        let fp = fingerprint(candidates);
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        let idx = {
            let mut rotation = self.routes.entry(route.clone()).or_default();
            rotation.last_used = tick;
            let sets = &mut rotation.sets;

            let pos = match sets.iter().position(|s| s.fingerprint == fp) {
                Some(pos) => pos,
                None => {
                    trace!(route = ?route, "Candidate set changed, rotation restarts at 0");
                    sets.insert(
                        0,
                        RotationState {
                            fingerprint: fp,
                            next: 0,
                        },
                    );
                    sets.truncate(ROUND_ROBIN_SETS_PER_ROUTE);
                    0
                }
            };

            let mut state = sets.remove(pos);
            let idx = state.next % candidates.len();
            state.next = state.next.wrapping_add(1);
            sets.insert(0, state);
            idx
        };

        // The entry guard is released; scanning the map is safe.
        while self.routes.len() > self.max_routes {
            self.evict_least_recent();
        }

        Ok(candidates[idx].clone())
    }
}

/// One lock stripe of the sticky cache.
#[derive(Debug, Default)]
struct LruStripe {
    /// key -> (uri, last use tick)
    entries: HashMap<String, (String, u64)>,
    tick: u64,
}

impl LruStripe {
    fn get(&mut self, key: &str) -> Option<String> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(key).map(|(uri, used)| {
            *used = tick;
            uri.clone()
        })
    }

    fn put(&mut self, key: String, uri: String, capacity: usize) {
        self.tick += 1;
        if !self.entries.contains_key(&key) && self.entries.len() >= capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, (_, used))| *used)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key, (uri, self.tick));
    }
}

/// Bounded, striped LRU map from sticky key to endpoint URI.
#[derive(Debug)]
pub struct StickyCache {
    stripes: Vec<Mutex<LruStripe>>,
    per_stripe: usize,
}

impl StickyCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let stripe_count = STICKY_STRIPES.min(capacity);
        Self {
            stripes: (0..stripe_count).map(|_| Mutex::default()).collect(),
            per_stripe: capacity.div_ceil(stripe_count),
        }
    }

    fn stripe(&self, key: &str) -> &Mutex<LruStripe> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut stripe = self.stripe(key).lock().unwrap_or_else(|e| e.into_inner());
        stripe.get(key)
    }

    pub fn put(&self, key: String, uri: String) {
        let mut stripe = self.stripe(&key).lock().unwrap_or_else(|e| e.into_inner());
        stripe.put(key, uri, self.per_stripe);
    }

    pub fn len(&self) -> usize {
        self.stripes
            .iter()
            .map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).entries.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upper bound on entries held.
    pub fn capacity(&self) -> usize {
        self.per_stripe * self.stripes.len()
    }
}

/// Session affinity on top of a fallback strategy.
#[derive(Debug)]
pub struct StickyBalancer {
    cache: StickyCache,
    fallback: SharedBalancer,
}

impl StickyBalancer {
    pub fn new(fallback: SharedBalancer, cache_size: usize) -> Self {
        Self {
            cache: StickyCache::new(cache_size),
            fallback,
        }
    }

    pub fn cache(&self) -> &StickyCache {
        &self.cache
    }
}

impl LoadBalancer for StickyBalancer {
    fn name(&self) -> &'static str {
        "sticky"
    }

    fn choose(
        &self,
        route: &RouteKey,
        candidates: &[Candidate],
        sticky_key: Option<&str>,
    ) -> Result<Candidate, NoCandidates> {
        if candidates.is_empty() {
            return Err(NoCandidates);
        }
        let Some(sticky_key) = sticky_key else {
            return self.fallback.choose(route, candidates, None);
        };

        let cache_key = format!("{}|{}|{}", route.scheme, route.virtual_host, sticky_key);
        if let Some(uri) = self.cache.get(&cache_key) {
            if let Some(hit) = candidates.iter().find(|c| c.uri == uri) {
                trace!(sticky_key = %sticky_key, uri = %uri, "Sticky hit");
                return Ok(hit.clone());
            }
        }

        let chosen = self.fallback.choose(route, candidates, Some(sticky_key))?;
        self.cache.put(cache_key, chosen.uri.clone());
        Ok(chosen)
    }
}
