//! Service registry and candidate lookup.
//!
//! The registry maps a service id to the endpoint record most recently
//! advertised for it. It is fed by an external discovery watcher through
//! [`ServiceRegistry::upsert`] and [`ServiceRegistry::remove`] and read by
//! every connection session through [`ServiceRegistry::candidates`].
//!
//! - Writers replace a whole endpoint record at once (copy-on-write)
//! - Readers load an immutable snapshot and never block writers
//! - Virtual hosts match the service id or one of its aliases
//!   (`name`, `*.suffix`, `prefix*`), case-insensitively

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

/// One advertised instance of a backend service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// Logical service id; also the default virtual host it answers to.
    pub id: String,
    /// Version tag of the advertised instance.
    #[serde(default)]
    pub version: String,
    /// One URI per protocol the instance exposes (`stomp://host:port`).
    pub uris: Vec<String>,
    /// Extra virtual hosts served (exact names or `*.suffix` / `prefix*`).
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Opaque metadata, not used for routing.
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub bundles: Vec<String>,
}

impl ServiceEndpoint {
    pub fn new(id: impl Into<String>, uris: Vec<String>) -> Self {
        Self {
            id: id.into(),
            version: String::new(),
            uris,
            aliases: Vec::new(),
            container: None,
            bundles: Vec::new(),
        }
    }

    pub fn with_aliases(mut self, aliases: Vec<String>) -> Self {
        self.aliases = aliases;
        self
    }
}

/// Key under which routing state is kept: detected scheme plus virtual host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub scheme: String,
    pub virtual_host: String,
}

impl RouteKey {
    pub fn new(scheme: impl Into<String>, virtual_host: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            virtual_host: virtual_host.into(),
        }
    }
}

/// A dialable backend address derived from an endpoint URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub service_id: String,
    /// The URI as advertised; used as the sticky identity.
    pub uri: String,
    /// `host:port` to dial.
    pub address: String,
}

/// Endpoint with its URIs parsed once, at upsert time.
#[derive(Debug)]
struct RegisteredService {
    endpoint: ServiceEndpoint,
    routes: Vec<ParsedUri>,
    patterns: Vec<HostPattern>,
}

#[derive(Debug)]
struct ParsedUri {
    scheme: String,
    uri: String,
    address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    Exact(String),
    Suffix(String),
    Prefix(String),
}

impl HostPattern {
    fn parse(raw: &str) -> Self {
        let raw = normalize_host(raw);
        if let Some(suffix) = raw.strip_prefix('*') {
            HostPattern::Suffix(suffix.to_string())
        } else if let Some(prefix) = raw.strip_suffix('*') {
            HostPattern::Prefix(prefix.to_string())
        } else {
            HostPattern::Exact(raw)
        }
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Exact(name) => name == host,
            HostPattern::Suffix(suffix) => host.len() > suffix.len() && host.ends_with(suffix),
            HostPattern::Prefix(prefix) => host.starts_with(prefix),
        }
    }
}

impl RegisteredService {
    fn new(endpoint: ServiceEndpoint) -> Self {
        let routes = endpoint
            .uris
            .iter()
            .filter_map(|uri| match parse_uri(uri) {
                Some(parsed) => Some(parsed),
                None => {
                    warn!(service_id = %endpoint.id, uri = %uri, "Ignoring unusable endpoint URI");
                    None
                }
            })
            .collect();

        let patterns = std::iter::once(endpoint.id.as_str())
            .chain(endpoint.aliases.iter().map(String::as_str))
            .map(HostPattern::parse)
            .collect();

        Self {
            endpoint,
            routes,
            patterns,
        }
    }

    fn serves(&self, virtual_host: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(virtual_host))
    }
}

fn parse_uri(raw: &str) -> Option<ParsedUri> {
    let url = Url::parse(raw).ok()?;
    // IPv6 literals come back bracketed, ready to pair with a port.
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(ParsedUri {
        scheme: url.scheme().to_ascii_lowercase(),
        uri: raw.to_string(),
        address: format!("{}:{}", host, port),
    })
}

/// Lowercase, trailing dot trimmed.
pub fn normalize_host(host: &str) -> String {
    host.trim().to_lowercase().trim_end_matches('.').to_string()
}

/// Immutable snapshot of the registry.
#[derive(Debug, Default)]
struct RegistrySnapshot {
    /// Ordered by id so candidate lists are stable between lookups.
    services: BTreeMap<String, Arc<RegisteredService>>,
}

impl RegistrySnapshot {
    fn with_upsert(&self, service: Arc<RegisteredService>) -> Self {
        let mut services = self.services.clone();
        services.insert(service.endpoint.id.clone(), service);
        Self { services }
    }

    fn without(&self, service_id: &str) -> Self {
        let mut services = self.services.clone();
        services.remove(service_id);
        Self { services }
    }
}

/// Registry of advertised services.
///
/// Uses ArcSwap so lookups are a pointer load and updates a pointer swap.
pub struct ServiceRegistry {
    snapshot: ArcSwap<RegistrySnapshot>,
}

impl ServiceRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
        }
    }

    /// Add or replace the endpoint advertised under `endpoint.id`.
    pub fn upsert(&self, endpoint: ServiceEndpoint) {
        let service = Arc::new(RegisteredService::new(endpoint));
        let service_id = service.endpoint.id.clone();
        let uri_count = service.routes.len();

        // rcu retries on a concurrent swap, so updates of other ids are not lost.
        self.snapshot
            .rcu(|current| current.with_upsert(Arc::clone(&service)));

        info!(service_id = %service_id, uri_count = uri_count, "Service upserted");
    }

    /// Remove a service. Removing an unknown id is a no-op.
    pub fn remove(&self, service_id: &str) {
        if !self.snapshot.load().services.contains_key(service_id) {
            debug!(service_id = %service_id, "Remove of unknown service ignored");
            return;
        }
        self.snapshot.rcu(|current| current.without(service_id));
        info!(service_id = %service_id, "Service removed");
    }

    /// Current endpoint record for a service.
    #[cfg(test)]
    pub(crate) fn get(&self, service_id: &str) -> Option<ServiceEndpoint> {
        self.snapshot
            .load()
            .services
            .get(service_id)
            .map(|s| s.endpoint.clone())
    }

    /// All registered service ids.
    pub fn service_ids(&self) -> Vec<String> {
        self.snapshot.load().services.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().services.is_empty()
    }

    /// Backends advertising one of `schemes` for `virtual_host`.
    ///
    /// Computed from the current snapshot on every call.
    pub fn candidates(&self, schemes: &[&str], virtual_host: &str) -> Vec<Candidate> {
        let host = normalize_host(virtual_host);
        if host.is_empty() {
            return Vec::new();
        }

        let snapshot = self.snapshot.load();
        let mut out = Vec::new();
        for service in snapshot.services.values().filter(|s| s.serves(&host)) {
            for route in &service.routes {
                if schemes.iter().any(|s| s.eq_ignore_ascii_case(&route.scheme)) {
                    out.push(Candidate {
                        service_id: service.endpoint.id.clone(),
                        uri: route.uri.clone(),
                        address: route.address.clone(),
                    });
                }
            }
        }

        debug!(
            virtual_host = %host,
            schemes = ?schemes,
            candidate_count = out.len(),
            "Candidates resolved"
        );
        out
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared registry reference.
pub type SharedRegistry = Arc<ServiceRegistry>;
