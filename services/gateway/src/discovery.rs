//! File-based discovery watcher.
//!
//! Polls a JSON document listing the services that are currently up and
//! applies the difference to the registry:
//!
//! ```json
//! {"services": [{"id": "broker0", "uris": ["stomp://10.0.0.5:61613"]}]}
//! ```
//!
//! A document that cannot be read or parsed leaves the registry on the last
//! applied state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::registry::{ServiceEndpoint, SharedRegistry};

/// Default poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// On-disk discovery document.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    #[serde(default)]
    pub services: Vec<ServiceEndpoint>,
}

/// Read and parse a discovery document.
pub async fn load(path: &Path) -> Result<DiscoveryDocument> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read discovery file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse discovery file {}", path.display()))
}

/// Changes that turn `applied` into `desired`: records to upsert and ids to
/// remove. Unchanged records are left alone.
pub fn diff(
    applied: &BTreeMap<String, ServiceEndpoint>,
    desired: &BTreeMap<String, ServiceEndpoint>,
) -> (Vec<ServiceEndpoint>, Vec<String>) {
    let upserts = desired
        .iter()
        .filter(|(id, endpoint)| applied.get(*id) != Some(*endpoint))
        .map(|(_, endpoint)| endpoint.clone())
        .collect();
    let removals = applied
        .keys()
        .filter(|id| !desired.contains_key(*id))
        .cloned()
        .collect();
    (upserts, removals)
}

/// Keeps a registry in line with a discovery file.
pub struct FileDiscovery {
    path: PathBuf,
    poll_interval: Duration,
    registry: SharedRegistry,
    applied: BTreeMap<String, ServiceEndpoint>,
}

impl FileDiscovery {
    pub fn new(path: PathBuf, poll_interval: Duration, registry: SharedRegistry) -> Self {
        Self {
            path,
            poll_interval,
            registry,
            applied: BTreeMap::new(),
        }
    }

    /// Apply the current document once. Returns the number of changes.
    pub async fn sync_once(&mut self) -> Result<usize> {
        let document = load(&self.path).await?;

        // Later duplicates of an id win.
        let desired: BTreeMap<String, ServiceEndpoint> = document
            .services
            .into_iter()
            .map(|endpoint| (endpoint.id.clone(), endpoint))
            .collect();

        let (upserts, removals) = diff(&self.applied, &desired);
        let changes = upserts.len() + removals.len();

        for endpoint in upserts {
            self.registry.upsert(endpoint);
        }
        for id in &removals {
            self.registry.remove(id);
        }
        self.applied = desired;

        if changes > 0 {
            info!(
                path = %self.path.display(),
                changes = changes,
                services = self.applied.len(),
                "Discovery changes applied"
            );
        } else {
            debug!(path = %self.path.display(), "Discovery unchanged");
        }
        Ok(changes)
    }

    /// Poll until the task is dropped.
    pub async fn run(mut self) {
        info!(
            path = %self.path.display(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Starting discovery watcher"
        );
        loop {
            if let Err(e) = self.sync_once().await {
                warn!(error = %format!("{e:#}"), "Discovery sync failed, keeping last state");
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
