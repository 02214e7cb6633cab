//! protogate gateway
//!
//! Multi-protocol detecting TCP gateway.
//!
//! This service:
//! - Accepts TCP connections on the configured listeners
//! - Detects AMQP, MQTT, OpenWire, STOMP, HTTP and TLS from the first bytes
//! - Routes on the virtual host named in the handshake
//! - Keeps its service registry in line with a discovery file

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use protogate_gateway::{
    tls, CallMetricsSink, ChannelMetricsSink, FileDiscovery, Gateway, GatewayConfig,
    ServiceRegistry, TlsMode,
};

mod config;

use config::{Config, TlsSetting};

/// Pending call metrics before new ones are dropped.
const METRICS_QUEUE: usize = 4096;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to GATEWAY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting protogate gateway");
    info!(
        listener_count = config.bind_addrs.len(),
        protocols = ?config.protocols.iter().map(|p| p.name()).collect::<Vec<_>>(),
        strategy = ?config.strategy,
        tls = ?config.tls,
        discovery_file = ?config.discovery_file,
        "Configuration loaded"
    );

    let tls_mode = match &config.tls {
        TlsSetting::Passthrough => TlsMode::Passthrough,
        TlsSetting::Terminate {
            cert_file,
            key_file,
        } => TlsMode::terminate(
            tls::load_server_config(cert_file, key_file)
                .await
                .context("Failed to load TLS credentials")?,
        ),
    };

    let registry = Arc::new(ServiceRegistry::new());

    if let Some(path) = &config.discovery_file {
        let mut discovery = FileDiscovery::new(
            path.clone(),
            config.discovery_poll_interval,
            Arc::clone(&registry),
        );
        // Start with the current document when it is readable.
        match discovery.sync_once().await {
            Ok(_) => info!(services = ?registry.service_ids(), "Initial discovery sync done"),
            Err(e) => error!(error = %format!("{e:#}"), "Initial discovery sync failed"),
        }
        tokio::spawn(discovery.run());
    }

    let balancer = config.strategy.build();

    let (metrics, mut metrics_rx) = ChannelMetricsSink::new(METRICS_QUEUE);
    let metrics: Arc<dyn CallMetricsSink> = Arc::new(metrics);
    tokio::spawn(async move {
        while let Some(call) = metrics_rx.recv().await {
            info!(
                virtual_host = %call.virtual_host,
                method = %call.method,
                path = %call.path,
                backend_addr = %call.backend,
                elapsed_ms = call.elapsed.as_millis() as u64,
                success = call.outcome.is_success(),
                outcome = ?call.outcome,
                "HTTP call"
            );
        }
    });

    let mut listener_handles = Vec::new();
    for bind_addr in &config.bind_addrs {
        let mut gateway_config = GatewayConfig::new(*bind_addr);
        gateway_config.max_connections = config.max_connections;
        gateway_config.protocols = config.protocols.clone();
        gateway_config.default_virtual_host = config.default_virtual_host.clone();
        gateway_config.idle_timeout = config.idle_timeout;
        gateway_config.max_handshake_bytes = config.max_handshake_bytes;
        gateway_config.bridge = config.bridge.clone();
        gateway_config.connect_timeout = config.connect_timeout;
        gateway_config.connect_attempts = config.connect_attempts;
        gateway_config.sticky_key = config.sticky_key;
        gateway_config.tls = tls_mode.clone();

        let bound = Gateway::bind(gateway_config, Arc::clone(&registry), Arc::clone(&balancer)).await;
        let gateway = match bound {
            Ok(gateway) => gateway.with_metrics(Arc::clone(&metrics)),
            Err(e) => {
                error!(
                    bind_addr = %bind_addr,
                    error = %e,
                    "Failed to bind listener"
                );
                return Err(e.into());
            }
        };

        let gateway = Arc::new(gateway);
        listener_handles.push(tokio::spawn(async move {
            if let Err(e) = gateway.run().await {
                error!(error = %e, "Listener error");
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    for handle in listener_handles {
        handle.abort();
    }
    Ok(())
}
