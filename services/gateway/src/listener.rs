//! TCP listener and connection handling.
//!
//! Each accepted connection runs on its own task:
//!
//! ```text
//! accept -> [TLS accept] -> detect + decode -> [HTTP hook] -> registry
//!        -> balancer + dialer -> replay prefix -> relay
//! ```
//!
//! Failures end the session and are counted; they never leave the
//! connection's task.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use protogate_detect::{
    default_protocols, ConnectionParameters, ProtocolMatcher, Rejection, SharedProtocol,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn, Instrument};

use crate::backend::{Dialer, DEFAULT_CONNECT_ATTEMPTS, DEFAULT_CONNECT_TIMEOUT};
use crate::balancer::SharedBalancer;
use crate::bridge::{relay, BridgeConfig, ResponseInspector};
use crate::error::GatewayError;
use crate::hook::{HttpExchange, HttpInterceptor, Verdict};
use crate::metrics::CallMetricsSink;
use crate::registry::SharedRegistry;
use crate::session::{CloseReason, ConnectionSession, Progress, SessionSettings};
use crate::tls::{starts_with_tls, TlsMode};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default time allowed from accept until the route is resolved.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on the prefix buffer.
pub const DEFAULT_MAX_HANDSHAKE_BYTES: usize = 64 * 1024;

/// Read size while detecting.
const DETECT_READ_SIZE: usize = 4096;

/// Client identity used by sticky balancing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StickyKeySource {
    /// The client's IP address.
    #[default]
    RemoteAddress,
    /// Virtual host and user from the handshake.
    VirtualHostUser,
}

impl StickyKeySource {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "remote-address" | "remote" => Some(StickyKeySource::RemoteAddress),
            "virtual-host-user" | "vhost-user" => Some(StickyKeySource::VirtualHostUser),
            _ => None,
        }
    }

    fn key(&self, peer_addr: SocketAddr, params: &ConnectionParameters) -> String {
        match self {
            StickyKeySource::RemoteAddress => peer_addr.ip().to_string(),
            StickyKeySource::VirtualHostUser => format!(
                "{}/{}",
                params.virtual_host.as_deref().unwrap_or_default(),
                params.user.as_deref().unwrap_or_default()
            ),
        }
    }
}

/// Configuration for one gateway listener.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Protocols to detect, in priority order.
    pub protocols: Vec<SharedProtocol>,
    /// Virtual host for handshakes that name none.
    pub default_virtual_host: Option<String>,
    /// Deadline, counted from accept, for detection to finish.
    pub idle_timeout: Duration,
    /// Bound on bytes buffered before routing.
    pub max_handshake_bytes: usize,
    pub bridge: BridgeConfig,
    pub connect_timeout: Duration,
    pub connect_attempts: usize,
    pub sticky_key: StickyKeySource,
    pub tls: TlsMode,
}

impl GatewayConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            protocols: default_protocols(),
            default_virtual_host: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_handshake_bytes: DEFAULT_MAX_HANDSHAKE_BYTES,
            bridge: BridgeConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            sticky_key: StickyKeySource::default(),
            tls: TlsMode::default(),
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct GatewayStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently open.
    pub connections_active: AtomicU64,
    pub connections_closed: AtomicU64,
    /// Connections refused at the connection limit.
    pub connections_rejected: AtomicU64,
    pub tls_terminated: AtomicU64,
    /// Handshakes decoded to a routing key.
    pub protocols_detected: AtomicU64,
    /// Unidentified, malformed or oversized handshakes.
    pub detection_failed: AtomicU64,
    pub idle_timeouts: AtomicU64,
    pub routes_matched: AtomicU64,
    /// Routing keys nothing advertises.
    pub routes_failed: AtomicU64,
    pub requests_rejected: AtomicU64,
    pub backend_connected: AtomicU64,
    pub backend_failed: AtomicU64,
    pub bytes_to_backend: AtomicU64,
    pub bytes_from_backend: AtomicU64,
}

impl GatewayStats {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A detecting gateway listener.
pub struct Gateway {
    config: GatewayConfig,
    listener: TcpListener,
    settings: SessionSettings,
    registry: SharedRegistry,
    balancer: SharedBalancer,
    dialer: Dialer,
    interceptor: Option<Arc<dyn HttpInterceptor>>,
    metrics: Option<Arc<dyn CallMetricsSink>>,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<GatewayStats>,
}

impl Gateway {
    /// Bind the listener socket.
    pub async fn bind(
        config: GatewayConfig,
        registry: SharedRegistry,
        balancer: SharedBalancer,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let settings = SessionSettings {
            matcher: Arc::new(ProtocolMatcher::new(config.protocols.clone())),
            default_virtual_host: config.default_virtual_host.clone(),
            max_handshake_bytes: config.max_handshake_bytes,
        };

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            protocols = ?config.protocols.iter().map(|p| p.name()).collect::<Vec<_>>(),
            balancer = balancer.name(),
            tls = ?config.tls,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            dialer: Dialer::new(config.connect_timeout, config.connect_attempts),
            settings,
            listener,
            config,
            registry,
            balancer,
            interceptor: None,
            metrics: None,
            stats: Arc::new(GatewayStats::default()),
        })
    }

    /// Install an HTTP interception hook.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn HttpInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Install a call metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn CallMetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            GatewayStats::incr(&self.stats.connections_rejected);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    GatewayStats::incr(&self.stats.connections_accepted);
                    GatewayStats::incr(&self.stats.connections_active);

                    let gateway = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = gateway.handle_connection(stream, peer_addr).await {
                                debug!(reason = e.reason_code(), error = %e, "Connection closed with error");
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            GatewayStats::incr(&stats.connections_closed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Terminate TLS if configured and the client opens with a handshake.
    async fn handle_connection(
        &self,
        client: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), GatewayError> {
        let _ = client.set_nodelay(true);
        let idle = self.config.idle_timeout;
        let deadline = Instant::now() + idle;

        if let TlsMode::Terminate(acceptor) = &self.config.tls {
            let is_tls = match timeout_at(deadline, starts_with_tls(&client)).await {
                Ok(result) => result?,
                Err(_) => {
                    GatewayStats::incr(&self.stats.idle_timeouts);
                    return Err(GatewayError::IdleTimeout(idle));
                }
            };

            if is_tls {
                let stream = match timeout_at(deadline, acceptor.accept(client)).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => return Err(GatewayError::Tls(e)),
                    Err(_) => {
                        GatewayStats::incr(&self.stats.idle_timeouts);
                        return Err(GatewayError::IdleTimeout(idle));
                    }
                };
                GatewayStats::incr(&self.stats.tls_terminated);
                debug!("TLS terminated");
                return self.serve(stream, peer_addr, deadline).await;
            }
        }

        self.serve(client, peer_addr, deadline).await
    }

    /// Drive one session from the first byte to the end of the relay.
    ///
    /// Detection must finish before `deadline`; a client trickling bytes
    /// does not extend it.
    async fn serve<S>(
        &self,
        mut client: S,
        peer_addr: SocketAddr,
        deadline: Instant,
    ) -> Result<(), GatewayError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut session = ConnectionSession::new(self.settings.clone());
        let idle = self.config.idle_timeout;
        let mut buf = vec![0u8; DETECT_READ_SIZE];

        loop {
            let n = match timeout_at(deadline, client.read(&mut buf)).await {
                Ok(Ok(0)) => return Err(session.fail(GatewayError::ClientClosed)),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(session.fail(GatewayError::Io(e))),
                Err(_) => {
                    GatewayStats::incr(&self.stats.idle_timeouts);
                    return Err(session.fail(GatewayError::IdleTimeout(idle)));
                }
            };
            match session.feed(&buf[..n]) {
                Ok(Progress::NeedMore) => continue,
                Ok(Progress::Resolved) => break,
                Err(e) => {
                    GatewayStats::incr(&self.stats.detection_failed);
                    return Err(e);
                }
            }
        }
        GatewayStats::incr(&self.stats.protocols_detected);

        let (Some(protocol), Some(mut params), Some(route)) = (
            session.protocol().cloned(),
            session.params().cloned(),
            session.route_key(),
        ) else {
            let prefix_len = session.prefix().len();
            return Err(session.fail(GatewayError::UnidentifiedProtocol { prefix_len }));
        };

        if let (Some(interceptor), Some(request)) =
            (&self.interceptor, session.request_head().cloned())
        {
            match interceptor.on_request(&request).await {
                Verdict::Pass => {}
                Verdict::Rewrite(headers) => {
                    session.rewrite_request_headers(headers);
                    params = session.params().cloned().unwrap_or(params);
                }
                Verdict::Reject { status, message } => {
                    GatewayStats::incr(&self.stats.requests_rejected);
                    let rejection = Rejection::Policy {
                        status,
                        message: message.clone(),
                    };
                    reject(&mut client, &protocol, &params, &rejection).await;
                    return Err(session.fail(GatewayError::Rejected { status, message }));
                }
            }
        }

        let candidates = self
            .registry
            .candidates(protocol.schemes(), &route.virtual_host);
        if candidates.is_empty() {
            GatewayStats::incr(&self.stats.routes_failed);
            info!(
                protocol = protocol.name(),
                virtual_host = %route.virtual_host,
                "No backend advertises route"
            );
            reject(&mut client, &protocol, &params, &Rejection::NoService).await;
            return Err(session.fail(GatewayError::NoCandidates {
                scheme: route.scheme.clone(),
                virtual_host: route.virtual_host.clone(),
            }));
        }
        GatewayStats::incr(&self.stats.routes_matched);

        let sticky_key = self.config.sticky_key.key(peer_addr, &params);
        let (mut backend, chosen) = match self
            .dialer
            .connect(self.balancer.as_ref(), &route, candidates, Some(&sticky_key))
            .await
        {
            Ok(connected) => connected,
            Err(e) => {
                GatewayStats::incr(&self.stats.backend_failed);
                let rejection = match &e {
                    GatewayError::NoCandidates { .. } => Rejection::NoService,
                    _ => Rejection::Unavailable,
                };
                reject(&mut client, &protocol, &params, &rejection).await;
                return Err(session.fail(e));
            }
        };
        GatewayStats::incr(&self.stats.backend_connected);

        info!(
            protocol = protocol.name(),
            virtual_host = %route.virtual_host,
            user = ?params.user,
            service_id = %chosen.service_id,
            backend_addr = %chosen.address,
            "Session routed"
        );

        let mut exchange = match (&self.interceptor, &self.metrics, session.request_head()) {
            (None, None, _) | (_, _, None) => None,
            (_, _, Some(request)) => Some(HttpExchange::new(
                request.clone(),
                route.virtual_host.clone(),
                chosen.address.clone(),
                self.interceptor.clone(),
                self.metrics.clone(),
            )),
        };

        let replay = session.begin_bridging();
        if let Err(e) = backend.write_all(&replay).await {
            if let Some(exchange) = exchange.as_mut() {
                exchange.finish_without_response("relay_error");
            }
            return Err(session.fail(GatewayError::Relay(e)));
        }
        self.stats
            .bytes_to_backend
            .fetch_add(replay.len() as u64, Ordering::Relaxed);
        drop(replay);

        let inspector: Option<&mut (dyn ResponseInspector + '_)> = match exchange.as_mut() {
            Some(exchange) => Some(exchange),
            None => None,
        };
        let result = relay(client, backend, &self.config.bridge, inspector).await;

        match result {
            Ok(relayed) => {
                self.stats
                    .bytes_to_backend
                    .fetch_add(relayed.client_to_backend, Ordering::Relaxed);
                self.stats
                    .bytes_from_backend
                    .fetch_add(relayed.backend_to_client, Ordering::Relaxed);
                if let Some(exchange) = exchange.as_mut() {
                    exchange.finish_without_response("no_response");
                }
                debug!(
                    client_to_backend = relayed.client_to_backend,
                    backend_to_client = relayed.backend_to_client,
                    grace_expired = relayed.grace_expired,
                    "Relay finished"
                );
                session.close(CloseReason::Completed);
                Ok(())
            }
            Err(e) => {
                if let Some(exchange) = exchange.as_mut() {
                    exchange.finish_without_response(e.reason_code());
                }
                Err(session.fail(e))
            }
        }
    }
}

/// Send the protocol's rejection, if it has one, and close the write side.
async fn reject<S>(
    client: &mut S,
    protocol: &SharedProtocol,
    params: &ConnectionParameters,
    rejection: &Rejection,
) where
    S: AsyncWrite + Unpin,
{
    let Some(bytes) = protocol.rejection(params, rejection) else {
        return;
    };
    if let Err(e) = client.write_all(&bytes).await {
        debug!(error = %e, "Failed to send rejection");
        return;
    }
    let _ = client.shutdown().await;
}
