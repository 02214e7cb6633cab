//! Backend dialing with bounded retry.
//!
//! - Connect timeout to backend: 2s default
//! - A candidate that failed is excluded from the next choice of the
//!   same session
//! - Attempts are bounded; exhausting them yields `BackendUnreachable`

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::balancer::LoadBalancer;
use crate::error::GatewayError;
use crate::registry::{Candidate, RouteKey};

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default number of dial attempts per session.
pub const DEFAULT_CONNECT_ATTEMPTS: usize = 3;

/// Opens backend connections for routed sessions.
#[derive(Debug, Clone)]
pub struct Dialer {
    connect_timeout: Duration,
    max_attempts: usize,
}

impl Dialer {
    pub fn new(connect_timeout: Duration, max_attempts: usize) -> Self {
        Self {
            connect_timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Choose a candidate and connect, retrying against the next choice.
    ///
    /// `candidates` must be non-empty; an empty list is reported as
    /// `NoCandidates` without dialing.
    pub async fn connect(
        &self,
        balancer: &dyn LoadBalancer,
        route: &RouteKey,
        mut candidates: Vec<Candidate>,
        sticky_key: Option<&str>,
    ) -> Result<(TcpStream, Candidate), GatewayError> {
        let mut attempts = 0;
        let mut last_error = None;

        while attempts < self.max_attempts {
            let Ok(candidate) = balancer.choose(route, &candidates, sticky_key) else {
                break;
            };
            attempts += 1;

            match self.try_connect(&candidate).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    debug!(
                        backend_addr = %candidate.address,
                        service_id = %candidate.service_id,
                        attempt = attempts,
                        "Connected to backend"
                    );
                    return Ok((stream, candidate));
                }
                Err(e) => {
                    warn!(
                        backend_addr = %candidate.address,
                        service_id = %candidate.service_id,
                        attempt = attempts,
                        error = %e,
                        "Backend connection failed"
                    );
                    candidates.retain(|c| c.uri != candidate.uri);
                    last_error = Some(e);
                }
            }
        }

        if attempts == 0 {
            return Err(GatewayError::NoCandidates {
                scheme: route.scheme.clone(),
                virtual_host: route.virtual_host.clone(),
            });
        }
        Err(GatewayError::BackendUnreachable {
            attempts,
            last_error,
        })
    }

    /// Attempt to connect to a specific backend.
    ///
    /// Name resolution runs on tokio's blocking pool, never on the reactor.
    async fn try_connect(&self, candidate: &Candidate) -> io::Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(candidate.address.as_str())).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
    }
}

impl Default for Dialer {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_CONNECT_ATTEMPTS)
    }
}
