//! Bidirectional relay between a client and its backend.
//!
//! Each direction reads into a fixed buffer and writes it out completely
//! before reading again, so a destination that stops draining stops the
//! source from being read. Memory per connection is bounded by two relay
//! buffers (plus one response head while it is being inspected).
//!
//! When one side reaches EOF, the other side's write half is shut down and
//! the opposite direction gets a short grace period to flush. An I/O error
//! on either side ends both directions at once.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use protogate_detect::http::{self, ResponseHead};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::GatewayError;

/// Default per-direction relay buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Default grace period for a half-closed connection.
pub const DEFAULT_HALF_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Relay settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Bytes read per direction before the write must complete.
    pub buffer_size: usize,
    /// How long the surviving direction may run after the other closed.
    pub half_close_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            half_close_grace: DEFAULT_HALF_CLOSE_GRACE,
        }
    }
}

/// Bytes moved by a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
    /// The half-close grace period ran out before the other side closed.
    pub grace_expired: bool,
}

/// What to do with an inspected response head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InspectAction {
    /// Forward the original head.
    Forward,
    /// Forward these bytes instead of the head.
    Replace(Vec<u8>),
    /// Send these bytes instead of the response and stop relaying.
    Terminate(Vec<u8>),
}

/// Observes the first HTTP response head flowing back to the client.
#[async_trait]
pub trait ResponseInspector: Send {
    async fn on_response_head(&mut self, head: &ResponseHead) -> InspectAction;
}

/// Relay until both directions finish, one fails, or the grace period ends.
pub async fn relay<C, B>(
    client: C,
    backend: B,
    config: &BridgeConfig,
    inspector: Option<&mut (dyn ResponseInspector + '_)>,
) -> Result<RelayStats, GatewayError>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let to_backend = AtomicU64::new(0);
    let to_client = AtomicU64::new(0);

    let upstream = pump(
        &mut client_read,
        &mut backend_write,
        config.buffer_size,
        &to_backend,
        None,
    );
    let downstream = pump(
        &mut backend_read,
        &mut client_write,
        config.buffer_size,
        &to_client,
        inspector,
    );
    tokio::pin!(upstream);
    tokio::pin!(downstream);

    let mut grace_expired = false;

    tokio::select! {
        result = &mut upstream => {
            result.map_err(GatewayError::Relay)?;
            trace!("Client finished sending");
            match timeout(config.half_close_grace, &mut downstream).await {
                Ok(result) => result.map_err(GatewayError::Relay)?,
                Err(_) => grace_expired = true,
            }
        }
        result = &mut downstream => {
            result.map_err(GatewayError::Relay)?;
            trace!("Backend finished sending");
            match timeout(config.half_close_grace, &mut upstream).await {
                Ok(result) => result.map_err(GatewayError::Relay)?,
                Err(_) => grace_expired = true,
            }
        }
    }

    if grace_expired {
        debug!("Half-close grace period elapsed, closing both sides");
    }

    Ok(RelayStats {
        client_to_backend: to_backend.load(Ordering::Relaxed),
        backend_to_client: to_client.load(Ordering::Relaxed),
        grace_expired,
    })
}

/// Copy one direction. Each chunk is written out before the next read.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    transferred: &AtomicU64,
    mut inspector: Option<&mut (dyn ResponseInspector + '_)>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    // Response bytes held back until the head is complete.
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            if !pending.is_empty() {
                writer.write_all(&pending).await?;
                transferred.fetch_add(pending.len() as u64, Ordering::Relaxed);
            }
            writer.shutdown().await?;
            return Ok(());
        }

        let Some(watcher) = inspector.as_deref_mut() else {
            writer.write_all(&buf[..n]).await?;
            transferred.fetch_add(n as u64, Ordering::Relaxed);
            continue;
        };

        pending.extend_from_slice(&buf[..n]);
        loop {
            let head = match http::parse_response_head(&pending) {
                Ok(Some(head)) => head,
                Ok(None) if pending.len() <= http::MAX_HEAD_BYTES => break,
                _ => {
                    // Not parseable as HTTP: stop watching, pass through.
                    debug!("Response head not inspectable, relaying opaquely");
                    inspector = None;
                    break;
                }
            };

            let rest = pending.split_off(head.head_len);
            // Interim responses are forwarded; the final one is inspected.
            if (100..200).contains(&head.status) && head.status != 101 {
                writer.write_all(&pending).await?;
                transferred.fetch_add(pending.len() as u64, Ordering::Relaxed);
                pending = rest;
                continue;
            }

            let out = match watcher.on_response_head(&head).await {
                InspectAction::Forward => std::mem::take(&mut pending),
                InspectAction::Replace(bytes) => bytes,
                InspectAction::Terminate(bytes) => {
                    writer.write_all(&bytes).await?;
                    transferred.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                    writer.shutdown().await?;
                    return Ok(());
                }
            };
            writer.write_all(&out).await?;
            transferred.fetch_add(out.len() as u64, Ordering::Relaxed);
            pending = rest;
            inspector = None;
            break;
        }

        if inspector.is_none() && !pending.is_empty() {
            writer.write_all(&pending).await?;
            transferred.fetch_add(pending.len() as u64, Ordering::Relaxed);
            pending.clear();
        }
    }
}
