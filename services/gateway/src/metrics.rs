//! Fire-and-forget reporting of proxied HTTP calls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

/// How a proxied call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// The backend answered with this status.
    Status(u16),
    /// No response head was relayed; reason code of the failure.
    Error(&'static str),
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Status(s) if *s < 500)
    }
}

/// One completed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMetric {
    pub virtual_host: String,
    pub method: String,
    pub path: String,
    pub backend: String,
    pub elapsed: Duration,
    pub outcome: CallOutcome,
}

/// Collector of call metrics. `record` must never block.
pub trait CallMetricsSink: Send + Sync {
    fn record(&self, metric: CallMetric);
}

/// Sink that forwards metrics over a bounded channel, dropping on overflow.
#[derive(Debug)]
pub struct ChannelMetricsSink {
    tx: mpsc::Sender<CallMetric>,
    dropped: AtomicU64,
}

impl ChannelMetricsSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<CallMetric>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Metrics discarded because the collector fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl CallMetricsSink for ChannelMetricsSink {
    fn record(&self, metric: CallMetric) {
        if self.tx.try_send(metric).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}
