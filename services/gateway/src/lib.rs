//! Multi-protocol detecting gateway.
//!
//! Clients of several wire protocols share one listening port. For every
//! accepted connection the gateway:
//! - identifies the protocol from the first bytes
//! - decodes just enough of the handshake to learn the virtual host
//! - picks a backend advertising that virtual host for the protocol
//! - replays the buffered handshake and relays bytes both ways
//!
//! ## Usage
//!
//! ```ignore
//! let registry = Arc::new(ServiceRegistry::new());
//! registry.upsert(ServiceEndpoint::new("broker0", vec!["stomp://10.0.0.5:61613".into()]));
//!
//! let config = GatewayConfig::new("[::]:61613".parse()?);
//! let gateway = Gateway::bind(config, registry, Strategy::RoundRobin.build()).await?;
//! Arc::new(gateway).run().await?;
//! ```

pub mod backend;
pub mod balancer;
pub mod bridge;
pub mod discovery;
pub mod error;
pub mod hook;
pub mod listener;
pub mod metrics;
pub mod registry;
pub mod session;
pub mod tls;

pub use balancer::{
    LoadBalancer, NoCandidates, RandomBalancer, RoundRobinBalancer, SharedBalancer,
    StickyBalancer, StickyCache, Strategy,
};
pub use bridge::{BridgeConfig, RelayStats};
pub use discovery::FileDiscovery;
pub use error::GatewayError;
pub use hook::{HttpInterceptor, Verdict};
pub use listener::{Gateway, GatewayConfig, GatewayStats, StickyKeySource};
pub use metrics::{CallMetric, CallMetricsSink, CallOutcome, ChannelMetricsSink};
pub use registry::{Candidate, RouteKey, ServiceEndpoint, ServiceRegistry, SharedRegistry};
pub use session::{CloseReason, ConnectionSession, SessionState};
pub use tls::TlsMode;
