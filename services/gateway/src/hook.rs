//! HTTP interception hook.
//!
//! An optional policy component sees the decoded request head before it is
//! replayed to the backend, and the first response head before it reaches
//! the client. Only the first exchange of a connection is decoded; later
//! keep-alive traffic is relayed opaquely.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use protogate_detect::http::{self, RequestHead, ResponseHead};
use tracing::debug;

use crate::bridge::{InspectAction, ResponseInspector};
use crate::metrics::{CallMetric, CallMetricsSink, CallOutcome};

/// Decision of an interceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Forward unchanged.
    Pass,
    /// Refuse with this status and message.
    Reject { status: u16, message: String },
    /// Forward with these headers instead.
    Rewrite(Vec<(String, String)>),
}

/// Policy hook for HTTP calls.
#[async_trait]
pub trait HttpInterceptor: Send + Sync {
    async fn on_request(&self, request: &RequestHead) -> Verdict;

    async fn on_response(&self, _request: &RequestHead, _response: &ResponseHead) -> Verdict {
        Verdict::Pass
    }
}

/// Tracks the first exchange of an HTTP connection while it is bridged.
pub struct HttpExchange {
    request: RequestHead,
    virtual_host: String,
    backend: String,
    started: Instant,
    interceptor: Option<Arc<dyn HttpInterceptor>>,
    metrics: Option<Arc<dyn CallMetricsSink>>,
    reported: bool,
}

impl HttpExchange {
    pub fn new(
        request: RequestHead,
        virtual_host: String,
        backend: String,
        interceptor: Option<Arc<dyn HttpInterceptor>>,
        metrics: Option<Arc<dyn CallMetricsSink>>,
    ) -> Self {
        Self {
            request,
            virtual_host,
            backend,
            started: Instant::now(),
            interceptor,
            metrics,
            reported: false,
        }
    }

    fn report(&mut self, outcome: CallOutcome) {
        if self.reported {
            return;
        }
        self.reported = true;
        if let Some(metrics) = &self.metrics {
            metrics.record(CallMetric {
                virtual_host: self.virtual_host.clone(),
                method: self.request.method.clone(),
                path: self.request.path.clone(),
                backend: self.backend.clone(),
                elapsed: self.started.elapsed(),
                outcome,
            });
        }
    }

    /// Report a call that ended without a response head.
    pub fn finish_without_response(&mut self, reason_code: &'static str) {
        self.report(CallOutcome::Error(reason_code));
    }
}

#[async_trait]
impl ResponseInspector for HttpExchange {
    async fn on_response_head(&mut self, head: &ResponseHead) -> InspectAction {
        let verdict = match &self.interceptor {
            Some(interceptor) => interceptor.on_response(&self.request, head).await,
            None => Verdict::Pass,
        };

        match verdict {
            Verdict::Pass => {
                self.report(CallOutcome::Status(head.status));
                InspectAction::Forward
            }
            Verdict::Rewrite(headers) => {
                self.report(CallOutcome::Status(head.status));
                let mut head = head.clone();
                head.headers = headers;
                InspectAction::Replace(head.encode())
            }
            Verdict::Reject { status, message } => {
                debug!(status = status, "Response rejected by interceptor");
                self.report(CallOutcome::Status(status));
                InspectAction::Terminate(http::response(status, &message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ChannelMetricsSink;
    use protogate_detect::http::{parse_request_head, parse_response_head};

    struct StripServerHeader;

    #[async_trait]
    impl HttpInterceptor for StripServerHeader {
        async fn on_request(&self, _request: &RequestHead) -> Verdict {
            Verdict::Pass
        }

        async fn on_response(&self, _request: &RequestHead, response: &ResponseHead) -> Verdict {
            let headers = response
                .headers
                .iter()
                .filter(|(k, _)| !k.eq_ignore_ascii_case("server"))
                .cloned()
                .collect();
            Verdict::Rewrite(headers)
        }
    }

    fn request() -> RequestHead {
        parse_request_head(b"GET /a HTTP/1.1\r\nHost: api\r\n\r\n")
            .unwrap()
            .unwrap()
    }

    fn response() -> ResponseHead {
        parse_response_head(b"HTTP/1.1 200 OK\r\nServer: x\r\nContent-Length: 0\r\n\r\n")
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_response_rewrite_and_metric() {
        let (sink, mut rx) = ChannelMetricsSink::new(4);
        let mut exchange = HttpExchange::new(
            request(),
            "api".into(),
            "10.0.0.1:80".into(),
            Some(Arc::new(StripServerHeader)),
            Some(Arc::new(sink)),
        );

        match exchange.on_response_head(&response()).await {
            InspectAction::Replace(bytes) => {
                assert_eq!(bytes, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec())
            }
            other => panic!("Expected Replace, got {:?}", other),
        }

        let metric = rx.recv().await.unwrap();
        assert_eq!(metric.outcome, CallOutcome::Status(200));
        assert_eq!(metric.method, "GET");

        // Reported once only.
        exchange.finish_without_response("relay_error");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_interceptor_forwards() {
        let mut exchange = HttpExchange::new(request(), "api".into(), "b".into(), None, None);
        assert_eq!(
            exchange.on_response_head(&response()).await,
            InspectAction::Forward
        );
    }
}
