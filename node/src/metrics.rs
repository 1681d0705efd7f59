//! # Prometheus Metrics
//!
//! Operational metrics for the gateway, rendered at `/metrics`. Everything
//! is registered in a dedicated [`prometheus::Registry`] under the `dedi`
//! prefix.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

use dedi_protocol::error::GatewayError;
use dedi_protocol::routing::RouteFailure;
use dedi_protocol::ErrorKind;

#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    /// Proxy requests by outcome: `ok`, `no_route`, `remote_failure`,
    /// `timeout`, `error`.
    pub proxy_requests_total: IntCounterVec,
    /// Wall time of successful proxy requests.
    pub proxy_latency_seconds: Histogram,
    /// Proof submissions by outcome: `admitted`, `rejected`.
    pub admissions_total: IntCounterVec,
    /// Live outbound sessions.
    pub connected_peers: IntGauge,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("dedi".into()), None)?;

        let proxy_requests_total = IntCounterVec::new(
            Opts::new("proxy_requests_total", "Proxy requests by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(proxy_requests_total.clone()))?;

        let proxy_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "proxy_latency_seconds",
                "Latency of answered proxy requests in seconds",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
        )?;
        registry.register(Box::new(proxy_latency_seconds.clone()))?;

        let admissions_total = IntCounterVec::new(
            Opts::new("admissions_total", "Proof submissions by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(admissions_total.clone()))?;

        let connected_peers = IntGauge::new("connected_peers", "Live outbound peer sessions")?;
        registry.register(Box::new(connected_peers.clone()))?;

        Ok(Self {
            registry,
            proxy_requests_total,
            proxy_latency_seconds,
            admissions_total,
            connected_peers,
        })
    }

    pub fn record_proxy(&self, result: Result<std::time::Duration, &GatewayError>) {
        let outcome = match result {
            Ok(elapsed) => {
                self.proxy_latency_seconds.observe(elapsed.as_secs_f64());
                "ok"
            }
            Err(GatewayError::Route(e)) => match e.kind() {
                RouteFailure::NoRoute => "no_route",
                RouteFailure::RemoteFailure => "remote_failure",
                RouteFailure::Timeout => "timeout",
            },
            Err(_) => "error",
        };
        self.proxy_requests_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_admission<T>(&self, result: &Result<T, GatewayError>) {
        let outcome = match result {
            Ok(_) => "admitted",
            Err(e) if e.kind() == ErrorKind::Admission => "rejected",
            Err(_) => "error",
        };
        self.admissions_total.with_label_values(&[outcome]).inc();
    }

    /// Render every registered metric in the text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<GatewayMetrics>;

/// `GET /metrics`.
pub async fn metrics_handler(State(metrics): State<SharedMetrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dedi_protocol::admission::AdmissionError;
    use dedi_protocol::routing::RouteError;

    #[test]
    fn outcomes_are_labelled() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.record_proxy(Ok(std::time::Duration::from_millis(12)));
        metrics.record_proxy(Err(&RouteError::NoRouteAvailable {
            network_id: "n".into(),
        }
        .into()));
        metrics.record_admission::<()>(&Err(AdmissionError::ReusedNonce.into()));

        assert_eq!(
            metrics.proxy_requests_total.with_label_values(&["ok"]).get(),
            1
        );
        assert_eq!(
            metrics
                .proxy_requests_total
                .with_label_values(&["no_route"])
                .get(),
            1
        );
        assert_eq!(
            metrics.admissions_total.with_label_values(&["rejected"]).get(),
            1
        );

        let text = metrics.encode().unwrap();
        assert!(text.contains("dedi_proxy_requests_total"));
        assert!(text.contains("dedi_connected_peers"));
    }
}
