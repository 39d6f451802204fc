// ===============================
// src/metrics.rs
// ===============================
use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Request, Response, Server};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Delivery pipeline --------
pub static DELIVERIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("deliveries_total", "deliveries settled (labels: queue, outcome)"),
        &["queue", "outcome"],
    )
    .unwrap()
});

pub static DECODE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("decode_errors_total", "malformed payloads per provider"),
        &["provider"],
    )
    .unwrap()
});

pub static PERSIST_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("persist_errors_total", "messages whose ticks were not all created"),
        &["queue"],
    )
    .unwrap()
});

pub static TICKS_BY_SYMBOL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_persisted_total", "ticks created per symbol"),
        &["symbol"],
    )
    .unwrap()
});

// Lenient numeric parsing: field left at 0 instead of failing the message
pub static NUMERIC_FALLBACKS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "numeric_parse_fallbacks_total",
            "numeric fields that failed to parse and were stored as 0 (labels: provider, field)",
        ),
        &["provider", "field"],
    )
    .unwrap()
});

// Persist latency per delivery (milliseconds)
pub static PERSIST_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        "persist_latency_ms",
        "Time spent persisting one delivery's ticks (ms)",
    ))
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_BINDING: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_binding", "configured bindings (labels: provider, queue)"),
        &["provider", "queue"],
    )
    .unwrap()
});

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(DELIVERIES.clone())),
        REGISTRY.register(Box::new(DECODE_ERRORS.clone())),
        REGISTRY.register(Box::new(PERSIST_ERRORS.clone())),
        REGISTRY.register(Box::new(TICKS_BY_SYMBOL.clone())),
        REGISTRY.register(Box::new(NUMERIC_FALLBACKS.clone())),
        REGISTRY.register(Box::new(PERSIST_LATENCY.clone())),
        REGISTRY.register(Box::new(CONFIG_BINDING.clone())),
    ] {
        if let Err(e) = m {
            error!(?e, "metric registration failed");
        }
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let resp = match req.uri().path() {
        "/" | "/metrics" => Response::builder()
            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
            .body(Body::from(encode_metrics())),
        _ => Response::builder().status(404).body(Body::from("not found\n")),
    };
    Ok(resp.unwrap_or_else(|_| Response::new(Body::empty())))
}

pub async fn serve_metrics(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });

    let server = match Server::try_bind(&addr) {
        Ok(b) => b.serve(make_svc),
        Err(e) => {
            error!(?e, %addr, "metrics bind failed");
            return;
        }
    };
    info!("metrics listening on http://{addr}/ (and /metrics)");
    if let Err(e) = server.await {
        error!(?e, "metrics server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn metrics_endpoint_renders_registry() {
        init();
        DELIVERIES.with_label_values(&["test-queue", "ack"]).inc();
        TICKS_BY_SYMBOL.with_label_values(&["TEST-SYM"]).inc();

        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = handle(req).await.unwrap();
        assert_eq!(resp.status(), 200);
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("deliveries_total"));
        assert!(text.contains("ticks_persisted_total{symbol=\"TEST-SYM\"}"));
        assert!(!text.lines().any(|l| l.starts_with("ticks_persisted ")));

        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        assert_eq!(handle(req).await.unwrap().status(), 404);
    }
}
