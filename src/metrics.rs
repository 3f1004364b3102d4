// ===============================
// src/metrics.rs
// ===============================
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Ingestion --------
pub static RAW_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("raw_events_total", "raw frames received per source"), &["source"]).unwrap()
});

pub static ACCEPTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("accepted_events_total", "canonical events accepted per source"),
        &["source"],
    )
    .unwrap()
});

pub static DUPLICATES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("duplicate_events_total", "canonical events rejected by the dedup store"),
        &["source"],
    )
    .unwrap()
});

pub static UNIDENTIFIED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("unidentified_frames_total", "frames dropped without a market identity").unwrap()
});

pub static FILTERED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("filtered_events_total", "events outside the market prefix filter").unwrap()
});

pub static MALFORMED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("malformed_frames_total", "frames skipped as malformed"), &["source"]).unwrap()
});

pub static DEDUP_SIZE: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("dedup_store_keys", "keys resident in the dedup store").unwrap());

// -------- Connector health --------
pub static CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("connector_connected", "1 if the connector session is up"), &["connector"]).unwrap()
});

pub static RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("connector_reconnects_total", "reconnect attempts"), &["connector"]).unwrap()
});

pub static RATE_LIMITED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("connector_rate_limited_total", "rate-limit responses"), &["connector"]).unwrap()
});

pub static LAST_EVENT_TS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("connector_last_event_ts", "Unix seconds of the last frame received"),
        &["connector"],
    )
    .unwrap()
});

// -------- Persistence --------
pub static FLUSHES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("log_flushes_total", "per-market log flushes").unwrap());

pub static FLUSH_ERRORS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("log_flush_errors_total", "failed per-market log flushes").unwrap());

pub static MERGE_RUNS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("merge_runs_total", "per-market merge runs").unwrap());

pub static MERGED_RECORDS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("merged_records_last", "records produced by the last merge").unwrap());

pub static UPLOADS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("artifact_uploads_total", "artifact uploads by result"), &["result"]).unwrap()
});

pub static ACTIVE_MARKETS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("active_markets", "markets with local artifacts").unwrap());

// ---- Config visibility ----
pub static CONFIG_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_mode", "operating mode (label: mode)"), &["mode"]).unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(RAW_EVENTS.clone())),
        REGISTRY.register(Box::new(ACCEPTED.clone())),
        REGISTRY.register(Box::new(DUPLICATES.clone())),
        REGISTRY.register(Box::new(UNIDENTIFIED.clone())),
        REGISTRY.register(Box::new(FILTERED.clone())),
        REGISTRY.register(Box::new(MALFORMED.clone())),
        REGISTRY.register(Box::new(DEDUP_SIZE.clone())),
        REGISTRY.register(Box::new(CONNECTED.clone())),
        REGISTRY.register(Box::new(RECONNECTS.clone())),
        REGISTRY.register(Box::new(RATE_LIMITED.clone())),
        REGISTRY.register(Box::new(LAST_EVENT_TS.clone())),
        REGISTRY.register(Box::new(FLUSHES.clone())),
        REGISTRY.register(Box::new(FLUSH_ERRORS.clone())),
        REGISTRY.register(Box::new(MERGE_RUNS.clone())),
        REGISTRY.register(Box::new(MERGED_RECORDS.clone())),
        REGISTRY.register(Box::new(UPLOADS.clone())),
        REGISTRY.register(Box::new(ACTIVE_MARKETS.clone())),
        REGISTRY.register(Box::new(CONFIG_MODE.clone())),
    ] {
        let _ = m;
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

async fn handle(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let body = encode_metrics();
    let resp = Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()));
    Ok(resp)
}

/// Serves every path (`/`, `/metrics`) with the registry contents.
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
    info!(%addr, "metrics listening on http://{addr}/ (and /metrics)");
    if let Err(e) = server.await {
        error!(?e, "metrics server error");
    }
}
