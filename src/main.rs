// ===============================
// src/main.rs
// ===============================
/*
 # connector health
curl -s localhost:9898/metrics | egrep '^(connector_connected|connector_reconnects_total|connector_last_event_ts)'

 # ingest volume per source
curl -s localhost:9898/metrics | egrep '^(raw_events_total|accepted_events_total|duplicate_events_total)'

*/
/*
=============================================================================
Project : pm_trade_recorder - multi-source trade & market-context recorder
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Follows one account on a recurring-market exchange through the
          live market feed, the authenticated user feed, a REST poller and
          an on-chain monitor; dedups everything into per-market JSONL logs,
          correlates each trade with the surrounding book, and promotes
          finished markets to durable storage.
=============================================================================
*/
mod domain;
mod error;
mod config;
mod metrics;
mod backoff;
mod resolver;
mod normalizer;
mod dedup;
mod layout;
mod recorder;
mod merge;
mod price_history;
mod consolidate;
mod storage;
mod promoter;
mod ingest;
mod feed;           // market websocket + shared ws session
mod user_feed;      // authenticated user channel
mod poller;         // REST activity poll
mod chain;          // on-chain monitor

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::backoff::{supervise, ConnectionState, Session};
use crate::config::Archive;
use crate::domain::RawSourceEvent;
use crate::layout::Layout;
use crate::resolver::MarketIndex;
use crate::storage::{HttpObjectStore, LocalDirStore, ObjectStore};

/// Spawns a supervised connector with its own connection state.
fn spawn_connector<S>(
    name: &'static str,
    mut session: S,
    policy: backoff::RetryPolicy,
    stop: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    S: Session + 'static,
{
    tokio::spawn(async move {
        let mut state = ConnectionState::new(name, policy);
        supervise(&mut session, &mut state, stop, backoff::classify).await;
    })
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(?e, "SIGTERM handler unavailable, waiting for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Load config ----
    let settings = match config::load() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    // ---- Metrics ----
    metrics::init();
    if settings.metrics_port != 0 {
        tokio::spawn(metrics::serve_metrics(settings.metrics_port));
    }
    metrics::CONFIG_MODE.with_label_values(&[settings.mode.as_str()]).set(1);

    let archive = match &settings.archive {
        Archive::Disabled => "disabled".to_string(),
        Archive::Dir(d) => format!("dir:{}", d.display()),
        Archive::Http { url, .. } => format!("http:{url}"),
    };
    info!(
        mode = settings.mode.as_str(),
        account = %settings.account,
        out_dir = %settings.out_dir.display(),
        markets = ?settings.discovery.explicit,
        prefix = ?settings.discovery.prefix,
        period_secs = settings.discovery.period_secs,
        user_feed = settings.user_creds.is_some(),
        chain = settings.chain.is_some(),
        archive = %archive,
        window_ms = settings.ingest.merge.window.as_millis() as u64,
        inactivity_secs = settings.ingest.promotion.inactivity.as_secs(),
        metrics_port = settings.metrics_port,
        "startup config"
    );

    let http = match reqwest::Client::builder().timeout(Duration::from_secs(30)).build() {
        Ok(c) => c,
        Err(e) => {
            error!(?e, "http client init failed");
            std::process::exit(1);
        }
    };

    // ---- Buses ----
    let (raw_tx, raw_rx) = mpsc::channel::<RawSourceEvent>(8192);
    let (index_tx, index_rx) = watch::channel(Arc::new(MarketIndex::default()));
    let (stop_tx, stop_rx) = watch::channel(false);

    // ---- Market discovery ----
    let resolver = resolver::MarketResolver::new(http.clone(), settings.gamma_url.clone());
    let discovery = tokio::spawn(resolver::run_discovery(
        resolver,
        settings.discovery.clone(),
        index_tx,
        stop_rx.clone(),
    ));

    // ---- Connectors ----
    let mut connectors: Vec<JoinHandle<()>> = Vec::new();
    if settings.mode.runs_live() {
        let market = feed::WsFeed::new(
            feed::MarketChannel,
            settings.market_ws_url.clone(),
            settings.live,
            index_rx.clone(),
            raw_tx.clone(),
            stop_rx.clone(),
        );
        connectors.push(spawn_connector("market_feed", market, settings.retry, stop_rx.clone()));

        match settings.user_creds.clone() {
            Some(creds) => {
                let user = feed::WsFeed::new(
                    user_feed::UserChannel::new(creds),
                    settings.user_ws_url.clone(),
                    settings.live,
                    index_rx.clone(),
                    raw_tx.clone(),
                    stop_rx.clone(),
                );
                connectors.push(spawn_connector("user_feed", user, settings.retry, stop_rx.clone()));
            }
            None => warn!("no API credentials, user feed disabled"),
        }
    }
    if settings.mode.runs_poller() {
        let poll = poller::Poller::new(http.clone(), settings.poll.clone(), raw_tx.clone(), stop_rx.clone());
        connectors.push(spawn_connector("poll", poll, settings.retry, stop_rx.clone()));
    }
    if let Some(chain_cfg) = settings.chain.clone() {
        let monitor = chain::ChainMonitor::new(http.clone(), chain_cfg, index_rx.clone(), raw_tx.clone(), stop_rx.clone());
        connectors.push(spawn_connector("chain", monitor, settings.retry, stop_rx.clone()));
    }
    // the ingestor sees end-of-stream once every connector has dropped its sender
    drop(raw_tx);

    // ---- Ingest ----
    let store: Option<Arc<dyn ObjectStore>> = match &settings.archive {
        Archive::Disabled => None,
        Archive::Dir(root) => Some(Arc::new(LocalDirStore::new(root.clone()))),
        Archive::Http { url, token } => Some(Arc::new(HttpObjectStore::new(http.clone(), url.clone(), token.clone()))),
    };
    let layout = Layout::new(&settings.out_dir, &settings.account);
    let ingestor = ingest::Ingestor::new(settings.ingest.clone(), layout, store, index_rx).await;
    let ingest_handle = tokio::spawn(ingestor.run(raw_rx, stop_rx.clone()));

    // ---- Wait for shutdown ----
    shutdown_signal().await;
    info!(grace_secs = settings.shutdown_grace.as_secs(), "shutdown requested");
    let _ = stop_tx.send(true);

    // connectors and discovery stop promptly; the ingestor drains and promotes
    let drain = async move {
        for h in connectors {
            let _ = h.await;
        }
        let _ = discovery.await;
        ingest_handle.await
    };
    match tokio::time::timeout(settings.shutdown_grace, drain).await {
        Ok(Ok(())) => info!("shutdown complete"),
        Ok(Err(e)) => error!(?e, "ingest task failed"),
        Err(_) => warn!("shutdown grace elapsed before ingest finished"),
    }
}
