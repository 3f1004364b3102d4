// ===============================
// src/poller.rs
// ===============================
//
// Periodic REST poll of the account's recent trades:
//   GET <data-api>/activity?user=<account>&limit=<n>&type=TRADE
// Each array element becomes one raw event. Items older than the newest one
// already forwarded are held back; same-time overlap is left to the dedup
// store. 429 goes to the dedicated rate-limit ramp, a malformed body only
// skips the cycle.
//
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::backoff::{ConnectionState, Session};
use crate::domain::{now_ms, RawSourceEvent, SourceKind};
use crate::error::FeedError;
use crate::metrics::{LAST_EVENT_TS, MALFORMED};
use crate::normalizer::payload_time_ms;

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub base_url: String,
    pub account: String,
    pub limit: u32,
    pub interval: Duration,
}

pub struct Poller {
    http: reqwest::Client,
    cfg: PollSettings,
    tx: mpsc::Sender<RawSourceEvent>,
    stop: watch::Receiver<bool>,
    /// Newest event time forwarded so far.
    high_water_ms: Option<i64>,
}

impl Poller {
    pub fn new(
        http: reqwest::Client,
        cfg: PollSettings,
        tx: mpsc::Sender<RawSourceEvent>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self { http, cfg, tx, stop, high_water_ms: None }
    }

    /// Drops items older than the high-water mark and advances it.
    /// Items without a time always pass.
    pub fn fresh(&mut self, items: Vec<Value>) -> Vec<Value> {
        let mark = self.high_water_ms;
        let fresh: Vec<Value> = items
            .into_iter()
            .filter(|item| match (payload_time_ms(item), mark) {
                (Some(t), Some(m)) => t >= m,
                _ => true,
            })
            .collect();
        let newest = fresh.iter().filter_map(payload_time_ms).max();
        self.high_water_ms = mark.max(newest);
        fresh
    }

    /// One request; the items of the returned JSON array.
    pub async fn poll_once(&self) -> Result<Vec<Value>, FeedError> {
        let url = format!("{}/activity", self.cfg.base_url.trim_end_matches('/'));
        let limit = self.cfg.limit.to_string();
        let rsp = self
            .http
            .get(url)
            .timeout(Duration::from_secs(10))
            .query(&[("user", self.cfg.account.as_str()), ("limit", limit.as_str()), ("type", "TRADE")])
            .send()
            .await?;
        let status = rsp.status();
        if !status.is_success() {
            return Err(FeedError::from_status(status, "activity poll"));
        }
        let body = rsp.text().await?;
        match serde_json::from_str::<Value>(&body) {
            Ok(Value::Array(items)) => Ok(items),
            Ok(_) => Err(FeedError::MalformedPayload("activity poll: expected a JSON array".into())),
            Err(e) => Err(FeedError::MalformedPayload(format!("activity poll: {e}"))),
        }
    }
}

#[async_trait::async_trait]
impl Session for Poller {
    async fn run_once(&mut self, state: &mut ConnectionState) -> Result<(), FeedError> {
        loop {
            match self.poll_once().await {
                Ok(items) => {
                    state.on_connected();
                    let received = now_ms();
                    LAST_EVENT_TS.with_label_values(&[state.name]).set(received / 1000);
                    let total = items.len();
                    let items = self.fresh(items);
                    debug!(connector = state.name, total, fresh = items.len(), "poll ok");
                    for payload in items {
                        let ev = RawSourceEvent { source: SourceKind::Poll, received_at_ms: received, payload };
                        if self.tx.send(ev).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Err(FeedError::MalformedPayload(reason)) => {
                    MALFORMED.with_label_values(&[SourceKind::Poll.as_str()]).inc();
                    warn!(connector = state.name, %reason, "malformed poll response, skipping cycle");
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = sleep(self.cfg.interval) => {}
                Ok(()) = self.stop.changed() => {}
            }
            if *self.stop.borrow() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn poller(uri: String) -> (Poller, mpsc::Receiver<RawSourceEvent>, watch::Sender<bool>) {
        let (tx, rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let cfg = PollSettings { base_url: uri, account: "0xacc".into(), limit: 50, interval: Duration::from_millis(10) };
        (Poller::new(reqwest::Client::new(), cfg, tx, stop_rx), rx, stop_tx)
    }

    #[tokio::test]
    async fn items_of_array_are_returned() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/activity"))
            .and(query_param("user", "0xacc"))
            .and(query_param("limit", "50"))
            .and(query_param("type", "TRADE"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"[{"transactionHash":"0x1"},{"transactionHash":"0x2"}]"#))
            .mount(&server)
            .await;
        let (p, _rx, _stop) = poller(server.uri());
        assert_eq!(p.poll_once().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn too_many_requests_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(429)).mount(&server).await;
        let (p, _rx, _stop) = poller(server.uri());
        let err = p.poll_once().await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::RateLimited);
    }

    #[tokio::test]
    async fn server_error_is_transient_and_garbage_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(query_param("limit", "50"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(200).set_body_string("<html>")).mount(&server).await;
        let (p, _rx, _stop) = poller(server.uri());
        assert_eq!(p.poll_once().await.unwrap_err().class(), ErrorClass::Transient);
        assert!(matches!(p.poll_once().await.unwrap_err(), FeedError::MalformedPayload(_)));
    }

    #[tokio::test]
    async fn session_emits_each_item_and_stops() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"[{"id":"a"},{"id":"b"}]"#))
            .mount(&server)
            .await;
        let (mut p, mut rx, stop) = poller(server.uri());
        let task = tokio::spawn(async move {
            let mut st = ConnectionState::new(
                "poll",
                crate::backoff::RetryPolicy {
                    network: crate::backoff::BackoffConfig {
                        base: Duration::from_secs(1),
                        cap: Duration::from_secs(30),
                        jitter: Duration::ZERO,
                    },
                    rate_limit: crate::backoff::BackoffConfig {
                        base: Duration::from_secs(5),
                        cap: Duration::from_secs(120),
                        jitter: Duration::ZERO,
                    },
                },
            );
            p.run_once(&mut st).await
        });
        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert_eq!((a.payload["id"].as_str(), b.payload["id"].as_str()), (Some("a"), Some("b")));
        assert_eq!(a.source, SourceKind::Poll);
        stop.send(true).unwrap();
        // drain anything polled meanwhile so the sender never blocks
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        assert!(task.await.unwrap().is_ok());
    }

    #[test]
    fn older_items_are_held_back() {
        let (mut p, _rx, _stop) = poller("http://127.0.0.1:1".into());
        let first = vec![
            serde_json::json!({"transactionHash": "0x1", "timestamp": 1_760_000_000}),
            serde_json::json!({"transactionHash": "0x2", "timestamp": 1_760_000_005}),
        ];
        assert_eq!(p.fresh(first.clone()).len(), 2);

        let mut second = first;
        second.push(serde_json::json!({"transactionHash": "0x3", "timestamp": 1_760_000_009}));
        second.push(serde_json::json!({"transactionHash": "0x4", "timestamp": 1_760_000_005}));
        second.push(serde_json::json!({"id": "no-time"}));
        let kept: Vec<_> = p.fresh(second).into_iter().map(|v| v.to_string()).collect();
        assert_eq!(kept.len(), 4);
        assert!(!kept.iter().any(|k| k.contains("0x1")));
        assert!(kept.iter().any(|k| k.contains("0x4")));
    }

    #[tokio::test]
    async fn malformed_cycle_is_skipped_without_leaving_the_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"[{"id":"after"}]"#))
            .mount(&server)
            .await;
        let (mut p, mut rx, stop) = poller(server.uri());
        let task = tokio::spawn(async move {
            let c = crate::backoff::BackoffConfig { base: Duration::from_secs(1), cap: Duration::from_secs(30), jitter: Duration::ZERO };
            let mut st = ConnectionState::new("poll", crate::backoff::RetryPolicy { network: c, rate_limit: c });
            p.run_once(&mut st).await
        });

        // the next cycle follows after the 10ms poll interval, not a backoff delay
        let ev = tokio::time::timeout(Duration::from_millis(900), rx.recv()).await.unwrap().unwrap();
        assert_eq!(ev.payload["id"], "after");
        assert!(!task.is_finished());
        stop.send(true).unwrap();
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        assert!(task.await.unwrap().is_ok());
    }
}
