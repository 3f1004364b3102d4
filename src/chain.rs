// ===============================
// src/chain.rs
// ===============================
//
// On-chain transaction monitor.
// - New heads from `eth_subscribe["newHeads"]` when a websocket RPC is
//   configured, otherwise (or when it cannot connect) HTTP polling of
//   `eth_blockNumber` every poll interval.
// - Each new block is fetched with full transactions; at most `max_catchup`
//   blocks are processed per head.
// - Cheap filter first: only transactions sent from or to the account.
// - Tagging: the call data is searched for every known outcome token id
//   rendered as a 32-byte big-endian word; the first hit names the market.
//
use futures_util::{SinkExt, StreamExt};
use num_bigint::BigUint;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::backoff::{ConnectionState, Session};
use crate::domain::{now_ms, RawSourceEvent, SourceKind};
use crate::error::FeedError;
use crate::metrics::LAST_EVENT_TS;
use crate::resolver::MarketIndex;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub rpc_url: String,
    pub ws_url: Option<String>,
    /// Lowercase 0x address.
    pub account: String,
    pub poll_interval: Duration,
    pub max_catchup: u64,
    /// A websocket without any head for this long is reconnected.
    pub head_timeout: Duration,
}

/// Decimal token id -> 64 lowercase hex digits, as it appears in ABI-encoded call data.
pub fn token_word(token_id: &str) -> Option<String> {
    let n = BigUint::parse_bytes(token_id.trim().as_bytes(), 10)?;
    let hex = n.to_str_radix(16);
    (hex.len() <= 64).then(|| format!("{hex:0>64}"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenPattern {
    pub word: String,
    pub token_id: String,
    pub slug: String,
}

pub fn patterns(index: &MarketIndex) -> Vec<TokenPattern> {
    index
        .markets()
        .flat_map(|m| {
            m.outcomes.iter().filter_map(move |(token, _)| {
                token_word(token).map(|word| TokenPattern { word, token_id: token.clone(), slug: m.slug.clone() })
            })
        })
        .collect()
}

fn parse_hex_u64(v: &Value) -> Option<u64> {
    let s = v.as_str()?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

/// Chain payload for a transaction of the account that touches a known token.
pub fn tag_transaction(tx: &Value, block: &Value, account: &str, patterns: &[TokenPattern]) -> Option<Value> {
    let from = tx.get("from").and_then(Value::as_str).unwrap_or_default().to_ascii_lowercase();
    let to = tx.get("to").and_then(Value::as_str).unwrap_or_default().to_ascii_lowercase();
    if from != account && to != account {
        return None;
    }
    let hash = tx.get("hash").and_then(Value::as_str)?;
    let input = tx.get("input").or_else(|| tx.get("data")).and_then(Value::as_str)?.to_ascii_lowercase();
    let Some(hit) = patterns.iter().find(|p| input.contains(&p.word)) else {
        debug!(%hash, "chain: account transaction without known token");
        return None;
    };
    Some(json!({
        "hash": hash,
        "blockNumber": block.get("number").cloned().unwrap_or(Value::Null),
        "blockTimestamp": block.get("timestamp").cloned().unwrap_or(Value::Null),
        "from": from,
        "to": to,
        "asset_id": hit.token_id,
        "slug": hit.slug,
    }))
}

struct Rpc {
    http: reqwest::Client,
    url: String,
}

impl Rpc {
    async fn call(&self, method: &str, params: Value) -> Result<Value, FeedError> {
        let payload = json!({"jsonrpc": "2.0", "method": method, "params": params, "id": 1});
        let rsp = self.http.post(&self.url).timeout(Duration::from_secs(10)).json(&payload).send().await?;
        if !rsp.status().is_success() {
            return Err(FeedError::from_status(rsp.status(), method));
        }
        let body: Value = serde_json::from_str(&rsp.text().await?)
            .map_err(|e| FeedError::MalformedPayload(format!("{method}: {e}")))?;
        if let Some(err) = body.get("error") {
            let msg = err.get("message").and_then(Value::as_str).unwrap_or_default();
            let code = err.get("code").and_then(Value::as_i64).unwrap_or_default();
            if code == -32005 || msg.to_ascii_lowercase().contains("rate") {
                return Err(FeedError::RateLimited(format!("{method}: {msg}")));
            }
            return Err(FeedError::Transient(format!("{method}: {code} {msg}")));
        }
        body.get("result")
            .cloned()
            .ok_or_else(|| FeedError::MalformedPayload(format!("{method}: no result")))
    }

    async fn block_number(&self) -> Result<u64, FeedError> {
        let v = self.call("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&v).ok_or_else(|| FeedError::MalformedPayload("eth_blockNumber: not a hex quantity".into()))
    }

    /// A block the node cannot serve yet (null result) is an error so the
    /// caller retries it instead of moving past it.
    async fn block(&self, n: u64) -> Result<Value, FeedError> {
        let block = self.call("eth_getBlockByNumber", json!([format!("0x{n:x}"), true])).await?;
        if !block.get("transactions").is_some_and(Value::is_array) {
            return Err(FeedError::Transient(format!("block 0x{n:x} not available yet")));
        }
        Ok(block)
    }
}

pub struct ChainMonitor {
    rpc: Rpc,
    cfg: ChainSettings,
    index: watch::Receiver<Arc<MarketIndex>>,
    tx: mpsc::Sender<RawSourceEvent>,
    stop: watch::Receiver<bool>,
    last_block: Option<u64>,
}

impl ChainMonitor {
    pub fn new(
        http: reqwest::Client,
        cfg: ChainSettings,
        index: watch::Receiver<Arc<MarketIndex>>,
        tx: mpsc::Sender<RawSourceEvent>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let rpc = Rpc { http, url: cfg.rpc_url.clone() };
        Self { rpc, cfg, index, tx, stop, last_block: None }
    }

    /// Processes blocks up to `head`. Returns the number of tagged transactions.
    pub async fn advance_to(&mut self, head: u64, state: &ConnectionState) -> Result<usize, FeedError> {
        let from = match self.last_block {
            Some(last) if head <= last => return Ok(0),
            Some(last) => (last + 1).max(head.saturating_sub(self.cfg.max_catchup.max(1) - 1)),
            None => head,
        };
        if let Some(last) = self.last_block {
            if from > last + 1 {
                warn!(connector = state.name, skipped = from - last - 1, "chain: too far behind, skipping blocks");
            }
        }
        let pats = patterns(&self.index.borrow());
        let mut tagged = 0;
        for n in from..=head {
            let block = self.rpc.block(n).await?;
            let txs = block.get("transactions").and_then(Value::as_array).cloned().unwrap_or_default();
            for tx in &txs {
                let Some(payload) = tag_transaction(tx, &block, &self.cfg.account, &pats) else {
                    continue;
                };
                tagged += 1;
                LAST_EVENT_TS.with_label_values(&[state.name]).set(now_ms() / 1000);
                let ev = RawSourceEvent::now(SourceKind::Chain, payload);
                if self.tx.send(ev).await.is_err() {
                    return Ok(tagged);
                }
            }
            self.last_block = Some(n);
        }
        Ok(tagged)
    }

    fn stopping(&self) -> bool { *self.stop.borrow() }

    async fn poll_heads(&mut self, state: &mut ConnectionState) -> Result<(), FeedError> {
        info!(connector = state.name, url = %self.cfg.rpc_url, "chain: polling heads over http");
        loop {
            let head = self.rpc.block_number().await?;
            state.on_connected();
            let tagged = self.advance_to(head, state).await?;
            if tagged > 0 {
                info!(connector = state.name, head, tagged, "chain: account transactions");
            }
            tokio::select! {
                _ = sleep(self.cfg.poll_interval) => {}
                Ok(()) = self.stop.changed() => {}
            }
            if self.stopping() {
                return Ok(());
            }
        }
    }

    async fn stream_heads(&mut self, ws: WsStream, state: &mut ConnectionState) -> Result<(), FeedError> {
        info!(connector = state.name, "chain: subscribed to new heads");
        state.on_connected();
        let (mut write, mut read) = ws.split();
        let sub = json!({"jsonrpc": "2.0", "id": 1, "method": "eth_subscribe", "params": ["newHeads"]});
        write.send(Message::Text(sub.to_string())).await?;

        let check = self.cfg.head_timeout / 2;
        let mut tick = interval_at(Instant::now() + check, check);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if state.is_silent(self.cfg.head_timeout) {
                        return Err(FeedError::Disconnected("no new heads".into()));
                    }
                }
                Ok(()) = self.stop.changed() => {
                    if self.stopping() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
                msg = read.next() => {
                    let Some(msg) = msg else {
                        return Err(FeedError::Disconnected("stream ended".into()));
                    };
                    match msg? {
                        Message::Text(text) => {
                            let Ok(v) = serde_json::from_str::<Value>(&text) else { continue };
                            let Some(head) = v.pointer("/params/result/number").and_then(parse_hex_u64) else {
                                continue;
                            };
                            state.mark_live();
                            self.advance_to(head, state).await?;
                        }
                        Message::Ping(p) => {
                            let _ = write.send(Message::Pong(p)).await;
                        }
                        Message::Close(_) => return Err(FeedError::Disconnected("closed by server".into())),
                        _ => {}
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Session for ChainMonitor {
    async fn run_once(&mut self, state: &mut ConnectionState) -> Result<(), FeedError> {
        if let Some(url) = self.cfg.ws_url.clone() {
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => return self.stream_heads(ws, state).await,
                Err(e) => warn!(connector = state.name, error = %e, "chain: websocket unavailable, falling back to http"),
            }
        }
        self.poll_heads(state).await
    }
}
