// ===============================
// src/feed.rs
// ===============================
//
// Live websocket connectors:
// - WsFeed<C>     : one supervised session per connect. Sends the channel's
//                   subscribe frame with every retained topic, pushes new topics
//                   as the market index grows, pings every `ping_interval` and
//                   drops the socket after `ping_interval * liveness_multiple`
//                   without any inbound traffic.
// - MarketChannel : public market channel, topics = outcome token ids.
//                   (the user channel lives in user_feed.rs)
//
// Frames: JSON object -> one raw event, JSON array -> one per element,
// non-JSON text (PONG) -> liveness only.
//
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::backoff::{ConnectionState, Session};
use crate::domain::{now_ms, RawSourceEvent, SourceKind};
use crate::error::FeedError;
use crate::metrics::LAST_EVENT_TS;
use crate::resolver::MarketIndex;

#[derive(Debug, Clone, Copy)]
pub struct LiveSettings {
    pub ping_interval: Duration,
    pub liveness_multiple: u32,
}

impl Default for LiveSettings {
    fn default() -> Self { Self { ping_interval: Duration::from_secs(5), liveness_multiple: 3 } }
}

impl LiveSettings {
    pub fn liveness_timeout(&self) -> Duration { self.ping_interval * self.liveness_multiple.max(1) }
}

/// What differs between the websocket channels.
pub trait Channel: Send + Sync {
    fn source(&self) -> SourceKind;

    /// Topics this channel should follow for the given index.
    fn topics(&self, index: &MarketIndex) -> Vec<String>;

    fn subscribe_frame(&self, topics: &[String]) -> Value;

    fn add_topics_frame(&self, topics: &[String]) -> Value;

    /// Inspects a text frame before it is emitted; an error ends the session.
    fn check_text(&self, _text: &str) -> Result<(), FeedError> { Ok(()) }
}

pub struct MarketChannel;

impl Channel for MarketChannel {
    fn source(&self) -> SourceKind { SourceKind::MarketFeed }

    fn topics(&self, index: &MarketIndex) -> Vec<String> { index.token_ids() }

    fn subscribe_frame(&self, topics: &[String]) -> Value { json!({"type": "market", "assets_ids": topics}) }

    fn add_topics_frame(&self, topics: &[String]) -> Value {
        json!({"assets_ids": topics, "operation": "subscribe"})
    }
}

/// Raw events carried by one text frame; `None` when the frame is not JSON.
pub fn frame_events(source: SourceKind, text: &str, received_at_ms: i64) -> Option<Vec<RawSourceEvent>> {
    let v: Value = serde_json::from_str(text).ok()?;
    let items = match v {
        Value::Array(items) => items,
        other => vec![other],
    };
    Some(
        items
            .into_iter()
            .filter(|p| !p.is_null())
            .map(|payload| RawSourceEvent { source, received_at_ms, payload })
            .collect(),
    )
}

pub struct WsFeed<C: Channel> {
    channel: C,
    url: String,
    live: LiveSettings,
    index: watch::Receiver<Arc<MarketIndex>>,
    tx: mpsc::Sender<RawSourceEvent>,
    stop: watch::Receiver<bool>,
}

impl<C: Channel> WsFeed<C> {
    pub fn new(
        channel: C,
        url: String,
        live: LiveSettings,
        index: watch::Receiver<Arc<MarketIndex>>,
        tx: mpsc::Sender<RawSourceEvent>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self { channel, url, live, index, tx, stop }
    }

    fn refresh_topics(&self, state: &mut ConnectionState) -> Vec<String> {
        let topics = self.channel.topics(&self.index.borrow());
        state.add_topics(topics)
    }

    /// Waits until there is something to subscribe to. False when stopping.
    async fn wait_for_topics(&mut self, state: &mut ConnectionState) -> bool {
        let dropped = state.sync_topics(self.channel.topics(&self.index.borrow()));
        if dropped > 0 {
            info!(connector = state.name, dropped, "topics left the index");
        }
        while state.subscribed_topics.is_empty() {
            tokio::select! {
                Ok(()) = self.index.changed() => { self.refresh_topics(state); }
                Ok(()) = self.stop.changed() => {}
                else => return false,
            }
            if *self.stop.borrow() {
                return false;
            }
        }
        true
    }

    /// Forwards the frame's events. False when the coordinator is gone.
    async fn emit(&self, state: &ConnectionState, text: &str) -> bool {
        let Some(events) = frame_events(self.channel.source(), text, now_ms()) else {
            debug!(connector = state.name, frame = %text, "non-JSON frame");
            return true;
        };
        LAST_EVENT_TS.with_label_values(&[state.name]).set(now_ms() / 1000);
        for ev in events {
            if self.tx.send(ev).await.is_err() {
                return false;
            }
        }
        true
    }
}

#[async_trait::async_trait]
impl<C: Channel> Session for WsFeed<C> {
    async fn run_once(&mut self, state: &mut ConnectionState) -> Result<(), FeedError> {
        if !self.wait_for_topics(state).await {
            return Ok(());
        }

        info!(connector = state.name, url = %self.url, topics = state.subscribed_topics.len(), "connecting");
        let (ws, resp) = connect_async(self.url.as_str()).await?;
        info!(connector = state.name, status = %resp.status(), "connected");
        state.on_connected();

        let (mut write, mut read) = ws.split();
        let topics: Vec<String> = state.subscribed_topics.iter().cloned().collect();
        write.send(Message::Text(self.channel.subscribe_frame(&topics).to_string())).await?;

        let timeout = self.live.liveness_timeout();
        let mut ping = interval_at(Instant::now() + self.live.ping_interval, self.live.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    if state.is_silent(timeout) {
                        warn!(connector = state.name, timeout_ms = timeout.as_millis() as u64, "no traffic, dropping connection");
                        return Err(FeedError::Disconnected("liveness timeout".into()));
                    }
                    write.send(Message::Text("PING".to_string())).await?;
                }
                Ok(()) = self.index.changed() => {
                    let added = self.refresh_topics(state);
                    if !added.is_empty() {
                        info!(connector = state.name, added = added.len(), "subscribing new topics");
                        write.send(Message::Text(self.channel.add_topics_frame(&added).to_string())).await?;
                    }
                }
                Ok(()) = self.stop.changed() => {
                    if *self.stop.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
                msg = read.next() => {
                    let Some(msg) = msg else {
                        return Err(FeedError::Disconnected("stream ended".into()));
                    };
                    state.mark_live();
                    match msg? {
                        Message::Text(text) => {
                            self.channel.check_text(&text)?;
                            if !self.emit(state, &text).await {
                                return Ok(());
                            }
                        }
                        Message::Ping(payload) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Message::Close(frame) => {
                            debug!(connector = state.name, ?frame, "server close");
                            return Err(FeedError::Disconnected("closed by server".into()));
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
