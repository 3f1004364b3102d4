// ===============================
// src/ingest.rs
// ===============================
//
// Coordinator task. Sole owner of the dedup store, the per-market write
// buffers, the market activity table and the merge / promotion schedule.
// Connectors only send RawSourceEvents into its channel.
//
//   raw -> normalize -> prefix filter -> dedup -> log buffer -> (flush)
//   every merge interval : re-merge markets that changed
//   every check interval : promote quiet markets
//   on stop              : drain, flush, merge, force-promote, save dedup state
//
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::consolidate;
use crate::dedup::DedupStore;
use crate::domain::{now_ms, RawSourceEvent};
use crate::layout::Layout;
use crate::merge::MergeSettings;
use crate::metrics::{ACCEPTED, DEDUP_SIZE, DUPLICATES, FILTERED, RAW_EVENTS, UNIDENTIFIED};
use crate::normalizer::normalize;
use crate::promoter::{PromotionSettings, Promoter};
use crate::recorder::{LogWriter, WriterSettings};
use crate::resolver::MarketIndex;
use crate::storage::ObjectStore;

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub market_prefix: Option<String>,
    pub attach_raw: bool,
    pub dedup_capacity: usize,
    pub merge: MergeSettings,
    pub merge_interval: Duration,
    pub writer: WriterSettings,
    pub promotion: PromotionSettings,
    pub heartbeat: Duration,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            market_prefix: None,
            attach_raw: false,
            dedup_capacity: crate::dedup::DEFAULT_CAPACITY,
            merge: MergeSettings::default(),
            merge_interval: Duration::from_secs(30),
            writer: WriterSettings::default(),
            promotion: PromotionSettings::default(),
            heartbeat: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    raw: u64,
    accepted: u64,
    duplicates: u64,
}

pub struct Ingestor {
    cfg: IngestSettings,
    layout: Layout,
    dedup: DedupStore,
    writer: LogWriter,
    promoter: Promoter,
    index: watch::Receiver<Arc<MarketIndex>>,
    dirty: BTreeSet<String>,
    tally: Tally,
}

impl Ingestor {
    pub async fn new(
        cfg: IngestSettings,
        layout: Layout,
        store: Option<Arc<dyn ObjectStore>>,
        index: watch::Receiver<Arc<MarketIndex>>,
    ) -> Self {
        let dedup = DedupStore::load(&layout.dedup_state(), cfg.dedup_capacity).await;
        DEDUP_SIZE.set(dedup.len() as i64);
        let writer = LogWriter::new(layout.clone(), cfg.writer.clone());
        let mut promoter = Promoter::new(layout.clone(), store, &cfg.promotion);
        if !promoter.enabled() {
            info!("ingest: no archive configured, artifacts stay local");
        }

        // Leftovers from a previous run age out like any other market.
        let now = now_ms();
        let mut dirty = BTreeSet::new();
        for m in layout.local_markets().await {
            info!(market = %m, "ingest: resuming local market");
            promoter.observe(&m, now);
            dirty.insert(m);
        }

        Self { cfg, layout, dedup, writer, promoter, index, dirty, tally: Tally::default() }
    }

    /// Normalizes, filters, dedups and buffers one raw frame.
    /// Returns the number of newly accepted events.
    pub fn accept(&mut self, raw: RawSourceEvent) -> usize {
        let source = raw.source.as_str();
        RAW_EVENTS.with_label_values(&[source]).inc();
        self.tally.raw += 1;

        let index = self.index.borrow().clone();
        let events = normalize(&raw, &index, self.cfg.attach_raw);
        if events.is_empty() {
            UNIDENTIFIED.inc();
            debug!(source, "ingest: frame without market identity dropped");
            return 0;
        }

        let mut accepted = 0;
        for ev in events {
            if let Some(prefix) = &self.cfg.market_prefix {
                if !ev.market_id.starts_with(prefix.as_str()) {
                    FILTERED.inc();
                    continue;
                }
            }
            if self.promoter.is_replay(&ev.market_id, ev.time_ms()) {
                debug!(market = %ev.market_id, key = %ev.dedup_key, "ingest: replay of a promoted market dropped");
                DUPLICATES.with_label_values(&[source]).inc();
                self.tally.duplicates += 1;
                continue;
            }
            if !self.dedup.check_and_insert(&ev.dedup_key) {
                DUPLICATES.with_label_values(&[source]).inc();
                self.tally.duplicates += 1;
                continue;
            }
            ACCEPTED.with_label_values(&[source]).inc();
            self.tally.accepted += 1;
            self.promoter.observe(&ev.market_id, raw.received_at_ms);
            self.dirty.insert(ev.market_id.clone());
            self.writer.append(&ev);
            accepted += 1;
        }
        DEDUP_SIZE.set(self.dedup.len() as i64);
        accepted
    }

    /// True when enough lines are buffered to flush ahead of the timer.
    pub fn flush_due(&self) -> bool { self.writer.pending() >= self.writer.settings().flush_every }

    pub async fn flush(&mut self) { self.writer.flush_all().await; }

    /// Rewrites the dedup state file when keys were added since the last save.
    pub async fn save_dedup(&mut self) {
        if !self.dedup.is_dirty() {
            return;
        }
        if let Err(e) = self.dedup.save(&self.layout.dedup_state()).await {
            warn!(error = %e, "ingest: dedup state not saved");
        }
    }

    /// Re-merges every market that received events since its last merge.
    pub async fn merge_dirty(&mut self) {
        let markets: Vec<String> = std::mem::take(&mut self.dirty).into_iter().collect();
        for m in markets {
            if !self.refresh(&m).await {
                self.dirty.insert(m);
            }
        }
    }

    async fn refresh(&mut self, market: &str) -> bool {
        if let Err(e) = self.writer.flush_market(market).await {
            error!(error = %e, %market, "ingest: flush before merge failed");
            return false;
        }
        match consolidate::refresh_market(&self.layout, market, &self.cfg.merge).await {
            Ok(out) => {
                debug!(%market, records = out.records, events = out.events, "ingest: merged");
                true
            }
            Err(e) => {
                error!(error = %e, %market, "ingest: merge failed");
                false
            }
        }
    }

    /// Promotes quiet markets, or every known market when `force` is set.
    /// Returns the markets promoted in this cycle.
    pub async fn promotion_cycle(&mut self, now: i64, force: bool) -> Vec<String> {
        if !self.promoter.enabled() {
            return Vec::new();
        }
        let candidates: Vec<String> = if force {
            let mut all: BTreeSet<String> = self.promoter.tracked().into_iter().collect();
            all.extend(self.layout.local_markets().await);
            all.into_iter().collect()
        } else {
            self.promoter.due(now)
        };

        let mut promoted = Vec::new();
        for m in candidates {
            if !self.refresh(&m).await {
                continue;
            }
            self.dirty.remove(&m);
            match self.promoter.promote(&m).await {
                Ok(files) => {
                    info!(market = %m, files, force, "ingest: market promoted");
                    promoted.push(m);
                }
                Err(e) => warn!(market = %m, error = %e, "ingest: promotion failed, retrying next cycle"),
            }
        }
        promoted
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<RawSourceEvent>, mut stop: watch::Receiver<bool>) {
        info!(dir = %self.layout.dir().display(), "ingest: started");
        let mut flush_tick = interval(self.cfg.writer.flush_interval);
        let mut merge_tick = interval(self.cfg.merge_interval);
        let mut promo_tick = interval(self.cfg.promotion.check_interval);
        let mut heartbeat = interval(self.cfg.heartbeat);
        for t in [&mut flush_tick, &mut merge_tick, &mut promo_tick, &mut heartbeat] {
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(raw) => {
                        self.accept(raw);
                        if self.flush_due() {
                            self.flush().await;
                        }
                    }
                    None => {
                        info!("ingest: all producers gone");
                        break;
                    }
                },
                _ = flush_tick.tick() => self.flush().await,
                _ = merge_tick.tick() => {
                    self.merge_dirty().await;
                    self.save_dedup().await;
                }
                _ = promo_tick.tick() => {
                    self.promotion_cycle(now_ms(), false).await;
                }
                _ = heartbeat.tick() => {
                    let t = std::mem::take(&mut self.tally);
                    info!(raw = t.raw, accepted = t.accepted, duplicates = t.duplicates,
                          dedup_keys = self.dedup.len(), markets = self.promoter.tracked().len(), "heartbeat");
                }
                Ok(()) = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
        self.shutdown(rx).await;
    }

    /// Final drain: nothing new is accepted from the channel after this returns.
    pub async fn shutdown(&mut self, mut rx: mpsc::Receiver<RawSourceEvent>) {
        rx.close();
        let mut drained = 0usize;
        while let Ok(raw) = rx.try_recv() {
            drained += self.accept(raw);
        }
        info!(drained, "ingest: stopping, final flush");
        self.flush().await;
        self.merge_dirty().await;
        let promoted = self.promotion_cycle(now_ms(), true).await;
        self.save_dedup().await;
        info!(promoted = promoted.len(), "ingest: stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MergedTradeRecord, SourceKind};
    use crate::promoter::tests::MemoryStore;
    use serde_json::json;

    async fn ingestor(dir: &std::path::Path, store: Option<Arc<MemoryStore>>) -> Ingestor {
        let (_tx, rx) = watch::channel(Arc::new(MarketIndex::default()));
        let store = store.map(|s| s as Arc<dyn ObjectStore>);
        Ingestor::new(IngestSettings::default(), Layout::new(dir, "0xacc"), store, rx).await
    }

    fn quote(market: &str, ts_ms: i64, received: i64) -> RawSourceEvent {
        RawSourceEvent {
            source: SourceKind::MarketFeed,
            received_at_ms: received,
            payload: json!({"event_type": "best_bid_ask", "slug": market, "asset_id": "1",
                            "best_bid": "0.4", "best_ask": "0.6", "timestamp": ts_ms.to_string()}),
        }
    }

    fn trade(source: SourceKind, tx: &str, ts: f64) -> RawSourceEvent {
        RawSourceEvent {
            source,
            received_at_ms: 1_760_000_000_000,
            payload: json!({"slug": "m", "transactionHash": tx, "timestamp": ts, "type": "TRADE",
                            "price": 0.5, "size": 2, "side": "BUY", "asset": "1"}),
        }
    }

    #[tokio::test]
    async fn same_frame_twice_is_accepted_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut ing = ingestor(dir.path(), None).await;
        let raw = quote("m", 1_760_000_000_000, 1_760_000_000_010);
        assert_eq!(ing.accept(raw.clone()), 1);
        assert_eq!(ing.accept(raw), 0);
        ing.flush().await;
        let text = tokio::fs::read_to_string(ing.layout.active_log("m")).await.unwrap();
        assert_eq!(text.lines().count(), 1);
    }

    #[tokio::test]
    async fn dedup_state_is_saved_with_merges_not_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let mut ing = ingestor(dir.path(), None).await;
        ing.accept(quote("m", 1_760_000_000_000, 1_760_000_000_010));
        ing.flush().await;
        assert!(tokio::fs::metadata(ing.layout.dedup_state()).await.is_err());
        ing.save_dedup().await;
        assert!(tokio::fs::metadata(ing.layout.dedup_state()).await.is_ok());
        assert!(!ing.dedup.is_dirty());
    }

    #[tokio::test]
    async fn prefix_filter_drops_other_markets() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = watch::channel(Arc::new(MarketIndex::default()));
        let cfg = IngestSettings { market_prefix: Some("btc-".into()), ..Default::default() };
        let mut ing = Ingestor::new(cfg, Layout::new(dir.path(), "0xacc"), None, rx).await;
        assert_eq!(ing.accept(quote("eth-1", 1, 1)), 0);
        assert_eq!(ing.accept(quote("btc-1", 1, 1)), 1);
    }

    #[tokio::test]
    async fn trade_from_poll_and_chain_merges_to_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut ing = ingestor(dir.path(), None).await;
        assert_eq!(ing.accept(trade(SourceKind::Poll, "0xabc", 1000.1)), 1);
        assert_eq!(ing.accept(trade(SourceKind::Chain, "0xabc", 1000.3)), 1);
        ing.merge_dirty().await;

        let body = tokio::fs::read(ing.layout.trades("m")).await.unwrap();
        let records: Vec<MergedTradeRecord> = serde_json::from_slice(&body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].transaction_id, "0xabc");
        assert_eq!(records[0].trade_time_ms, 1_000_100);
        assert_eq!(records[0].trade.sources, vec![SourceKind::Poll, SourceKind::Chain]);
    }

    #[tokio::test]
    async fn quiet_market_is_promoted_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let mut ing = ingestor(dir.path(), Some(store.clone())).await;
        let t0 = 1_760_000_000_000;
        ing.accept(quote("quiet", t0, t0));
        ing.accept(quote("busy", t0, t0));
        ing.accept(quote("busy", t0 + 300_000, t0 + 300_000));
        ing.flush().await;
        ing.merge_dirty().await;

        let promoted = ing.promotion_cycle(t0 + 301_000, false).await;
        assert_eq!(promoted, vec!["quiet".to_string()]);
        assert_eq!(
            *store.keys.lock().unwrap(),
            vec!["0xacc/quiet/quiet.events.jsonl", "0xacc/quiet/quiet.trades.json", "0xacc/quiet/quiet.prices.json"]
        );
        assert!(ing.layout.artifacts("quiet").await.is_empty());
        assert_eq!(ing.layout.artifacts("busy").await.len(), 3);

        assert!(ing.promotion_cycle(t0 + 302_000, false).await.is_empty());
        assert_eq!(store.keys.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn promoted_market_ignores_replayed_trades() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let (_tx, rx) = watch::channel(Arc::new(MarketIndex::default()));
        let cfg = IngestSettings { dedup_capacity: 4, ..Default::default() };
        let store_dyn: Arc<dyn ObjectStore> = store.clone();
        let mut ing = Ingestor::new(cfg, Layout::new(dir.path(), "0xacc"), Some(store_dyn), rx).await;

        let t0 = 1_760_000_000_000;
        let old_trade = RawSourceEvent {
            source: SourceKind::Poll,
            received_at_ms: t0,
            payload: json!({"slug": "old", "transactionHash": "0xold", "timestamp": t0 / 1000, "type": "TRADE",
                            "price": 0.5, "size": 2, "side": "BUY", "asset": "1"}),
        };
        assert_eq!(ing.accept(old_trade.clone()), 1);
        ing.accept(quote("busy", t0 + 300_000, t0 + 300_000));
        assert_eq!(ing.promotion_cycle(t0 + 301_000, false).await, vec!["old".to_string()]);

        // enough fresh keys to push the trade's key out of the dedup store
        for i in 1..=5 {
            ing.accept(quote("busy", t0 + 300_000 + i, t0 + 300_000 + i));
        }
        assert!(!ing.dedup.contains(&format!("tx:0xold:{t0}:old:trade")));

        assert_eq!(ing.accept(old_trade), 0);
        ing.flush().await;
        assert!(ing.layout.artifacts("old").await.is_empty());
        assert!(!ing.promoter.is_tracked("old"));
    }

    #[tokio::test]
    async fn shutdown_force_promotes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let mut ing = ingestor(dir.path(), Some(store.clone())).await;
        let (tx, rx) = mpsc::channel(8);
        let now = now_ms();
        tx.send(quote("a", now, now)).await.unwrap();
        tx.send(quote("b", now, now)).await.unwrap();
        ing.shutdown(rx).await;

        assert_eq!(store.keys.lock().unwrap().len(), 6);
        assert!(ing.layout.local_markets().await.is_empty());
        assert!(tokio::fs::metadata(ing.layout.dedup_state()).await.is_ok());
    }
}
