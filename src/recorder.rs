// ===============================
// src/recorder.rs
// ===============================
//
// Per-market JSONL append log, owned by the ingest coordinator:
// - `append` serializes an accepted event into the market's buffer.
// - Buffers are flushed by the coordinator every flush interval and whenever
//   `flush_every` lines are pending, whichever comes first.
// - Parent directory is created on demand; the file is opened in append mode.
// - A failed write keeps the lines buffered; they are retried on the next flush.
// - Once the active segment reaches `rotate_bytes` it is renamed to
//   `<market>.events.<n>.jsonl`; segments are never truncated.
//
// Durability is best-effort: lines accepted but not yet flushed are lost if
// the process dies. Nothing here fsyncs.
//
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
};
use tracing::{debug, error, info};

use crate::domain::CanonicalEvent;
use crate::error::StoreError;
use crate::layout::Layout;
use crate::metrics::{FLUSHES, FLUSH_ERRORS};

#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub flush_interval: Duration,
    pub flush_every: usize,
    pub rotate_bytes: u64,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self { flush_interval: Duration::from_secs(1), flush_every: 1000, rotate_bytes: 64 * 1024 * 1024 }
    }
}

pub struct LogWriter {
    layout: Layout,
    cfg: WriterSettings,
    buffers: BTreeMap<String, Vec<String>>,
    pending: usize,
}

impl LogWriter {
    pub fn new(layout: Layout, cfg: WriterSettings) -> Self {
        Self { layout, cfg, buffers: BTreeMap::new(), pending: 0 }
    }

    pub fn settings(&self) -> &WriterSettings { &self.cfg }

    /// Buffers one event for its market.
    pub fn append(&mut self, ev: &CanonicalEvent) {
        match serde_json::to_string(ev) {
            Ok(line) => {
                self.buffers.entry(ev.market_id.clone()).or_default().push(line);
                self.pending += 1;
            }
            Err(e) => error!(?e, market = %ev.market_id, "recorder: serialize error, skip event"),
        }
    }

    pub fn pending(&self) -> usize { self.pending }

    pub fn buffered(&self, market: &str) -> usize { self.buffers.get(market).map_or(0, Vec::len) }

    /// Writes the market's buffered lines. On error they stay buffered.
    pub async fn flush_market(&mut self, market: &str) -> Result<usize, StoreError> {
        let Some(lines) = self.buffers.remove(market) else {
            return Ok(0);
        };
        if lines.is_empty() {
            return Ok(0);
        }
        match self.write_lines(market, &lines).await {
            Ok(()) => {
                self.pending = self.pending.saturating_sub(lines.len());
                FLUSHES.inc();
                debug!(%market, lines = lines.len(), "recorder: flushed");
                Ok(lines.len())
            }
            Err(e) => {
                FLUSH_ERRORS.inc();
                self.buffers.insert(market.to_string(), lines);
                Err(e)
            }
        }
    }

    /// Flushes every market; failures are logged and retried next time.
    pub async fn flush_all(&mut self) -> usize {
        let markets: Vec<String> = self.buffers.keys().cloned().collect();
        let mut written = 0;
        for m in markets {
            match self.flush_market(&m).await {
                Ok(n) => written += n,
                Err(e) => error!(error = %e, market = %m, "recorder: flush failed, lines kept for retry"),
            }
        }
        written
    }

    async fn write_lines(&self, market: &str, lines: &[String]) -> Result<(), StoreError> {
        let path = self.layout.active_log(market);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        let mut writer = BufWriter::new(file);
        for line in lines {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        writer.flush().await?;
        drop(writer);

        let len = fs::metadata(&path).await?.len();
        if len >= self.cfg.rotate_bytes {
            self.rotate(market, &path).await?;
        }
        Ok(())
    }

    async fn rotate(&self, market: &str, active: &Path) -> Result<(), StoreError> {
        let n = self.layout.rotated_segments(market).await.len() as u32 + 1;
        let target = self.layout.segment(market, n);
        fs::rename(active, &target).await?;
        info!(%market, segment = n, path = %target.display(), "recorder: log rotated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventType, SourceKind};

    fn ev(market: &str, i: i64) -> CanonicalEvent {
        CanonicalEvent {
            event_time_ms: Some(1_000 + i),
            receipt_time_ms: 1_000 + i,
            source: SourceKind::MarketFeed,
            market_id: market.to_string(),
            asset_id: Some("1".into()),
            event_type: EventType::PriceChange,
            price: Some(0.5),
            size: None,
            best_bid: Some(0.49),
            best_ask: Some(0.51),
            mid: Some(0.5),
            spread: Some(0.02),
            side: None,
            outcome: None,
            usdc_size: None,
            transaction_id: None,
            dedup_key: format!("raw:{i}"),
            raw: None,
        }
    }

    #[tokio::test]
    async fn lines_appended_in_acceptance_order() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path(), "0xacc");
        let mut w = LogWriter::new(layout.clone(), WriterSettings { flush_every: 3, ..Default::default() });
        w.append(&ev("m", 2));
        w.append(&ev("m", 1));
        w.append(&ev("other", 0));
        assert_eq!(w.pending(), 3);
        assert_eq!(w.buffered("m"), 2);
        assert_eq!(w.flush_all().await, 3);
        assert_eq!(w.pending(), 0);

        let text = tokio::fs::read_to_string(layout.active_log("m")).await.unwrap();
        let keys: Vec<String> = text
            .lines()
            .map(|l| serde_json::from_str::<CanonicalEvent>(l).unwrap().dedup_key)
            .collect();
        assert_eq!(keys, vec!["raw:2", "raw:1"]);
    }

    #[tokio::test]
    async fn rotates_without_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path(), "0xacc");
        let mut w = LogWriter::new(layout.clone(), WriterSettings { rotate_bytes: 200, ..Default::default() });
        for i in 0..3 {
            w.append(&ev("m", i));
            w.flush_market("m").await.unwrap();
        }
        let segs = layout.log_segments("m").await;
        assert!(segs.len() >= 2, "expected rotation, got {segs:?}");
        let mut total = 0;
        for p in segs {
            total += tokio::fs::read_to_string(p).await.unwrap().lines().count();
        }
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn failed_flush_keeps_lines() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("out");
        tokio::fs::write(&blocker, b"not a directory").await.unwrap();
        let layout = Layout::new(&blocker, "0xacc");
        let mut w = LogWriter::new(layout, WriterSettings::default());
        w.append(&ev("m", 0));
        assert!(w.flush_market("m").await.is_err());
        assert_eq!(w.buffered("m"), 1);

        tokio::fs::remove_file(&blocker).await.unwrap();
        assert_eq!(w.flush_market("m").await.unwrap(), 1);
        assert_eq!(w.buffered("m"), 0);
    }
}
