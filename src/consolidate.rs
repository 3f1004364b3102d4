// ===============================
// src/consolidate.rs
// ===============================
//
// Reads a market's log segments back, re-runs the merge and rewrites the two
// derived artifacts (`trades.json`, `prices.json`) via temp file + rename.
//
use std::path::Path;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, warn};

use crate::domain::CanonicalEvent;
use crate::error::StoreError;
use crate::layout::Layout;
use crate::merge::{merge_market, MergeSettings};
use crate::metrics::{MALFORMED, MERGED_RECORDS, MERGE_RUNS};
use crate::price_history;

#[derive(Debug, Default)]
pub struct LoadedLog {
    pub events: Vec<CanonicalEvent>,
    pub malformed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub events: usize,
    pub records: usize,
    pub malformed: usize,
}

/// All events of a market, segment by segment. Unparseable lines are skipped.
pub async fn read_log(layout: &Layout, market: &str) -> Result<LoadedLog, StoreError> {
    let mut out = LoadedLog::default();
    for path in layout.log_segments(market).await {
        let file = tokio::fs::File::open(&path).await?;
        let mut lines = tokio::io::BufReader::new(file).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CanonicalEvent>(&line) {
                Ok(ev) => out.events.push(ev),
                Err(e) => {
                    out.malformed += 1;
                    debug!(?e, path = %path.display(), "consolidate: malformed line skipped");
                }
            }
        }
    }
    Ok(out)
}

pub async fn write_json_atomic(path: &Path, body: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Re-derives `trades.json` and `prices.json` from the full log of `market`.
pub async fn refresh_market(layout: &Layout, market: &str, cfg: &MergeSettings) -> Result<RefreshOutcome, StoreError> {
    let log = read_log(layout, market).await?;
    if log.malformed > 0 {
        MALFORMED.with_label_values(&["log"]).inc_by(log.malformed as u64);
        warn!(%market, malformed = log.malformed, "consolidate: skipped malformed log lines");
    }

    let records = merge_market(market, &log.events, cfg);
    let history = price_history::build(market, &log.events, &records);

    write_json_atomic(&layout.trades(market), &serde_json::to_vec_pretty(&records)?).await?;
    write_json_atomic(&layout.prices(market), &serde_json::to_vec_pretty(&history)?).await?;

    MERGE_RUNS.inc();
    MERGED_RECORDS.set(records.len() as i64);
    debug!(%market, events = log.events.len(), records = records.len(), "consolidate: market refreshed");
    Ok(RefreshOutcome { events: log.events.len(), records: records.len(), malformed: log.malformed })
}
