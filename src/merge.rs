// ===============================
// src/merge.rs
// ===============================
//
// Trade / market-context correlation for one market.
//
// `merge_market` is a pure function of the accumulated log: it re-derives every
// MergedTradeRecord from scratch, so running it twice over the same events
// (in any arrival order) yields byte-identical output.
//
//   trades    : trade events from user feed / poll / chain, one record per tx id
//   snapshots : market feed events carrying bid / ask / mid / price
//   window    : [t - W, t + W]; if empty, widen around the nearest snapshot s
//               when |s - t| <= fallback: [max(s - W, t - B), min(s + W, t + B)]
//
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::domain::{
    CanonicalEvent, EventType, MergedTradeRecord, PartitionCounts, RangeStats, SnapshotPartition, SnapshotPoint,
    SourceKind, TradeFields, WindowKind, WindowStats,
};

#[derive(Debug, Clone)]
pub struct MergeSettings {
    /// Primary half-width W.
    pub window: Duration,
    /// Max distance to the nearest snapshot for the fallback to apply.
    pub fallback: Duration,
    /// Secondary bound B around the trade time for the widened window.
    pub fallback_bound: Duration,
    /// Snapshot lists at or above this size are dropped, keeping only stats.
    pub max_raw_snapshots: usize,
    pub attach_raw: bool,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3),
            fallback: Duration::from_secs(30),
            fallback_bound: Duration::from_secs(30),
            max_raw_snapshots: 100,
            attach_raw: false,
        }
    }
}

pub fn round6(x: f64) -> f64 {
    let r = (x * 1e6).round() / 1e6;
    if r == 0.0 { 0.0 } else { r }
}

/// One trade, consolidated over every source that reported it.
#[derive(Debug)]
struct TradeGroup<'a> {
    tx: String,
    reports: Vec<&'a CanonicalEvent>,
}

impl<'a> TradeGroup<'a> {
    fn representative(&self) -> &'a CanonicalEvent {
        // reports are sorted by preference; never empty
        self.reports[0]
    }

    fn time_ms(&self) -> i64 { self.representative().time_ms() }

    fn fields(&self) -> TradeFields {
        fn pick<'e, T: Clone>(reports: &[&'e CanonicalEvent], f: impl Fn(&'e CanonicalEvent) -> Option<T>) -> Option<T> {
            reports.iter().find_map(|e| f(*e))
        }
        let r = &self.reports;
        let sources: BTreeSet<SourceKind> = r.iter().map(|e| e.source).collect();
        TradeFields {
            asset_id: pick(r, |e| e.asset_id.clone()),
            outcome: pick(r, |e| e.outcome.clone()),
            side: pick(r, |e| e.side),
            price: pick(r, |e| e.price),
            size: pick(r, |e| e.size),
            usdc_size: pick(r, |e| e.usdc_size),
            sources: sources.into_iter().collect(),
        }
    }
}

fn group_trades<'a>(events: &'a [CanonicalEvent]) -> Vec<TradeGroup<'a>> {
    let mut by_tx: BTreeMap<String, Vec<&'a CanonicalEvent>> = BTreeMap::new();
    for ev in events.iter().filter(|e| e.is_trade_record()) {
        if let Some(tx) = &ev.transaction_id {
            by_tx.entry(tx.to_ascii_lowercase()).or_default().push(ev);
        }
    }
    let mut groups: Vec<TradeGroup> = by_tx
        .into_iter()
        .map(|(tx, mut reports)| {
            reports.sort_by(|a, b| {
                (a.source.trade_priority(), a.time_ms(), &a.dedup_key)
                    .cmp(&(b.source.trade_priority(), b.time_ms(), &b.dedup_key))
            });
            TradeGroup { tx, reports }
        })
        .collect();
    groups.sort_by(|a, b| (a.time_ms(), &a.tx).cmp(&(b.time_ms(), &b.tx)));
    groups
}

fn snapshot_of(ev: &CanonicalEvent) -> Option<SnapshotPoint> {
    if !ev.is_market_snapshot() {
        return None;
    }
    let price = match ev.event_type {
        EventType::LastTradePrice | EventType::PriceChange | EventType::Trade => ev.price,
        _ => None,
    };
    if ev.best_bid.is_none() && ev.best_ask.is_none() && ev.mid.is_none() && price.is_none() {
        return None;
    }
    Some(SnapshotPoint {
        t: ev.time_ms(),
        asset_id: ev.asset_id.clone(),
        event_type: ev.event_type,
        bid: ev.best_bid,
        ask: ev.best_ask,
        mid: ev.mid,
        spread: ev.spread.or(match (ev.best_bid, ev.best_ask) {
            (Some(b), Some(a)) => Some(round6(a - b)),
            _ => None,
        }),
        price,
    })
}

/// Market snapshots of the log, ascending by time (dedup key breaks ties).
fn collect_snapshots(events: &[CanonicalEvent]) -> Vec<SnapshotPoint> {
    let mut keyed: Vec<(&str, SnapshotPoint)> =
        events.iter().filter_map(|e| snapshot_of(e).map(|p| (e.dedup_key.as_str(), p))).collect();
    keyed.sort_by(|a, b| (a.1.t, a.0).cmp(&(b.1.t, b.0)));
    keyed.into_iter().map(|(_, p)| p).collect()
}

fn in_range(snaps: &[SnapshotPoint], lo: i64, hi: i64) -> &[SnapshotPoint] {
    let start = snaps.partition_point(|p| p.t < lo);
    let end = snaps.partition_point(|p| p.t <= hi);
    &snaps[start..end.max(start)]
}

/// Time of the snapshot closest to `t`; the earlier one wins a tie.
fn nearest(snaps: &[SnapshotPoint], t: i64) -> Option<i64> {
    let i = snaps.partition_point(|p| p.t < t);
    let after = snaps.get(i).map(|p| p.t);
    let before = i.checked_sub(1).and_then(|j| snaps.get(j)).map(|p| p.t);
    match (before, after) {
        (Some(b), Some(a)) => Some(if t - b <= a - t { b } else { a }),
        (b, a) => b.or(a),
    }
}

fn range_stats(values: impl Iterator<Item = f64>) -> Option<RangeStats> {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;
    let mut count = 0usize;
    for v in values {
        min = min.min(v);
        max = max.max(v);
        sum += v;
        count += 1;
    }
    (count > 0).then(|| RangeStats { min: round6(min), max: round6(max), avg: round6(sum / count as f64), count })
}

fn window_stats(points: &[SnapshotPoint], trade_time: i64) -> WindowStats {
    WindowStats {
        snapshot_count: points.len(),
        bid: range_stats(points.iter().filter_map(|p| p.bid)),
        ask: range_stats(points.iter().filter_map(|p| p.ask)),
        spread: range_stats(points.iter().filter_map(|p| p.spread)),
        mid: range_stats(points.iter().filter_map(|p| p.mid)),
        last_trade_price: points
            .iter()
            .rev()
            .filter(|p| p.t <= trade_time && p.event_type == EventType::LastTradePrice)
            .find_map(|p| p.price)
            .map(round6),
    }
}

fn partition(points: &[SnapshotPoint], t: i64) -> SnapshotPartition {
    let mut out = SnapshotPartition::default();
    for p in points {
        let bucket = match p.t.cmp(&t) {
            std::cmp::Ordering::Less => &mut out.before,
            std::cmp::Ordering::Equal => &mut out.at,
            std::cmp::Ordering::Greater => &mut out.after,
        };
        bucket.push(p.clone());
    }
    out
}

/// Re-derives all merged trade records of one market, ordered by (trade time, tx id).
pub fn merge_market(market: &str, events: &[CanonicalEvent], cfg: &MergeSettings) -> Vec<MergedTradeRecord> {
    let w = cfg.window.as_millis() as i64;
    let fallback = cfg.fallback.as_millis() as i64;
    let bound = cfg.fallback_bound.as_millis() as i64;

    let snaps = collect_snapshots(events);
    group_trades(events)
        .into_iter()
        .map(|g| {
            let t = g.time_ms();
            let (mut kind, mut lo, mut hi) = (WindowKind::Primary, t.saturating_sub(w), t.saturating_add(w));
            let mut window = in_range(&snaps, lo, hi);

            if window.is_empty() {
                kind = WindowKind::Empty;
                if let Some(s) = nearest(&snaps, t).filter(|s| s.saturating_sub(t).saturating_abs() <= fallback) {
                    let (flo, fhi) = (s.saturating_sub(w).max(t.saturating_sub(bound)), s.saturating_add(w).min(t.saturating_add(bound)));
                    let widened = in_range(&snaps, flo, fhi);
                    if !widened.is_empty() {
                        kind = WindowKind::Fallback;
                        (lo, hi, window) = (flo, fhi, widened);
                    }
                }
            }

            let parts = partition(window, t);
            let counts = PartitionCounts { before: parts.before.len(), at: parts.at.len(), after: parts.after.len() };
            let truncated = window.len() >= cfg.max_raw_snapshots;
            let rep = g.representative();
            MergedTradeRecord {
                transaction_id: g.tx.clone(),
                market_id: market.to_string(),
                trade_time_ms: t,
                trade: g.fields(),
                window_kind: kind,
                window_start_ms: lo,
                window_end_ms: hi,
                counts,
                stats: (!window.is_empty()).then(|| window_stats(window, t)),
                snapshots: (!window.is_empty() && !truncated).then_some(parts),
                snapshots_truncated: !window.is_empty() && truncated,
                raw: if cfg.attach_raw { rep.raw.clone() } else { None },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use serde_json::json;

    fn snap(t_ms: i64, bid: f64, ask: f64) -> CanonicalEvent {
        CanonicalEvent {
            event_time_ms: Some(t_ms),
            receipt_time_ms: t_ms + 40,
            source: SourceKind::MarketFeed,
            market_id: "m".into(),
            asset_id: Some("111".into()),
            event_type: EventType::BestBidAsk,
            price: None,
            size: None,
            best_bid: Some(bid),
            best_ask: Some(ask),
            mid: Some(round6((bid + ask) / 2.0)),
            spread: Some(round6(ask - bid)),
            side: None,
            outcome: None,
            usdc_size: None,
            transaction_id: None,
            dedup_key: format!("raw:{t_ms}"),
            raw: None,
        }
    }

    fn trade(tx: &str, t_ms: i64, source: SourceKind) -> CanonicalEvent {
        CanonicalEvent {
            event_time_ms: Some(t_ms),
            receipt_time_ms: t_ms,
            source,
            market_id: "m".into(),
            asset_id: Some("111".into()),
            event_type: EventType::Trade,
            price: Some(0.5),
            size: Some(10.0),
            best_bid: None,
            best_ask: None,
            mid: None,
            spread: None,
            side: Some(Side::Buy),
            outcome: Some("Up".into()),
            usdc_size: Some(5.0),
            transaction_id: Some(tx.into()),
            dedup_key: format!("tx:{tx}:{t_ms}:m:trade"),
            raw: Some(json!({"source": source.as_str()})),
        }
    }

    fn secs(s: u64) -> Duration { Duration::from_secs(s) }

    #[test]
    fn window_edges_saturate_near_the_time_limit() {
        let t = i64::MAX - 100;
        let events = vec![snap(t - 1_000, 0.4, 0.6), trade("0xend", t, SourceKind::Poll)];
        let cfg = MergeSettings { window: secs(5), ..Default::default() };
        let out = merge_market("m", &events, &cfg);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].window_kind, WindowKind::Primary);
        assert_eq!(out[0].counts, PartitionCounts { before: 1, at: 0, after: 0 });
    }

    #[test]
    fn window_collects_only_in_range_snapshots_ascending() {
        let events = vec![
            snap(2_000_000, 0.1, 0.2),
            snap(1_002_000, 0.48, 0.52),
            trade("0x1", 1_000_000, SourceKind::Poll),
            snap(999_000, 0.47, 0.53),
            snap(997_000, 0.46, 0.54),
        ];
        let cfg = MergeSettings { window: secs(5), ..Default::default() };
        let out = merge_market("m", &events, &cfg);
        assert_eq!(out.len(), 1);
        let r = &out[0];
        assert_eq!(r.window_kind, WindowKind::Primary);
        let snaps = r.snapshots.as_ref().unwrap();
        assert_eq!(snaps.times(), vec![997_000, 999_000, 1_002_000]);
        assert_eq!(r.counts, PartitionCounts { before: 2, at: 0, after: 1 });

        let stats = r.stats.as_ref().unwrap();
        assert_eq!(stats.snapshot_count, 3);
        let bid = stats.bid.as_ref().unwrap();
        assert_eq!((bid.min, bid.max, bid.avg), (0.46, 0.48, 0.47));
        let spread = stats.spread.as_ref().unwrap();
        assert_eq!((spread.min, spread.max), (0.04, 0.08));
    }

    #[test]
    fn fallback_widens_around_nearest_snapshot() {
        let events = vec![trade("0x1", 1_000_000, SourceKind::Poll), snap(1_020_000, 0.4, 0.6), snap(1_021_500, 0.41, 0.59)];
        let out = merge_market("m", &events, &MergeSettings::default());
        let r = &out[0];
        assert_eq!(r.window_kind, WindowKind::Fallback);
        assert_eq!((r.window_start_ms, r.window_end_ms), (1_017_000, 1_023_000));
        assert_eq!(r.snapshots.as_ref().unwrap().times(), vec![1_020_000, 1_021_500]);
        assert_eq!(r.counts.after, 2);
    }

    #[test]
    fn beyond_fallback_threshold_has_no_context() {
        let events = vec![trade("0x1", 1_000_000, SourceKind::Poll), snap(1_031_000, 0.4, 0.6)];
        let r = &merge_market("m", &events, &MergeSettings::default())[0];
        assert_eq!(r.window_kind, WindowKind::Empty);
        assert!(r.stats.is_none() && r.snapshots.is_none());
        assert_eq!(r.counts, PartitionCounts::default());
    }

    #[test]
    fn same_tx_from_two_sources_is_one_record() {
        let events = vec![trade("0xabc", 1_000_300, SourceKind::Chain), trade("0xabc", 1_000_100, SourceKind::Poll)];
        let out = merge_market("m", &events, &MergeSettings::default());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].transaction_id, "0xabc");
        assert_eq!(out[0].trade_time_ms, 1_000_100);
        assert_eq!(out[0].trade.sources, vec![SourceKind::Poll, SourceKind::Chain]);
    }

    #[test]
    fn merge_is_byte_identical_regardless_of_arrival_order() {
        let mut events = vec![
            trade("0xb", 1_000_000, SourceKind::UserFeed),
            trade("0xa", 1_000_000, SourceKind::Poll),
            snap(999_100, 0.333333, 0.666667),
            snap(1_000_000, 0.3, 0.7),
            snap(1_001_000, 0.1, 0.9),
        ];
        let cfg = MergeSettings { attach_raw: true, ..Default::default() };
        let a = serde_json::to_vec(&merge_market("m", &events, &cfg)).unwrap();
        let b = serde_json::to_vec(&merge_market("m", &events, &cfg)).unwrap();
        events.reverse();
        let c = serde_json::to_vec(&merge_market("m", &events, &cfg)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);

        let out = merge_market("m", &events, &cfg);
        assert_eq!(out.iter().map(|r| r.transaction_id.as_str()).collect::<Vec<_>>(), vec!["0xa", "0xb"]);
        assert_eq!(out[0].counts, PartitionCounts { before: 1, at: 1, after: 1 });
    }

    #[test]
    fn large_windows_keep_only_stats() {
        let mut events: Vec<CanonicalEvent> = (0..150).map(|i| snap(999_000 + i * 10, 0.4, 0.6)).collect();
        events.push(trade("0x1", 1_000_000, SourceKind::Poll));
        let r = &merge_market("m", &events, &MergeSettings::default())[0];
        assert!(r.snapshots.is_none());
        assert!(r.snapshots_truncated);
        assert_eq!(r.stats.as_ref().unwrap().snapshot_count, 150);
    }

    #[test]
    fn last_trade_price_is_at_or_before_trade() {
        let mut before = snap(999_500, 0.4, 0.6);
        before.event_type = EventType::LastTradePrice;
        before.best_bid = None;
        before.best_ask = None;
        before.mid = None;
        before.spread = None;
        before.price = Some(0.45);
        let mut after = before.clone();
        after.event_time_ms = Some(1_000_500);
        after.price = Some(0.55);
        after.dedup_key = "raw:after".into();
        let events = vec![before, after, trade("0x1", 1_000_000, SourceKind::Poll)];
        let r = &merge_market("m", &events, &MergeSettings::default())[0];
        assert_eq!(r.stats.as_ref().unwrap().last_trade_price, Some(0.45));
    }
}
