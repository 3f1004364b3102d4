// ===============================
// src/price_history.rs
// ===============================
//
// Compact per-market price history: one series per outcome token (1 point per
// second, last value wins), summary stats, and a BUY spend split by outcome.
//
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::{CanonicalEvent, EventType, MergedTradeRecord, Side};
use crate::merge::round6;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesStats {
    pub count: usize,
    pub first: f64,
    pub last: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetSeries {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    /// `[time_ms, price]`, ascending.
    pub points: Vec<(i64, f64)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<SeriesStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpendSplit {
    pub up: f64,
    pub down: f64,
    pub other: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideCounts {
    pub buy: usize,
    pub sell: usize,
    pub unknown: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceHistory {
    pub market_id: String,
    pub assets: BTreeMap<String, AssetSeries>,
    pub spend: SpendSplit,
    pub trades: SideCounts,
}

fn point_value(ev: &CanonicalEvent) -> Option<f64> {
    if !ev.is_market_snapshot() {
        return None;
    }
    ev.mid.or(match ev.event_type {
        EventType::LastTradePrice => ev.price,
        _ => None,
    })
}

fn series_stats(points: &[(i64, f64)]) -> Option<SeriesStats> {
    let (first, last) = (points.first()?.1, points.last()?.1);
    let values = points.iter().map(|p| p.1);
    let min = values.clone().fold(f64::INFINITY, f64::min);
    let max = values.clone().fold(f64::NEG_INFINITY, f64::max);
    let sum: f64 = values.sum();
    Some(SeriesStats {
        count: points.len(),
        first,
        last,
        min,
        max,
        avg: round6(sum / points.len() as f64),
    })
}

pub fn build(market: &str, events: &[CanonicalEvent], trades: &[MergedTradeRecord]) -> PriceHistory {
    let mut ordered: Vec<&CanonicalEvent> = events.iter().filter(|e| point_value(e).is_some()).collect();
    ordered.sort_by(|a, b| (a.time_ms(), &a.dedup_key).cmp(&(b.time_ms(), &b.dedup_key)));

    let mut buckets: BTreeMap<String, (Option<String>, BTreeMap<i64, f64>)> = BTreeMap::new();
    for ev in ordered {
        let (Some(asset), Some(v)) = (ev.asset_id.as_ref(), point_value(ev)) else {
            continue;
        };
        let entry = buckets.entry(asset.clone()).or_default();
        if entry.0.is_none() {
            entry.0 = ev.outcome.clone();
        }
        entry.1.insert(ev.time_ms().div_euclid(1000) * 1000, round6(v));
    }

    let assets = buckets
        .into_iter()
        .map(|(asset, (outcome, pts))| {
            let points: Vec<(i64, f64)> = pts.into_iter().collect();
            let stats = series_stats(&points);
            (asset, AssetSeries { outcome, points, stats })
        })
        .collect();

    let mut spend = SpendSplit::default();
    let mut counts = SideCounts::default();
    for r in trades {
        match r.trade.side {
            Some(Side::Buy) => counts.buy += 1,
            Some(Side::Sell) => counts.sell += 1,
            None => counts.unknown += 1,
        }
        if r.trade.side != Some(Side::Buy) {
            continue;
        }
        let usdc = r.trade.usdc_size.or(match (r.trade.price, r.trade.size) {
            (Some(p), Some(s)) => Some(p * s),
            _ => None,
        });
        let Some(usdc) = usdc else { continue };
        match r.trade.outcome.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("up") | Some("yes") => spend.up += usdc,
            Some("down") | Some("no") => spend.down += usdc,
            _ => spend.other += usdc,
        }
        spend.total += usdc;
    }
    spend = SpendSplit {
        up: round6(spend.up),
        down: round6(spend.down),
        other: round6(spend.other),
        total: round6(spend.total),
    };

    PriceHistory { market_id: market.to_string(), assets, spend, trades: counts }
}
