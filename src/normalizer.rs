// ===============================
// src/normalizer.rs
// ===============================
//
// RawSourceEvent -> Vec<CanonicalEvent>, one adapter per source.
// Never fails: unknown frames become `event` entries, frames without any
// market identity are dropped (empty vec).
//
use serde_json::{Map, Value};

use crate::domain::{CanonicalEvent, EventType, RawSourceEvent, Side, SourceKind};
use crate::resolver::MarketIndex;

const TIME_KEYS: &[&str] = &["timestamp", "matchtime", "match_time", "last_update", "time", "ts", "blockTimestamp"];
const SLUG_KEYS: &[&str] = &["slug", "market_slug", "eventSlug"];
const CONDITION_KEYS: &[&str] = &["market", "conditionId", "condition_id"];
const ASSET_KEYS: &[&str] = &["asset_id", "asset", "token_id", "tokenId", "assetId"];
const PRICE_KEYS: &[&str] = &["price", "p", "last_trade_price"];
const SIZE_KEYS: &[&str] = &["size", "shares", "amount"];
const TX_KEYS: &[&str] = &["transactionHash", "transaction_hash", "txHash", "tx_hash", "hash"];
const ID_KEYS: &[&str] = &["id", "trade_id", "event_id"];
const SIDE_KEYS: &[&str] = &["side", "taker_side"];
const BID_KEYS: &[&str] = &["best_bid", "bestBid", "bid"];
const ASK_KEYS: &[&str] = &["best_ask", "bestAsk", "ask"];
const SPREAD_KEYS: &[&str] = &["spread"];
const OUTCOME_KEYS: &[&str] = &["outcome", "token_label"];
const USDC_KEYS: &[&str] = &["usdcSize", "usdc_size", "notional"];
const TYPE_KEYS: &[&str] = &["event_type", "type", "eventType"];

/// Length of the payload prefix used in last-resort dedup keys.
pub const PAYLOAD_PREFIX_CHARS: usize = 120;

/// Times at or beyond this (year ~33658 in ms) are rejected as garbage.
const MAX_TIME_MS: f64 = 1e15;

pub fn normalize(raw: &RawSourceEvent, index: &MarketIndex, attach_raw: bool) -> Vec<CanonicalEvent> {
    let mut out = match raw.source {
        SourceKind::MarketFeed => market_feed(raw, index),
        SourceKind::UserFeed => user_feed(raw, index),
        SourceKind::Poll => poll(raw, index),
        SourceKind::Chain => chain(raw, index),
    };
    if attach_raw {
        for ev in &mut out {
            ev.raw = Some(raw.payload.clone());
        }
    }
    out
}

// ---------- field probing ----------

fn first<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().filter_map(|k| obj.get(*k)).find(|v| !v.is_null())
}

fn str_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    first(obj, keys).and_then(|v| match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn num_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    first(obj, keys).and_then(as_f64)
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|x| x.is_finite())
}

/// Epoch value in seconds or milliseconds (decimal or 0x-hex) -> milliseconds.
pub fn parse_time_ms(v: &Value) -> Option<i64> {
    let x = match v {
        Value::String(s) if s.starts_with("0x") => i64::from_str_radix(&s[2..], 16).ok()? as f64,
        _ => as_f64(v)?,
    };
    if x <= 0.0 || x >= MAX_TIME_MS {
        return None;
    }
    Some(if x < 1e12 { (x * 1000.0).round() as i64 } else { x.round() as i64 })
}

fn time_field(obj: &Map<String, Value>) -> Option<i64> {
    first(obj, TIME_KEYS).and_then(parse_time_ms)
}

/// Event time of a single JSON object payload, if it carries one.
pub fn payload_time_ms(payload: &Value) -> Option<i64> {
    payload.as_object().and_then(time_field)
}

fn side_field(obj: &Map<String, Value>) -> Option<Side> {
    str_field(obj, SIDE_KEYS).and_then(|s| Side::parse(&s))
}

/// Market identity: slug, else index lookup by asset / condition, else raw condition id.
fn market_identity(obj: &Map<String, Value>, asset: Option<&str>, index: &MarketIndex) -> Option<String> {
    if let Some(slug) = str_field(obj, SLUG_KEYS) {
        return Some(slug);
    }
    if let Some(s) = asset.and_then(|a| index.slug_for_token(a)) {
        return Some(s.to_string());
    }
    let condition = str_field(obj, CONDITION_KEYS)?;
    Some(index.slug_for_condition(&condition).map(str::to_string).unwrap_or(condition))
}

fn round6(x: f64) -> f64 { (x * 1e6).round() / 1e6 }

fn fill_mid_spread(ev: &mut CanonicalEvent) {
    if let (Some(b), Some(a)) = (ev.best_bid, ev.best_ask) {
        if ev.mid.is_none() {
            ev.mid = Some(round6((a + b) / 2.0));
        }
        if ev.spread.is_none() {
            ev.spread = Some(round6(a - b));
        }
    }
}

/// Fixed priority: explicit id, tx composite, payload-prefix composite.
pub fn derive_dedup_key(
    explicit_id: Option<&str>,
    tx: Option<&str>,
    time_ms: i64,
    market: &str,
    event_type: EventType,
    payload: &Value,
) -> String {
    if let Some(id) = explicit_id {
        return format!("id:{id}");
    }
    if let Some(tx) = tx {
        return format!("tx:{}:{}:{}:{}", tx.to_ascii_lowercase(), time_ms, market, event_type.as_str());
    }
    // The prefix covers only what the key does not already carry, so long
    // identity fields cannot crowd out the fields that tell events apart.
    let (asset, rest) = match payload {
        Value::Object(obj) => {
            let asset = str_field(obj, ASSET_KEYS).unwrap_or_default();
            let rest: Map<String, Value> = obj
                .iter()
                .filter(|(k, _)| !is_key_carried(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            (asset, Value::Object(rest))
        }
        other => (String::new(), other.clone()),
    };
    let serialized = serde_json::to_string(&rest).unwrap_or_default();
    let prefix: String = serialized.chars().take(PAYLOAD_PREFIX_CHARS).collect();
    format!("raw:{}:{}:{}:{}:{}", time_ms, market, event_type.as_str(), asset, prefix)
}

fn is_key_carried(field: &str) -> bool {
    [TIME_KEYS, TYPE_KEYS, SLUG_KEYS, CONDITION_KEYS, ASSET_KEYS]
        .iter()
        .any(|keys| keys.contains(&field))
}

fn blank(raw: &RawSourceEvent, market: String, event_type: EventType) -> CanonicalEvent {
    CanonicalEvent {
        event_time_ms: None,
        receipt_time_ms: raw.received_at_ms,
        source: raw.source,
        market_id: market,
        asset_id: None,
        event_type,
        price: None,
        size: None,
        best_bid: None,
        best_ask: None,
        mid: None,
        spread: None,
        side: None,
        outcome: None,
        usdc_size: None,
        transaction_id: None,
        dedup_key: String::new(),
        raw: None,
    }
}

// ---------- market feed ----------

fn market_feed(raw: &RawSourceEvent, index: &MarketIndex) -> Vec<CanonicalEvent> {
    match &raw.payload {
        Value::Array(items) => items.iter().flat_map(|v| market_frame(raw, v, index)).collect(),
        v => market_frame(raw, v, index),
    }
}

fn market_frame(raw: &RawSourceEvent, frame: &Value, index: &MarketIndex) -> Vec<CanonicalEvent> {
    let Some(obj) = frame.as_object() else {
        return Vec::new();
    };
    let event_type = str_field(obj, TYPE_KEYS).map(|t| EventType::parse(&t)).unwrap_or(EventType::Event);
    let frame_time = time_field(obj);

    // Batched price updates: one event per entry, frame fields as defaults.
    let batch = obj
        .get("price_changes")
        .or_else(|| obj.get("changes"))
        .and_then(|v| v.as_array());
    if let Some(changes) = batch {
        return changes
            .iter()
            .filter_map(|c| c.as_object())
            .filter_map(|c| {
                let mut merged = obj.clone();
                merged.remove("price_changes");
                merged.remove("changes");
                for (k, v) in c {
                    merged.insert(k.clone(), v.clone());
                }
                let merged_value = Value::Object(merged);
                market_single(raw, &merged_value, EventType::PriceChange, frame_time, index)
            })
            .collect();
    }
    market_single(raw, frame, event_type, frame_time, index).into_iter().collect()
}

fn market_single(
    raw: &RawSourceEvent,
    frame: &Value,
    event_type: EventType,
    frame_time: Option<i64>,
    index: &MarketIndex,
) -> Option<CanonicalEvent> {
    let obj = frame.as_object()?;
    let asset = str_field(obj, ASSET_KEYS);
    let market = market_identity(obj, asset.as_deref(), index)?;

    let mut ev = blank(raw, market, event_type);
    ev.event_time_ms = time_field(obj).or(frame_time);
    ev.outcome = asset.as_deref().and_then(|a| index.outcome_for_token(a)).map(str::to_string);
    ev.asset_id = asset;

    match event_type {
        EventType::Book => {
            ev.best_bid = best_level(obj, &["bids", "buys"], true);
            ev.best_ask = best_level(obj, &["asks", "sells"], false);
        }
        EventType::Event | EventType::TickSizeChange => {}
        _ => {
            ev.price = num_field(obj, PRICE_KEYS);
            ev.size = num_field(obj, SIZE_KEYS);
            ev.side = side_field(obj);
            ev.best_bid = num_field(obj, BID_KEYS);
            ev.best_ask = num_field(obj, ASK_KEYS);
            ev.spread = num_field(obj, SPREAD_KEYS);
        }
    }
    fill_mid_spread(&mut ev);
    ev.dedup_key = derive_dedup_key(None, None, ev.time_ms(), &ev.market_id, event_type, frame);
    Some(ev)
}

fn best_level(obj: &Map<String, Value>, keys: &[&str], highest: bool) -> Option<f64> {
    let levels = first(obj, keys)?.as_array()?;
    let prices = levels.iter().filter_map(|l| match l {
        Value::Object(o) => o.get("price").and_then(as_f64),
        Value::Array(a) => a.first().and_then(as_f64),
        _ => None,
    });
    if highest {
        prices.fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.max(p))))
    } else {
        prices.fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.min(p))))
    }
}

// ---------- user feed ----------

fn user_feed(raw: &RawSourceEvent, index: &MarketIndex) -> Vec<CanonicalEvent> {
    match &raw.payload {
        Value::Array(items) => items.iter().filter_map(|v| user_frame(raw, v, index)).collect(),
        v => user_frame(raw, v, index).into_iter().collect(),
    }
}

fn user_frame(raw: &RawSourceEvent, frame: &Value, index: &MarketIndex) -> Option<CanonicalEvent> {
    let obj = frame.as_object()?;
    let event_type = str_field(obj, &["event_type"])
        .or_else(|| str_field(obj, &["type"]))
        .map(|t| EventType::parse(&t))
        .unwrap_or(EventType::Event);
    let asset = str_field(obj, ASSET_KEYS);
    let market = market_identity(obj, asset.as_deref(), index)?;

    let mut ev = blank(raw, market, event_type);
    ev.event_time_ms = time_field(obj);
    ev.price = num_field(obj, PRICE_KEYS);
    ev.size = num_field(obj, SIZE_KEYS);
    ev.side = side_field(obj);
    ev.outcome = str_field(obj, OUTCOME_KEYS)
        .or_else(|| asset.as_deref().and_then(|a| index.outcome_for_token(a)).map(str::to_string));
    ev.usdc_size = num_field(obj, USDC_KEYS).or_else(|| match (ev.price, ev.size) {
        (Some(p), Some(s)) => Some(round6(p * s)),
        _ => None,
    });
    ev.asset_id = asset;

    let id = str_field(obj, ID_KEYS);
    let explicit = match event_type {
        // order updates share the order id; keep each update distinct
        EventType::Order => id.as_ref().map(|id| {
            let kind = str_field(obj, &["type"]).unwrap_or_default();
            let matched = str_field(obj, &["size_matched"]).unwrap_or_default();
            format!("{id}:{kind}:{matched}")
        }),
        _ => id.clone(),
    };
    if event_type == EventType::Trade {
        ev.transaction_id = str_field(obj, TX_KEYS).or(id);
    }
    ev.dedup_key = derive_dedup_key(
        explicit.as_deref(),
        ev.transaction_id.as_deref(),
        ev.time_ms(),
        &ev.market_id,
        event_type,
        frame,
    );
    Some(ev)
}

// ---------- REST poll ----------

fn poll(raw: &RawSourceEvent, index: &MarketIndex) -> Vec<CanonicalEvent> {
    match &raw.payload {
        Value::Array(items) => items.iter().filter_map(|v| poll_item(raw, v, index)).collect(),
        v => poll_item(raw, v, index).into_iter().collect(),
    }
}

fn poll_item(raw: &RawSourceEvent, item: &Value, index: &MarketIndex) -> Option<CanonicalEvent> {
    let obj = item.as_object()?;
    let event_type = match str_field(obj, &["type"]).as_deref().map(str::to_ascii_uppercase).as_deref() {
        Some("TRADE") | None => EventType::Trade,
        _ => EventType::Event,
    };
    let asset = str_field(obj, ASSET_KEYS);
    let market = market_identity(obj, asset.as_deref(), index)?;

    let mut ev = blank(raw, market, event_type);
    ev.event_time_ms = time_field(obj);
    ev.price = num_field(obj, PRICE_KEYS);
    ev.size = num_field(obj, SIZE_KEYS);
    ev.usdc_size = num_field(obj, USDC_KEYS);
    ev.side = side_field(obj);
    ev.outcome = str_field(obj, OUTCOME_KEYS)
        .or_else(|| asset.as_deref().and_then(|a| index.outcome_for_token(a)).map(str::to_string));
    ev.asset_id = asset;
    ev.transaction_id = str_field(obj, TX_KEYS).map(|t| t.to_ascii_lowercase());

    let explicit = str_field(obj, ID_KEYS);
    ev.dedup_key = derive_dedup_key(
        explicit.as_deref(),
        ev.transaction_id.as_deref(),
        ev.time_ms(),
        &ev.market_id,
        event_type,
        item,
    );
    Some(ev)
}

// ---------- chain ----------

/// Chain frames are already tagged by the monitor with `market` and `asset_id`.
fn chain(raw: &RawSourceEvent, index: &MarketIndex) -> Vec<CanonicalEvent> {
    let Some(obj) = raw.payload.as_object() else {
        return Vec::new();
    };
    let asset = str_field(obj, ASSET_KEYS);
    let Some(market) = market_identity(obj, asset.as_deref(), index) else {
        return Vec::new();
    };
    let mut ev = blank(raw, market, EventType::Trade);
    ev.event_time_ms = time_field(obj);
    ev.outcome = asset.as_deref().and_then(|a| index.outcome_for_token(a)).map(str::to_string);
    ev.asset_id = asset;
    ev.transaction_id = str_field(obj, TX_KEYS).map(|t| t.to_ascii_lowercase());
    if ev.transaction_id.is_none() {
        ev.event_type = EventType::Event;
    }
    ev.dedup_key = derive_dedup_key(
        None,
        ev.transaction_id.as_deref(),
        ev.time_ms(),
        &ev.market_id,
        ev.event_type,
        &raw.payload,
    );
    vec![ev]
}
