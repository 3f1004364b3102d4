// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which feed delivered an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind { MarketFeed, UserFeed, Poll, Chain }

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::MarketFeed => "market_feed",
            SourceKind::UserFeed => "user_feed",
            SourceKind::Poll => "poll",
            SourceKind::Chain => "chain",
        }
    }

    /// Order in which sources are trusted when several report the same transaction.
    pub fn trade_priority(&self) -> u8 {
        match self {
            SourceKind::Poll => 0,
            SourceKind::UserFeed => 1,
            SourceKind::Chain => 2,
            SourceKind::MarketFeed => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side { Buy, Sell }

impl Side {
    pub fn parse(s: &str) -> Option<Side> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" | "B" | "BID" => Some(Side::Buy),
            "SELL" | "S" | "ASK" => Some(Side::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Book,
    PriceChange,
    LastTradePrice,
    BestBidAsk,
    TickSizeChange,
    Trade,
    Order,
    Event,
}

impl EventType {
    pub fn parse(s: &str) -> EventType {
        match s.trim().to_ascii_lowercase().as_str() {
            "book" => EventType::Book,
            "price_change" => EventType::PriceChange,
            "last_trade_price" => EventType::LastTradePrice,
            "best_bid_ask" => EventType::BestBidAsk,
            "tick_size_change" => EventType::TickSizeChange,
            "trade" => EventType::Trade,
            "order" => EventType::Order,
            _ => EventType::Event,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Book => "book",
            EventType::PriceChange => "price_change",
            EventType::LastTradePrice => "last_trade_price",
            EventType::BestBidAsk => "best_bid_ask",
            EventType::TickSizeChange => "tick_size_change",
            EventType::Trade => "trade",
            EventType::Order => "order",
            EventType::Event => "event",
        }
    }
}

/// Frame as received from a connector; lives only until it is normalized.
#[derive(Debug, Clone)]
pub struct RawSourceEvent { pub source: SourceKind, pub received_at_ms: i64, pub payload: Value }

impl RawSourceEvent {
    pub fn now(source: SourceKind, payload: Value) -> Self {
        Self { source, received_at_ms: now_ms(), payload }
    }
}

/// Source-agnostic event; one JSON line in the per-market log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time_ms: Option<i64>,
    pub receipt_time_ms: i64,
    pub source: SourceKind,
    pub market_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_bid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_ask: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spread: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usdc_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub dedup_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl CanonicalEvent {
    /// Event time, falling back to receipt time.
    pub fn time_ms(&self) -> i64 { self.event_time_ms.unwrap_or(self.receipt_time_ms) }

    pub fn is_trade_record(&self) -> bool {
        self.source != SourceKind::MarketFeed
            && self.event_type == EventType::Trade
            && self.transaction_id.is_some()
    }

    pub fn is_market_snapshot(&self) -> bool { self.source == SourceKind::MarketFeed }
}

/// Aggregates over the snapshots matched to one trade.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeStats { pub min: f64, pub max: f64, pub avg: f64, pub count: usize }

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub snapshot_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<RangeStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<RangeStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spread: Option<RangeStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<RangeStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_trade_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPoint {
    pub t: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spread: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPartition {
    pub before: Vec<SnapshotPoint>,
    pub at: Vec<SnapshotPoint>,
    pub after: Vec<SnapshotPoint>,
}

impl SnapshotPartition {
    /// Times of all points, ascending.
    pub fn times(&self) -> Vec<i64> {
        self.before.iter().chain(&self.at).chain(&self.after).map(|p| p.t).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usdc_size: Option<f64>,
    pub sources: Vec<SourceKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind { Primary, Fallback, Empty }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedTradeRecord {
    pub transaction_id: String,
    pub market_id: String,
    pub trade_time_ms: i64,
    pub trade: TradeFields,
    pub window_kind: WindowKind,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub counts: PartitionCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<WindowStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshots: Option<SnapshotPartition>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub snapshots_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCounts { pub before: usize, pub at: usize, pub after: usize }

pub fn now_ms() -> i64 { chrono::Utc::now().timestamp_millis() }
