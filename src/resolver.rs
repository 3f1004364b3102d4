// ===============================
// src/resolver.rs
// ===============================
//
// Market id resolution:
// - MarketResolver : slug -> {condition id, outcome token ids} via the Gamma
//                    markets endpoint; hits are cached, misses retried later.
// - MarketIndex    : immutable lookup snapshot shared through a watch channel.
// - run_discovery  : periodically resolves explicit + recurring-window slugs
//                    and drops windows older than RETAINED_WINDOWS periods.
//
use ahash::AHashMap as HashMap;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::FeedError;

#[derive(Debug, Clone, PartialEq)]
pub struct MarketInfo {
    pub slug: String,
    pub condition_id: String,
    /// (token id, outcome label)
    pub outcomes: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct MarketIndex {
    markets: BTreeMap<String, MarketInfo>,
    by_token: HashMap<String, (String, String)>,
    by_condition: HashMap<String, String>,
}

impl MarketIndex {
    pub fn from_markets<I: IntoIterator<Item = MarketInfo>>(markets: I) -> Self {
        let mut idx = MarketIndex::default();
        for m in markets {
            idx.insert(m);
        }
        idx
    }

    fn insert(&mut self, m: MarketInfo) {
        for (token, outcome) in &m.outcomes {
            self.by_token.insert(token.clone(), (m.slug.clone(), outcome.clone()));
        }
        self.by_condition.insert(m.condition_id.to_ascii_lowercase(), m.slug.clone());
        self.markets.insert(m.slug.clone(), m);
    }

    pub fn slug_for_token(&self, token: &str) -> Option<&str> {
        self.by_token.get(token).map(|(s, _)| s.as_str())
    }

    pub fn outcome_for_token(&self, token: &str) -> Option<&str> {
        self.by_token.get(token).map(|(_, o)| o.as_str())
    }

    pub fn slug_for_condition(&self, condition_id: &str) -> Option<&str> {
        self.by_condition.get(&condition_id.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn markets(&self) -> impl Iterator<Item = &MarketInfo> { self.markets.values() }

    pub fn token_ids(&self) -> Vec<String> {
        self.markets.values().flat_map(|m| m.outcomes.iter().map(|(t, _)| t.clone())).collect()
    }

    pub fn condition_ids(&self) -> Vec<String> {
        self.markets.values().map(|m| m.condition_id.clone()).collect()
    }

    pub fn len(&self) -> usize { self.markets.len() }

    pub fn is_empty(&self) -> bool { self.markets.is_empty() }
}

#[derive(Debug, Deserialize)]
struct GammaMarket {
    slug: String,
    #[serde(rename = "conditionId")]
    condition_id: String,
    #[serde(default, deserialize_with = "de_string_vec")]
    outcomes: Vec<String>,
    #[serde(rename = "clobTokenIds", default, deserialize_with = "de_string_vec")]
    clob_token_ids: Vec<String>,
}

// Gamma sometimes returns JSON arrays encoded as a string ("[\"Up\",\"Down\"]").
fn de_string_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Array(arr) => Ok(arr
            .into_iter()
            .filter_map(|x| match x {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()),
        Value::String(s) => serde_json::from_str::<Vec<String>>(&s).map_err(serde::de::Error::custom),
        _ => Ok(Vec::new()),
    }
}

impl From<GammaMarket> for MarketInfo {
    fn from(g: GammaMarket) -> Self {
        let outcomes = g
            .clob_token_ids
            .into_iter()
            .enumerate()
            .map(|(i, token)| {
                let label = g.outcomes.get(i).cloned().unwrap_or_else(|| format!("outcome_{i}"));
                (token, label)
            })
            .collect();
        MarketInfo { slug: g.slug, condition_id: g.condition_id, outcomes }
    }
}

pub struct MarketResolver {
    http: reqwest::Client,
    gamma_base: String,
    cache: HashMap<String, MarketInfo>,
}

impl MarketResolver {
    pub fn new(http: reqwest::Client, gamma_base: String) -> Self {
        Self { http, gamma_base: gamma_base.trim_end_matches('/').to_string(), cache: HashMap::new() }
    }

    /// Forgets cached markets whose slug fails `keep`.
    pub fn retain<F: Fn(&str) -> bool>(&mut self, keep: F) { self.cache.retain(|slug, _| keep(slug)); }

    pub fn cache_len(&self) -> usize { self.cache.len() }

    /// Resolves a slug, hitting the network only on a cache miss.
    pub async fn resolve(&mut self, slug: &str) -> Result<Option<MarketInfo>, FeedError> {
        if let Some(m) = self.cache.get(slug) {
            return Ok(Some(m.clone()));
        }
        let url = format!("{}/markets", self.gamma_base);
        let rsp = self
            .http
            .get(url)
            .timeout(Duration::from_secs(8))
            .query(&[("slug", slug), ("limit", "1")])
            .send()
            .await?;
        if !rsp.status().is_success() {
            return Err(FeedError::from_status(rsp.status(), "gamma markets"));
        }
        let body = rsp.text().await?;
        let markets: Vec<GammaMarket> = serde_json::from_str(&body)
            .map_err(|e| FeedError::MalformedPayload(format!("gamma markets: {e}")))?;
        let Some(m) = markets.into_iter().find(|m| m.slug == slug) else {
            return Ok(None);
        };
        let info = MarketInfo::from(m);
        self.cache.insert(slug.to_string(), info.clone());
        Ok(Some(info))
    }
}

/// Slugs of recurring markets around `now_secs`: previous, current and next window.
pub fn recurring_slugs(prefix: &str, period_secs: i64, now_secs: i64) -> Vec<String> {
    if prefix.is_empty() || period_secs <= 0 {
        return Vec::new();
    }
    let start = now_secs.div_euclid(period_secs) * period_secs;
    [start - period_secs, start, start + period_secs]
        .iter()
        .map(|s| format!("{prefix}{s}"))
        .collect()
}

/// Recurring windows kept in the index behind the current one.
pub const RETAINED_WINDOWS: i64 = 4;

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub explicit: Vec<String>,
    pub prefix: Option<String>,
    pub period_secs: i64,
    pub interval: Duration,
}

impl DiscoverySettings {
    pub fn candidates(&self, now_secs: i64) -> Vec<String> {
        let mut out = self.explicit.clone();
        if let Some(prefix) = &self.prefix {
            out.extend(recurring_slugs(prefix, self.period_secs, now_secs));
        }
        out
    }

    /// False for recurring slugs whose window started more than
    /// `RETAINED_WINDOWS` periods before the current one. Explicit slugs and
    /// slugs not shaped `<prefix><epoch>` are always kept.
    pub fn is_retained(&self, slug: &str, now_secs: i64) -> bool {
        if self.explicit.iter().any(|e| e == slug) {
            return true;
        }
        let (Some(prefix), true) = (&self.prefix, self.period_secs > 0) else {
            return true;
        };
        let Some(start) = slug.strip_prefix(prefix.as_str()).and_then(|s| s.parse::<i64>().ok()) else {
            return true;
        };
        let current = now_secs.div_euclid(self.period_secs) * self.period_secs;
        start >= current - RETAINED_WINDOWS * self.period_secs
    }
}

/// One discovery pass: prunes expired windows, resolves new candidates.
/// Returns true when the set of known markets changed.
pub async fn discover_once(
    resolver: &mut MarketResolver,
    cfg: &DiscoverySettings,
    known: &mut BTreeMap<String, MarketInfo>,
    now_secs: i64,
) -> bool {
    let before = known.len();
    known.retain(|slug, _| cfg.is_retained(slug, now_secs));
    resolver.retain(|slug| cfg.is_retained(slug, now_secs));
    let mut changed = known.len() != before;
    if changed {
        info!(dropped = before - known.len(), cached = resolver.cache_len(), "expired market windows dropped");
    }

    for slug in cfg.candidates(now_secs) {
        if known.contains_key(&slug) {
            continue;
        }
        match resolver.resolve(&slug).await {
            Ok(Some(m)) => {
                info!(slug = %m.slug, condition = %m.condition_id, tokens = m.outcomes.len(), "market resolved");
                known.insert(slug, m);
                changed = true;
            }
            Ok(None) => debug!(%slug, "market not listed yet"),
            Err(e) => warn!(%slug, error = %e, "market resolution failed"),
        }
    }
    changed
}

/// Resolves candidate slugs on an interval and publishes a new index whenever
/// the known set changes.
pub async fn run_discovery(
    mut resolver: MarketResolver,
    cfg: DiscoverySettings,
    index_tx: watch::Sender<Arc<MarketIndex>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(cfg.interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut known: BTreeMap<String, MarketInfo> = BTreeMap::new();

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            Ok(()) = stop.changed() => {}
        }
        if *stop.borrow() {
            break;
        }

        let now = chrono::Utc::now().timestamp();
        if discover_once(&mut resolver, &cfg, &mut known, now).await {
            let idx = MarketIndex::from_markets(known.values().cloned());
            if idx.is_empty() {
                warn!("market index is empty, feeds wait for markets");
            }
            info!(markets = idx.len(), "market index published");
            let _ = index_tx.send(Arc::new(idx));
        }
    }
}
