// ===============================
// src/promoter.rs
// ===============================
//
// Promotion scheduler state:
// - observe(market, t)   : last activity per market.
// - due(now)             : markets quiet for longer than the inactivity
//                          threshold while some other market is still active.
// - promote(market)      : uploads every local artifact, then deletes them.
//                          Any failed upload keeps all local files and the
//                          market stays tracked, so the next cycle retries.
//
// A market that receives events again after promotion starts a new generation;
// its next artifacts go under `<account>/<market>/g<n>/` so earlier objects are
// never overwritten.
//
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::layout::Layout;
use crate::metrics::{ACTIVE_MARKETS, UPLOADS};
use crate::storage::{object_key, ObjectStore};

#[derive(Debug, Clone)]
pub struct PromotionSettings {
    pub inactivity: Duration,
    pub check_interval: Duration,
}

impl Default for PromotionSettings {
    fn default() -> Self {
        Self { inactivity: Duration::from_secs(300), check_interval: Duration::from_secs(30) }
    }
}

pub struct Promoter {
    layout: Layout,
    store: Option<Arc<dyn ObjectStore>>,
    inactivity_ms: i64,
    last_activity: BTreeMap<String, i64>,
    generations: BTreeMap<String, u32>,
    /// Last activity of each market at its most recent promotion.
    promoted_through: BTreeMap<String, i64>,
}

impl Promoter {
    pub fn new(layout: Layout, store: Option<Arc<dyn ObjectStore>>, cfg: &PromotionSettings) -> Self {
        Self {
            layout,
            store,
            inactivity_ms: cfg.inactivity.as_millis() as i64,
            last_activity: BTreeMap::new(),
            generations: BTreeMap::new(),
            promoted_through: BTreeMap::new(),
        }
    }

    pub fn enabled(&self) -> bool { self.store.is_some() }

    pub fn observe(&mut self, market: &str, now_ms: i64) {
        let slot = self.last_activity.entry(market.to_string()).or_insert(now_ms);
        *slot = (*slot).max(now_ms);
        ACTIVE_MARKETS.set(self.last_activity.len() as i64);
    }

    pub fn tracked(&self) -> Vec<String> { self.last_activity.keys().cloned().collect() }

    pub fn is_tracked(&self, market: &str) -> bool { self.last_activity.contains_key(market) }

    /// True for an event that belongs to an already promoted period of `market`.
    pub fn is_replay(&self, market: &str, event_time_ms: i64) -> bool {
        self.promoted_through.get(market).is_some_and(|t| event_time_ms <= *t)
    }

    /// Quiet markets, only when at least one other market is still active.
    pub fn due(&self, now_ms: i64) -> Vec<String> {
        let quiet = |t: i64| now_ms - t > self.inactivity_ms;
        let (inactive, active): (Vec<_>, Vec<_>) = self.last_activity.iter().partition(|(_, t)| quiet(**t));
        if active.is_empty() {
            return Vec::new();
        }
        inactive.into_iter().map(|(m, _)| m.clone()).collect()
    }

    /// Uploads all artifacts of `market`; deletes them only if every upload succeeded.
    pub async fn promote(&mut self, market: &str) -> Result<usize, StoreError> {
        let Some(store) = self.store.clone() else {
            return Ok(0);
        };
        let files = self.layout.artifacts(market).await;
        let generation = self.generations.get(market).copied().unwrap_or(0);

        for file in &files {
            let key = match generation {
                0 => object_key(self.layout.account(), market, file),
                g => {
                    let base = object_key(self.layout.account(), market, file);
                    let (dir, name) = base.rsplit_once('/').unwrap_or(("", base.as_str()));
                    format!("{dir}/g{g}/{name}")
                }
            };
            if let Err(e) = store.put(&key, file).await {
                UPLOADS.with_label_values(&["error"]).inc();
                warn!(%market, %key, error = %e, backend = store.backend_type(), "promoter: upload failed, local files kept");
                return Err(e);
            }
            UPLOADS.with_label_values(&["ok"]).inc();
        }

        for file in &files {
            if let Err(e) = tokio::fs::remove_file(file).await {
                warn!(?e, path = %file.display(), "promoter: uploaded file could not be removed");
            }
        }
        if let Some(t) = self.last_activity.remove(market) {
            let through = self.promoted_through.entry(market.to_string()).or_insert(t);
            *through = (*through).max(t);
        }
        self.generations.insert(market.to_string(), generation + 1);
        ACTIVE_MARKETS.set(self.last_activity.len() as i64);
        info!(%market, files = files.len(), generation, "promoter: market promoted");
        Ok(files.len())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// In-memory store recording uploaded keys; can be told to fail.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub keys: Mutex<Vec<String>>,
        pub fail: AtomicBool,
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn put(&self, key: &str, file: &Path) -> Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Upload { key: key.into(), reason: "unavailable".into() });
            }
            tokio::fs::metadata(file).await?;
            self.keys.lock().unwrap().push(key.to_string());
            Ok(())
        }

        fn backend_type(&self) -> &'static str { "memory" }
    }

    async fn seed(layout: &Layout, market: &str) {
        tokio::fs::create_dir_all(layout.dir()).await.unwrap();
        for p in [layout.active_log(market), layout.trades(market), layout.prices(market)] {
            tokio::fs::write(p, b"x").await.unwrap();
        }
    }

    fn setup() -> (tempfile::TempDir, Layout, Arc<MemoryStore>, Promoter) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path(), "0xacc");
        let store = Arc::new(MemoryStore::default());
        let p = Promoter::new(layout.clone(), Some(store.clone()), &PromotionSettings::default());
        (dir, layout, store, p)
    }

    #[test]
    fn due_requires_another_active_market() {
        let (_d, _l, _s, mut p) = setup();
        p.observe("old", 0);
        assert!(p.due(301_000).is_empty());
        p.observe("live", 300_000);
        assert_eq!(p.due(301_000), vec!["old".to_string()]);
        assert!(p.due(299_000).is_empty());
    }

    #[tokio::test]
    async fn failed_upload_keeps_files_and_retries() {
        let (_d, layout, store, mut p) = setup();
        seed(&layout, "m").await;
        p.observe("m", 0);
        store.fail.store(true, Ordering::SeqCst);
        assert!(p.promote("m").await.is_err());
        assert_eq!(layout.artifacts("m").await.len(), 3);
        assert!(p.is_tracked("m"));

        store.fail.store(false, Ordering::SeqCst);
        assert_eq!(p.promote("m").await.unwrap(), 3);
        assert!(layout.artifacts("m").await.is_empty());
        assert!(!p.is_tracked("m"));
        assert_eq!(
            *store.keys.lock().unwrap(),
            vec!["0xacc/m/m.events.jsonl", "0xacc/m/m.trades.json", "0xacc/m/m.prices.json"]
        );
    }

    #[tokio::test]
    async fn events_up_to_promotion_are_replays() {
        let (_d, layout, _s, mut p) = setup();
        seed(&layout, "m").await;
        p.observe("m", 1_000);
        assert!(!p.is_replay("m", 500));
        p.promote("m").await.unwrap();
        assert!(p.is_replay("m", 500));
        assert!(p.is_replay("m", 1_000));
        assert!(!p.is_replay("m", 1_001));
        assert!(!p.is_replay("other", 0));
    }

    #[tokio::test]
    async fn later_generation_does_not_overwrite() {
        let (_d, layout, store, mut p) = setup();
        seed(&layout, "m").await;
        p.promote("m").await.unwrap();
        seed(&layout, "m").await;
        p.promote("m").await.unwrap();
        let keys = store.keys.lock().unwrap();
        assert_eq!(keys.len(), 6);
        assert_eq!(keys[3], "0xacc/m/g1/m.events.jsonl");
    }
}
