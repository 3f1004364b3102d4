// ===============================
// src/layout.rs
// ===============================
//
// On-disk layout of one account's artifacts:
//   <out>/<account>/<market>.events.jsonl      active log segment
//   <out>/<account>/<market>.events.<n>.jsonl  rotated segments, n = 1, 2, ...
//   <out>/<account>/<market>.trades.json       merged trade records
//   <out>/<account>/<market>.prices.json       price history
//   <out>/<account>/dedup-state.json
//
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

const EVENTS_SUFFIX: &str = ".events.jsonl";

/// File-name safe form of a market id.
pub fn sanitize(market: &str) -> String {
    let s: String = market
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    if s.is_empty() { "_".to_string() } else { s }
}

#[derive(Debug, Clone)]
pub struct Layout {
    account: String,
    dir: PathBuf,
}

impl Layout {
    pub fn new(out_dir: &Path, account: &str) -> Self {
        Self { account: account.to_string(), dir: out_dir.join(account) }
    }

    pub fn account(&self) -> &str { &self.account }

    pub fn dir(&self) -> &Path { &self.dir }

    pub fn active_log(&self, market: &str) -> PathBuf {
        self.dir.join(format!("{}{EVENTS_SUFFIX}", sanitize(market)))
    }

    pub fn segment(&self, market: &str, n: u32) -> PathBuf {
        self.dir.join(format!("{}.events.{n}.jsonl", sanitize(market)))
    }

    pub fn trades(&self, market: &str) -> PathBuf {
        self.dir.join(format!("{}.trades.json", sanitize(market)))
    }

    pub fn prices(&self, market: &str) -> PathBuf {
        self.dir.join(format!("{}.prices.json", sanitize(market)))
    }

    pub fn dedup_state(&self) -> PathBuf { self.dir.join("dedup-state.json") }

    /// Rotated segments 1..n that exist on disk.
    pub async fn rotated_segments(&self, market: &str) -> Vec<PathBuf> {
        let mut out = Vec::new();
        let mut n = 1;
        loop {
            let p = self.segment(market, n);
            if !exists(&p).await {
                break;
            }
            out.push(p);
            n += 1;
        }
        out
    }

    /// Log segments in replay order: rotated 1..n, then the active file.
    pub async fn log_segments(&self, market: &str) -> Vec<PathBuf> {
        let mut out = self.rotated_segments(market).await;
        let active = self.active_log(market);
        if exists(&active).await {
            out.push(active);
        }
        out
    }

    /// Every local artifact of a market, in upload order.
    pub async fn artifacts(&self, market: &str) -> Vec<PathBuf> {
        let mut out = self.log_segments(market).await;
        for p in [self.trades(market), self.prices(market)] {
            if exists(&p).await {
                out.push(p);
            }
        }
        out
    }

    /// Markets that still have an active log or a rotated segment in the
    /// account directory.
    pub async fn local_markets(&self) -> Vec<String> {
        let mut out = BTreeSet::new();
        let Ok(mut rd) = tokio::fs::read_dir(&self.dir).await else {
            return Vec::new();
        };
        while let Ok(Some(entry)) = rd.next_entry().await {
            if let Some(m) = entry.file_name().to_str().and_then(log_market) {
                out.insert(m.to_string());
            }
        }
        out.into_iter().collect()
    }
}

/// Market of `<m>.events.jsonl` or `<m>.events.<n>.jsonl`.
fn log_market(name: &str) -> Option<&str> {
    if let Some(m) = name.strip_suffix(EVENTS_SUFFIX) {
        return Some(m);
    }
    let (stem, n) = name.strip_suffix(".jsonl")?.rsplit_once('.')?;
    if n.is_empty() || !n.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.strip_suffix(".events")
}

async fn exists(p: &Path) -> bool { tokio::fs::metadata(p).await.is_ok() }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_ids_are_sanitised() {
        assert_eq!(sanitize("btc-updown-15m-1760000000"), "btc-updown-15m-1760000000");
        assert_eq!(sanitize("a/b c:d"), "a_b_c_d");
        assert_eq!(sanitize(""), "_");
    }

    #[tokio::test]
    async fn segments_in_replay_order() {
        let dir = tempfile::tempdir().unwrap();
        let l = Layout::new(dir.path(), "0xacc");
        tokio::fs::create_dir_all(l.dir()).await.unwrap();
        for p in [l.segment("m", 2), l.segment("m", 1), l.active_log("m"), l.trades("m")] {
            tokio::fs::write(&p, b"").await.unwrap();
        }
        let segs = l.log_segments("m").await;
        assert_eq!(segs, vec![l.segment("m", 1), l.segment("m", 2), l.active_log("m")]);
        let all = l.artifacts("m").await;
        assert_eq!(all.len(), 4);
        assert_eq!(all.last(), Some(&l.trades("m")));
        assert_eq!(l.local_markets().await, vec!["m".to_string()]);
    }

    #[tokio::test]
    async fn market_with_only_rotated_segments_is_listed() {
        let dir = tempfile::tempdir().unwrap();
        let l = Layout::new(dir.path(), "0xacc");
        tokio::fs::create_dir_all(l.dir()).await.unwrap();
        for p in [l.segment("m", 1), l.segment("n", 12), l.trades("t"), l.dedup_state()] {
            tokio::fs::write(&p, b"").await.unwrap();
        }
        tokio::fs::write(l.dir().join("x.events.tmp.jsonl"), b"").await.unwrap();
        assert_eq!(l.local_markets().await, vec!["m".to_string(), "n".to_string()]);
        assert_eq!(l.log_segments("m").await, vec![l.segment("m", 1)]);
    }
}
