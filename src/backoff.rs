// ===============================
// src/backoff.rs
// ===============================
//
// Reconnection supervisor shared by every connector:
// - Backoff       : doubling delay from `base`, capped at `cap`.
// - ConnectionState: per-connector topics, two backoff ramps, liveness stamp.
// - supervise     : runs a Session forever, classifying each failure
//                   (transient / rate-limited / fatal) into a delay or a stop.
//
use async_trait::async_trait;
use rand::Rng;
use std::collections::BTreeSet;
use tokio::sync::watch;
use tokio::time::{sleep, Duration, Instant};
use tracing::{error, info, warn};

use crate::error::{ErrorClass, FeedError};
use crate::metrics::{CONNECTED, RATE_LIMITED, RECONNECTS};

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
}

#[derive(Debug, Clone)]
pub struct Backoff {
    cfg: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(cfg: BackoffConfig) -> Self { Self { cfg, attempt: 0 } }

    /// Delay before the next attempt: base, 2*base, 4*base, ... never above cap.
    pub fn next_delay(&mut self) -> Duration {
        let shift = self.attempt.min(20);
        self.attempt = self.attempt.saturating_add(1);
        let factor = 1u32 << shift;
        self.cfg.base.saturating_mul(factor).min(self.cfg.cap)
    }

    pub fn reset(&mut self) { self.attempt = 0; }

    fn jitter(&self) -> Duration {
        let max = self.cfg.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub network: BackoffConfig,
    pub rate_limit: BackoffConfig,
}

/// Private state of one connection. Topics survive reconnects.
#[derive(Debug)]
pub struct ConnectionState {
    pub name: &'static str,
    pub subscribed_topics: BTreeSet<String>,
    pub backoff: Backoff,
    pub rate_limit_backoff: Backoff,
    pub last_liveness: Option<Instant>,
}

impl ConnectionState {
    pub fn new(name: &'static str, policy: RetryPolicy) -> Self {
        Self {
            name,
            subscribed_topics: BTreeSet::new(),
            backoff: Backoff::new(policy.network),
            rate_limit_backoff: Backoff::new(policy.rate_limit),
            last_liveness: None,
        }
    }

    /// A session is up (or a poll succeeded): ramps restart from base.
    pub fn on_connected(&mut self) {
        self.backoff.reset();
        self.rate_limit_backoff.reset();
        self.last_liveness = Some(Instant::now());
        CONNECTED.with_label_values(&[self.name]).set(1);
    }

    pub fn mark_live(&mut self) { self.last_liveness = Some(Instant::now()); }

    /// True when nothing was heard for longer than `timeout`.
    pub fn is_silent(&self, timeout: Duration) -> bool {
        match self.last_liveness {
            Some(t) => t.elapsed() > timeout,
            None => false,
        }
    }

    /// Adds topics, returning the ones not subscribed before.
    pub fn add_topics<I: IntoIterator<Item = String>>(&mut self, topics: I) -> Vec<String> {
        topics.into_iter().filter(|t| self.subscribed_topics.insert(t.clone())).collect()
    }

    /// Replaces the topic set with `topics` on reconnect, returning how many
    /// were dropped.
    pub fn sync_topics<I: IntoIterator<Item = String>>(&mut self, topics: I) -> usize {
        let current: BTreeSet<String> = topics.into_iter().collect();
        let before = self.subscribed_topics.len();
        self.subscribed_topics.retain(|t| current.contains(t));
        let dropped = before - self.subscribed_topics.len();
        self.subscribed_topics.extend(current);
        dropped
    }
}

/// One connection attempt of a connector: connect, stream, return on failure.
///
/// `Ok(())` means the session ended on its own (stop requested or a clean
/// close); the connector is re-entered after the network delay unless stopping.
#[async_trait]
pub trait Session: Send {
    async fn run_once(&mut self, state: &mut ConnectionState) -> Result<(), FeedError>;
}

/// Runs `session` until it fails fatally or `stop` flips to true.
pub async fn supervise<S, C>(session: &mut S, state: &mut ConnectionState, mut stop: watch::Receiver<bool>, classify: C)
where
    S: Session,
    C: Fn(&FeedError) -> ErrorClass,
{
    loop {
        if *stop.borrow() {
            break;
        }
        let result = session.run_once(state).await;
        CONNECTED.with_label_values(&[state.name]).set(0);
        if *stop.borrow() {
            break;
        }
        let delay = match result {
            Ok(()) => {
                info!(connector = state.name, "session ended, reconnecting");
                state.backoff.next_delay()
            }
            Err(e) => match classify(&e) {
                ErrorClass::Fatal => {
                    error!(connector = state.name, error = %e, "fatal error, connector stopped");
                    return;
                }
                ErrorClass::RateLimited => {
                    RATE_LIMITED.with_label_values(&[state.name]).inc();
                    let d = state.rate_limit_backoff.next_delay();
                    warn!(connector = state.name, error = %e, delay_ms = d.as_millis() as u64, "rate limited, backing off");
                    d
                }
                ErrorClass::Transient => {
                    let d = state.backoff.next_delay();
                    warn!(connector = state.name, error = %e, delay_ms = d.as_millis() as u64, "connection failed, backing off");
                    d
                }
            },
        };
        RECONNECTS.with_label_values(&[state.name]).inc();
        let jitter = state.backoff.jitter();
        tokio::select! {
            _ = sleep(delay + jitter) => {}
            Ok(()) = stop.changed() => {}
        }
    }
    info!(connector = state.name, "connector stopped");
}

/// Default classification: the error's own class.
pub fn classify(e: &FeedError) -> ErrorClass { e.class() }

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(base_ms: u64, cap_ms: u64) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(base_ms),
            cap: Duration::from_millis(cap_ms),
            jitter: Duration::ZERO,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy { network: cfg(1_000, 30_000), rate_limit: cfg(5_000, 120_000) }
    }

    #[test]
    fn doubling_sequence_is_capped() {
        let mut b = Backoff::new(cfg(1_000, 30_000));
        let secs: Vec<u64> = (0..8).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30, 30]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn topics_are_retained_and_deduplicated() {
        let mut st = ConnectionState::new("test", policy());
        let added = st.add_topics(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(added.len(), 2);
        let added = st.add_topics(vec!["b".to_string(), "c".to_string()]);
        assert_eq!(added, vec!["c".to_string()]);
        assert_eq!(st.subscribed_topics.len(), 3);
    }

    #[test]
    fn reconnect_drops_topics_no_longer_indexed() {
        let mut st = ConnectionState::new("t", policy());
        st.add_topics(vec!["a".to_string(), "b".to_string()]);
        let dropped = st.sync_topics(vec!["b".to_string(), "c".to_string()]);
        assert_eq!(dropped, 1);
        assert_eq!(st.subscribed_topics.iter().cloned().collect::<Vec<_>>(), vec!["b", "c"]);
    }

    /// Replays a scripted result per call and records call instants.
    struct Scripted {
        calls: Vec<Instant>,
        script: fn(usize) -> Result<(), FeedError>,
        stop: watch::Sender<bool>,
    }

    #[async_trait]
    impl Session for Scripted {
        async fn run_once(&mut self, _state: &mut ConnectionState) -> Result<(), FeedError> {
            self.calls.push(Instant::now());
            let r = (self.script)(self.calls.len());
            if r.is_ok() {
                let _ = self.stop.send(true);
            }
            r
        }
    }

    async fn run_script(script: fn(usize) -> Result<(), FeedError>) -> Vec<u64> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut s = Scripted { calls: Vec::new(), script, stop: stop_tx };
        let mut st = ConnectionState::new("test", policy());
        supervise(&mut s, &mut st, stop_rx, classify).await;
        s.calls.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_disconnects_follow_backoff() {
        let gaps = run_script(|n| if n == 8 { Ok(()) } else { Err(FeedError::Disconnected("eof".into())) }).await;
        assert_eq!(gaps, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_uses_its_own_ramp() {
        let gaps = run_script(|n| match n {
            1 | 2 => Err(FeedError::RateLimited("429".into())),
            3 => Err(FeedError::Transient("reset".into())),
            _ => Ok(()),
        })
        .await;
        assert_eq!(gaps, vec![5, 10, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_stops_connector() {
        let gaps = run_script(|_| Err(FeedError::Authentication("401".into()))).await;
        assert!(gaps.is_empty());
    }
}
