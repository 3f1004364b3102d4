// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : pm_trade_recorder - multi-source trade & market-context recorder
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Follows one account on a recurring-market exchange through the
          live market feed, the authenticated user feed, a REST poller and
          an on-chain monitor; dedups everything into per-market JSONL logs,
          correlates each trade with the surrounding book, and promotes
          finished markets to durable storage.
=============================================================================
*/
use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::{BackoffConfig, RetryPolicy};
use crate::chain::ChainSettings;
use crate::error::ConfigError;
use crate::feed::LiveSettings;
use crate::ingest::IngestSettings;
use crate::merge::MergeSettings;
use crate::poller::PollSettings;
use crate::promoter::PromotionSettings;
use crate::recorder::WriterSettings;
use crate::resolver::DiscoverySettings;
use crate::user_feed::UserCredentials;

/// Which feeds run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// REST poller only
    Poll,
    /// market + user websockets
    Live,
    /// everything
    Hybrid,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Poll => "poll",
            Mode::Live => "live",
            Mode::Hybrid => "hybrid",
        }
    }

    pub fn runs_poller(&self) -> bool { matches!(self, Mode::Poll | Mode::Hybrid) }

    pub fn runs_live(&self) -> bool { matches!(self, Mode::Live | Mode::Hybrid) }
}

#[derive(Parser, Clone, Debug)]
#[command(name = "pm_trade_recorder", version, about = "Multi-source trade and market-context recorder")]
pub struct Cli {
    #[arg(long, env = "MODE", value_enum, default_value = "hybrid")]
    pub mode: Mode,

    /// Account address (0x + 40 hex)
    #[arg(long, env = "ACCOUNT")]
    pub account: String,

    #[arg(long, env = "MARKET_PREFIX")]
    pub market_prefix: Option<String>,

    /// Comma separated explicit market slugs
    #[arg(long, env = "MARKETS", value_delimiter = ',')]
    pub markets: Vec<String>,

    /// Recurrence period of prefix markets, 0 disables window discovery
    #[arg(long, env = "MARKET_PERIOD_SECS", default_value_t = 900)]
    pub market_period_secs: i64,

    #[arg(long, env = "DISCOVERY_INTERVAL_SECS", default_value_t = 30)]
    pub discovery_interval_secs: u64,

    #[arg(long, env = "OUT_DIR", default_value = "data")]
    pub out_dir: PathBuf,

    // ---- poller ----
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 10)]
    pub poll_interval_secs: u64,
    #[arg(long, env = "POLL_LIMIT", default_value_t = 100)]
    pub poll_limit: u32,

    // ---- endpoints ----
    #[arg(long, env = "MARKET_WS_URL", default_value = "wss://ws-subscriptions-clob.polymarket.com/ws/market")]
    pub market_ws_url: String,
    #[arg(long, env = "USER_WS_URL", default_value = "wss://ws-subscriptions-clob.polymarket.com/ws/user")]
    pub user_ws_url: String,
    #[arg(long, env = "DATA_API_URL", default_value = "https://data-api.polymarket.com")]
    pub data_api_url: String,
    #[arg(long, env = "GAMMA_API_URL", default_value = "https://gamma-api.polymarket.com")]
    pub gamma_api_url: String,
    #[arg(long, env = "CHAIN_RPC_URL")]
    pub chain_rpc_url: Option<String>,
    #[arg(long, env = "CHAIN_WS_URL")]
    pub chain_ws_url: Option<String>,

    // ---- credentials (out-of-band, env only) ----
    #[arg(skip = std::env::var("POLY_API_KEY").ok())]
    pub api_key: Option<String>,
    #[arg(skip = std::env::var("POLY_API_SECRET").ok())]
    pub api_secret: Option<String>,
    #[arg(skip = std::env::var("POLY_API_PASSPHRASE").ok())]
    pub api_passphrase: Option<String>,
    #[arg(skip = std::env::var("ARCHIVE_TOKEN").ok())]
    pub archive_token: Option<String>,

    // ---- archive ----
    #[arg(long, env = "ARCHIVE_DIR", conflicts_with = "archive_url")]
    pub archive_dir: Option<PathBuf>,
    #[arg(long, env = "ARCHIVE_URL")]
    pub archive_url: Option<String>,

    // ---- writer / dedup ----
    #[arg(long, env = "FLUSH_INTERVAL_MS", default_value_t = 1000)]
    pub flush_interval_ms: u64,
    #[arg(long, env = "FLUSH_EVERY", default_value_t = 1000)]
    pub flush_every: usize,
    #[arg(long, env = "ROTATE_BYTES", default_value_t = 64 * 1024 * 1024)]
    pub rotate_bytes: u64,
    #[arg(long, env = "DEDUP_CAPACITY", default_value_t = 10_000)]
    pub dedup_capacity: usize,

    // ---- merge ----
    #[arg(long, env = "WINDOW_SECS", default_value_t = 3)]
    pub window_secs: u64,
    #[arg(long, env = "FALLBACK_SECS", default_value_t = 30)]
    pub fallback_secs: u64,
    #[arg(long, env = "FALLBACK_BOUND_SECS", default_value_t = 30)]
    pub fallback_bound_secs: u64,
    #[arg(long, env = "MAX_RAW_SNAPSHOTS", default_value_t = 100)]
    pub max_raw_snapshots: usize,
    #[arg(long, env = "MERGE_INTERVAL_SECS", default_value_t = 30)]
    pub merge_interval_secs: u64,
    /// Attach the trade's raw payload to merged records
    #[arg(long, env = "ATTACH_RAW")]
    pub attach_raw: bool,

    // ---- promotion ----
    #[arg(long, env = "INACTIVITY_SECS", default_value_t = 300)]
    pub inactivity_secs: u64,
    #[arg(long, env = "PROMOTION_CHECK_SECS", default_value_t = 30)]
    pub promotion_check_secs: u64,
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 15)]
    pub shutdown_grace_secs: u64,

    // ---- liveness / backoff ----
    #[arg(long, env = "PING_INTERVAL_SECS", default_value_t = 5)]
    pub ping_interval_secs: u64,
    #[arg(long, env = "LIVENESS_MULTIPLE", default_value_t = 3)]
    pub liveness_multiple: u32,
    #[arg(long, env = "BACKOFF_BASE_MS", default_value_t = 1000)]
    pub backoff_base_ms: u64,
    #[arg(long, env = "BACKOFF_CAP_MS", default_value_t = 30_000)]
    pub backoff_cap_ms: u64,
    #[arg(long, env = "RATE_LIMIT_BASE_MS", default_value_t = 5000)]
    pub rate_limit_base_ms: u64,
    #[arg(long, env = "RATE_LIMIT_CAP_MS", default_value_t = 120_000)]
    pub rate_limit_cap_ms: u64,
    #[arg(long, env = "BACKOFF_JITTER_MS", default_value_t = 0)]
    pub backoff_jitter_ms: u64,

    // ---- observability ----
    /// 0 disables the metrics endpoint
    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,
}

#[derive(Clone, Debug)]
pub enum Archive {
    Disabled,
    Dir(PathBuf),
    Http { url: String, token: Option<String> },
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub mode: Mode,
    pub account: String,
    pub out_dir: PathBuf,
    pub metrics_port: u16,
    pub gamma_url: String,
    pub discovery: DiscoverySettings,
    pub ingest: IngestSettings,
    pub live: LiveSettings,
    pub market_ws_url: String,
    pub user_ws_url: String,
    pub user_creds: Option<UserCredentials>,
    pub poll: PollSettings,
    pub chain: Option<ChainSettings>,
    pub retry: RetryPolicy,
    pub archive: Archive,
    pub shutdown_grace: Duration,
}

/// `0x` + 40 hex digits, returned lowercase.
pub fn validate_account(raw: &str) -> Result<String, ConfigError> {
    let s = raw.trim().to_ascii_lowercase();
    let ok = s.len() == 42
        && s.starts_with("0x")
        && hex::decode(&s[2..]).map(|b| b.len() == 20).unwrap_or(false);
    if ok { Ok(s) } else { Err(ConfigError::InvalidAccount(raw.to_string())) }
}

fn validate_url(name: &'static str, raw: &str) -> Result<String, ConfigError> {
    url::Url::parse(raw).map_err(|e| ConfigError::Invalid { name, reason: e.to_string() })?;
    Ok(raw.trim_end_matches('/').to_string())
}

fn positive(name: &'static str, v: u64) -> Result<u64, ConfigError> {
    if v == 0 {
        return Err(ConfigError::Invalid { name, reason: "must be greater than zero".into() });
    }
    Ok(v)
}

impl Settings {
    pub fn from_cli(cli: Cli) -> Result<Settings, ConfigError> {
        let account = validate_account(&cli.account)?;

        let market_prefix = cli.market_prefix.filter(|p| !p.trim().is_empty());
        let explicit: Vec<String> =
            cli.markets.iter().map(|m| m.trim().to_string()).filter(|m| !m.is_empty()).collect();
        if explicit.is_empty() && (market_prefix.is_none() || cli.market_period_secs <= 0) && cli.mode.runs_live() {
            tracing::warn!("no markets and no recurring prefix: live feeds will wait for markets");
        }

        let ms = Duration::from_millis;
        let secs = Duration::from_secs;

        let retry = RetryPolicy {
            network: BackoffConfig {
                base: ms(positive("backoff-base-ms", cli.backoff_base_ms)?),
                cap: ms(cli.backoff_cap_ms.max(cli.backoff_base_ms)),
                jitter: ms(cli.backoff_jitter_ms),
            },
            rate_limit: BackoffConfig {
                base: ms(positive("rate-limit-base-ms", cli.rate_limit_base_ms)?),
                cap: ms(cli.rate_limit_cap_ms.max(cli.rate_limit_base_ms)),
                jitter: ms(cli.backoff_jitter_ms),
            },
        };

        let ingest = IngestSettings {
            market_prefix: market_prefix.clone(),
            attach_raw: cli.attach_raw,
            dedup_capacity: cli.dedup_capacity.max(2),
            merge: MergeSettings {
                window: secs(cli.window_secs),
                fallback: secs(cli.fallback_secs),
                fallback_bound: secs(cli.fallback_bound_secs),
                max_raw_snapshots: cli.max_raw_snapshots,
                attach_raw: cli.attach_raw,
            },
            merge_interval: secs(positive("merge-interval-secs", cli.merge_interval_secs)?),
            writer: WriterSettings {
                flush_interval: ms(positive("flush-interval-ms", cli.flush_interval_ms)?),
                flush_every: cli.flush_every.max(1),
                rotate_bytes: positive("rotate-bytes", cli.rotate_bytes)?,
            },
            promotion: PromotionSettings {
                inactivity: secs(cli.inactivity_secs),
                check_interval: secs(positive("promotion-check-secs", cli.promotion_check_secs)?),
            },
            ..IngestSettings::default()
        };

        let live = LiveSettings {
            ping_interval: secs(positive("ping-interval-secs", cli.ping_interval_secs)?),
            liveness_multiple: cli.liveness_multiple.max(1),
        };

        let user_creds = match (cli.api_key, cli.api_secret, cli.api_passphrase) {
            (Some(api_key), Some(secret), Some(passphrase)) => Some(UserCredentials { api_key, secret, passphrase }),
            _ => None,
        };

        let chain = match cli.chain_rpc_url {
            Some(rpc) => Some(ChainSettings {
                rpc_url: validate_url("chain-rpc-url", &rpc)?,
                ws_url: cli.chain_ws_url.as_deref().map(|u| validate_url("chain-ws-url", u)).transpose()?,
                account: account.clone(),
                poll_interval: secs(2),
                max_catchup: 20,
                head_timeout: secs(60),
            }),
            None => None,
        };

        let archive = match (cli.archive_dir, cli.archive_url) {
            (Some(dir), _) => Archive::Dir(dir),
            (None, Some(url)) => Archive::Http { url: validate_url("archive-url", &url)?, token: cli.archive_token },
            (None, None) => Archive::Disabled,
        };

        Ok(Settings {
            mode: cli.mode,
            poll: PollSettings {
                base_url: validate_url("data-api-url", &cli.data_api_url)?,
                account: account.clone(),
                limit: cli.poll_limit.max(1),
                interval: secs(positive("poll-interval-secs", cli.poll_interval_secs)?),
            },
            account,
            out_dir: cli.out_dir,
            metrics_port: cli.metrics_port,
            gamma_url: validate_url("gamma-api-url", &cli.gamma_api_url)?,
            discovery: DiscoverySettings {
                explicit,
                prefix: market_prefix,
                period_secs: cli.market_period_secs,
                interval: secs(positive("discovery-interval-secs", cli.discovery_interval_secs)?),
            },
            ingest,
            live,
            market_ws_url: validate_url("market-ws-url", &cli.market_ws_url)?,
            user_ws_url: validate_url("user-ws-url", &cli.user_ws_url)?,
            user_creds,
            chain,
            retry,
            archive,
            shutdown_grace: secs(cli.shutdown_grace_secs),
        })
    }
}

pub fn load() -> Result<Settings, ConfigError> {
    // .env first so clap's `env` fallbacks see it
    let _ = dotenv();
    Settings::from_cli(Cli::parse())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACC: &str = "0xAbCdEf0123456789abcdef0123456789ABCDEF01";

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["pm_trade_recorder"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::from_cli(parse(&["--account", ACC])).unwrap();
        assert_eq!(s.mode, Mode::Hybrid);
        assert_eq!(s.account, ACC.to_ascii_lowercase());
        assert_eq!(s.ingest.merge.window, Duration::from_secs(3));
        assert_eq!(s.ingest.merge.fallback, Duration::from_secs(30));
        assert_eq!(s.ingest.merge.max_raw_snapshots, 100);
        assert_eq!(s.ingest.promotion.inactivity, Duration::from_secs(300));
        assert_eq!(s.ingest.writer.flush_every, 1000);
        assert_eq!(s.ingest.dedup_capacity, 10_000);
        assert_eq!(s.retry.network.base, Duration::from_secs(1));
        assert_eq!(s.retry.network.cap, Duration::from_secs(30));
        assert_eq!(s.poll.limit, 100);
        assert_eq!(s.live.liveness_timeout(), Duration::from_secs(15));
        assert!(s.chain.is_none());
        assert!(matches!(s.archive, Archive::Disabled));
    }

    #[test]
    fn malformed_account_is_rejected() {
        for bad in ["0x123", "abcdef0123456789abcdef0123456789abcdef0123", "0xZZcdef0123456789abcdef0123456789abcdef01"] {
            let err = Settings::from_cli(parse(&["--account", bad])).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidAccount(_)), "{bad}");
        }
    }

    #[test]
    fn mode_markets_and_archive() {
        let s = Settings::from_cli(parse(&[
            "--account", ACC, "--mode", "poll", "--markets", "a-1, b-2", "--archive-dir", "/tmp/archive",
            "--chain-rpc-url", "https://rpc.example",
        ]))
        .unwrap();
        assert!(s.mode.runs_poller() && !s.mode.runs_live());
        assert_eq!(s.discovery.explicit, vec!["a-1".to_string(), "b-2".to_string()]);
        assert!(matches!(s.archive, Archive::Dir(_)));
        assert_eq!(s.chain.unwrap().account, ACC.to_ascii_lowercase());
    }

    #[test]
    fn zero_interval_is_invalid() {
        let err = Settings::from_cli(parse(&["--account", ACC, "--poll-interval-secs", "0"])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "poll-interval-secs", .. }));
    }
}
