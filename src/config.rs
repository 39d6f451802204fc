// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : tick_ingest — price-feed ingestion worker in Rust
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Consumes GDAX trade-execution and OANDA aggregated-quote messages
          from per-symbol queues, normalizes them into ticks, stores them in
          Postgres, and acks / requeues / drops each delivery.
=============================================================================
*/
use ahash::AHashSet as HashSet;
use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use thiserror::Error;

use crate::domain::Provider;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid binding `{0}`: expected provider:queue")]
    BindingFormat(String),
    #[error("unknown provider `{0}` (expected gdax|oanda)")]
    UnknownProvider(String),
    #[error("queue `{0}` bound more than once")]
    DuplicateQueue(String),
    #[error("no bindings configured")]
    NoBindings,
    #[error("DATABASE_URL is required when STORE_MODE=postgres")]
    MissingDatabaseUrl,
}

/// Tempat menyimpan tick
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StoreMode {
    Postgres,
    Memory,
}

/// Sumber pesan untuk queue tiap binding
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FeedMode {
    Mock,
    Replay,
}

/// One consumer binding: which decoder reads which queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingSpec {
    pub provider: Provider,
    pub queue: String,
}

#[derive(Clone, Debug, Parser)]
#[command(name = "tick_ingest", about = "Price-feed tick ingestion worker")]
pub struct Args {
    /// Comma separated provider:queue pairs, e.g. gdax:BTC-USD,oanda:EUR_USD
    #[arg(long, env = "BINDINGS", default_value = "gdax:BTC-USD,gdax:ETH-USD,oanda:EUR_USD")]
    pub bindings: String,

    #[arg(long = "store", env = "STORE_MODE", value_enum, default_value = "postgres")]
    pub store_mode: StoreMode,

    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 5)]
    pub db_max_connections: u32,

    /// Run the schema bootstrap before consuming
    #[arg(long = "migrate", env = "RUN_MIGRATIONS", default_value_t = true, action = clap::ArgAction::Set)]
    pub run_migrations: bool,

    #[arg(long = "feed", env = "FEED_MODE", value_enum, default_value = "mock")]
    pub feed_mode: FeedMode,

    #[arg(long, env = "REPLAY_DIR", default_value = "./replay")]
    pub replay_dir: String,

    /// Redeliveries the in-process broker allows per message (0 = unlimited)
    #[arg(long, env = "DELIVERY_LIMIT", default_value_t = 5)]
    pub delivery_limit: u32,

    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,
}

impl Args {
    pub fn delivery_limit(&self) -> Option<u32> {
        (self.delivery_limit > 0).then_some(self.delivery_limit)
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub args: Args,
    pub bindings: Vec<BindingSpec>,
}

/// `gdax:BTC-USD, oanda:EUR_USD` -> bindings, in order.
pub fn parse_bindings(raw: &str) -> Result<Vec<BindingSpec>, ConfigError> {
    let mut out: Vec<BindingSpec> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (provider, queue) = entry
            .split_once(':')
            .ok_or_else(|| ConfigError::BindingFormat(entry.to_string()))?;
        let queue = queue.trim();
        if queue.is_empty() {
            return Err(ConfigError::BindingFormat(entry.to_string()));
        }
        let provider =
            Provider::parse(provider).ok_or_else(|| ConfigError::UnknownProvider(provider.trim().to_string()))?;
        if !seen.insert(queue.to_string()) {
            return Err(ConfigError::DuplicateQueue(queue.to_string()));
        }
        out.push(BindingSpec { provider, queue: queue.to_string() });
    }
    if out.is_empty() {
        return Err(ConfigError::NoBindings);
    }
    Ok(out)
}

pub fn from_args(args: Args) -> Result<Config, ConfigError> {
    if args.store_mode == StoreMode::Postgres && args.database_url.as_deref().map_or(true, str::is_empty) {
        return Err(ConfigError::MissingDatabaseUrl);
    }
    let bindings = parse_bindings(&args.bindings)?;
    Ok(Config { args, bindings })
}

pub fn load() -> Result<Config, ConfigError> {
    // Pastikan .env dibaca (agar DATABASE_URL, BINDINGS, dll ter-load)
    let _ = dotenv();
    from_args(Args::parse())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["tick_ingest"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn parses_binding_list() {
        let b = parse_bindings(" gdax:BTC-USD , GDAX:ETH-USD,oanda:EUR_USD,").unwrap();
        assert_eq!(
            b,
            vec![
                BindingSpec { provider: Provider::Gdax, queue: "BTC-USD".into() },
                BindingSpec { provider: Provider::Gdax, queue: "ETH-USD".into() },
                BindingSpec { provider: Provider::Oanda, queue: "EUR_USD".into() },
            ]
        );
    }

    #[test]
    fn rejects_bad_bindings() {
        assert!(matches!(parse_bindings("BTC-USD"), Err(ConfigError::BindingFormat(_))));
        assert!(matches!(parse_bindings("gdax:"), Err(ConfigError::BindingFormat(_))));
        assert!(matches!(parse_bindings("kraken:XBT"), Err(ConfigError::UnknownProvider(_))));
        assert!(matches!(parse_bindings("coinbase:BTC-USD"), Err(ConfigError::UnknownProvider(_))));
        assert!(matches!(
            parse_bindings("gdax:BTC-USD,oanda:BTC-USD"),
            Err(ConfigError::DuplicateQueue(_))
        ));
        assert!(matches!(parse_bindings(" , "), Err(ConfigError::NoBindings)));
    }

    #[test]
    fn postgres_requires_database_url() {
        let a = Args::try_parse_from(["tick_ingest", "--store", "postgres", "--database-url", ""]).unwrap();
        assert!(matches!(from_args(a), Err(ConfigError::MissingDatabaseUrl)));

        let cfg = from_args(args(&["--store", "memory", "--bindings", "oanda:USD_JPY"])).unwrap();
        assert_eq!(cfg.bindings.len(), 1);
        assert_eq!(cfg.args.store_mode, StoreMode::Memory);
    }

    #[test]
    fn flags_override_defaults() {
        let a = args(&[
            "--store", "memory", "--feed", "replay", "--replay-dir", "/tmp/r",
            "--migrate", "false", "--delivery-limit", "0", "--metrics-port", "9100",
        ]);
        assert_eq!(a.feed_mode, FeedMode::Replay);
        assert_eq!(a.replay_dir, "/tmp/r");
        assert!(!a.run_migrations);
        assert_eq!(a.delivery_limit(), None);
        assert_eq!(a.metrics_port, 9100);
    }
}
