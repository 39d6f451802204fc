// ===============================
// src/main.rs
// ===============================
/*
 # jalankan tanpa database (mock feed + in-memory store)
 STORE_MODE=memory cargo run

 # hitungan outcome per queue
 curl -s localhost:9898/metrics | grep '^deliveries_total'
 curl -s localhost:9898/metrics | grep '^numeric_parse_fallbacks_total'
*/
/*
=============================================================================
Project : tick_ingest — price-feed ingestion worker in Rust
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Consumes GDAX trade-execution and OANDA aggregated-quote messages
          from per-symbol queues, normalizes them into ticks, stores them in
          Postgres, and acks / requeues / drops each delivery.
=============================================================================
*/
mod broker;
mod config;
mod consumer;
mod decoder;
mod domain;
mod feed;
mod gdax;
mod metrics;
mod oanda;
mod policy;
mod store;

use futures_util::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::broker::{MemoryBroker, MemoryConsumer};
use crate::config::{BindingSpec, Config, FeedMode, StoreMode};
use crate::consumer::{ConsumerBinding, WorkerStats};
use crate::domain::Provider;
use crate::gdax::GdaxDecoder;
use crate::oanda::OandaDecoder;
use crate::store::{InMemoryTickStore, PgTickStore, TickStore};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

async fn open_store(cfg: &Config) -> Result<Arc<dyn TickStore>, BoxError> {
    match cfg.args.store_mode {
        StoreMode::Memory => {
            info!("store: in-memory (ticks are not durable)");
            Ok(Arc::new(InMemoryTickStore::new()))
        }
        StoreMode::Postgres => {
            let url = cfg.args.database_url.as_deref().unwrap_or_default();
            let store = PgTickStore::connect(url, cfg.args.db_max_connections).await?;
            if cfg.args.run_migrations {
                store.migrate().await?;
            }
            Ok(Arc::new(store))
        }
    }
}

/// Worker task for one binding; decoder chosen by provider.
fn spawn_worker(
    spec: &BindingSpec,
    store: Arc<dyn TickStore>,
    source: MemoryConsumer,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<WorkerStats> {
    match spec.provider {
        Provider::Gdax => {
            let binding = ConsumerBinding::new(spec.queue.clone(), GdaxDecoder, store);
            tokio::spawn(consumer::run(binding, source, shutdown))
        }
        Provider::Oanda => {
            let binding = ConsumerBinding::new(spec.queue.clone(), OandaDecoder, store);
            tokio::spawn(consumer::run(binding, source, shutdown))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Load config ----
    let cfg = config::load()?;

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(cfg.args.metrics_port));

    info!(
        store = ?cfg.args.store_mode,
        feed = ?cfg.args.feed_mode,
        bindings = ?cfg.bindings,
        delivery_limit = ?cfg.args.delivery_limit(),
        "startup config"
    );
    for b in &cfg.bindings {
        metrics::CONFIG_BINDING
            .with_label_values(&[b.provider.as_str(), &b.queue])
            .set(1);
    }

    // ---- Store (pool shared by every worker) ----
    let store = open_store(&cfg).await?;

    // ---- Bindings: one queue, one feed, one worker each ----
    let broker = MemoryBroker::new(1024, cfg.args.delivery_limit());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::with_capacity(cfg.bindings.len());
    let mut feeds = Vec::with_capacity(cfg.bindings.len());

    for spec in &cfg.bindings {
        let (publisher, source) = broker.declare(&spec.queue);
        workers.push((
            spec.queue.clone(),
            spawn_worker(spec, store.clone(), source, shutdown_rx.clone()),
        ));
        feeds.push(match cfg.args.feed_mode {
            FeedMode::Mock => tokio::spawn(feed::run_mock(publisher, spec.provider, shutdown_rx.clone())),
            FeedMode::Replay => tokio::spawn(feed::run_replay(publisher, cfg.args.replay_dir.clone())),
        });
    }

    // ---- Wait for signal ----
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(?e, "ctrl_c listener failed, shutting down");
    }
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    join_all(feeds).await;
    let (queues, handles): (Vec<String>, Vec<_>) = workers.into_iter().unzip();
    let mut total = WorkerStats::default();
    for (queue, joined) in queues.into_iter().zip(join_all(handles).await) {
        match joined {
            Ok(stats) => {
                total.acknowledged += stats.acknowledged;
                total.requeued += stats.requeued;
                total.dropped += stats.dropped;
            }
            Err(e) => error!(%queue, ?e, "worker panicked"),
        }
    }
    info!(?total, "all workers stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_bindings;
    use std::time::Duration;

    const FILL: &str = r#"{"type":"done","reason":"filled","price":"64.2","product_id":"LTC-USD","time":"2020-01-01T00:00:00Z"}"#;
    const PRICE: &str = r#"{"type":"PRICE","instrument":"EUR_USD","time":"2020-01-01T00:00:00Z","asks":[{"price":"1.1","liquidity":1000000}],"bids":[]}"#;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn poisoned_binding_does_not_block_others() {
        let specs = parse_bindings("gdax:A,oanda:B").unwrap();
        let store = Arc::new(InMemoryTickStore::new());
        let broker = MemoryBroker::new(16, None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut publishers = Vec::new();
        let mut handles = Vec::new();
        for spec in &specs {
            let (publisher, source) = broker.declare(&spec.queue);
            publishers.push(publisher);
            handles.push(spawn_worker(spec, store.clone(), source, shutdown_rx.clone()));
        }

        // A: one fill, then a body that never decodes and is requeued forever
        publishers[0].publish(FILL.as_bytes().to_vec()).await.unwrap();
        publishers[0].publish(b"{\"type\":\"done\",".to_vec()).await.unwrap();
        for _ in 0..3 {
            publishers[1].publish(PRICE.as_bytes().to_vec()).await.unwrap();
        }

        let persisted = tokio::time::timeout(Duration::from_secs(5), async {
            while store.len() < 4 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(persisted.is_ok(), "only {} ticks persisted", store.len());

        shutdown_tx.send(true).unwrap();
        let a = handles.remove(0).await.unwrap();
        let b = handles.remove(0).await.unwrap();

        assert_eq!(a.acknowledged, 1);
        assert!(a.requeued > 0);
        assert_eq!(a.dropped, 0);
        assert_eq!(b, WorkerStats { acknowledged: 3, requeued: 0, dropped: 0 });

        let ticks = store.ticks();
        assert_eq!(ticks.iter().filter(|t| t.symbol == "LTC-USD").count(), 1);
        assert_eq!(ticks.iter().filter(|t| t.symbol == "EUR-USD").count(), 3);
    }
}
