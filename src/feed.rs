// ===============================
// src/feed.rs
// ===============================
//
// Inbound feed drivers, one per binding, publishing raw provider payloads
// into that binding's queue:
// - run_mock   : random-walk generator (~20 msgs/s) in the provider's shape
// - run_replay : `<dir>/<queue>.jsonl`, one delivery per non-blank line
//
// Notes:
// - Mock trade feed emits received/open/done events; roughly a third of the
//   `done` events are canceled, so filtering is exercised too.
// - Mock quote feed sends a HEARTBEAT every 10th message.
//
use chrono::{SecondsFormat, Utc};
use rand::Rng;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::broker::Publisher;
use crate::domain::Provider;

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn mock_trade(symbol: &str, seq: i64, px: f64) -> serde_json::Value {
    // jangan simpan ThreadRng melewati .await
    let mut rng = rand::thread_rng();
    let side = if rng.gen_bool(0.5) { "buy" } else { "sell" };
    let size = format!("{:.4}", rng.gen_range(0.001..2.0));
    let price = format!("{px:.2}");
    match seq % 3 {
        0 => json!({
            "type": "received", "sequence": seq, "product_id": symbol, "time": now_rfc3339(),
            "order_type": "limit", "side": side, "size": size, "price": price,
        }),
        1 => json!({
            "type": "open", "sequence": seq, "product_id": symbol, "time": now_rfc3339(),
            "side": side, "price": price, "remaining_size": size,
        }),
        _ => {
            let reason = if rng.gen_bool(0.66) { "filled" } else { "canceled" };
            json!({
                "type": "done", "sequence": seq, "product_id": symbol, "time": now_rfc3339(),
                "order_type": "limit", "side": side, "size": size, "price": price, "reason": reason,
            })
        }
    }
}

fn mock_quote(instrument: &str, seq: i64, mid: f64) -> serde_json::Value {
    if seq % 10 == 0 {
        return json!({ "type": "HEARTBEAT", "time": now_rfc3339() });
    }
    let mut rng = rand::thread_rng();
    let half = rng.gen_range(0.00005..0.0002);
    let depth = |lvl: u32| 1_000_000u64 * u64::from(lvl);
    json!({
        "type": "PRICE",
        "instrument": instrument,
        "time": now_rfc3339(),
        "tradeable": true,
        "status": "tradeable",
        "asks": [
            { "price": format!("{:.5}", mid + half), "liquidity": depth(1) },
            { "price": format!("{:.5}", mid + 2.0 * half), "liquidity": depth(5) },
        ],
        "bids": [
            { "price": format!("{:.5}", mid - half), "liquidity": depth(1) },
            { "price": format!("{:.5}", mid - 2.0 * half), "liquidity": depth(5) },
        ],
        "closeoutAsk": format!("{:.5}", mid + 2.0 * half),
        "closeoutBid": format!("{:.5}", mid - 2.0 * half),
    })
}

/// Synthetic provider payloads until shutdown or the queue closes.
pub async fn run_mock(publisher: Publisher, provider: Provider, mut shutdown: watch::Receiver<bool>) {
    let symbol = publisher.queue().to_string();
    info!(queue = %symbol, %provider, "mock feed: started");

    let mut px: f64 = match provider {
        Provider::Gdax => 100.0,
        Provider::Oanda => 1.1,
    };
    let mut seq: i64 = 0;
    loop {
        let step = rand::thread_rng().gen_range(-3..=3) as f64;
        px = match provider {
            Provider::Gdax => (px + step * 0.01).max(50.0),
            Provider::Oanda => (px + step * 0.00001).max(0.5),
        };
        seq += 1;
        let payload = match provider {
            Provider::Gdax => mock_trade(&symbol, seq, px),
            Provider::Oanda => mock_quote(&symbol, seq, px),
        };
        if publisher.publish(payload.to_string().into_bytes()).await.is_err() {
            warn!(queue = %symbol, "mock feed: queue closed");
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(Duration::from_millis(50)) => {}
        }
    }
    info!(queue = %symbol, published = seq, "mock feed: stopped");
}

/// Publish every non-blank line of `<dir>/<queue>.jsonl`, then return.
pub async fn run_replay(publisher: Publisher, dir: String) {
    let queue = publisher.queue().to_string();
    let path = Path::new(&dir).join(format!("{queue}.jsonl"));
    let file = match File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            error!(?e, path = %path.display(), "replay: open failed");
            return;
        }
    };
    info!(path = %path.display(), "replay: started");

    let mut lines = BufReader::new(file).lines();
    let mut published: u64 = 0;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                if publisher.publish(line.into_bytes()).await.is_err() {
                    warn!(%queue, "replay: queue closed");
                    break;
                }
                published += 1;
            }
            Ok(None) => break,
            Err(e) => {
                error!(?e, %queue, "replay: read error");
                break;
            }
        }
    }
    info!(%queue, published, "replay: finished");
}
