// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Price-feed provider behind a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    /// Trade-execution feed (GDAX full channel).
    Gdax,
    /// Aggregated-quote feed (OANDA pricing stream).
    Oanda,
}

impl Provider {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gdax" => Some(Provider::Gdax),
            "oanda" => Some(Provider::Oanda),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gdax => "gdax",
            Provider::Oanda => "oanda",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized, append-only price/quote/trade record.
///
/// `id` stays `None` until the store assigns one. Numeric fields the provider
/// did not send (or sent unparsable) stay at zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Tick {
    pub id: Option<i64>,
    pub symbol: String,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub kind: String,
    pub order_type: Option<String>,
    pub side: Option<String>,
    pub bid: f64,
    pub ask: f64,
    pub price: f64,
    pub size: f64,
    pub volume: f64,
    pub liquidity: f64,
}

/// What the broker is told about a delivery once the binding is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Success or terminal no-op: ack.
    Acknowledge,
    /// Transient failure: nack with requeue.
    RequeueOnce,
    /// Failed again after a redelivery: ack without requeue, logged as error.
    DropAndLog,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Acknowledge => "ack",
            DeliveryOutcome::RequeueOnce => "requeue",
            DeliveryOutcome::DropAndLog => "drop",
        }
    }
}

/// One message instance handed to a binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub queue: String,
    pub body: Vec<u8>,
    pub redelivered: bool,
}
