// ===============================
// src/gdax.rs
// ===============================
//
// Trade-execution feed (GDAX full channel). Every message type decodes, but
// only a filled `done` with a price becomes a tick:
//   {"type":"done","reason":"filled","price":"101.5","product_id":"LTC-USD",...}
// `received` / `open` / `match` / canceled `done` are valid no-ops.
//
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use crate::decoder::{
    decode_json, normalize_symbol, null_default, parse_numeric, DecodeError, Decoder,
};
use crate::domain::{Provider, Tick};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct GdaxMessage {
    #[serde(deserialize_with = "null_default")]
    pub sequence: i64,
    #[serde(rename = "type", deserialize_with = "null_default")]
    pub kind: String,
    pub time: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "null_default")]
    pub product_id: String,
    #[serde(rename = "client_oid", deserialize_with = "null_default")]
    pub client_id: String,
    #[serde(deserialize_with = "null_default")]
    pub order_id: String,
    #[serde(deserialize_with = "null_default")]
    pub order_type: String,
    #[serde(deserialize_with = "null_default")]
    pub bid: String,
    #[serde(deserialize_with = "null_default")]
    pub ask: String,
    #[serde(deserialize_with = "null_default")]
    pub size: String,
    #[serde(deserialize_with = "null_default")]
    pub price: String,
    #[serde(deserialize_with = "null_default")]
    pub funds: String,
    #[serde(deserialize_with = "null_default")]
    pub side: String,
    #[serde(deserialize_with = "null_default")]
    pub volume: String,
    #[serde(deserialize_with = "null_default")]
    pub reason: String,
}

impl GdaxMessage {
    pub fn is_fill(&self) -> bool {
        self.kind == "done" && self.reason == "filled" && !self.price.is_empty()
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GdaxDecoder;

impl Decoder for GdaxDecoder {
    type Message = GdaxMessage;

    fn provider(&self) -> Provider {
        Provider::Gdax
    }

    fn decode(&self, body: &[u8]) -> Result<GdaxMessage, DecodeError> {
        decode_json(body)
    }

    fn to_ticks(&self, msg: &GdaxMessage) -> Vec<Tick> {
        if !msg.is_fill() {
            return Vec::new();
        }
        info!(product = %msg.product_id, side = %msg.side, "FILLED @ {}", msg.price);

        let p = Provider::Gdax;
        vec![Tick {
            id: None,
            symbol: normalize_symbol(&msg.product_id),
            timestamp: msg.time,
            kind: msg.kind.clone(),
            order_type: non_empty(&msg.order_type),
            side: non_empty(&msg.side),
            bid: parse_numeric(p, "bid", &msg.bid),
            ask: parse_numeric(p, "ask", &msg.ask),
            price: parse_numeric(p, "price", &msg.price),
            size: parse_numeric(p, "size", &msg.size),
            volume: parse_numeric(p, "volume", &msg.volume),
            liquidity: 0.0,
        }]
    }
}
