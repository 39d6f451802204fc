// ===============================
// src/oanda.rs
// ===============================
//
// Aggregated-quote feed (OANDA pricing stream). One PRICE snapshot fans out
// to one tick per book entry, asks first then bids:
//   {"type":"PRICE","instrument":"EUR_USD","time":"...",
//    "asks":[{"price":"1.1","liquidity":1000000}],"bids":[...]}
// HEARTBEAT messages carry no book and produce nothing.
//
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::decoder::{decode_json, normalize_symbol, null_default, DecodeError, Decoder, Quantity};
use crate::domain::{Provider, Tick};

pub const HEARTBEAT: &str = "HEARTBEAT";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BookEntry {
    pub price: Option<Quantity>,
    pub liquidity: Option<Quantity>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OandaMessage {
    #[serde(rename = "type", deserialize_with = "null_default")]
    pub kind: String,
    pub time: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "null_default")]
    pub bids: Vec<BookEntry>,
    #[serde(deserialize_with = "null_default")]
    pub asks: Vec<BookEntry>,
    #[serde(deserialize_with = "null_default")]
    pub closeout_bid: String,
    #[serde(deserialize_with = "null_default")]
    pub closeout_ask: String,
    #[serde(deserialize_with = "null_default")]
    pub status: String,
    #[serde(deserialize_with = "null_default")]
    pub tradeable: bool,
    #[serde(deserialize_with = "null_default")]
    pub instrument: String,
}

impl OandaMessage {
    pub fn is_heartbeat(&self) -> bool {
        self.kind == HEARTBEAT
    }

    /// Ticks a non-heartbeat snapshot is expected to produce.
    pub fn expected_ticks(&self) -> usize {
        self.asks.len() + self.bids.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BookSide {
    Ask,
    Bid,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OandaDecoder;

impl OandaDecoder {
    fn entry_tick(&self, msg: &OandaMessage, entry: &BookEntry, side: BookSide) -> Tick {
        let p = Provider::Oanda;
        let price = entry.price.as_ref().map_or(0.0, |q| q.value(p, "price"));
        let mut tick = Tick {
            symbol: normalize_symbol(&msg.instrument),
            timestamp: msg.time,
            kind: msg.kind.to_lowercase(),
            liquidity: entry.liquidity.as_ref().map_or(0.0, |q| q.value(p, "liquidity")),
            ..Default::default()
        };
        match side {
            BookSide::Ask => tick.ask = price,
            BookSide::Bid => tick.bid = price,
        }
        tick
    }
}

impl Decoder for OandaDecoder {
    type Message = OandaMessage;

    fn provider(&self) -> Provider {
        Provider::Oanda
    }

    fn decode(&self, body: &[u8]) -> Result<OandaMessage, DecodeError> {
        decode_json(body)
    }

    fn to_ticks(&self, msg: &OandaMessage) -> Vec<Tick> {
        if msg.is_heartbeat() {
            debug!(time = ?msg.time, "oanda heartbeat, nothing to persist");
            return Vec::new();
        }
        let mut ticks = Vec::with_capacity(msg.expected_ticks());
        ticks.extend(msg.asks.iter().map(|e| self.entry_tick(msg, e, BookSide::Ask)));
        ticks.extend(msg.bids.iter().map(|e| self.entry_tick(msg, e, BookSide::Bid)));
        ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_ask_snapshot() {
        let body = br#"{"type":"PRICE","instrument":"EUR_USD","time":"2016-06-22T18:41:36.201836422Z","asks":[{"price":"1.1","liquidity":1000000}],"bids":[]}"#;
        let d = OandaDecoder;
        let msg = d.decode(body).unwrap();
        let ticks = d.to_ticks(&msg);
        assert_eq!(ticks.len(), 1);
        let t = &ticks[0];
        assert_eq!(t.symbol, "EUR-USD");
        assert_eq!(t.ask, 1.1);
        assert_eq!(t.bid, 0.0);
        assert_eq!(t.liquidity, 1_000_000.0);
        assert_eq!(t.kind, "price");
        assert!(t.timestamp.is_some());
    }

    #[test]
    fn asks_then_bids_one_tick_each() {
        let body = br#"{"type":"PRICE","instrument":"USD_JPY","time":"2020-01-01T00:00:00Z",
            "asks":[{"price":"110.2","liquidity":1000000},{"price":"110.3","liquidity":5000000}],
            "bids":[{"price":"110.1","liquidity":1000000},{"price":"110.0","liquidity":"2000000"},{"price":"109.9"}],
            "closeoutBid":"110.0","closeoutAsk":"110.3","status":"tradeable","tradeable":true}"#;
        let d = OandaDecoder;
        let msg = d.decode(body).unwrap();
        assert_eq!(msg.expected_ticks(), 5);
        assert!(msg.tradeable);
        assert_eq!(msg.closeout_bid, "110.0");

        let ticks = d.to_ticks(&msg);
        assert_eq!(ticks.len(), 5);
        assert!(ticks.iter().all(|t| t.symbol == "USD-JPY"));
        assert_eq!(ticks[0].ask, 110.2);
        assert_eq!(ticks[1].ask, 110.3);
        assert_eq!(ticks[2].bid, 110.1);
        assert_eq!(ticks[3].liquidity, 2_000_000.0);
        assert_eq!(ticks[4].bid, 109.9);
        assert_eq!(ticks[4].liquidity, 0.0);
    }

    #[test]
    fn missing_entry_keys_stay_zero() {
        let body = br#"{"type":"PRICE","instrument":"EUR_USD","time":"2020-01-01T00:00:00Z","asks":[{}],"bids":[{"liquidity":10}]}"#;
        let d = OandaDecoder;
        let ticks = d.to_ticks(&d.decode(body).unwrap());
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].ask, 0.0);
        assert_eq!(ticks[0].liquidity, 0.0);
        assert_eq!(ticks[1].bid, 0.0);
        assert_eq!(ticks[1].liquidity, 10.0);
    }

    #[test]
    fn heartbeat_is_noop() {
        let d = OandaDecoder;
        let msg = d.decode(br#"{"type":"HEARTBEAT"}"#).unwrap();
        assert!(msg.is_heartbeat());
        assert!(d.to_ticks(&msg).is_empty());
    }

    #[test]
    fn null_book_side_reads_as_empty() {
        let d = OandaDecoder;
        let body = br#"{"type":"PRICE","instrument":"EUR_USD","time":"2020-01-01T00:00:00Z",
            "asks":[{"price":"1.1","liquidity":null}],"bids":null,"closeoutBid":null,"tradeable":null}"#;
        let msg = d.decode(body).unwrap();
        assert_eq!(msg.expected_ticks(), 1);
        let ticks = d.to_ticks(&msg);
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].ask, 1.1);
        assert_eq!(ticks[0].liquidity, 0.0);

        let body = br#"{"type":"PRICE","instrument":"EUR_USD","time":"2020-01-01T00:00:00Z",
            "asks":null,"bids":[{"price":null,"liquidity":5}]}"#;
        let ticks = d.to_ticks(&d.decode(body).unwrap());
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].bid, 0.0);
        assert_eq!(ticks[0].liquidity, 5.0);
    }

    #[test]
    fn decode_is_deterministic() {
        let body = br#"{"type":"PRICE","instrument":"EUR_USD","asks":[{"price":"1.1","liquidity":1}],"bids":[]}"#;
        let d = OandaDecoder;
        assert_eq!(d.decode(body).unwrap(), d.decode(body).unwrap());
    }

    #[test]
    fn malformed_book_is_decode_error() {
        let d = OandaDecoder;
        assert!(d.decode(br#"{"type":"PRICE","asks":"none"}"#).is_err());
        assert!(d.decode(br#"{"type":"PRICE","asks":[{"price":true}]}"#).is_err());
    }
}
