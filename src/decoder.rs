// ===============================
// src/decoder.rs
// ===============================
//
// Provider decoders share one capability: bytes -> message -> tick candidates.
// Persisting the candidates and picking the delivery outcome is done once,
// generically, in consumer.rs.
//
// Numeric quantities arrive as strings. An unparsable field is NOT an error:
// the tick field stays 0.0 (accepted precision trade-off), but every fallback
// is logged at debug and counted in `numeric_parse_fallbacks_total`.
//
use serde::{Deserialize, Deserializer};
use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::domain::{Provider, Tick};
use crate::metrics::NUMERIC_FALLBACKS;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("body is not utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait Decoder: Send + Sync + 'static {
    type Message: fmt::Debug + Send + Sync;

    fn provider(&self) -> Provider;

    /// Pure: decoding the same bytes twice yields equal messages.
    fn decode(&self, body: &[u8]) -> Result<Self::Message, DecodeError>;

    /// Tick candidates for persistence. Empty for filtered / no-op messages.
    fn to_ticks(&self, msg: &Self::Message) -> Vec<Tick>;
}

/// Shared JSON entry point for decoders.
pub fn decode_json<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, DecodeError> {
    let text = std::str::from_utf8(body)?;
    Ok(serde_json::from_str(text)?)
}

/// Explicit `null` reads the same as an absent key. Pair with `#[serde(default)]`.
pub fn null_default<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(de)?.unwrap_or_default())
}

/// `EUR_USD` -> `EUR-USD`
pub fn normalize_symbol(raw: &str) -> String {
    raw.trim().replace('_', "-")
}

/// Lenient string -> f64. Empty means "not sent" and is silent; anything
/// else that does not parse (whitespace included) is a counted fallback.
pub fn parse_numeric(provider: Provider, field: &'static str, raw: &str) -> f64 {
    if raw.is_empty() {
        return 0.0;
    }
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => {
            debug!(%provider, field, value = %raw, "unparsable numeric field, using 0");
            NUMERIC_FALLBACKS
                .with_label_values(&[provider.as_str(), field])
                .inc();
            0.0
        }
    }
}

/// Book quantity sent either as a JSON number or as a numeric string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Quantity {
    Number(f64),
    Text(String),
}

impl Quantity {
    pub fn value(&self, provider: Provider, field: &'static str) -> f64 {
        match self {
            Quantity::Number(v) => *v,
            Quantity::Text(s) => parse_numeric(provider, field, s),
        }
    }
}
