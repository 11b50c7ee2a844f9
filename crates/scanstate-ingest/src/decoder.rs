//! Versioned scan message decoding
//!
//! Inbound message bodies are JSON objects whose `data` field is encoded
//! according to `data_version`. Decoding happens in two steps: the envelope
//! (address, port, service, version, timestamp) is parsed first, then the
//! `data` field is handed to the [`PayloadRule`] registered for that
//! version. Adding a wire version means registering another rule; the
//! dispatch in [`ScanDecoder::decode`] never changes.
//!
//! # Example
//!
//! ```
//! use scanstate_ingest::decoder::ScanDecoder;
//!
//! let decoder = ScanDecoder::default();
//! let body = br#"{"ip":"1.2.3.4","port":80,"service":"http","data_version":1,"data":"aGVsbG8=","timestamp":100}"#;
//! let scan = decoder.decode(body).unwrap();
//! assert_eq!(scan.data, b"hello");
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use scanstate_common::{DataVersion, Scan};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;

/// Why a message could not be turned into a [`Scan`]
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Body is not a JSON object of the expected shape
    #[error("Malformed message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    /// No rule is registered for the message's `data_version`
    #[error("Unsupported data version: {0}")]
    UnsupportedVersion(DataVersion),

    /// `data` does not match what its version requires
    #[error("Invalid {version} payload: {source}")]
    InvalidPayload {
        version: DataVersion,
        #[source]
        source: PayloadError,
    },
}

impl DecodeError {
    /// Stable label for logs and counters
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::MalformedMessage(_) => "malformed_message",
            DecodeError::UnsupportedVersion(_) => "unsupported_version",
            DecodeError::InvalidPayload { .. } => "invalid_payload",
        }
    }
}

/// Failure of a single payload rule
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("data field is missing")]
    Missing,

    #[error("expected a string, found {0}")]
    NotAString(&'static str),

    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Turns the raw `data` field of one wire version into canonical bytes.
///
/// `data` is `None` when the field is absent or `null`.
pub trait PayloadRule: Send + Sync {
    fn decode(&self, data: Option<&Value>) -> Result<Vec<u8>, PayloadError>;
}

impl<F> PayloadRule for F
where
    F: Fn(Option<&Value>) -> Result<Vec<u8>, PayloadError> + Send + Sync,
{
    fn decode(&self, data: Option<&Value>) -> Result<Vec<u8>, PayloadError> {
        self(data)
    }
}

/// `V1`: standard, padded base64
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64Rule;

impl PayloadRule for Base64Rule {
    fn decode(&self, data: Option<&Value>) -> Result<Vec<u8>, PayloadError> {
        let encoded = expect_str(data)?;
        Ok(STANDARD.decode(encoded)?)
    }
}

/// `V2`: the string is the payload
#[derive(Debug, Clone, Copy, Default)]
pub struct RawStringRule;

impl PayloadRule for RawStringRule {
    fn decode(&self, data: Option<&Value>) -> Result<Vec<u8>, PayloadError> {
        Ok(expect_str(data)?.as_bytes().to_vec())
    }
}

fn expect_str(data: Option<&Value>) -> Result<&str, PayloadError> {
    match data {
        None => Err(PayloadError::Missing),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(PayloadError::NotAString(json_kind(other))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Envelope of an inbound message. `data` stays untyped only until the
/// version's rule has run.
#[derive(Debug, Deserialize)]
struct WireScan {
    ip: Ipv4Addr,
    port: u16,
    service: String,
    data_version: DataVersion,
    #[serde(default)]
    data: Option<Value>,
    timestamp: i64,
}

/// Decodes message bodies into [`Scan`] records.
///
/// Holds no mutable state, so one instance can be shared by every
/// handler task.
#[derive(Clone)]
pub struct ScanDecoder {
    rules: HashMap<DataVersion, Arc<dyn PayloadRule>>,
}

impl ScanDecoder {
    /// A decoder with no versions registered
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Register `rule` for `version`, replacing any previous rule
    pub fn register(&mut self, version: DataVersion, rule: impl PayloadRule + 'static) {
        self.rules.insert(version, Arc::new(rule));
    }

    pub fn with_rule(mut self, version: DataVersion, rule: impl PayloadRule + 'static) -> Self {
        self.register(version, rule);
        self
    }

    /// Registered versions in ascending order
    pub fn versions(&self) -> Vec<DataVersion> {
        let mut versions: Vec<_> = self.rules.keys().copied().collect();
        versions.sort();
        versions
    }

    pub fn decode(&self, body: &[u8]) -> Result<Scan, DecodeError> {
        let wire: WireScan = serde_json::from_slice(body)?;

        let rule = self
            .rules
            .get(&wire.data_version)
            .ok_or(DecodeError::UnsupportedVersion(wire.data_version))?;

        let data = rule
            .decode(wire.data.as_ref())
            .map_err(|source| DecodeError::InvalidPayload {
                version: wire.data_version,
                source,
            })?;

        Ok(Scan {
            ip: wire.ip,
            port: wire.port,
            service: wire.service,
            data_version: wire.data_version,
            data,
            timestamp: wire.timestamp,
        })
    }
}

impl Default for ScanDecoder {
    /// Decoder for every wire version currently in production
    fn default() -> Self {
        Self::empty()
            .with_rule(DataVersion::V1, Base64Rule)
            .with_rule(DataVersion::V2, RawStringRule)
    }
}

impl std::fmt::Debug for ScanDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanDecoder")
            .field("versions", &self.versions())
            .finish()
    }
}
