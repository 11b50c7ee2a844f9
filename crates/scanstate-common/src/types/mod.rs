//! Domain types shared across scanstate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Wire discriminant describing how a scan's `data` field is encoded.
///
/// Kept as a newtype over the raw integer so that versions the decoder does
/// not know about can still be carried and reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataVersion(pub i64);

impl DataVersion {
    /// Base64-encoded payload
    pub const V1: DataVersion = DataVersion(1);

    /// Payload carried as a plain string
    pub const V2: DataVersion = DataVersion(2);

    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for DataVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Natural key of a monitored service endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanKey {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub service: String,
}

impl ScanKey {
    pub fn new(ip: Ipv4Addr, port: u16, service: impl Into<String>) -> Self {
        Self {
            ip,
            port,
            service: service.into(),
        }
    }
}

impl std::fmt::Display for ScanKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.ip, self.port, self.service)
    }
}

/// A decoded scan observation.
///
/// `data` is already normalized: whatever encoding the wire version
/// implied has been undone by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub service: String,
    pub data_version: DataVersion,
    pub data: Vec<u8>,
    /// Seconds since the Unix epoch
    pub timestamp: i64,
}

impl Scan {
    /// Natural key of this scan
    pub fn key(&self) -> ScanKey {
        ScanKey::new(self.ip, self.port, self.service.clone())
    }

    /// The observation time, or `None` if `timestamp` is outside the range
    /// `chrono` can represent.
    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sample() -> Scan {
        Scan {
            ip: Ipv4Addr::new(10, 0, 0, 7),
            port: 443,
            service: "https".to_string(),
            data_version: DataVersion::V1,
            data: b"payload".to_vec(),
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn test_key_display() {
        assert_eq!(sample().key().to_string(), "10.0.0.7:443/https");
    }

    #[test]
    fn test_observed_at() {
        let observed = sample().observed_at().unwrap();
        assert_eq!(observed.timestamp(), 1_700_000_000);

        let mut out_of_range = sample();
        out_of_range.timestamp = i64::MAX;
        assert!(out_of_range.observed_at().is_none());
    }

    #[test]
    fn test_data_version_serde_is_bare_integer() {
        assert_eq!(serde_json::to_string(&DataVersion::V2).unwrap(), "2");
        let parsed: DataVersion = serde_json::from_str("7").unwrap();
        assert_eq!(parsed, DataVersion(7));
        assert_eq!(parsed.to_string(), "v7");
    }
}
