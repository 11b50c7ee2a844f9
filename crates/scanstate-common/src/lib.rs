//! Scanstate Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging, and error handling for the scanstate workspace.
//!
//! # Overview
//!
//! - **Types**: the canonical [`Scan`] record, its natural [`ScanKey`] and
//!   the [`DataVersion`] discriminant carried on the wire
//! - **Error Handling**: the shared [`ScanstateError`] and [`Result`] alias
//! - **Logging**: `tracing` subscriber configuration shared by all binaries
//!
//! # Example
//!
//! ```
//! use scanstate_common::{DataVersion, Scan};
//! use std::net::Ipv4Addr;
//!
//! let scan = Scan {
//!     ip: Ipv4Addr::new(1, 2, 3, 4),
//!     port: 80,
//!     service: "http".to_string(),
//!     data_version: DataVersion::V2,
//!     data: b"hello".to_vec(),
//!     timestamp: 100,
//! };
//! assert_eq!(scan.key().to_string(), "1.2.3.4:80/http");
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{Result, ScanstateError};
pub use types::{DataVersion, Scan, ScanKey};
