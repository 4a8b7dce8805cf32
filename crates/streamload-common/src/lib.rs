//! Streamload Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, logging setup and record fingerprinting for the
//! streamload workspace.
//!
//! - **Error Handling**: [`CommonError`] and the crate [`Result`] alias for fingerprinting
//! - **Logging**: [`logging::LogConfig`] and [`logging::init_logging`]
//! - **Fingerprints**: stable content hashes for canonical payloads and key sequences
//!
//! # Example
//!
//! ```no_run
//! use streamload_common::fingerprint::fingerprint_json;
//! use serde_json::json;
//!
//! let digest = fingerprint_json(&json!({"site_code": "PR2a"})).unwrap();
//! assert_eq!(digest.len(), 64);
//! ```

pub mod error;
pub mod fingerprint;
pub mod logging;

pub use error::{CommonError, Result};
