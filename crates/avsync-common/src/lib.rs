//! avsync common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Helpers shared by the avsync workspace members:
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Fingerprints**: order-independent SHA-256 digests of JSON documents
//! - **Logging**: tracing subscriber setup for console and rolling files
//! - **Time**: lenient parsing of upstream timestamps, wire formatting
//!
//! # Example
//!
//! ```
//! use avsync_common::fingerprint::fingerprint;
//! use serde_json::json;
//!
//! let a = fingerprint(&json!({"tail": "N123AB", "pax": 8}));
//! let b = fingerprint(&json!({"pax": 8, "tail": "N123AB"}));
//! assert_eq!(a, b);
//! ```

pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod time;

pub use error::{CommonError, Result};
