//! Roster Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types and utilities for the roster ingestion workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Fingerprints**: content digests used as idempotency keys
//! - **Logging**: tracing subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use roster_common::fingerprint::ContentFingerprint;
//!
//! let fingerprint = ContentFingerprint::compute(b"StudentID,Date,Status\n");
//! println!("fingerprint: {}", fingerprint);
//! ```

pub mod error;
pub mod fingerprint;
pub mod logging;

pub use error::{CommonError, Result};
pub use fingerprint::ContentFingerprint;
