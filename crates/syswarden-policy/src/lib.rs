//! # syswarden-policy
//!
//! Assembles a filter profile, a path-permission profile and a target
//! identity into an immutable, checksummed policy bundle.
//!
//! - **Paths / Parser**: path-permission profiles, as JSON or text lines.
//! - **Bundle**: assembly with application-root scope validation.
//! - **Checksum**: domain-separated SHA-256 over canonical artifact bytes.
//! - **Store**: atomic on-disk bundle directories and verification.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod bundle;
pub mod checksum;
pub mod parser;
pub mod paths;
pub mod store;
