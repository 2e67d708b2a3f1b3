//! Tollgate - Distributed Token Bucket Rate Limiting
//!
//! This crate decides whether an operation keyed by a caller identity may
//! proceed under a quota shared by every process that talks to the same
//! bucket store. Buckets live only in the store; concurrent updates are
//! serialised with optimistic, version-checked writes and retried on
//! conflict, so no two callers can spend the same token.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
