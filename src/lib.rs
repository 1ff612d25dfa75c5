//! Slidegate - Sliding Window Rate Limiting
//!
//! This crate enforces per-key request quotas over a rolling window. The
//! window is approximated by a fixed number of expiring sub-bucket counters
//! held in a pluggable store: an in-process map for a single node, or Redis
//! for limits shared across nodes.

pub mod config;
pub mod error;
pub mod guard;
pub mod ratelimit;
pub mod store;
