//! Tollgate - Sliding-Window Request Admission Control
//!
//! This crate implements per-client sliding-window rate limiting as axum
//! middleware. Counts are kept in a shared Redis store so every instance
//! agrees on a client's usage, with a process-local store that keeps
//! enforcing whenever the shared store is unreachable or slow.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;

pub use error::{Result, TollgateError};
