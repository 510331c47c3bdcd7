//! # Meridian Middleware
//!
//! Request middleware for the Meridian framework: the stateful primitives
//! (token buckets, circuit breakers, a single-flight response cache) and
//! the stages built on them.
//!
//! Stages are ordinary [`Handler`](meridian_core::Handler)s. They run in
//! the order they are mounted and either call `ctx.next()` to wrap the rest
//! of the chain or return to let it continue.
//!
//! ## Example
//!
//! ```
//! use meridian_core::Chain;
//! use meridian_middleware::stages::{
//!     AccessLog, RateLimitMiddleware, RecoveryMiddleware, RequestIdMiddleware,
//! };
//!
//! let chain = Chain::from(RecoveryMiddleware)
//!     .with(RequestIdMiddleware::new())
//!     .with(AccessLog::new("api"))
//!     .with(RateLimitMiddleware::builder().speed(50.0).burst(100).build());
//! assert_eq!(chain.len(), 4);
//! ```
//!
//! ## Shared state
//!
//! [`BreakerStore`], [`CacheStore`] and [`IpFilter`](stages::IpFilter) are
//! cheap to clone and meant to be shared between the middleware and the
//! admin API.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod breaker;
pub mod bucket;
pub mod cache;
pub mod stages;

#[cfg(test)]
mod test_support;

pub use breaker::{
    one_per_interval, Admission, Breaker, BreakerConfig, BreakerSnapshot, BreakerState,
    BreakerStore, HalfOpenPolicy, UnknownState,
};
pub use bucket::{RateBucket, WaitError};
pub use cache::{CacheEntry, CacheStore, Cancelled, Flight, Lookup, VaryValues};
