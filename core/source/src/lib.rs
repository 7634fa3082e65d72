//! Remote source abstraction for gapsync.
//!
//! This module provides a trait-based interface for identifier-indexed
//! remote catalogs and the client-side policies wrapped around them:
//!
//! - [`RemoteSource`]: fetch one identifier window, probe reachability,
//!   report the catalog's self-declared total
//! - [`RetryExecutor`]: bounded retry with exponential backoff
//! - [`SourceClient`]: composes retry and request pacing around any source
//! - [`HttpSource`] and [`MemorySource`]: concrete catalogs
//!
//! Catalog identifiers are sparse. An empty window says nothing about
//! whether more records exist further on; interpreting that is left to the
//! sync engine.

pub mod client;
pub mod http;
pub mod memory;
pub mod retry;
pub mod source;

pub use client::SourceClient;
pub use http::{Credentials, HttpSource, HttpSourceConfig};
pub use memory::MemorySource;
pub use retry::{RetryConfig, RetryExecutor};
pub use source::{RemoteSource, WindowPage};
