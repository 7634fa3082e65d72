//! Common utilities and types shared across gapsync crates.
//!
//! This module provides the error type and the small set of domain types
//! (identifiers, records, identifier windows) that every layer agrees on.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{IdWindow, Record, SourceId};
