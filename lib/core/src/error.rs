//! Error handling foundation.
//!
//! Component traits return plain domain enums defined in each crate's own
//! `error` module. Code paths that chain several fallible steps of different
//! kinds (server startup, for instance) use this alias and map each step into
//! a layer-specific context type.

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;
