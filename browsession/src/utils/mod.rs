//! Utility modules for the session safekeeper.

pub mod errors;
pub mod logger;

pub use errors::{BrowsessionError, Result};
