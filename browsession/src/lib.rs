//! Browser session safekeeper library
//!
//! Watches a browser profile, snapshots its session files when the browser
//! starts or stops (and periodically while it runs), and rotates old
//! snapshots out of the backup root.

pub mod config;
pub mod daemon;
pub mod detect;
pub mod fs;
pub mod retention;
pub mod scheduler;
pub mod snapshot;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::BrowsessionError;
pub type Result<T> = std::result::Result<T, BrowsessionError>;
