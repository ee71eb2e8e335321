//! Filesystem helpers shared by the detector, snapshot engine and retention.

pub mod metadata;
pub mod pattern;
pub mod space;
pub mod walker;
