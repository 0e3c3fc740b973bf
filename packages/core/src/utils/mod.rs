//! Shared utilities

pub mod mentions;

pub use mentions::{diff_mentions, extract_mentions};
