//! Core Error Types
//!
//! Errors raised while parsing and validating topics and filters. All
//! functions in this crate return `Result<T>` which is aliased to
//! `Result<T, Error>`, so `?` propagation works throughout.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Empty topic filter")]
    EmptyTopicFilter,

    #[error("Invalid topic filter: {0}")]
    InvalidTopicFilter(String),
}

pub type Result<T> = std::result::Result<T, Error>;
