//! Storage Error Types
//!
//! This module defines all error types that can occur during storage
//! operations, plus the [`ErrorClass`] taxonomy callers use to decide how
//! to react:
//!
//! - **Recoverable**: transient backend trouble; the caller may retry the
//!   same call with the same arguments.
//! - **Unrecoverable**: schema mismatch, corruption, or misuse; the caller
//!   must stop using the affected iterator or handle.
//! - **NotFound**: outcomes like "generation already dropped" that callers
//!   replaying administrative operations treat as success.
//!
//! The storage layer never retries internally: it performs one KV operation
//! and reports its outcome. Higher layers own retry and backoff.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`] for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Recoverable,
    Unrecoverable,
    NotFound,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    #[error("Generation not found: {0}")]
    GenerationNotFound(u64),

    #[error("Generation {0} is still open for writes")]
    GenerationNotClosed(u64),

    #[error("Message not found")]
    MessageNotFound,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Corrupt key: {0}")]
    CorruptKey(String),

    #[error("Corrupt value: {0}")]
    CorruptValue(String),

    #[error("Static key not found in trie")]
    StaticKeyNotFound,

    #[error("Static key space exhausted at {0} bytes")]
    StaticKeyOverflow(usize),

    #[error("Topic filter does not select this stream")]
    FilterMismatch,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Topic error: {0}")]
    Topic(#[from] mqtthouse_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The retry taxonomy this error falls into.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::GenerationNotFound(_) | Error::MessageNotFound => ErrorClass::NotFound,
            Error::Backend(_) | Error::PreconditionFailed(_) | Error::Io(_) => {
                ErrorClass::Recoverable
            }
            Error::DatabaseNotFound(_)
            | Error::GenerationNotClosed(_)
            | Error::SchemaMismatch(_)
            | Error::CorruptKey(_)
            | Error::CorruptValue(_)
            | Error::StaticKeyNotFound
            | Error::StaticKeyOverflow(_)
            | Error::FilterMismatch
            | Error::Unsupported(_)
            | Error::Topic(_) => ErrorClass::Unrecoverable,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }
}

impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::Backend(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::CorruptValue(e.to_string())
    }
}
