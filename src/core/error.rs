//! Error types for the streaming core

use thiserror::Error;

/// Failure while decoding tile bytes into splat records.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("bad payload magic {found:#010x}")]
    BadMagic { found: u32 },

    #[error("unsupported payload version {0}")]
    UnsupportedVersion(u32),

    #[error("record count mismatch: header says {header}, plane holds {plane}")]
    CountMismatch { header: usize, plane: usize },

    #[error("invalid spherical harmonics degree {0}")]
    InvalidShDegree(u8),

    #[error("decompression failed: {0}")]
    Decompress(String),
}

/// Failure while fetching tile bytes from a source.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("tile byte range not found in source")]
    NotFound,

    #[error("fetch timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Main error type for the engine core
#[derive(Debug, Error)]
pub enum Error {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("resident budget exhausted: need {needed} splats, {free} free")]
    BudgetExceeded { needed: usize, free: usize },

    #[error("tile format mismatch: {0}")]
    Format(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
