//! Core types, errors, configuration and logging

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::StreamingConfig;
pub use error::{DecodeError, Error, FetchError};
