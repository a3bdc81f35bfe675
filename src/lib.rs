//! Splatstream - streaming level-of-detail core for Gaussian splat rendering
//!
//! Streams multi-million-splat models from remote storage in LOD tiles,
//! keeps a fixed-budget resident working set, and re-sorts the visible
//! splats by depth off the render thread. Rendering, camera control and
//! format-specific decoders are external collaborators behind the traits
//! in [`streaming::fetch`] and [`splat::codec`].

pub mod core;
pub mod engine;
pub mod math;
pub mod sort;
pub mod splat;
pub mod streaming;
pub mod tiles;

pub use engine::{SplatStreamer, StreamingStats};

/// Standard Result type for the engine
pub type Result<T> = crate::core::types::Result<T>;
