//! Spatial/LOD tile partitioning and per-frame tile selection

pub mod select;
pub mod tree;

pub use select::{select_tiles, DesiredTile};
pub use tree::{ByteRange, Tile, TileId, TileManifest, TileManifestEntry, TileState, TileTree};
