//! Splat records, tile payload codec and model aggregates

pub mod codec;
pub mod model;
pub mod record;

pub use codec::{RawTileCodec, TileDecoder};
pub use model::{CameraView, Generation, ModelData, ViewSnapshot};
pub use record::{ShPlane, SplatRecord, TileSplats, SPLAT_STRIDE};
