//! Prioritized tile streaming: fetch scheduling, budgeting and residency

pub mod budget;
pub mod download;
pub mod fetch;
pub mod priority;
pub mod texdata;

pub use budget::MemoryBudget;
pub use download::{DecodedTile, DownloadStats, LodDownloadManager};
pub use fetch::{FileFetcher, MemoryFetcher, TileFetcher};
pub use priority::{FetchQueue, TilePriority};
pub use texdata::{ResidentBuffer, SplatRange, SplatTexdataManager};
