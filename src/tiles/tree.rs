//! Arena tile tree and the tile state machine
//!
//! Tiles live in a flat arena and reference each other through stable
//! integer ids, so the LOD graph carries no ownership cycles and a model's
//! topology serializes as plain index lists in its manifest.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::{Result, Vec3};
use crate::math::Aabb;
use crate::splat::model::Generation;

/// Stable arena index of a tile
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileId(pub u32);

impl TileId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Lifecycle state of a tile
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TileState {
    #[default]
    Unloaded,
    Requested,
    Downloading,
    Decoding,
    Resident,
    Failed,
    Evicted,
}

/// Byte range of a tile's payload within its model source
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub len: u64,
}

impl ByteRange {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }
}

/// One spatial partition of a model's splats at one LOD level
#[derive(Clone, Debug)]
pub struct Tile {
    pub id: TileId,
    pub level: u32,
    pub bounds: Aabb,
    pub splat_count: u32,
    pub range: ByteRange,
    pub parent: Option<TileId>,
    pub children: Vec<TileId>,
    pub state: TileState,
    /// Failed attempts so far for the current request cycle
    pub retries: u32,
    /// Earliest instant the next attempt may start (backoff / deferral)
    pub retry_after: Option<Instant>,
    /// Generation at which the tile entered Failed, for re-request gating
    pub failed_at: Option<Generation>,
}

impl Tile {
    pub fn is_resident(&self) -> bool {
        self.state == TileState::Resident
    }

    pub fn center(&self) -> Vec3 {
        self.bounds.center()
    }
}

/// One tile entry in a model manifest
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TileManifestEntry {
    pub level: u32,
    pub bounds_min: [f32; 3],
    pub bounds_max: [f32; 3],
    pub splat_count: u32,
    pub offset: u64,
    pub len: u64,
    pub parent: Option<u32>,
    #[serde(default)]
    pub children: Vec<u32>,
}

/// LOD tree description of a packaged model
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TileManifest {
    pub name: String,
    #[serde(default)]
    pub sh_degree: u8,
    pub tiles: Vec<TileManifestEntry>,
}

/// Arena of tiles with parent/child index links
#[derive(Debug, Default)]
pub struct TileTree {
    tiles: Vec<Tile>,
    roots: Vec<TileId>,
}

impl TileTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from a parsed manifest, validating its topology.
    pub fn from_manifest(manifest: &TileManifest) -> Result<Self> {
        let mut tree = Self::new();
        let count = manifest.tiles.len() as u32;

        for (i, entry) in manifest.tiles.iter().enumerate() {
            if let Some(parent) = entry.parent {
                if parent >= count {
                    return Err(Error::Manifest(format!(
                        "tile {} references parent {} out of range",
                        i, parent
                    )));
                }
                let parent_entry = &manifest.tiles[parent as usize];
                if entry.level != parent_entry.level + 1 {
                    return Err(Error::Manifest(format!(
                        "tile {} at level {} has parent at level {}",
                        i, entry.level, parent_entry.level
                    )));
                }
                if !parent_entry.children.contains(&(i as u32)) {
                    return Err(Error::Manifest(format!(
                        "tile {} not listed among its parent's children",
                        i
                    )));
                }
                // Children must refine inside their parent's coverage;
                // together with sibling disjointness this keeps every LOD
                // level spatially disjoint across the whole model
                let child_bounds = entry_bounds(entry);
                let parent_bounds = entry_bounds(parent_entry);
                if !parent_bounds.contains_aabb(&child_bounds) {
                    return Err(Error::Manifest(format!(
                        "tile {} extends outside its parent's bounds",
                        i
                    )));
                }
            }

            for &child in &entry.children {
                if child >= count {
                    return Err(Error::Manifest(format!(
                        "tile {} references child {} out of range",
                        i, child
                    )));
                }
                if manifest.tiles[child as usize].parent != Some(i as u32) {
                    return Err(Error::Manifest(format!(
                        "tile {} lists child {} that does not point back",
                        i, child
                    )));
                }
            }

            // Sibling coverage must be spatially disjoint within a level
            for (a, &ca) in entry.children.iter().enumerate() {
                for &cb in entry.children.iter().skip(a + 1) {
                    let ba = entry_bounds(&manifest.tiles[ca as usize]);
                    let bb = entry_bounds(&manifest.tiles[cb as usize]);
                    if ba.overlaps_interior(&bb) {
                        return Err(Error::Manifest(format!(
                            "children {} and {} of tile {} overlap",
                            ca, cb, i
                        )));
                    }
                }
            }

            tree.tiles.push(Tile {
                id: TileId(i as u32),
                level: entry.level,
                bounds: entry_bounds(entry),
                splat_count: entry.splat_count,
                range: ByteRange::new(entry.offset, entry.len),
                parent: entry.parent.map(TileId),
                children: entry.children.iter().copied().map(TileId).collect(),
                state: TileState::Unloaded,
                retries: 0,
                retry_after: None,
                failed_at: None,
            });
            if entry.parent.is_none() {
                tree.roots.push(TileId(i as u32));
            }
        }

        // Root coverage must be disjoint as well
        for (a, &ra) in tree.roots.iter().enumerate() {
            for &rb in tree.roots.iter().skip(a + 1) {
                if tree.get(ra).bounds.overlaps_interior(&tree.get(rb).bounds) {
                    return Err(Error::Manifest(format!(
                        "root tiles {} and {} overlap",
                        ra.0, rb.0
                    )));
                }
            }
        }

        Ok(tree)
    }

    /// Parse and build from manifest JSON bytes
    pub fn from_manifest_json(bytes: &[u8]) -> Result<Self> {
        let manifest: TileManifest =
            serde_json::from_slice(bytes).map_err(|e| Error::Manifest(e.to_string()))?;
        Self::from_manifest(&manifest)
    }

    /// Append a tile, wiring it into its parent's child list.
    ///
    /// Used by the manifest loader's tests and by tools that build trees
    /// programmatically; manifest loading validates levels separately.
    pub fn insert(
        &mut self,
        level: u32,
        bounds: Aabb,
        splat_count: u32,
        range: ByteRange,
        parent: Option<TileId>,
    ) -> TileId {
        let id = TileId(self.tiles.len() as u32);
        debug_assert!(parent.is_none_or(|p| self.get(p).level + 1 == level));

        self.tiles.push(Tile {
            id,
            level,
            bounds,
            splat_count,
            range,
            parent,
            children: Vec::new(),
            state: TileState::Unloaded,
            retries: 0,
            retry_after: None,
            failed_at: None,
        });

        match parent {
            Some(p) => self.tiles[p.index()].children.push(id),
            None => self.roots.push(id),
        }
        id
    }

    pub fn get(&self, id: TileId) -> &Tile {
        &self.tiles[id.index()]
    }

    pub fn get_mut(&mut self, id: TileId) -> &mut Tile {
        &mut self.tiles[id.index()]
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn roots(&self) -> &[TileId] {
        &self.roots
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = TileId> + use<> {
        (0..self.tiles.len() as u32).map(TileId)
    }

    /// Apply a state transition, enforcing the legal state machine.
    ///
    /// Returns false (and leaves the tile untouched) on an illegal
    /// transition; callers treat that as a bug signal, not control flow.
    pub fn transition(&mut self, id: TileId, to: TileState) -> bool {
        let tile = &mut self.tiles[id.index()];
        let from = tile.state;
        if !transition_legal(from, to) {
            log::warn!("illegal tile transition {:?} -> {:?} for tile {}", from, to, id.0);
            return false;
        }

        if to == TileState::Requested && from != TileState::Requested {
            // Fresh request cycle unless we are mid-retry
            if matches!(from, TileState::Unloaded | TileState::Evicted | TileState::Failed) {
                tile.retries = 0;
                tile.retry_after = None;
                tile.failed_at = None;
            }
        }

        log::trace!("tile {} {:?} -> {:?}", id.0, from, to);
        tile.state = to;
        true
    }

    /// Number of tiles currently in the given state
    pub fn count_state(&self, state: TileState) -> usize {
        self.tiles.iter().filter(|t| t.state == state).count()
    }
}

fn entry_bounds(entry: &TileManifestEntry) -> Aabb {
    Aabb::new(Vec3::from_array(entry.bounds_min), Vec3::from_array(entry.bounds_max))
}

fn transition_legal(from: TileState, to: TileState) -> bool {
    use TileState::*;
    matches!(
        (from, to),
        (Unloaded, Requested)
            | (Requested, Downloading)
            | (Requested, Unloaded)
            | (Downloading, Decoding)
            | (Downloading, Requested) // fetch failed, retrying
            | (Downloading, Unloaded)  // cancelled or stale
            | (Downloading, Failed)
            | (Decoding, Resident)
            | (Decoding, Requested)    // decode failed or admission deferred
            | (Decoding, Unloaded)     // cancelled or stale
            | (Decoding, Failed)
            | (Resident, Evicted)
            | (Evicted, Requested)
            | (Evicted, Unloaded)
            | (Failed, Requested)
            | (Failed, Unloaded)
    )
}
