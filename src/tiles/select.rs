//! Per-frame LOD tile selection
//!
//! Pure function from a tile tree and a camera snapshot to the desired tile
//! set. Refinement is coarse-to-fine: a tile's children enter the desired
//! set only once the tile itself is resident, and the tile stays desired
//! until every visible child is resident, so coverage never drops out
//! during an LOD transition.

use crate::splat::model::ViewSnapshot;
use super::tree::{TileId, TileTree};

/// Distances below this clamp count as "at the tile"
const MIN_DISTANCE: f32 = 1e-3;

/// A tile the camera currently wants resident
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DesiredTile {
    pub id: TileId,
    /// Levels between this tile and its nearest resident ancestor
    /// (0 when the tile itself is resident). Smaller deltas fetch first.
    pub lod_delta: u32,
}

/// Compute the desired tile set for one camera snapshot.
///
/// The result is in deterministic pre-order over the tree. Selection never
/// mutates tile state; turning the desired set into fetches and evictions
/// is the download manager's job.
pub fn select_tiles(
    tree: &TileTree,
    snapshot: &ViewSnapshot,
    refine_threshold: f32,
) -> Vec<DesiredTile> {
    let mut desired = Vec::new();
    for &root in tree.roots() {
        visit(tree, root, snapshot, refine_threshold, None, &mut desired);
    }
    desired
}

/// Angular footprint of a tile as seen from the camera.
///
/// Larger projected footprint or closer distance means a larger value; the
/// monotonic ordering (closer/larger => finer LOD) is the contract, the
/// exact constant is a tunable.
fn footprint(tree: &TileTree, id: TileId, snapshot: &ViewSnapshot) -> f32 {
    let tile = tree.get(id);
    let extent = tile.bounds.bounding_radius();
    let distance = tile.bounds.distance_to_point(snapshot.position).max(MIN_DISTANCE);
    extent / distance
}

fn visit(
    tree: &TileTree,
    id: TileId,
    snapshot: &ViewSnapshot,
    refine_threshold: f32,
    nearest_resident_level: Option<u32>,
    desired: &mut Vec<DesiredTile>,
) {
    let tile = tree.get(id);

    if !snapshot.frustum.intersects_aabb(&tile.bounds) {
        return;
    }

    // Ties go to the coarser level: refine only strictly above the threshold
    let wants_refine =
        !tile.children.is_empty() && footprint(tree, id, snapshot) > refine_threshold;

    if wants_refine && tile.is_resident() {
        let mut covered = true;
        for &child in &tile.children {
            let child_tile = tree.get(child);
            if !snapshot.frustum.intersects_aabb(&child_tile.bounds) {
                continue;
            }
            covered &= child_tile.is_resident();
            visit(tree, child, snapshot, refine_threshold, Some(tile.level), desired);
        }

        // Hold the coarse tile while any visible child is still in flight,
        // so the region never renders with a gap.
        if !covered {
            desired.push(DesiredTile { id, lod_delta: 0 });
        }
        return;
    }

    let lod_delta = if tile.is_resident() {
        0
    } else {
        match nearest_resident_level {
            Some(level) => tile.level - level,
            None => tile.level + 1,
        }
    };
    desired.push(DesiredTile { id, lod_delta });
}
