//! Priority ordering for tile fetch scheduling
//!
//! The queue is rebuilt from the desired set on every reconcile, so a
//! low-priority request that has not started yet is re-ranked (or dropped)
//! before it ever reaches the network.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::core::types::Vec3;
use crate::tiles::select::DesiredTile;
use crate::tiles::tree::{TileId, TileTree};

/// Priority of one queued tile fetch
#[derive(Clone, Copy, Debug)]
pub struct TilePriority {
    pub tile: TileId,
    /// Distance from camera to the tile bounds (closer fetches first)
    pub distance: f32,
    /// Levels between the tile and its nearest resident coverage
    /// (smaller deltas fetch first at equal distance)
    pub lod_delta: u32,
}

impl TilePriority {
    /// Rank a desired tile against the camera position
    pub fn calculate(tree: &TileTree, desired: &DesiredTile, camera_pos: Vec3) -> Self {
        let tile = tree.get(desired.id);
        Self {
            tile: desired.id,
            distance: tile.bounds.distance_to_point(camera_pos),
            lod_delta: desired.lod_delta,
        }
    }
}

impl Eq for TilePriority {}

impl PartialEq for TilePriority {
    fn eq(&self, other: &Self) -> bool {
        self.tile == other.tile
    }
}

impl Ord for TilePriority {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap pops the closest tile first; at equal distance the
        // smaller LOD delta wins. total_cmp keeps NaN/infinity ordered.
        other
            .distance
            .total_cmp(&self.distance)
            .then_with(|| other.lod_delta.cmp(&self.lod_delta))
    }
}

impl PartialOrd for TilePriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Fetch queue, redrawn from scratch on every reconcile
#[derive(Default)]
pub struct FetchQueue {
    heap: BinaryHeap<TilePriority>,
}

impl FetchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn push(&mut self, priority: TilePriority) {
        self.heap.push(priority);
    }

    /// Highest priority entry (closest tile, then smallest LOD delta)
    pub fn pop(&mut self) -> Option<TilePriority> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Aabb;
    use crate::tiles::tree::ByteRange;

    fn tree_with_tiles_at(xs: &[f32]) -> (TileTree, Vec<TileId>) {
        let mut tree = TileTree::new();
        let ids = xs
            .iter()
            .map(|&x| {
                tree.insert(
                    0,
                    Aabb::new(Vec3::new(x, 0.0, 0.0), Vec3::new(x + 1.0, 1.0, 1.0)),
                    10,
                    ByteRange::new(0, 64),
                    None,
                )
            })
            .collect();
        (tree, ids)
    }

    #[test]
    fn test_closest_tile_pops_first() {
        let (tree, ids) = tree_with_tiles_at(&[100.0, 10.0, 50.0]);
        let camera = Vec3::ZERO;

        let mut queue = FetchQueue::new();
        for &id in &ids {
            queue.push(TilePriority::calculate(
                &tree,
                &DesiredTile { id, lod_delta: 1 },
                camera,
            ));
        }

        assert_eq!(queue.pop().unwrap().tile, ids[1]); // x = 10
        assert_eq!(queue.pop().unwrap().tile, ids[2]); // x = 50
        assert_eq!(queue.pop().unwrap().tile, ids[0]); // x = 100
        assert!(queue.is_empty());
    }

    #[test]
    fn test_lod_delta_breaks_distance_ties() {
        let (tree, ids) = tree_with_tiles_at(&[10.0, 10.0]);
        let camera = Vec3::ZERO;

        let mut queue = FetchQueue::new();
        queue.push(TilePriority::calculate(
            &tree,
            &DesiredTile { id: ids[0], lod_delta: 3 },
            camera,
        ));
        queue.push(TilePriority::calculate(
            &tree,
            &DesiredTile { id: ids[1], lod_delta: 1 },
            camera,
        ));

        assert_eq!(queue.pop().unwrap().tile, ids[1]);
        assert_eq!(queue.pop().unwrap().tile, ids[0]);
    }

    #[test]
    fn test_clear() {
        let (tree, ids) = tree_with_tiles_at(&[10.0]);
        let mut queue = FetchQueue::new();
        queue.push(TilePriority::calculate(
            &tree,
            &DesiredTile { id: ids[0], lod_delta: 0 },
            Vec3::ZERO,
        ));

        assert_eq!(queue.len(), 1);
        queue.clear();
        assert!(queue.is_empty());
    }
}
