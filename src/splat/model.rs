//! Model aggregate, camera snapshots and the generation counter

use crate::core::types::{Mat4, Vec3};
use crate::math::Frustum;
use crate::tiles::TileTree;

/// Monotonically increasing camera/visibility epoch.
///
/// Every asynchronous result carries the generation captured when its work
/// was scheduled; results that drifted too far behind the current counter
/// are discarded on arrival instead of applied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Self {
        Generation(self.0 + 1)
    }

    /// How many generations `newer` is ahead of this one (0 if not behind)
    pub fn drift_from(self, newer: Generation) -> u64 {
        newer.0.saturating_sub(self.0)
    }
}

/// Per-frame camera input from the camera collaborator
#[derive(Clone, Copy, Debug)]
pub struct CameraView {
    pub view: Mat4,
    pub proj: Mat4,
    pub position: Vec3,
}

/// Immutable snapshot handed to selection, reconcile and sort jobs.
///
/// Built once per frame; nothing downstream reads mutable camera state.
#[derive(Clone, Copy, Debug)]
pub struct ViewSnapshot {
    pub view: Mat4,
    pub view_proj: Mat4,
    pub position: Vec3,
    pub frustum: Frustum,
    pub generation: Generation,
}

/// Camera movement below these thresholds does not bump the generation
const POSITION_EPSILON: f32 = 1e-4;
const MATRIX_EPSILON: f32 = 1e-5;

/// All tiles of one loaded model plus its visibility epoch
pub struct ModelData {
    tree: TileTree,
    generation: Generation,
    last_position: Option<Vec3>,
    last_view_proj: Option<Mat4>,
    resident_splats: usize,
}

impl ModelData {
    pub fn new(tree: TileTree) -> Self {
        Self {
            tree,
            generation: Generation(0),
            last_position: None,
            last_view_proj: None,
            resident_splats: 0,
        }
    }

    pub fn tree(&self) -> &TileTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut TileTree {
        &mut self.tree
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn resident_splats(&self) -> usize {
        self.resident_splats
    }

    pub fn set_resident_splats(&mut self, count: usize) {
        self.resident_splats = count;
    }

    /// Derive this frame's snapshot, bumping the generation when the camera
    /// moved meaningfully since the last observation.
    pub fn observe(&mut self, camera: &CameraView) -> ViewSnapshot {
        let view_proj = camera.proj * camera.view;

        let moved = match (self.last_position, self.last_view_proj) {
            (Some(pos), Some(vp)) => {
                pos.distance(camera.position) > POSITION_EPSILON
                    || !matrices_close(&vp, &view_proj)
            }
            _ => true,
        };

        if moved {
            self.generation = self.generation.next();
            self.last_position = Some(camera.position);
            self.last_view_proj = Some(view_proj);
        }

        ViewSnapshot {
            view: camera.view,
            view_proj,
            position: camera.position,
            frustum: Frustum::from_view_projection(&view_proj),
            generation: self.generation,
        }
    }

    /// Advance the generation without camera motion (the visible tile set
    /// changed, e.g. through tile arrivals or evictions).
    pub fn bump(&mut self) -> Generation {
        self.generation = self.generation.next();
        self.generation
    }
}

fn matrices_close(a: &Mat4, b: &Mat4) -> bool {
    a.to_cols_array()
        .iter()
        .zip(b.to_cols_array().iter())
        .all(|(x, y)| (x - y).abs() <= MATRIX_EPSILON)
}
