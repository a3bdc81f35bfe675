//! Depth ordering of visible splats
//!
//! Alpha compositing needs splats drawn back-to-front, so every camera
//! change reorders the full visible index set. At million-splat scale an
//! `n log n` comparison sort is too slow per frame; depth keys are instead
//! quantized into a fixed number of buckets and placed with a stable
//! counting sort that is linear in splat count.

pub mod worker;

use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;

use crate::core::types::{Mat4, Vec3};
use crate::splat::model::Generation;

pub use worker::{SortWorker, SortedOrder};

/// Quantized depth key paired with a position in the job's index set
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SortEntry {
    pub key: u32,
    pub index: u32,
}

/// Snapshot consumed by one sort pass.
///
/// Carries its own copy of the visible positions, so the sorter never
/// reads the resident buffer while the streaming side mutates it. The
/// buffers are recycled between jobs instead of reallocated.
pub struct SortJob {
    pub generation: Generation,
    pub view: Mat4,
    /// Visible splat indices into the resident buffer
    pub indices: Vec<u32>,
    /// Position of each indexed splat, parallel to `indices`
    pub positions: Vec<Vec3>,
}

/// Depth sorter with reusable scratch buffers
pub struct DepthSorter {
    bucket_count: usize,
    counts: Vec<u32>,
    depths: Vec<f32>,
    entries: Vec<SortEntry>,
}

impl DepthSorter {
    /// `depth_bucket_bits` sets the key resolution: `1 << bits` buckets
    pub fn new(depth_bucket_bits: u32) -> Self {
        let bits = depth_bucket_bits.clamp(1, 24);
        Self {
            bucket_count: 1usize << bits,
            counts: Vec::new(),
            depths: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Sort the job's indices back-to-front into `out`.
    ///
    /// The output is a permutation of `job.indices` ordered by
    /// non-increasing quantized view-space depth; entries with equal keys
    /// keep their input order (stable).
    pub fn sort_into(&mut self, job: &SortJob, out: &mut Vec<u32>) {
        let n = job.indices.len();
        debug_assert_eq!(n, job.positions.len());

        out.clear();
        if n == 0 {
            return;
        }

        // Depth along the view axis, computed in parallel
        let view = job.view;
        job.positions
            .par_iter()
            .map(|p| -view.transform_point3(*p).z)
            .collect_into_vec(&mut self.depths);

        let (min_depth, max_depth) = self
            .depths
            .par_iter()
            .fold(
                || (f32::INFINITY, f32::NEG_INFINITY),
                |(lo, hi), &d| (lo.min(d), hi.max(d)),
            )
            .reduce(
                || (f32::INFINITY, f32::NEG_INFINITY),
                |a, b| (a.0.min(b.0), a.1.max(b.1)),
            );

        // Quantize into buckets sized to this job's depth range. The span
        // floor keeps the scale finite for degenerate (near-planar) scenes.
        let span = (max_depth - min_depth).max(1e-6);
        let max_key = (self.bucket_count - 1) as f32;
        let scale = max_key / span;
        let depths = &self.depths;
        (0..n)
            .into_par_iter()
            .map(|i| SortEntry {
                key: ((depths[i] - min_depth) * scale).min(max_key) as u32,
                index: i as u32,
            })
            .collect_into_vec(&mut self.entries);

        // Counting sort, largest key first (back-to-front)
        self.counts.clear();
        self.counts.resize(self.bucket_count, 0);
        for entry in &self.entries {
            self.counts[entry.key as usize] += 1;
        }

        let mut total = 0u32;
        for key in (0..self.bucket_count).rev() {
            let count = self.counts[key];
            self.counts[key] = total;
            total += count;
        }

        out.resize(n, 0);
        for entry in &self.entries {
            let slot = self.counts[entry.key as usize];
            self.counts[entry.key as usize] += 1;
            out[slot as usize] = job.indices[entry.index as usize];
        }
    }
}
