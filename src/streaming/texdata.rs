//! Fixed-budget resident splat store
//!
//! Owns the CPU mirror of the GPU-resident working set: a fixed-capacity
//! record slab (plus SH plane), a first-fit range allocator, and the
//! pin/evict bookkeeping that keeps the set inside the byte budget. The
//! rendering collaborator uploads only the dirty sub-ranges drained each
//! frame, never the whole buffer.
//!
//! Eviction is two-phase: a victim's range is first retired and only
//! returns to the free list once the published sort order can no longer
//! reference it, so a draw order in flight never points at recycled slots.

use std::collections::HashMap;

use half::f16;

use crate::core::config::StreamingConfig;
use crate::core::error::Error;
use crate::core::types::{Result, Vec3};
use crate::splat::model::Generation;
use crate::splat::record::{ShPlane, SplatRecord, TileSplats, SPLAT_STRIDE};
use crate::streaming::budget::MemoryBudget;
use crate::tiles::tree::TileId;

/// Contiguous range of splat slots in the resident buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SplatRange {
    pub start: u32,
    pub len: u32,
}

impl SplatRange {
    pub fn new(start: u32, len: u32) -> Self {
        Self { start, len }
    }

    pub fn end(&self) -> u32 {
        self.start + self.len
    }
}

/// CPU mirror of the GPU splat buffer
pub struct ResidentBuffer {
    records: Vec<SplatRecord>,
    /// Position plane kept separate so depth sorting reads hot, dense data
    positions: Vec<Vec3>,
    /// SH plane, `sh_coeffs` values per splat (empty at degree 0)
    sh: Vec<f16>,
    sh_coeffs: usize,
    capacity: u32,
    /// Free ranges, sorted by start, always coalesced
    free: Vec<SplatRange>,
    /// Sub-ranges written since the renderer last drained them
    dirty: Vec<SplatRange>,
}

impl ResidentBuffer {
    fn new(capacity: u32, sh_coeffs: usize) -> Self {
        Self {
            records: vec![SplatRecord::default(); capacity as usize],
            positions: vec![Vec3::ZERO; capacity as usize],
            sh: vec![f16::ZERO; capacity as usize * sh_coeffs],
            sh_coeffs,
            capacity,
            free: if capacity > 0 {
                vec![SplatRange::new(0, capacity)]
            } else {
                Vec::new()
            },
            dirty: Vec::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn sh_coeffs_per_splat(&self) -> usize {
        self.sh_coeffs
    }

    /// Record slab for GPU upload
    pub fn records(&self) -> &[SplatRecord] {
        &self.records
    }

    /// SH plane for GPU upload (empty at degree 0)
    pub fn sh(&self) -> &[f16] {
        &self.sh
    }

    /// Position plane used by the sorter's gather
    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    /// Total free splat slots (may be fragmented)
    pub fn free_splats(&self) -> u32 {
        self.free.iter().map(|r| r.len).sum()
    }

    /// Drain the sub-ranges written since the last call
    pub fn take_dirty(&mut self) -> Vec<SplatRange> {
        std::mem::take(&mut self.dirty)
    }

    /// First-fit allocation of a contiguous range
    fn allocate(&mut self, len: u32) -> Option<SplatRange> {
        if len == 0 {
            return Some(SplatRange::new(0, 0));
        }
        let slot = self.free.iter().position(|r| r.len >= len)?;
        let entry = self.free[slot];
        let out = SplatRange::new(entry.start, len);
        if entry.len == len {
            self.free.remove(slot);
        } else {
            self.free[slot] = SplatRange::new(entry.start + len, entry.len - len);
        }
        Some(out)
    }

    /// Return a range to the free list, coalescing neighbors
    fn release(&mut self, range: SplatRange) {
        if range.len == 0 {
            return;
        }
        let at = self
            .free
            .iter()
            .position(|r| r.start > range.start)
            .unwrap_or(self.free.len());
        self.free.insert(at, range);

        // Merge with successor, then predecessor
        if at + 1 < self.free.len() && self.free[at].end() == self.free[at + 1].start {
            self.free[at].len += self.free[at + 1].len;
            self.free.remove(at + 1);
        }
        if at > 0 && self.free[at - 1].end() == self.free[at].start {
            self.free[at - 1].len += self.free[at].len;
            self.free.remove(at);
        }
    }

    /// Copy a decoded tile into its range and mark the sub-range dirty
    fn write(&mut self, range: SplatRange, splats: &TileSplats) {
        let start = range.start as usize;
        for (i, record) in splats.records.iter().enumerate() {
            self.records[start + i] = *record;
            self.positions[start + i] = record.position();
        }
        if self.sh_coeffs > 0 {
            if let Some(plane) = &splats.sh {
                let dst = start * self.sh_coeffs;
                self.sh[dst..dst + plane.coeffs.len()].copy_from_slice(&plane.coeffs);
            }
        }
        if range.len > 0 {
            self.dirty.push(range);
        }
    }
}

struct Resident {
    range: SplatRange,
    bytes: usize,
    last_visible_frame: u64,
    last_visible_gen: Option<Generation>,
    pinned: bool,
}

struct Retired {
    range: SplatRange,
    bytes: usize,
    /// First generation whose sort orders no longer reference this range
    after: Generation,
}

/// Manages what occupies the resident buffer
pub struct SplatTexdataManager {
    buffer: ResidentBuffer,
    budget: MemoryBudget,
    resident: HashMap<TileId, Resident>,
    retired: Vec<Retired>,
    /// Generation of the currently published sort order
    published_floor: Option<Generation>,
    frame: u64,
    bytes_per_splat: usize,
    resident_splat_count: usize,
    evictions: u64,
}

impl SplatTexdataManager {
    pub fn new(config: &StreamingConfig, sh_degree: u8) -> Self {
        let sh_coeffs = ShPlane::coeffs_per_splat(sh_degree);
        let bytes_per_splat = SPLAT_STRIDE + sh_coeffs * 2;
        let capacity = (config.memory_budget_bytes / bytes_per_splat) as u32;

        log::info!(
            "resident buffer: {} splat slots ({} MB budget, {} B/splat)",
            capacity,
            config.memory_budget_bytes / 1024 / 1024,
            bytes_per_splat
        );

        Self {
            buffer: ResidentBuffer::new(capacity, sh_coeffs),
            budget: MemoryBudget::new(capacity as usize * bytes_per_splat),
            resident: HashMap::new(),
            retired: Vec::new(),
            published_floor: None,
            frame: 0,
            bytes_per_splat,
            resident_splat_count: 0,
            evictions: 0,
        }
    }

    /// Start a frame: note the published sort generation and reclaim any
    /// retired ranges nothing can reference anymore.
    pub fn begin_frame(&mut self, published: Option<Generation>) {
        self.frame += 1;
        self.published_floor = published;
        self.reclaim_retired();
    }

    /// Free retired ranges whose eviction the published order has outlived.
    /// Returns the number of splat slots reclaimed.
    fn reclaim_retired(&mut self) -> u32 {
        let floor = self.published_floor;
        let mut reclaimed = 0;

        let mut i = 0;
        while i < self.retired.len() {
            let reclaimable = match floor {
                None => true,
                Some(published) => published >= self.retired[i].after,
            };
            if reclaimable {
                let entry = self.retired.swap_remove(i);
                reclaimed += entry.range.len;
                self.buffer.release(entry.range);
                self.budget.release(entry.bytes);
            } else {
                i += 1;
            }
        }
        reclaimed
    }

    /// Admit a decoded tile into the resident buffer.
    ///
    /// Evicts unpinned, least-recently-visible tiles as needed. Returns the
    /// tiles evicted to make room. Fails with `BudgetExceeded` when nothing
    /// evictable remains — a recoverable condition, the tile simply stays
    /// out of the buffer for now.
    pub fn admit(&mut self, tile: TileId, splats: &TileSplats) -> Result<Vec<TileId>> {
        if self.resident.contains_key(&tile) {
            return Ok(Vec::new());
        }

        let tile_coeffs = splats
            .sh
            .as_ref()
            .map_or(0, |p| ShPlane::coeffs_per_splat(p.degree));
        if tile_coeffs != self.buffer.sh_coeffs {
            return Err(Error::Format(format!(
                "tile carries {} SH coefficients per splat, model expects {}",
                tile_coeffs, self.buffer.sh_coeffs
            )));
        }

        let needed = splats.len() as u32;
        let mut evicted = Vec::new();

        loop {
            if let Some(range) = self.buffer.allocate(needed) {
                self.buffer.write(range, splats);
                let bytes = needed as usize * self.bytes_per_splat;
                let reserved = self.budget.reserve(bytes);
                debug_assert!(reserved, "slab allocation cannot outrun the budget");
                self.resident.insert(
                    tile,
                    Resident {
                        range,
                        bytes,
                        last_visible_frame: self.frame,
                        last_visible_gen: None,
                        pinned: false,
                    },
                );
                self.resident_splat_count += needed as usize;
                return Ok(evicted);
            }

            match self.pick_victim() {
                Some(victim) => {
                    self.retire(victim);
                    evicted.push(victim);
                    self.reclaim_retired();
                }
                None => {
                    // Undo nothing: evictions already made are still correct
                    return Err(Error::BudgetExceeded {
                        needed: needed as usize,
                        free: self.buffer.free_splats() as usize,
                    });
                }
            }
        }
    }

    /// Unpinned resident tile that has gone unseen the longest
    fn pick_victim(&self) -> Option<TileId> {
        self.resident
            .iter()
            .filter(|(_, r)| !r.pinned)
            .min_by_key(|(id, r)| (r.last_visible_frame, id.0))
            .map(|(&id, _)| id)
    }

    /// Remove a tile from the resident set; its range frees once the
    /// published order moves past the tile's last visible generation.
    fn retire(&mut self, tile: TileId) {
        if let Some(entry) = self.resident.remove(&tile) {
            self.resident_splat_count -= entry.range.len as usize;
            self.evictions += 1;
            self.retired.push(Retired {
                range: entry.range,
                bytes: entry.bytes,
                after: entry
                    .last_visible_gen
                    .map(Generation::next)
                    .unwrap_or_default(),
            });
            log::trace!("retired tile {} ({} splats)", tile.0, entry.range.len);
        }
    }

    /// Pin the currently visible tiles; everything else becomes evictable.
    /// Pinned tiles are never chosen as eviction victims.
    pub fn set_visible(&mut self, visible: &[TileId], generation: Generation) {
        for entry in self.resident.values_mut() {
            entry.pinned = false;
        }
        for id in visible {
            if let Some(entry) = self.resident.get_mut(id) {
                entry.pinned = true;
                entry.last_visible_frame = self.frame;
                entry.last_visible_gen = Some(generation);
            }
        }
    }

    /// Evict unpinned tiles until usage drops to the target fraction of the
    /// budget. Returns the evicted tiles.
    pub fn enforce_budget(&mut self, target: f32) -> Vec<TileId> {
        let mut excess = self.budget.over_target(target);
        let mut evicted = Vec::new();

        while excess > 0 {
            let Some(victim) = self.pick_victim() else { break };
            let bytes = self.resident[&victim].bytes;
            self.retire(victim);
            evicted.push(victim);
            excess = excess.saturating_sub(bytes);
        }

        if !evicted.is_empty() {
            self.reclaim_retired();
            log::debug!(
                "evicted {} tiles enforcing budget (pressure {:.2})",
                evicted.len(),
                self.budget.pressure()
            );
        }
        evicted
    }

    /// Flat index set over all resident, currently-visible splats, in
    /// buffer order. This is the sorter's input.
    pub fn visible_indices(&self, out: &mut Vec<u32>) {
        out.clear();

        let mut ranges: Vec<SplatRange> = self
            .resident
            .values()
            .filter(|r| r.pinned)
            .map(|r| r.range)
            .collect();
        ranges.sort_by_key(|r| r.start);

        for range in ranges {
            out.extend(range.start..range.end());
        }
    }

    /// Gather positions for a set of buffer indices into `out`
    pub fn gather_positions(&self, indices: &[u32], out: &mut Vec<Vec3>) {
        out.clear();
        out.extend(indices.iter().map(|&i| self.buffer.positions[i as usize]));
    }

    pub fn is_resident(&self, tile: TileId) -> bool {
        self.resident.contains_key(&tile)
    }

    pub fn is_pinned(&self, tile: TileId) -> bool {
        self.resident.get(&tile).is_some_and(|r| r.pinned)
    }

    pub fn range_of(&self, tile: TileId) -> Option<SplatRange> {
        self.resident.get(&tile).map(|r| r.range)
    }

    pub fn resident_splats(&self) -> usize {
        self.resident_splat_count
    }

    pub fn resident_tiles(&self) -> usize {
        self.resident.len()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn used_bytes(&self) -> usize {
        self.budget.used()
    }

    pub fn pressure(&self) -> f32 {
        self.budget.pressure()
    }

    pub fn buffer(&self) -> &ResidentBuffer {
        &self.buffer
    }

    /// Drain dirty sub-ranges for the renderer's incremental upload
    pub fn take_dirty(&mut self) -> Vec<SplatRange> {
        self.buffer.take_dirty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splat::record::SplatRecord;

    fn splats(count: usize, tag: f32) -> TileSplats {
        TileSplats {
            records: (0..count)
                .map(|i| SplatRecord {
                    position: [tag, i as f32, 0.0],
                    scale: [0.1; 3],
                    rotation: [0.0, 0.0, 0.0, 1.0],
                    color: [255; 4],
                    _pad: [0; 4],
                })
                .collect(),
            sh: None,
        }
    }

    /// Manager sized to hold exactly `capacity` splats at SH degree 0
    fn manager(capacity: usize) -> SplatTexdataManager {
        let config = StreamingConfig {
            memory_budget_bytes: capacity * SPLAT_STRIDE,
            ..Default::default()
        };
        let mut manager = SplatTexdataManager::new(&config, 0);
        manager.begin_frame(None);
        manager
    }

    #[test]
    fn test_admit_within_budget() {
        let mut m = manager(100);

        let evicted = m.admit(TileId(0), &splats(40, 0.0)).expect("admit");
        assert!(evicted.is_empty());
        assert!(m.is_resident(TileId(0)));
        assert_eq!(m.resident_splats(), 40);
        assert_eq!(m.used_bytes(), 40 * SPLAT_STRIDE);
    }

    #[test]
    fn test_budget_never_exceeded() {
        let mut m = manager(100);

        m.admit(TileId(0), &splats(60, 0.0)).expect("admit");
        m.begin_frame(None);
        m.admit(TileId(1), &splats(60, 1.0)).expect("admit evicts");
        m.begin_frame(None);
        let _ = m.admit(TileId(2), &splats(90, 2.0));

        assert!(m.used_bytes() <= 100 * SPLAT_STRIDE);
    }

    #[test]
    fn test_eviction_is_least_recently_visible() {
        let mut m = manager(100);

        m.admit(TileId(0), &splats(40, 0.0)).expect("admit");
        m.admit(TileId(1), &splats(40, 1.0)).expect("admit");

        // Tile 1 was seen more recently than tile 0
        m.set_visible(&[TileId(0), TileId(1)], Generation(1));
        m.begin_frame(Some(Generation(2)));
        m.set_visible(&[TileId(1)], Generation(2));
        m.begin_frame(Some(Generation(3)));
        m.set_visible(&[], Generation(3));

        let evicted = m.admit(TileId(2), &splats(60, 2.0)).expect("admit");
        assert_eq!(evicted, vec![TileId(0)]);
        assert!(m.is_resident(TileId(1)));
    }

    #[test]
    fn test_pinned_tiles_never_evicted() {
        let mut m = manager(100);

        m.admit(TileId(0), &splats(50, 0.0)).expect("admit");
        m.admit(TileId(1), &splats(50, 1.0)).expect("admit");
        m.set_visible(&[TileId(0), TileId(1)], Generation(1));

        let result = m.admit(TileId(2), &splats(10, 2.0));
        assert!(matches!(result, Err(Error::BudgetExceeded { .. })));
        assert!(m.is_resident(TileId(0)));
        assert!(m.is_resident(TileId(1)));
    }

    #[test]
    fn test_admission_larger_than_buffer_fails() {
        let mut m = manager(50);
        let result = m.admit(TileId(0), &splats(80, 0.0));
        assert!(matches!(result, Err(Error::BudgetExceeded { .. })));
        assert_eq!(m.resident_splats(), 0);
    }

    #[test]
    fn test_visible_indices_cover_pinned_tiles_in_buffer_order() {
        let mut m = manager(100);

        m.admit(TileId(0), &splats(3, 0.0)).expect("admit");
        m.admit(TileId(1), &splats(2, 1.0)).expect("admit");
        m.admit(TileId(2), &splats(2, 2.0)).expect("admit");
        m.set_visible(&[TileId(0), TileId(2)], Generation(1));

        let mut indices = Vec::new();
        m.visible_indices(&mut indices);

        // Tile 0 occupies [0,3), tile 1 [3,5), tile 2 [5,7); only pinned
        // tiles contribute
        assert_eq!(indices, vec![0, 1, 2, 5, 6]);
    }

    #[test]
    fn test_incremental_writes_mark_only_touched_ranges() {
        let mut m = manager(100);

        m.admit(TileId(0), &splats(10, 0.0)).expect("admit");
        let dirty = m.take_dirty();
        assert_eq!(dirty, vec![SplatRange::new(0, 10)]);

        m.admit(TileId(1), &splats(5, 1.0)).expect("admit");
        let dirty = m.take_dirty();
        assert_eq!(dirty, vec![SplatRange::new(10, 5)]);

        // Neighboring tile data survives the second write
        assert_eq!(m.buffer().records()[0].position[0], 0.0);
        assert_eq!(m.buffer().records()[10].position[0], 1.0);
    }

    #[test]
    fn test_retired_ranges_wait_for_published_order() {
        let mut m = manager(100);

        m.admit(TileId(0), &splats(80, 0.0)).expect("admit");
        m.set_visible(&[TileId(0)], Generation(5));
        m.set_visible(&[], Generation(6));

        // Published order still at generation 5: tile 0 was visible then,
        // so its range cannot be recycled yet
        m.begin_frame(Some(Generation(5)));
        let result = m.admit(TileId(1), &splats(80, 1.0));
        assert!(matches!(result, Err(Error::BudgetExceeded { .. })));
        assert!(!m.is_resident(TileId(0)), "victim retired even when deferred");

        // Once publication reaches generation 6 the space frees up
        m.begin_frame(Some(Generation(6)));
        let evicted = m.admit(TileId(1), &splats(80, 1.0)).expect("admit");
        assert!(evicted.is_empty(), "victim already retired earlier");
        assert!(m.is_resident(TileId(1)));
    }

    #[test]
    fn test_enforce_budget_reclaims_released_tiles() {
        let mut m = manager(100);

        m.admit(TileId(0), &splats(50, 0.0)).expect("admit");
        m.admit(TileId(1), &splats(45, 1.0)).expect("admit");
        m.set_visible(&[TileId(1)], Generation(1));

        // Usage 95%, target 50%: the unpinned tile goes
        let evicted = m.enforce_budget(0.5);
        assert_eq!(evicted, vec![TileId(0)]);
        assert!(m.is_resident(TileId(1)));
        assert_eq!(m.resident_splats(), 45);
    }

    #[test]
    fn test_sh_shape_mismatch_rejected() {
        let mut m = manager(100);

        let bad = TileSplats {
            records: splats(4, 0.0).records,
            sh: Some(ShPlane {
                degree: 1,
                coeffs: vec![f16::ZERO; 4 * ShPlane::coeffs_per_splat(1)],
            }),
        };

        assert!(matches!(m.admit(TileId(0), &bad), Err(Error::Format(_))));
        assert!(!m.is_resident(TileId(0)));
    }

    #[test]
    fn test_free_list_coalesces() {
        let mut m = manager(30);

        m.admit(TileId(0), &splats(10, 0.0)).expect("admit");
        m.admit(TileId(1), &splats(10, 1.0)).expect("admit");
        m.admit(TileId(2), &splats(10, 2.0)).expect("admit");

        // Evict the middle tile, then the first; the freed ranges must
        // merge so a 20-splat tile fits again
        m.set_visible(&[TileId(2)], Generation(1));
        m.begin_frame(None);
        let evicted = m.admit(TileId(3), &splats(20, 3.0)).expect("admit");

        assert_eq!(evicted.len(), 2);
        assert!(m.is_resident(TileId(3)));
        assert!(m.is_resident(TileId(2)));
    }
}
