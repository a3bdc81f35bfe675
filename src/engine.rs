//! Frame-loop facade over the streaming core
//!
//! `SplatStreamer` wires the four components together once per frame:
//! observe the camera, select the desired tile set, reconcile and pump the
//! download manager, admit decoded tiles into the resident buffer, pin the
//! visible set, and hand the sorter a fresh snapshot when anything moved.
//! Every call is non-blocking; async results land on later frames.

use std::sync::Arc;

use crate::core::config::StreamingConfig;
use crate::core::error::Error;
use crate::core::types::{Result, Vec3};
use crate::sort::worker::{SortWorker, SortedOrder};
use crate::sort::SortJob;
use crate::splat::codec::TileDecoder;
use crate::splat::model::{CameraView, Generation, ModelData};
use crate::streaming::download::{DownloadStats, LodDownloadManager};
use crate::streaming::fetch::TileFetcher;
use crate::streaming::texdata::{ResidentBuffer, SplatRange, SplatTexdataManager};
use crate::tiles::select::{select_tiles, DesiredTile};
use crate::tiles::tree::{TileId, TileManifest, TileState, TileTree};

/// Aggregate state surfaced for observability and UI
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamingStats {
    pub generation: u64,
    pub desired_tiles: usize,
    pub resident_tiles: usize,
    pub resident_splats: usize,
    pub failed_tiles: usize,
    pub queue_len: usize,
    pub in_flight: usize,
    pub budget_pressure: f32,
    pub evictions: u64,
    pub download: DownloadStats,
}

/// Streaming engine core for one model
pub struct SplatStreamer {
    model: ModelData,
    download: LodDownloadManager,
    texdata: SplatTexdataManager,
    sorter: SortWorker,
    config: StreamingConfig,
    last_desired: Vec<DesiredTile>,
    last_submitted: Generation,
    visible_dirty: bool,
    scratch: Option<(Vec<u32>, Vec<Vec3>)>,
}

impl SplatStreamer {
    /// Open a model from its manifest, running fetches on a dedicated
    /// tokio runtime.
    pub fn new(
        manifest: &TileManifest,
        fetcher: Arc<dyn TileFetcher>,
        decoder: Arc<dyn TileDecoder>,
        config: StreamingConfig,
    ) -> Result<Self> {
        let tree = TileTree::from_manifest(manifest)?;
        let download = LodDownloadManager::new(fetcher, decoder, config.clone());
        Ok(Self::assemble(tree, manifest.sh_degree, download, config))
    }

    /// Like [`SplatStreamer::new`], but spawns fetches onto the caller's
    /// tokio runtime. Panics outside a runtime context.
    pub fn new_with_current_runtime(
        manifest: &TileManifest,
        fetcher: Arc<dyn TileFetcher>,
        decoder: Arc<dyn TileDecoder>,
        config: StreamingConfig,
    ) -> Result<Self> {
        let tree = TileTree::from_manifest(manifest)?;
        let download = LodDownloadManager::new_with_current_runtime(fetcher, decoder, config.clone());
        Ok(Self::assemble(tree, manifest.sh_degree, download, config))
    }

    fn assemble(
        tree: TileTree,
        sh_degree: u8,
        download: LodDownloadManager,
        config: StreamingConfig,
    ) -> Self {
        let texdata = SplatTexdataManager::new(&config, sh_degree);
        let sorter = SortWorker::new(config.depth_bucket_bits, config.generation_drift);

        Self {
            model: ModelData::new(tree),
            download,
            texdata,
            sorter,
            config,
            last_desired: Vec::new(),
            last_submitted: Generation(0),
            visible_dirty: false,
            scratch: None,
        }
    }

    /// Advance one frame. Never blocks on network, decode or sorting.
    pub fn update(&mut self, camera: &CameraView) {
        let mut snapshot = self.model.observe(camera);

        // Retired buffer ranges free up once the published order has moved
        // past the eviction that retired them
        let published = self.sorter.published().map(|o| o.generation);
        self.texdata.begin_frame(published);

        let desired = select_tiles(self.model.tree(), &snapshot, self.config.refine_threshold);
        if desired != self.last_desired {
            // Visible tile set changed: new visibility epoch
            snapshot.generation = self.model.bump();
            self.visible_dirty = true;
        }

        self.download.reconcile(self.model.tree_mut(), &desired, &snapshot);
        self.download.pump(self.model.tree_mut());

        for decoded in self.download.poll(self.model.tree_mut()) {
            match self.texdata.admit(decoded.tile, &decoded.splats) {
                Ok(evicted) => {
                    let tree = self.model.tree_mut();
                    tree.transition(decoded.tile, TileState::Resident);
                    for tile in evicted {
                        tree.transition(tile, TileState::Evicted);
                    }
                    self.visible_dirty = true;
                }
                Err(Error::BudgetExceeded { needed, free }) => {
                    log::debug!(
                        "deferring tile {}: needs {} splat slots, {} free",
                        decoded.tile.0,
                        needed,
                        free
                    );
                    self.download.defer(self.model.tree_mut(), decoded.tile);
                }
                Err(err) => {
                    log::warn!("tile {} rejected at admission: {}", decoded.tile.0, err);
                    self.download.reject(self.model.tree_mut(), decoded.tile);
                }
            }
        }

        // Pin exactly the desired-and-resident set; everything else is
        // fair game for eviction
        let visible: Vec<TileId> = desired
            .iter()
            .map(|d| d.id)
            .filter(|&id| self.texdata.is_resident(id))
            .collect();
        self.texdata.set_visible(&visible, snapshot.generation);

        // Reclaim tiles that refinement released
        for tile in self.texdata.enforce_budget(self.config.target_utilization) {
            self.model.tree_mut().transition(tile, TileState::Evicted);
        }

        // Hand the sorter a fresh snapshot when depth order could have
        // changed; otherwise the previous published order stays in use
        self.sorter.note_generation(snapshot.generation);
        if self.visible_dirty || snapshot.generation > self.last_submitted {
            if let Some(buffers) = self.sorter.take_recycled() {
                self.scratch = Some(buffers);
            }
            let (mut indices, mut positions) = self.scratch.take().unwrap_or_default();
            self.texdata.visible_indices(&mut indices);
            self.texdata.gather_positions(&indices, &mut positions);

            self.sorter.submit(SortJob {
                generation: snapshot.generation,
                view: camera.view,
                indices,
                positions,
            });
            self.last_submitted = snapshot.generation;
            self.visible_dirty = false;
        }

        self.model.set_resident_splats(self.texdata.resident_splats());
        self.last_desired = desired;
    }

    /// Latest published draw order (back-to-front), if any
    pub fn sorted_order(&self) -> Option<Arc<SortedOrder>> {
        self.sorter.published()
    }

    /// True once a draw order has been published at least once
    pub fn ready(&self) -> bool {
        self.sorter.published().is_some()
    }

    /// Resident record/SH/position slabs for GPU upload
    pub fn resident_buffer(&self) -> &ResidentBuffer {
        self.texdata.buffer()
    }

    /// Drain the sub-ranges the renderer needs to re-upload
    pub fn take_dirty(&mut self) -> Vec<SplatRange> {
        self.texdata.take_dirty()
    }

    pub fn model(&self) -> &ModelData {
        &self.model
    }

    pub fn texdata(&self) -> &SplatTexdataManager {
        &self.texdata
    }

    pub fn stats(&self) -> StreamingStats {
        StreamingStats {
            generation: self.model.generation().0,
            desired_tiles: self.last_desired.len(),
            resident_tiles: self.texdata.resident_tiles(),
            resident_splats: self.texdata.resident_splats(),
            failed_tiles: self.model.tree().count_state(TileState::Failed),
            queue_len: self.download.queue_len(),
            in_flight: self.download.in_flight_count(),
            budget_pressure: self.texdata.pressure(),
            evictions: self.texdata.evictions(),
            download: *self.download.stats(),
        }
    }
}
