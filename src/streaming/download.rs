//! Prioritized, cancellable tile download and decode scheduling
//!
//! Turns the desired tile set into a bounded stream of fetch+decode work.
//! Results come back over a channel and are applied at the start of the
//! next frame; a result whose generation drifted past the configured
//! threshold is discarded instead of applied. Cancellation is structural:
//! an in-flight fetch for a tile that stopped being desired keeps running,
//! but its result is thrown away on arrival.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;

use crate::core::config::StreamingConfig;
use crate::core::error::{DecodeError, FetchError};
use crate::core::types::Vec3;
use crate::splat::codec::TileDecoder;
use crate::splat::model::{Generation, ViewSnapshot};
use crate::splat::record::TileSplats;
use crate::streaming::fetch::TileFetcher;
use crate::streaming::priority::{FetchQueue, TilePriority};
use crate::tiles::select::DesiredTile;
use crate::tiles::tree::{TileId, TileState, TileTree};

/// Why one fetch+decode attempt failed
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("{0}")]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Decode(#[from] DecodeError),
}

/// A decoded tile ready for admission into the resident buffer
pub struct DecodedTile {
    pub tile: TileId,
    pub generation: Generation,
    pub splats: TileSplats,
}

/// Progress messages sent by fetch tasks
enum TaskEvent {
    /// Bytes arrived; decode is starting on the worker
    Fetched { tile: TileId, generation: Generation },
    /// Terminal outcome of the attempt
    Done {
        tile: TileId,
        generation: Generation,
        result: Result<TileSplats, AttemptError>,
    },
}

struct InFlight {
    #[allow(dead_code)]
    generation: Generation,
    cancelled: bool,
}

/// Counters surfaced for observability
#[derive(Clone, Copy, Debug, Default)]
pub struct DownloadStats {
    /// Tiles that entered Requested
    pub requested: u64,
    /// Fetch tasks spawned
    pub fetches_started: u64,
    /// Failed attempts that were retried
    pub retries: u64,
    /// Tiles that exhausted their retries
    pub failures: u64,
    /// In-flight fetches abandoned by reconcile
    pub cancelled: u64,
    /// Results discarded because their fetch was cancelled
    pub cancelled_results: u64,
    /// Results discarded for generation drift
    pub stale_results: u64,
    /// Decoded tiles rejected for a manifest/shape mismatch
    pub format_rejects: u64,
    /// Admissions pushed back for lack of budget
    pub deferred: u64,
}

/// Fetch scheduler for one model
///
/// Owns in-flight request state only; every tile state change goes through
/// the [`TileTree`] state machine, and decoded records are handed off to
/// the caller the moment they are polled.
pub struct LodDownloadManager {
    fetcher: Arc<dyn TileFetcher>,
    decoder: Arc<dyn TileDecoder>,
    config: StreamingConfig,
    queue: FetchQueue,
    in_flight: HashMap<TileId, InFlight>,
    /// LOD delta of each currently desired tile, for retry re-queueing
    desired_meta: HashMap<TileId, u32>,
    current_generation: Generation,
    camera_pos: Vec3,
    event_tx: mpsc::UnboundedSender<TaskEvent>,
    event_rx: mpsc::UnboundedReceiver<TaskEvent>,
    handle: Handle,
    /// Keeps the dedicated runtime alive when this manager owns one
    #[allow(dead_code)]
    runtime: Option<Runtime>,
    stats: DownloadStats,
}

impl LodDownloadManager {
    /// Create a manager with its own tokio runtime
    pub fn new(
        fetcher: Arc<dyn TileFetcher>,
        decoder: Arc<dyn TileDecoder>,
        config: StreamingConfig,
    ) -> Self {
        let runtime = Runtime::new().expect("failed to create tokio runtime");
        let handle = runtime.handle().clone();
        Self::with_handle(fetcher, decoder, config, handle, Some(runtime))
    }

    /// Create a manager that spawns onto the current tokio runtime
    ///
    /// Panics if called outside a tokio runtime context.
    pub fn new_with_current_runtime(
        fetcher: Arc<dyn TileFetcher>,
        decoder: Arc<dyn TileDecoder>,
        config: StreamingConfig,
    ) -> Self {
        Self::with_handle(fetcher, decoder, config, Handle::current(), None)
    }

    fn with_handle(
        fetcher: Arc<dyn TileFetcher>,
        decoder: Arc<dyn TileDecoder>,
        config: StreamingConfig,
        handle: Handle,
        runtime: Option<Runtime>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            fetcher,
            decoder,
            config,
            queue: FetchQueue::new(),
            in_flight: HashMap::new(),
            desired_meta: HashMap::new(),
            current_generation: Generation(0),
            camera_pos: Vec3::ZERO,
            event_tx,
            event_rx,
            handle,
            runtime,
            stats: DownloadStats::default(),
        }
    }

    /// Diff the desired set against current tile states.
    ///
    /// Newly desired tiles enter the fetch queue; tiles no longer desired
    /// have queued requests dropped and in-flight fetches abandoned. The
    /// queue is redrawn from scratch, so outstanding unstarted requests are
    /// re-prioritized against the new camera position every call.
    pub fn reconcile(
        &mut self,
        tree: &mut TileTree,
        desired: &[DesiredTile],
        snapshot: &ViewSnapshot,
    ) {
        self.current_generation = snapshot.generation;
        self.camera_pos = snapshot.position;

        self.desired_meta.clear();
        for d in desired {
            self.desired_meta.insert(d.id, d.lod_delta);
        }

        // Abandon in-flight work for tiles no longer desired
        for (&tile, entry) in self.in_flight.iter_mut() {
            if !self.desired_meta.contains_key(&tile) && !entry.cancelled {
                entry.cancelled = true;
                self.stats.cancelled += 1;
                if matches!(
                    tree.get(tile).state,
                    TileState::Downloading | TileState::Decoding
                ) {
                    tree.transition(tile, TileState::Unloaded);
                }
                log::trace!("cancelled in-flight fetch for tile {}", tile.0);
            }
        }

        // Queued-but-unstarted requests for undesired tiles are dropped
        for id in tree.ids() {
            if tree.get(id).state == TileState::Requested && !self.desired_meta.contains_key(&id) {
                tree.transition(id, TileState::Unloaded);
            }
        }

        // Redraw the fetch queue from the desired set
        self.queue.clear();
        for d in desired {
            match tree.get(d.id).state {
                TileState::Unloaded | TileState::Evicted => {
                    if self.in_flight.contains_key(&d.id) {
                        // A cancelled fetch is still draining; request again
                        // once its result has been discarded
                        continue;
                    }
                    tree.transition(d.id, TileState::Requested);
                    self.stats.requested += 1;
                    self.queue.push(TilePriority::calculate(tree, d, snapshot.position));
                }
                TileState::Requested => {
                    self.queue.push(TilePriority::calculate(tree, d, snapshot.position));
                }
                TileState::Failed => {
                    // Failed is terminal within one visibility epoch; a later
                    // generation makes the tile eligible again
                    let failed_at = tree.get(d.id).failed_at.unwrap_or_default();
                    if snapshot.generation > failed_at {
                        tree.transition(d.id, TileState::Requested);
                        self.stats.requested += 1;
                        self.queue.push(TilePriority::calculate(tree, d, snapshot.position));
                    }
                }
                TileState::Downloading | TileState::Decoding | TileState::Resident => {}
            }
        }
    }

    /// Spawn fetch tasks until the concurrency cap is reached
    pub fn pump(&mut self, tree: &mut TileTree) {
        let now = Instant::now();
        let mut deferred = Vec::new();

        while self.in_flight.len() < self.config.max_concurrent_fetches {
            let Some(entry) = self.queue.pop() else { break };

            let tile = tree.get(entry.tile);
            if tile.state != TileState::Requested || self.in_flight.contains_key(&entry.tile) {
                continue;
            }
            if let Some(after) = tile.retry_after {
                if after > now {
                    deferred.push(entry);
                    continue;
                }
            }

            let range = tile.range;
            tree.transition(entry.tile, TileState::Downloading);

            let generation = self.current_generation;
            self.in_flight.insert(
                entry.tile,
                InFlight {
                    generation,
                    cancelled: false,
                },
            );
            self.stats.fetches_started += 1;

            let fetcher = self.fetcher.clone();
            let decoder = self.decoder.clone();
            let tx = self.event_tx.clone();
            let id = entry.tile;
            self.handle.spawn(async move {
                match fetcher.fetch(range).await {
                    Ok(bytes) => {
                        let _ = tx.send(TaskEvent::Fetched { tile: id, generation });
                        let result = decoder.decode(&bytes).map_err(AttemptError::Decode);
                        let _ = tx.send(TaskEvent::Done { tile: id, generation, result });
                    }
                    Err(e) => {
                        let _ = tx.send(TaskEvent::Done {
                            tile: id,
                            generation,
                            result: Err(AttemptError::Fetch(e)),
                        });
                    }
                }
            });
        }

        // Tiles still waiting out a backoff go back in the queue
        for entry in deferred {
            self.queue.push(entry);
        }
    }

    /// Drain completed fetches (non-blocking) and return decoded tiles
    /// that passed the staleness guard. Returned tiles are in Decoding
    /// state; the caller admits them and completes the transition.
    pub fn poll(&mut self, tree: &mut TileTree) -> Vec<DecodedTile> {
        let mut ready = Vec::new();

        while let Ok(event) = self.event_rx.try_recv() {
            match event {
                TaskEvent::Fetched { tile, .. } => {
                    if let Some(entry) = self.in_flight.get(&tile) {
                        if !entry.cancelled && tree.get(tile).state == TileState::Downloading {
                            tree.transition(tile, TileState::Decoding);
                        }
                    }
                }
                TaskEvent::Done {
                    tile,
                    generation,
                    result,
                } => {
                    let Some(entry) = self.in_flight.remove(&tile) else {
                        continue;
                    };
                    if entry.cancelled {
                        self.stats.cancelled_results += 1;
                        log::trace!("discarded cancelled result for tile {}", tile.0);
                        continue;
                    }
                    if generation.drift_from(self.current_generation) > self.config.generation_drift
                    {
                        self.stats.stale_results += 1;
                        tree.transition(tile, TileState::Unloaded);
                        log::trace!(
                            "discarded stale result for tile {} (gen {} vs {})",
                            tile.0,
                            generation.0,
                            self.current_generation.0
                        );
                        continue;
                    }

                    match result {
                        Ok(splats) => {
                            let expected = tree.get(tile).splat_count as usize;
                            if splats.len() != expected {
                                log::warn!(
                                    "tile {}: decoder produced {} records, manifest says {}",
                                    tile.0,
                                    splats.len(),
                                    expected
                                );
                                self.reject(tree, tile);
                                continue;
                            }
                            ready.push(DecodedTile {
                                tile,
                                generation,
                                splats,
                            });
                        }
                        Err(err) => self.record_failure(tree, tile, &err),
                    }
                }
            }
        }

        ready
    }

    /// Push a decoded tile back to Requested with a short hold because the
    /// resident buffer had no room for it.
    pub fn defer(&mut self, tree: &mut TileTree, tile: TileId) {
        tree.transition(tile, TileState::Requested);
        tree.get_mut(tile).retry_after = Some(Instant::now() + self.config.backoff_delay(1));
        self.stats.deferred += 1;

        if let Some(&lod_delta) = self.desired_meta.get(&tile) {
            let desired = DesiredTile { id: tile, lod_delta };
            self.queue.push(TilePriority::calculate(tree, &desired, self.camera_pos));
        }
    }

    /// Mark a tile Failed for the current generation (format mismatch or
    /// other non-retryable rejection).
    pub fn reject(&mut self, tree: &mut TileTree, tile: TileId) {
        tree.transition(tile, TileState::Failed);
        tree.get_mut(tile).failed_at = Some(self.current_generation);
        self.stats.format_rejects += 1;
    }

    fn record_failure(&mut self, tree: &mut TileTree, tile: TileId, err: &AttemptError) {
        let retries = {
            let t = tree.get_mut(tile);
            t.retries += 1;
            t.retries
        };

        if retries <= self.config.retry_limit {
            let delay = self.config.backoff_delay(retries);
            tree.transition(tile, TileState::Requested);
            tree.get_mut(tile).retry_after = Some(Instant::now() + delay);
            self.stats.retries += 1;
            log::debug!(
                "tile {} attempt {} failed ({}), retrying in {:?}",
                tile.0,
                retries,
                err,
                delay
            );

            if let Some(&lod_delta) = self.desired_meta.get(&tile) {
                let desired = DesiredTile { id: tile, lod_delta };
                self.queue.push(TilePriority::calculate(tree, &desired, self.camera_pos));
            }
        } else {
            tree.transition(tile, TileState::Failed);
            tree.get_mut(tile).failed_at = Some(self.current_generation);
            self.stats.failures += 1;
            log::warn!("tile {} failed permanently: {}", tile.0, err);
        }
    }

    pub fn stats(&self) -> &DownloadStats {
        &self.stats
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}
