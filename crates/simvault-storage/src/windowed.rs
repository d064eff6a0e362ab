//! Windowed backing store: hot cache plus async persistence.
//!
//! Originals stay in the cache from insert until the pipeline reports their
//! window durable; eviction is LRU over durable windows down to the cache
//! budget. Lookups that miss the cache hydrate the whole window containing
//! the id back from the database through a synchronous request to the
//! pipeline's write worker, so `find` and `load` may block.

use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::sync::Arc;

use fxhash::{FxHashMap, FxHashSet};
use parking_lot::Mutex;
use simvault_core::{
    chain::{restore_chain, replay, CheckpointArena},
    layouts, Checkpoint, CheckpointAccessor, CheckpointError, ChkptId, ContainerLayout,
    DetachedCheckpoint, NodeMeta, Result, SharedContainer, Tick,
};
use tracing::{debug, info, warn};

use crate::compress::decompress;
use crate::database::WindowDatabase;
use crate::pipeline::{Pipeline, PipelineHandle};
use crate::window::decode_window;

/// Configuration for a [`WindowedStore`].
#[derive(Debug, Clone)]
pub struct WindowedStoreConfig {
    /// Checkpoints per persisted window. Must match the checkpointer's
    /// snapshot threshold so every restore chain spans at most two windows.
    pub window_len: u32,
    /// Cache budget in windows; durable windows beyond this are evicted
    /// least-recently-used first.
    pub max_cached_windows: usize,
    /// Bounded depth of each pipeline stage queue.
    pub queue_depth: usize,
}

impl Default for WindowedStoreConfig {
    fn default() -> Self {
        Self {
            window_len: 20,
            max_cached_windows: 4,
            queue_depth: 4,
        }
    }
}

impl WindowedStoreConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the window length.
    #[must_use]
    pub fn with_window_len(mut self, window_len: u32) -> Self {
        self.window_len = window_len;
        self
    }

    /// Sets the cache budget in windows.
    #[must_use]
    pub fn with_max_cached_windows(mut self, max: usize) -> Self {
        self.max_cached_windows = max;
        self
    }

    /// Sets the stage queue depth.
    #[must_use]
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::InvalidConfig`] if any knob is zero.
    pub fn validate(&self) -> Result<()> {
        if self.window_len == 0 {
            return Err(CheckpointError::InvalidConfig(
                "window_len must be >= 1".to_string(),
            ));
        }
        if self.max_cached_windows == 0 {
            return Err(CheckpointError::InvalidConfig(
                "max_cached_windows must be >= 1".to_string(),
            ));
        }
        if self.queue_depth == 0 {
            return Err(CheckpointError::InvalidConfig(
                "queue_depth must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// The hot cache: whole windows of live nodes, LRU ordered, with a durable
/// set fed by pipeline notifications.
///
/// Shared between the simulator thread and the pipeline's eviction worker,
/// always behind a mutex.
pub(crate) struct WindowCache {
    window_len: u64,
    max_windows: usize,
    windows: FxHashMap<u64, Vec<Checkpoint>>,
    /// Front is most recently used.
    lru: VecDeque<u64>,
    durable: FxHashSet<u64>,
}

impl WindowCache {
    fn new(window_len: u32, max_windows: usize) -> Self {
        Self {
            window_len: u64::from(window_len),
            max_windows,
            windows: FxHashMap::default(),
            lru: VecDeque::new(),
            durable: FxHashSet::default(),
        }
    }

    fn window_index(&self, key: ChkptId) -> u64 {
        // Ids start at 1; a stray unidentified id maps onto window 0 where
        // the node scan simply misses.
        key.saturating_sub(1) / self.window_len
    }

    fn touch(&mut self, win: u64) {
        if let Some(pos) = self.lru.iter().position(|w| *w == win) {
            self.lru.remove(pos);
        }
        self.lru.push_front(win);
    }

    fn node(&self, key: ChkptId) -> Option<&Checkpoint> {
        self.windows
            .get(&self.window_index(key))?
            .iter()
            .find(|c| c.arena_key() == key)
    }

    fn node_mut(&mut self, key: ChkptId) -> Option<&mut Checkpoint> {
        let win = self.window_index(key);
        self.windows
            .get_mut(&win)?
            .iter_mut()
            .find(|c| c.arena_key() == key)
    }

    fn insert_node(&mut self, node: Checkpoint) -> Result<()> {
        let key = node.arena_key();
        // Keep the parent's child list current while it is still cached.
        if let Some(prev) = node.prev() {
            if let Some(parent) = self.node_mut(prev) {
                parent.add_next(key);
            }
        }

        let win = self.window_index(key);
        let window = self.windows.entry(win).or_default();
        if let Some(last) = window.last() {
            if last.arena_key() + 1 != key {
                return Err(CheckpointError::InvariantViolation(format!(
                    "checkpoint {key} inserted out of order into window {win} ending at {}",
                    last.arena_key()
                )));
            }
        }
        window.push(node);
        self.touch(win);
        Ok(())
    }

    /// Installs a hydrated window; it came from the database, so it is
    /// durable by construction.
    fn insert_window(&mut self, nodes: Vec<Checkpoint>) -> Result<u64> {
        let first = nodes.first().ok_or_else(|| {
            CheckpointError::StorageCorruption("hydrated window holds no checkpoints".to_string())
        })?;
        let win = self.window_index(first.arena_key());
        if self.windows.contains_key(&win) {
            return Err(CheckpointError::InvariantViolation(format!(
                "hydrated window {win} is already cached"
            )));
        }
        self.windows.insert(win, nodes);
        self.durable.insert(win);
        self.touch(win);
        Ok(win)
    }

    pub(crate) fn mark_durable(&mut self, ids: &[ChkptId]) {
        for &id in ids {
            let win = self.window_index(id);
            self.durable.insert(win);
        }
    }

    /// Evicts least-recently-used durable windows down to the budget.
    /// Windows not yet reported durable are never dropped.
    pub(crate) fn evict_excess(&mut self) {
        while self.windows.len() > self.max_windows {
            let Some(pos) = (0..self.lru.len())
                .rev()
                .find(|i| self.durable.contains(&self.lru[*i]))
            else {
                break;
            };
            let Some(win) = self.lru.remove(pos) else {
                break;
            };
            self.windows.remove(&win);
            debug!(window = win, "evicted durable checkpoint window from cache");
        }
    }

    fn nodes(&self) -> impl Iterator<Item = &Checkpoint> {
        self.windows.values().flatten()
    }

    fn drain_reverse(&mut self) -> Vec<Checkpoint> {
        let mut nodes: Vec<Checkpoint> = self
            .windows
            .drain()
            .flat_map(|(_, window)| window)
            .collect();
        nodes.sort_by_key(|n| std::cmp::Reverse(n.arena_key()));
        self.lru.clear();
        self.durable.clear();
        nodes
    }
}

/// Arena view over a locked cache that hydrates misses from the database.
struct CacheArena<'a> {
    cache: &'a mut WindowCache,
    pipeline: &'a Pipeline,
    layouts: &'a [ContainerLayout],
}

impl CacheArena<'_> {
    fn ensure(&mut self, key: ChkptId) -> Result<()> {
        if self.cache.node(key).is_some() {
            let win = self.cache.window_index(key);
            self.cache.touch(win);
            return Ok(());
        }
        let Some(blob) = self.pipeline.hydrate(key)? else {
            return Ok(());
        };
        let bytes = decompress(&blob)?;
        let chkpts = decode_window(&bytes, self.layouts)?;
        let nodes: Vec<Checkpoint> = chkpts
            .into_iter()
            .map(DetachedCheckpoint::into_node)
            .collect();
        debug!(key, count = nodes.len(), "hydrated checkpoint window");
        self.cache.insert_window(nodes)?;
        self.cache.evict_excess();
        Ok(())
    }
}

impl CheckpointArena for CacheArena<'_> {
    fn node(&mut self, key: ChkptId) -> Result<Option<&Checkpoint>> {
        self.ensure(key)?;
        Ok(self.cache.node(key))
    }

    fn node_mut(&mut self, key: ChkptId) -> Result<Option<&mut Checkpoint>> {
        self.ensure(key)?;
        Ok(self.cache.node_mut(key))
    }
}

/// Backing store keeping a working window of checkpoints in memory and the
/// rest in a keyed blob database.
pub struct WindowedStore {
    cache: Arc<Mutex<WindowCache>>,
    pipeline: Pipeline,
    containers: Vec<SharedContainer>,
    layouts: Vec<ContainerLayout>,
}

impl WindowedStore {
    /// Creates the store and spawns its persistence pipeline over `db`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::InvalidConfig`] for a bad configuration,
    /// or [`CheckpointError::Pipeline`] if a worker thread cannot be
    /// spawned.
    pub fn new(db: Arc<dyn WindowDatabase>, config: WindowedStoreConfig) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(Mutex::new(WindowCache::new(
            config.window_len,
            config.max_cached_windows,
        )));
        let pipeline = Pipeline::spawn(
            db,
            cache.clone(),
            config.window_len as usize,
            config.queue_depth,
        )?;
        Ok(Self {
            cache,
            pipeline,
            containers: Vec::new(),
            layouts: Vec::new(),
        })
    }

    /// Drain handle usable after the store has been boxed into a
    /// checkpointer.
    #[must_use]
    pub fn handle(&self) -> PipelineHandle {
        self.pipeline.handle()
    }

    fn with_arena<R>(&mut self, f: impl FnOnce(&mut CacheArena<'_>) -> Result<R>) -> Result<R> {
        let mut cache = self.cache.lock();
        let mut arena = CacheArena {
            cache: &mut cache,
            pipeline: &self.pipeline,
            layouts: &self.layouts,
        };
        f(&mut arena)
    }

    /// Decodes every persisted window into rebuilt nodes, keyed by id.
    fn persisted_nodes(&self) -> Result<BTreeMap<ChkptId, Checkpoint>> {
        let mut nodes = BTreeMap::new();
        for blob in self.pipeline.all_windows()? {
            let bytes = decompress(&blob)?;
            for chkpt in decode_window(&bytes, &self.layouts)? {
                let node = chkpt.into_node();
                nodes.insert(node.arena_key(), node);
            }
        }
        Ok(nodes)
    }

    /// Cached plus persisted nodes in id order, preferring the cached
    /// original where both exist.
    fn collect_all(&self) -> Result<BTreeMap<ChkptId, Checkpoint>> {
        let mut nodes = self.persisted_nodes()?;
        let cache = self.cache.lock();
        for node in cache.nodes() {
            nodes.insert(node.arena_key(), node.detach().into_node());
        }
        Ok(nodes)
    }
}

impl CheckpointAccessor for WindowedStore {
    fn set_containers(&mut self, containers: Vec<SharedContainer>) {
        self.layouts = layouts(&containers);
        self.containers = containers;
    }

    fn insert(&mut self, node: Checkpoint) -> Result<()> {
        if self.pipeline.is_failed() {
            warn!(
                id = node.id(),
                "pipeline has failed; checkpoint is cached but will not be persisted"
            );
        } else if let Err(e) = self.pipeline.publish(node.detach()) {
            warn!(id = node.id(), error = %e, "checkpoint publish failed; kept in cache only");
        }

        let mut cache = self.cache.lock();
        cache.insert_node(node)?;
        cache.evict_excess();
        Ok(())
    }

    fn has(&mut self, id: ChkptId) -> bool {
        if self
            .cache
            .lock()
            .node(id)
            .is_some_and(|n| !n.is_flagged_deleted())
        {
            return true;
        }
        match self.pipeline.list_ids() {
            Ok(ids) => ids.contains(&id),
            Err(e) => {
                warn!(error = %e, "persisted id listing failed");
                false
            }
        }
    }

    fn node_count(&mut self) -> u64 {
        let cached: Vec<ChkptId> = self.cache.lock().nodes().map(Checkpoint::arena_key).collect();
        let persisted = self.pipeline.list_ids().unwrap_or_default();
        let mut all: Vec<ChkptId> = cached;
        all.extend(persisted);
        all.sort_unstable();
        all.dedup();
        all.len() as u64
    }

    fn node_meta(&mut self, key: ChkptId) -> Result<Option<NodeMeta>> {
        self.with_arena(|arena| Ok(arena.node(key)?.map(NodeMeta::from)))
    }

    fn list(&mut self) -> Result<Vec<ChkptId>> {
        let mut ids: Vec<ChkptId> = {
            let cache = self.cache.lock();
            cache
                .nodes()
                .filter(|n| !n.is_flagged_deleted())
                .map(Checkpoint::id)
                .collect()
        };
        ids.extend(self.pipeline.list_ids()?);
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    fn list_at(&mut self, t: Tick) -> Result<Vec<ChkptId>> {
        let mut ids: Vec<ChkptId> = {
            let cache = self.cache.lock();
            cache
                .nodes()
                .filter(|n| !n.is_flagged_deleted() && n.tick() == t)
                .map(Checkpoint::id)
                .collect()
        };
        for (_, node) in self.persisted_nodes()? {
            if !node.is_flagged_deleted() && node.tick() == t {
                ids.push(node.id());
            }
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    fn find_detached(&mut self, id: ChkptId) -> Result<Option<DetachedCheckpoint>> {
        self.with_arena(|arena| {
            Ok(arena
                .node(id)?
                .filter(|n| !n.is_flagged_deleted())
                .map(Checkpoint::detach))
        })
    }

    fn load_into(&mut self, id: ChkptId) -> Result<()> {
        let containers = self.containers.clone();
        self.with_arena(|arena| {
            match arena.node(id)? {
                Some(node) if !node.is_flagged_deleted() => {}
                _ => return Err(CheckpointError::NotFound(id)),
            }
            let chain = restore_chain(arena, id)?;
            replay(arena, &chain, &containers)
        })
    }

    fn trace_value(
        &mut self,
        out: &mut dyn Write,
        id: ChkptId,
        container_index: usize,
        offset: u64,
        size: u32,
    ) -> Result<()> {
        let lay = self.layouts.clone();
        self.with_arena(|arena| {
            if arena.node(id)?.is_none() {
                return Err(CheckpointError::NotFound(id));
            }
            simvault_core::trace::trace_value(arena, out, &lay, id, container_index, offset, size)
        })
    }

    fn delete(&mut self, _id: ChkptId) -> Result<()> {
        Err(CheckpointError::Unsupported(
            "explicit checkpoint deletion in windowed mode",
        ))
    }

    fn erase(&mut self, _key: ChkptId) -> Result<()> {
        Err(CheckpointError::Unsupported(
            "explicit checkpoint erasure in windowed mode",
        ))
    }

    fn nearest_live_ancestor(&mut self, key: ChkptId) -> Result<Option<ChkptId>> {
        self.with_arena(|arena| {
            let Some(node) = arena.node(key)? else {
                return Ok(None);
            };
            let mut cur = node.prev();
            while let Some(k) = cur {
                let Some(n) = arena.node(k)? else {
                    return Ok(None);
                };
                if !n.is_flagged_deleted() {
                    return Ok(Some(k));
                }
                cur = n.prev();
            }
            Ok(None)
        })
    }

    fn flag_all_deleted(&mut self) -> Result<()> {
        let mut cache = self.cache.lock();
        let keys: Vec<ChkptId> = cache
            .nodes()
            .filter(|n| !n.is_flagged_deleted())
            .map(Checkpoint::arena_key)
            .collect();
        for key in keys {
            if let Some(node) = cache.node_mut(key) {
                node.flag_deleted()?;
            }
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        if let Err(e) = self.pipeline.flush() {
            warn!(error = %e, "pipeline drain during teardown failed");
        }
        self.pipeline.shutdown();

        let mut cache = self.cache.lock();
        let mut nodes = cache.drain_reverse();
        for node in &mut nodes {
            if !node.is_flagged_deleted() {
                node.flag_deleted()?;
            }
        }
        info!(count = nodes.len(), "windowed store torn down");
        Ok(())
    }

    fn mem_total(&mut self) -> u64 {
        self.cache.lock().nodes().map(Checkpoint::total_memory).sum()
    }

    fn mem_content(&mut self) -> u64 {
        self.cache
            .lock()
            .nodes()
            .map(Checkpoint::content_memory)
            .sum()
    }

    fn dump_list(&mut self, out: &mut dyn Write) -> Result<()> {
        for node in self.collect_all()?.values() {
            writeln!(out, "{node}")?;
        }
        Ok(())
    }

    fn dump_data(&mut self, out: &mut dyn Write) -> Result<()> {
        for node in self.collect_all()?.values() {
            node.storage().dump(out)?;
            writeln!(out)?;
        }
        Ok(())
    }

    fn dump_annotated_data(&mut self, out: &mut dyn Write) -> Result<()> {
        for node in self.collect_all()?.values() {
            writeln!(out, "{node}")?;
            node.storage().dump(out)?;
            writeln!(out)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for WindowedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cache = self.cache.lock();
        f.debug_struct("WindowedStore")
            .field("cached_windows", &cache.windows.len())
            .field("durable_windows", &cache.durable.len())
            .field("failed", &self.pipeline.is_failed())
            .finish_non_exhaustive()
    }
}
