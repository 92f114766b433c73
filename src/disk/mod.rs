//! Disk buffer pool
//!
//! A bounded allocator for the fixed-size blocks the disk cache and
//! peer readers work in. Capacity is enforced with a high/low watermark
//! pair: crossing into the upper half of the band latches a pressure
//! flag and fires the cache-trim trigger, and while pressure is latched
//! asynchronous requests queue instead of allocating. When occupancy
//! falls back to the low watermark the queue drains in FIFO order and
//! registered observers are told the disk is ready again.
//!
//! Callbacks are never invoked on the freeing thread. The wake
//! procedure builds a [`WakeBatch`] under the pool lock and posts it
//! through an unbounded channel; the upper-layer executor drains the
//! channel and dispatches, so a `free` call can never re-enter the
//! caller through an arbitrary callback.

mod backing;

pub use backing::BackingKind;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::{DiskCacheConfig, BLOCK_SIZE};

use backing::{Backing, BlockData, MmapRegionUnavailable, SlabPool};

/// Statistics tag for a block ("read cache", "write cache", ...)
pub type Category = &'static str;

/// One-shot callback receiving a block once pressure subsides
pub type AllocHandler = Box<dyn FnOnce(Block) + Send + 'static>;

/// A consumer that wants to hear when the cache is writable again
pub trait DiskObserver: Send + Sync {
    fn on_disk(&self);
}

/// A fixed-size disk block checked out of the pool.
///
/// Blocks must be returned with [`BufferPool::free`] or
/// [`BufferPool::free_many`]; dropping one releases its memory but
/// leaves the pool's occupancy count stale.
pub struct Block {
    data: BlockData,
    category: Category,
}

impl Block {
    /// The statistics category this block was allocated under
    pub fn category(&self) -> Category {
        self.category
    }

    pub fn len(&self) -> usize {
        self.data.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::ops::Deref for Block {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_slice()
    }
}

impl std::ops::DerefMut for Block {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_mut_slice()
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("category", &self.category)
            .field("len", &self.len())
            .finish()
    }
}

/// Notifications built during a wake-up, dispatched on the executor.
///
/// Handlers are served in their queue order, then observers in their
/// registration order.
pub struct WakeBatch {
    handlers: Vec<(AllocHandler, Block)>,
    observers: Vec<Arc<dyn DiskObserver>>,
}

impl WakeBatch {
    /// Invoke every handler with its block, then every observer
    pub fn dispatch(self) {
        for (handler, block) in self.handlers {
            handler(block);
        }
        for observer in self.observers {
            observer.on_disk();
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.observers.is_empty()
    }
}

/// Spawn a task that drains wake batches and dispatches them.
///
/// Embedders with their own event loop can instead drain the receiver
/// themselves and call [`WakeBatch::dispatch`] in place.
pub fn spawn_wake_dispatcher(
    mut rx: mpsc::UnboundedReceiver<WakeBatch>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            batch.dispatch();
        }
    })
}

struct PendingHandler {
    category: Category,
    handler: AllocHandler,
}

struct PoolState {
    in_use: usize,
    max_use: usize,
    low_watermark: usize,
    exceeded_max_size: bool,
    handlers: VecDeque<PendingHandler>,
    observers: Vec<Arc<dyn DiskObserver>>,
    backing: Backing,
    want_pool: bool,
    want_mmap: Option<std::path::PathBuf>,
    chunk_hint: usize,
    lock_in_ram: bool,
    categories: HashMap<Category, usize>,
}

/// Watermark-driven allocator of disk blocks
pub struct BufferPool {
    block_size: usize,
    state: Mutex<PoolState>,
    wake_tx: mpsc::UnboundedSender<WakeBatch>,
    trim_trigger: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl BufferPool {
    /// Create a pool with default capacity (configure with
    /// [`set_settings`](Self::set_settings) before serious use).
    ///
    /// `wake_tx` is where wake-up batches are posted; pair it with
    /// [`spawn_wake_dispatcher`] or a hand-rolled drain loop.
    pub fn new(wake_tx: mpsc::UnboundedSender<WakeBatch>) -> Self {
        Self::with_block_size(BLOCK_SIZE, wake_tx)
    }

    /// Create a pool with a non-standard block size (tests mostly)
    pub fn with_block_size(block_size: usize, wake_tx: mpsc::UnboundedSender<WakeBatch>) -> Self {
        Self {
            block_size,
            state: Mutex::new(PoolState {
                in_use: 0,
                max_use: 64,
                low_watermark: 32,
                exceeded_max_size: false,
                handlers: VecDeque::new(),
                observers: Vec::new(),
                backing: Backing::Heap,
                want_pool: false,
                want_mmap: None,
                chunk_hint: 0,
                lock_in_ram: false,
                categories: HashMap::new(),
            }),
            wake_tx,
            trim_trigger: None,
        }
    }

    /// Install the cache-trim trigger fired whenever pressure latches
    pub fn with_trim_trigger(mut self, trigger: impl Fn() + Send + Sync + 'static) -> Self {
        self.trim_trigger = Some(Arc::new(trigger));
        self
    }

    /// Block size in bytes
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of outstanding blocks
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use
    }

    /// Whether pressure is currently latched
    pub fn is_exceeded(&self) -> bool {
        self.state.lock().exceeded_max_size
    }

    /// Which backing strategy is active
    pub fn backing_kind(&self) -> BackingKind {
        self.state.lock().backing.kind()
    }

    /// Per-category counts of outstanding blocks
    pub fn stats(&self) -> Vec<(Category, usize)> {
        let state = self.state.lock();
        let mut out: Vec<_> = state
            .categories
            .iter()
            .map(|(k, v)| (*k, *v))
            .filter(|(_, v)| *v > 0)
            .collect();
        out.sort_unstable_by_key(|(k, _)| *k);
        out
    }

    /// Move a block to a different statistics category
    pub fn rename(&self, block: &mut Block, category: Category) {
        let mut state = self.state.lock();
        if let Some(count) = state.categories.get_mut(block.category) {
            *count = count.saturating_sub(1);
        }
        *state.categories.entry(category).or_default() += 1;
        block.category = category;
    }

    /// Synchronous allocation attempt. Refuses (without queueing) once
    /// the capacity ceiling is reached.
    pub fn allocate(&self, category: Category) -> Option<Block> {
        let (block, trim) = {
            let mut state = self.state.lock();
            if state.in_use >= state.max_use {
                let trim = !state.exceeded_max_size;
                state.exceeded_max_size = true;
                (None, trim)
            } else {
                let mut trim = false;
                let block = self.allocate_impl(&mut state, category, &mut trim);
                (block, trim)
            }
        };
        self.fire_trim(trim);
        block
    }

    /// Allocation attempt that also registers `observer` for a one-shot
    /// "disk ready" notification if the pool is under pressure.
    ///
    /// Returns the block (if any) and whether pressure was latched.
    pub fn allocate_or_observe(
        &self,
        category: Category,
        observer: Arc<dyn DiskObserver>,
    ) -> (Option<Block>, bool) {
        let (block, exceeded, trim) = {
            let mut state = self.state.lock();
            let mut trim = false;
            let block = if state.in_use >= state.max_use {
                trim = !state.exceeded_max_size;
                state.exceeded_max_size = true;
                None
            } else {
                self.allocate_impl(&mut state, category, &mut trim)
            };
            if state.exceeded_max_size {
                state.observers.push(observer);
            }
            (block, state.exceeded_max_size, trim)
        };
        self.fire_trim(trim);
        (block, exceeded)
    }

    /// Asynchronous allocation. Under pressure the handler is queued
    /// and fired exactly once, with a block, on the executor; otherwise
    /// the block is returned synchronously.
    pub fn async_allocate(&self, category: Category, handler: AllocHandler) -> Option<Block> {
        let (block, trim) = {
            let mut state = self.state.lock();
            if state.exceeded_max_size {
                state.handlers.push_back(PendingHandler { category, handler });
                (None, false)
            } else {
                let mut trim = false;
                match self.allocate_impl(&mut state, category, &mut trim) {
                    Some(block) => (Some(block), trim),
                    None => {
                        // Backing ran dry; pressure just latched
                        state.handlers.push_back(PendingHandler { category, handler });
                        (None, trim)
                    }
                }
            }
        };
        self.fire_trim(trim);
        block
    }

    /// Return one block to the pool
    pub fn free(&self, block: Block) {
        let (batch, trim) = {
            let mut state = self.state.lock();
            self.free_impl(&mut state, block);
            self.check_buffer_level(&mut state)
        };
        self.post(batch);
        self.fire_trim(trim);
    }

    /// Return many blocks at once. Blocks are released in address order
    /// to maximize cache locality, and the watermark check runs once at
    /// the end.
    pub fn free_many(&self, mut blocks: Vec<Block>) {
        if blocks.is_empty() {
            return;
        }
        blocks.sort_unstable_by_key(|b| b.data.sort_key());

        let (batch, trim) = {
            let mut state = self.state.lock();
            for block in blocks {
                self.free_impl(&mut state, block);
            }
            self.check_buffer_level(&mut state)
        };
        self.post(batch);
        self.fire_trim(trim);
    }

    /// Advisory for the cache: how many blocks to evict so that `need`
    /// more allocations fit without violating the watermarks.
    pub fn num_to_evict(&self, need: usize) -> usize {
        let state = self.state.lock();
        let in_use = state.in_use as i64;
        let over_low = in_use - state.low_watermark as i64;
        let over_max = in_use + need as i64 - state.max_use as i64;
        over_low.max(over_max).clamp(0, in_use) as usize
    }

    /// Apply new cache settings.
    ///
    /// Capacity and watermark changes take effect immediately (unless
    /// the mmap backing holds live blocks); a change of backing
    /// strategy is deferred until no blocks are outstanding.
    pub fn set_settings(&self, cfg: &DiskCacheConfig) {
        let trim = {
            let mut state = self.state.lock();

            state.chunk_hint = cfg.cache_buffer_chunk_size;
            state.lock_in_ram = cfg.lock_disk_cache;
            state.want_pool = cfg.use_disk_cache_pool;
            state.want_mmap = cfg.mmap_cache.clone();

            // A live mmap region is sized to max_use; nothing can
            // change under it until its blocks drain.
            if state.backing.kind() == BackingKind::Mmap && state.in_use > 0 {
                return;
            }

            state.max_use = cfg.cache_size;
            state.low_watermark = cfg.low_watermark();

            let mut trim = false;
            if state.in_use >= state.max_use && !state.exceeded_max_size {
                state.exceeded_max_size = true;
                trim = true;
            }

            if state.in_use == 0 {
                self.apply_backing(&mut state);
            }
            trim
        };
        self.fire_trim(trim);
    }

    /// Set the watermarks directly instead of deriving them from
    /// [`DiskCacheConfig`]. `low_watermark` is clamped to `max_use`.
    pub fn set_watermarks(&self, max_use: usize, low_watermark: usize) {
        let trim = {
            let mut state = self.state.lock();
            state.max_use = max_use;
            state.low_watermark = low_watermark.min(max_use);
            if state.in_use >= state.max_use && !state.exceeded_max_size {
                state.exceeded_max_size = true;
                true
            } else {
                false
            }
        };
        self.fire_trim(trim);
    }

    /// Drop memory cached by the slab backing
    pub fn release_memory(&self) {
        let mut state = self.state.lock();
        if let Backing::Pool(pool) = &mut state.backing {
            pool.release_memory();
        }
    }

    fn post(&self, batch: Option<WakeBatch>) {
        if let Some(batch) = batch {
            if !batch.is_empty() && self.wake_tx.send(batch).is_err() {
                tracing::debug!("wake dispatcher gone; dropping disk notifications");
            }
        }
    }

    fn fire_trim(&self, trim: bool) {
        if trim {
            if let Some(trigger) = &self.trim_trigger {
                trigger();
            }
        }
    }

    /// Pressure latches in the upper half of the watermark band
    fn latch_point(state: &PoolState) -> usize {
        state.low_watermark + (state.max_use - state.low_watermark) / 2
    }

    fn allocate_impl(
        &self,
        state: &mut PoolState,
        category: Category,
        trim: &mut bool,
    ) -> Option<Block> {
        let chunk = if state.chunk_hint != 0 {
            state.chunk_hint
        } else {
            (state.max_use / 10).max(1)
        };

        // The mmap free list latches pressure while slots remain, so
        // handlers queue before the region runs completely dry.
        #[cfg(unix)]
        {
            let slots_low = match &state.backing {
                Backing::Mmap(region) => {
                    region.free_slot_count() <= (state.max_use - state.low_watermark) / 2
                }
                _ => false,
            };
            if slots_low && !state.exceeded_max_size {
                state.exceeded_max_size = true;
                *trim = true;
            }
        }

        let data = match state.backing.allocate(self.block_size, chunk) {
            Some(data) => data,
            None => {
                if !state.exceeded_max_size {
                    state.exceeded_max_size = true;
                    *trim = true;
                }
                return None;
            }
        };

        if state.lock_in_ram {
            backing::pin(&data);
        }

        state.in_use += 1;
        *state.categories.entry(category).or_default() += 1;

        if state.in_use >= Self::latch_point(state) && !state.exceeded_max_size {
            state.exceeded_max_size = true;
            *trim = true;
        }

        Some(Block { data, category })
    }

    fn free_impl(&self, state: &mut PoolState, block: Block) {
        let Block { data, category } = block;

        if state.lock_in_ram {
            backing::unpin(&data);
        }
        if let Some(count) = state.categories.get_mut(category) {
            *count = count.saturating_sub(1);
        }

        state.backing.release(data);
        state.in_use -= 1;

        if state.in_use == 0 {
            self.apply_backing(state);
        }
    }

    /// Runs after frees: if pressure is latched and occupancy fell to
    /// the low watermark, serve queued handlers in FIFO order. Should
    /// the pool re-enter pressure mid-drain, the served prefix is
    /// posted as one batch and the remainder stays queued. Observers
    /// are only notified once the whole queue drained without
    /// re-latching.
    fn check_buffer_level(&self, state: &mut PoolState) -> (Option<WakeBatch>, bool) {
        if !state.exceeded_max_size || state.in_use > state.low_watermark {
            return (None, false);
        }
        state.exceeded_max_size = false;

        let mut trim = false;
        let mut served: Vec<(AllocHandler, Block)> = Vec::new();

        while let Some(pending) = state.handlers.pop_front() {
            match self.allocate_impl(state, pending.category, &mut trim) {
                Some(block) => {
                    served.push((pending.handler, block));
                    if state.exceeded_max_size && !state.handlers.is_empty() {
                        return (
                            Some(WakeBatch {
                                handlers: served,
                                observers: Vec::new(),
                            }),
                            trim,
                        );
                    }
                }
                None => {
                    state.handlers.push_front(pending);
                    break;
                }
            }
        }

        let observers = if state.exceeded_max_size {
            Vec::new()
        } else {
            std::mem::take(&mut state.observers)
        };

        let batch = WakeBatch {
            handlers: served,
            observers,
        };
        if batch.is_empty() {
            (None, trim)
        } else {
            (Some(batch), trim)
        }
    }

    /// Switch to the configured backing strategy. Caller guarantees
    /// `in_use == 0`.
    fn apply_backing(&self, state: &mut PoolState) {
        debug_assert_eq!(state.in_use, 0);

        let desired = if state.want_mmap.is_some() {
            BackingKind::Mmap
        } else if state.want_pool {
            BackingKind::Pool
        } else {
            BackingKind::Heap
        };
        if state.backing.kind() == desired {
            return;
        }

        state.backing = match desired {
            BackingKind::Mmap => {
                let path = state.want_mmap.as_ref().expect("mmap path checked above");
                match Backing::mmap(path, state.max_use, self.block_size) {
                    Ok(backing) => backing,
                    Err(MmapRegionUnavailable(err)) => {
                        tracing::warn!("mmap cache unavailable, staying on heap: {err}");
                        state.want_mmap = None;
                        if state.want_pool {
                            Backing::Pool(SlabPool::new())
                        } else {
                            Backing::Heap
                        }
                    }
                }
            }
            BackingKind::Pool => Backing::Pool(SlabPool::new()),
            BackingKind::Heap => Backing::Heap,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_pool(cache_size: usize, gap_blocks: usize) -> (BufferPool, mpsc::UnboundedReceiver<WakeBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = BufferPool::with_block_size(1024, tx);
        pool.set_settings(&DiskCacheConfig {
            cache_size,
            max_queued_disk_bytes: gap_blocks * 1024,
            ..Default::default()
        });
        (pool, rx)
    }

    #[test]
    fn test_allocate_and_free_track_in_use() {
        let (pool, _rx) = test_pool(64, 16);
        let a = pool.allocate("read cache").unwrap();
        let b = pool.allocate("write cache").unwrap();
        assert_eq!(pool.in_use(), 2);
        assert_eq!(
            pool.stats(),
            vec![("read cache", 1), ("write cache", 1)]
        );

        pool.free(a);
        pool.free(b);
        assert_eq!(pool.in_use(), 0);
        assert!(pool.stats().is_empty());
    }

    #[test]
    fn test_allocate_refuses_at_ceiling() {
        let (pool, _rx) = test_pool(18, 16);
        // low watermark = 2, ceiling = 18
        let blocks: Vec<_> = (0..18).map(|_| pool.allocate("read cache").unwrap()).collect();
        assert_eq!(pool.in_use(), 18);
        assert!(pool.allocate("read cache").is_none());
        pool.free_many(blocks);
    }

    #[test]
    fn test_pressure_latches_in_upper_band() {
        let (pool, _rx) = test_pool(20, 16);
        // low = 4, latch point = 4 + (20-4)/2 = 12
        let mut blocks = Vec::new();
        for _ in 0..11 {
            blocks.push(pool.allocate("read cache").unwrap());
        }
        assert!(!pool.is_exceeded());
        blocks.push(pool.allocate("read cache").unwrap());
        assert!(pool.is_exceeded());

        // Latch clears only at the low watermark
        while pool.in_use() > 5 {
            pool.free(blocks.pop().unwrap());
        }
        assert!(pool.is_exceeded());
        pool.free(blocks.pop().unwrap());
        assert!(!pool.is_exceeded());
        pool.free_many(blocks);
    }

    #[test]
    fn test_trim_trigger_fires_once_per_latch() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = BufferPool::with_block_size(1024, tx)
            .with_trim_trigger(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        pool.set_settings(&DiskCacheConfig {
            cache_size: 18,
            max_queued_disk_bytes: 16 * 1024,
            ..Default::default()
        });

        // low = 2, latch at 10
        let blocks: Vec<_> = (0..12).map(|_| pool.allocate("read cache").unwrap()).collect();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        pool.free_many(blocks);
    }

    #[test]
    fn test_num_to_evict() {
        let (pool, _rx) = test_pool(20, 16);
        // low = 4
        let blocks: Vec<_> = (0..10).map(|_| pool.allocate("read cache").unwrap()).collect();

        // over the low watermark by 6
        assert_eq!(pool.num_to_evict(0), 6);
        // needing 14 more: 10 + 14 - 20 = 4 < 6
        assert_eq!(pool.num_to_evict(14), 6);
        // needing 18 more: 10 + 18 - 20 = 8
        assert_eq!(pool.num_to_evict(18), 8);
        pool.free_many(blocks);

        // never more than in_use
        assert_eq!(pool.num_to_evict(1000), 0);
    }

    #[test]
    fn test_rename_moves_category() {
        let (pool, _rx) = test_pool(64, 16);
        let mut block = pool.allocate("receive buffer").unwrap();
        pool.rename(&mut block, "write cache");
        assert_eq!(block.category(), "write cache");
        assert_eq!(pool.stats(), vec![("write cache", 1)]);
        pool.free(block);
    }

    #[test]
    fn test_backing_switch_deferred_until_drained() {
        let (pool, _rx) = test_pool(64, 16);
        assert_eq!(pool.backing_kind(), BackingKind::Heap);

        let block = pool.allocate("read cache").unwrap();
        pool.set_settings(&DiskCacheConfig {
            cache_size: 64,
            max_queued_disk_bytes: 16 * 1024,
            use_disk_cache_pool: true,
            ..Default::default()
        });
        // One block outstanding: still on the old strategy
        assert_eq!(pool.backing_kind(), BackingKind::Heap);

        pool.free(block);
        assert_eq!(pool.backing_kind(), BackingKind::Pool);
    }

    #[cfg(unix)]
    #[test]
    fn test_mmap_backing_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = BufferPool::with_block_size(4096, tx);
        pool.set_settings(&DiskCacheConfig {
            cache_size: 32,
            max_queued_disk_bytes: 16 * 4096,
            mmap_cache: Some(dir.path().join("cache.mmap")),
            ..Default::default()
        });
        assert_eq!(pool.backing_kind(), BackingKind::Mmap);

        let mut block = pool.allocate("write cache").unwrap();
        block[..4].copy_from_slice(b"abcd");
        assert_eq!(&block[..4], b"abcd");
        pool.free(block);

        // Turning the mmap path off reverts to heap once drained
        pool.set_settings(&DiskCacheConfig {
            cache_size: 32,
            max_queued_disk_bytes: 16 * 4096,
            ..Default::default()
        });
        assert_eq!(pool.backing_kind(), BackingKind::Heap);
    }
}
