//! Integration tests for the disk buffer pool's watermark protocol:
//! pressure latching, FIFO handler queues, mid-drain slicing and
//! observer notification ordering.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, UnboundedReceiver};

use gosh_core::disk::{Block, BufferPool, DiskObserver, WakeBatch};

const BLOCK: usize = 1024;

fn pool_with_watermarks(max_use: usize, low: usize) -> (BufferPool, UnboundedReceiver<WakeBatch>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pool = BufferPool::with_block_size(BLOCK, tx);
    pool.set_watermarks(max_use, low);
    (pool, rx)
}

/// Dispatch everything queued for the executor, returning how many
/// batches there were
fn drain(rx: &mut UnboundedReceiver<WakeBatch>) -> usize {
    let mut batches = 0;
    while let Ok(batch) = rx.try_recv() {
        batch.dispatch();
        batches += 1;
    }
    batches
}

struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl DiskObserver for Recorder {
    fn on_disk(&self) {
        self.events.lock().unwrap().push("observer".to_string());
    }
}

#[test]
fn async_allocate_queues_until_low_watermark() {
    let (pool, mut rx) = pool_with_watermarks(4, 2);

    let mut blocks: Vec<Block> = (0..4)
        .map(|_| pool.allocate("read cache").expect("within capacity"))
        .collect();
    assert_eq!(pool.in_use(), 4);
    assert!(pool.is_exceeded());

    // A fifth request must queue, not allocate
    let delivered = Arc::new(AtomicUsize::new(0));
    let flag = delivered.clone();
    let immediate = pool.async_allocate(
        "read cache",
        Box::new(move |block| {
            assert_eq!(block.len(), BLOCK);
            flag.fetch_add(1, Ordering::SeqCst);
        }),
    );
    assert!(immediate.is_none());

    // One free is not enough: occupancy is still above the low mark
    pool.free(blocks.pop().unwrap());
    assert_eq!(drain(&mut rx), 0);
    assert_eq!(delivered.load(Ordering::SeqCst), 0);

    // The second free reaches the low watermark and wakes the handler
    pool.free(blocks.pop().unwrap());
    assert_eq!(drain(&mut rx), 1);
    assert_eq!(delivered.load(Ordering::SeqCst), 1);

    // The handler's block counts as in use again
    assert_eq!(pool.in_use(), 3);

    pool.free_many(blocks);
}

#[test]
fn drain_slices_queue_when_pressure_returns() {
    let (pool, mut rx) = pool_with_watermarks(4, 0);

    let blocks: Vec<Block> = (0..4)
        .map(|_| pool.allocate("write cache").expect("within capacity"))
        .collect();
    assert!(pool.is_exceeded());

    let served = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second", "third"] {
        let log = served.clone();
        let none = pool.async_allocate(
            "write cache",
            Box::new(move |block| {
                log.lock().unwrap().push(name);
                drop(block); // leaked on purpose: not returned to the pool
            }),
        );
        assert!(none.is_none());
    }

    // Every block comes back at once. The drain hands blocks to the
    // first two handlers; their allocations re-enter pressure, so the
    // third stays queued and the served prefix posts as one batch.
    pool.free_many(blocks);
    assert_eq!(drain(&mut rx), 1);
    assert_eq!(*served.lock().unwrap(), vec!["first", "second"]);
    assert_eq!(pool.in_use(), 2);
    assert!(pool.is_exceeded());
}

#[test]
fn handlers_fire_exactly_once_across_multiple_wakes() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let pool = Arc::new(BufferPool::with_block_size(BLOCK, tx));
    pool.set_watermarks(4, 0);

    let blocks: Vec<Block> = (0..4).map(|_| pool.allocate("read cache").unwrap()).collect();

    // Handlers return their block immediately, so each wake frees
    // capacity for the next
    let fired = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let counter = fired.clone();
        let pool_for_handler = pool.clone();
        let none = pool.async_allocate(
            "read cache",
            Box::new(move |block| {
                counter.fetch_add(1, Ordering::SeqCst);
                pool_for_handler.free(block);
            }),
        );
        assert!(none.is_none());
    }

    // The first drain serves two handlers (slicing re-latches); their
    // frees trigger the follow-up wake that serves the third
    pool.free_many(blocks);
    drain(&mut rx);

    assert_eq!(fired.load(Ordering::SeqCst), 3);
    assert_eq!(pool.in_use(), 0);
    assert!(!pool.is_exceeded());
}

#[test]
fn observers_notified_after_handlers() {
    let (pool, mut rx) = pool_with_watermarks(4, 2);
    let events = Arc::new(Mutex::new(Vec::new()));

    let mut blocks: Vec<Block> = (0..4).map(|_| pool.allocate("read cache").unwrap()).collect();
    assert!(pool.is_exceeded());

    // Under pressure: no block, observer registered
    let observer = Arc::new(Recorder {
        events: events.clone(),
    });
    let (block, exceeded) = pool.allocate_or_observe("read cache", observer);
    assert!(block.is_none());
    assert!(exceeded);

    let log = events.clone();
    pool.async_allocate(
        "read cache",
        Box::new(move |_block| {
            log.lock().unwrap().push("handler".to_string());
        }),
    );

    // Drop to the low watermark: the handler is served, but its
    // allocation re-latches pressure, so the observer waits
    pool.free(blocks.pop().unwrap());
    pool.free(blocks.pop().unwrap());
    drain(&mut rx);
    assert_eq!(*events.lock().unwrap(), vec!["handler"]);

    // Another free clears pressure for good and releases the observer
    pool.free(blocks.pop().unwrap());
    drain(&mut rx);
    assert_eq!(*events.lock().unwrap(), vec!["handler", "observer"]);

    pool.free_many(blocks);
}

#[test]
fn in_use_matches_allocs_minus_frees() {
    let (pool, mut rx) = pool_with_watermarks(64, 32);

    let mut outstanding = Vec::new();
    let mut allocs = 0usize;
    let mut frees = 0usize;

    for round in 0..10 {
        for _ in 0..(round % 5) + 1 {
            if let Some(block) = pool.allocate("read cache") {
                outstanding.push(block);
                allocs += 1;
            }
        }
        if round % 2 == 0 {
            if let Some(block) = outstanding.pop() {
                pool.free(block);
                frees += 1;
            }
        }
    }

    assert_eq!(pool.in_use(), allocs - frees);
    pool.free_many(outstanding);
    assert_eq!(pool.in_use(), 0);
    drain(&mut rx);
}

#[tokio::test]
async fn wake_dispatcher_runs_handlers_on_the_executor() {
    let (tx, rx) = mpsc::unbounded_channel();
    let pool = Arc::new(BufferPool::with_block_size(BLOCK, tx));
    pool.set_watermarks(2, 0);
    let dispatcher = gosh_core::spawn_wake_dispatcher(rx);

    let a = pool.allocate("read cache").unwrap();
    let b = pool.allocate("read cache").unwrap();

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    assert!(pool
        .async_allocate(
            "read cache",
            Box::new(move |block| {
                let _ = done_tx.send(block.len());
            }),
        )
        .is_none());

    pool.free_many(vec![a, b]);

    let len = tokio::time::timeout(std::time::Duration::from_secs(2), done_rx)
        .await
        .expect("handler never ran")
        .unwrap();
    assert_eq!(len, BLOCK);
    dispatcher.abort();
}
