//! Ordered merge queue
//!
//! A bounded priority queue across N producers. Each producer may have at
//! most one item in flight: `push` parks until the consumer has popped the
//! previous item *and* acknowledged it with [`MergeQueue::flush`]. `pop`
//! parks until every producer has either an item queued or has declared
//! itself done, then hands out the smallest item under the composite
//! comparator.
//!
//! Sentinel items sort strictly ahead of data rows, in the fixed precedence
//! of [`QueueItem::sort_class`], so revision drift and per-index failures
//! surface before any row queued alongside them. Data rows compare with the
//! caller's comparator; when none is supplied the index type defines no
//! order (bounding-box style queries) and the queue only promises
//! per-producer FIFO, with cross-producer interleaving unspecified.
//!
//! Locks are never held across an await: state lives in a `std` mutex and
//! parking uses `tokio::sync::Notify`, so `done`, `flush`, and `shutdown`
//! stay synchronous and remain callable from drop guards.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use setview_core::{Error, QueueItem, Result, ViewRow};

/// Row ordering supplied by the index module.
pub type RowComparator = Arc<dyn Fn(&ViewRow, &ViewRow) -> Ordering + Send + Sync>;

/// Result of [`MergeQueue::pop`].
#[derive(Debug)]
pub enum Popped {
    /// The smallest item currently available, and who produced it
    Item { producer: usize, item: QueueItem },
    /// Every producer is done and nothing is left
    Closed,
}

#[derive(Default)]
struct Slot {
    item: Option<QueueItem>,
    /// Popped but not yet flushed; the producer's window stays occupied
    held: bool,
    done: bool,
}

struct QueueState {
    slots: Vec<Slot>,
    /// Producers whose popped items await a flush
    unacked: Vec<usize>,
    shutdown: bool,
}

pub struct MergeQueue {
    state: Mutex<QueueState>,
    consumer: Notify,
    /// One wakeup channel per producer window
    free: Vec<Notify>,
    less: Option<RowComparator>,
}

impl MergeQueue {
    /// Queue for `producers` workers merging under `less`.
    pub fn new(producers: usize, less: Option<RowComparator>) -> Self {
        MergeQueue {
            state: Mutex::new(QueueState {
                slots: (0..producers).map(|_| Slot::default()).collect(),
                unacked: Vec::new(),
                shutdown: false,
            }),
            consumer: Notify::new(),
            free: (0..producers).map(|_| Notify::new()).collect(),
            less,
        }
    }

    /// Handle for one producer. Hand out exactly one per producer index;
    /// dropping it signals `done`.
    pub fn producer(self: &Arc<Self>, id: usize) -> Producer {
        Producer {
            queue: Arc::clone(self),
            id,
        }
    }

    /// Publish an item, parking while the producer's window is occupied.
    pub async fn push(&self, producer: usize, item: QueueItem) -> Result<()> {
        let mut item = Some(item);
        loop {
            let notified = {
                let mut st = self.state.lock().unwrap();
                if st.shutdown {
                    return Err(Error::QueueShutdown);
                }
                let slot = &mut st.slots[producer];
                debug_assert!(!slot.done, "push after done");
                if slot.item.is_none() && !slot.held {
                    slot.item = item.take();
                    self.consumer.notify_one();
                    return Ok(());
                }
                self.free[producer].notified()
            };
            notified.await;
        }
    }

    /// Take the smallest available item once every producer is ready.
    ///
    /// After [`MergeQueue::shutdown`], remaining items drain without the
    /// all-ready barrier and then `Closed` is reported.
    pub async fn pop(&self) -> Popped {
        loop {
            let notified = {
                let mut st = self.state.lock().unwrap();
                if st.shutdown {
                    return match self.take_any(&mut st) {
                        Some(popped) => popped,
                        None => Popped::Closed,
                    };
                }
                let ready = st.slots.iter().all(|s| s.done || s.item.is_some());
                if ready {
                    match self.smallest(&st) {
                        Some(idx) => {
                            let item = st.slots[idx].item.take().unwrap();
                            st.slots[idx].held = true;
                            st.unacked.push(idx);
                            return Popped::Item {
                                producer: idx,
                                item,
                            };
                        }
                        None => return Popped::Closed,
                    }
                }
                self.consumer.notified()
            };
            notified.await;
        }
    }

    /// Acknowledge popped items, reopening their producers' windows.
    pub fn flush(&self) {
        let mut st = self.state.lock().unwrap();
        let unacked = std::mem::take(&mut st.unacked);
        for idx in unacked {
            st.slots[idx].held = false;
            self.free[idx].notify_one();
        }
    }

    /// Declare that `producer` will push nothing further. Idempotent.
    pub fn done(&self, producer: usize) {
        let mut st = self.state.lock().unwrap();
        if !st.slots[producer].done {
            st.slots[producer].done = true;
            self.consumer.notify_one();
        }
    }

    /// Wake every parked producer with `queue_shutdown` and let the
    /// consumer drain whatever is still queued.
    pub fn shutdown(&self) {
        let mut st = self.state.lock().unwrap();
        if st.shutdown {
            return;
        }
        st.shutdown = true;
        for free in &self.free {
            free.notify_one();
        }
        self.consumer.notify_one();
    }

    /// Index of the smallest queued item, or `None` when nothing is queued.
    fn smallest(&self, st: &QueueState) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, slot) in st.slots.iter().enumerate() {
            let Some(item) = &slot.item else { continue };
            best = match best {
                None => Some(i),
                Some(j) => {
                    let current = st.slots[j].item.as_ref().unwrap();
                    if self.item_cmp(item, current) == Ordering::Less {
                        Some(i)
                    } else {
                        Some(j)
                    }
                }
            };
        }
        best
    }

    fn take_any(&self, st: &mut QueueState) -> Option<Popped> {
        let idx = self.smallest(st)?;
        let item = st.slots[idx].item.take().unwrap();
        Some(Popped::Item {
            producer: idx,
            item,
        })
    }

    fn item_cmp(&self, a: &QueueItem, b: &QueueItem) -> Ordering {
        let by_class = a.sort_class().cmp(&b.sort_class());
        if by_class != Ordering::Equal {
            return by_class;
        }
        match (a, b) {
            (QueueItem::Row(ra), QueueItem::Row(rb)) => match &self.less {
                Some(less) => less(ra, rb),
                // Unordered index types: every candidate row counts as
                // smaller, leaving cross-producer order unspecified while
                // the one-item window keeps each producer FIFO.
                None => Ordering::Less,
            },
            _ => Ordering::Equal,
        }
    }
}

/// One producer's handle on the queue. Dropping it signals `done`, so a
/// worker that unwinds can never wedge the consumer barrier.
pub struct Producer {
    queue: Arc<MergeQueue>,
    id: usize,
}

impl Producer {
    pub fn id(&self) -> usize {
        self.id
    }

    pub async fn push(&self, item: QueueItem) -> Result<()> {
        self.queue.push(self.id, item).await
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.queue.done(self.id);
    }
}
