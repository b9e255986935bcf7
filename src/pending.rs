//! Contexts waiting for dispatch
//!
//! Producers post a [`Job`] per context that gained work; the dispatcher is the
//! only consumer and drains whole lists at once, so the lists need no locks.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::context::DrawContext;
use crate::object::ContextId;

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

/// Multi-producer, single-consumer list.
///
/// Pushes are a CAS on the head (Treiber stack). The consumer swaps the whole
/// chain out and reverses it, so items come back oldest first. There is no
/// single-item pop, which keeps the list free of ABA hazards.
pub struct MpscList<T> {
    head: AtomicPtr<Node<T>>,
    _marker: PhantomData<Box<Node<T>>>,
}

impl<T> MpscList<T> {
    /// Create an empty list
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Append an item; safe from any thread
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: node is not yet shared
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Detach every queued item, oldest first
    pub fn take_all(&self) -> Vec<T> {
        let mut cur = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        let mut out = Vec::new();
        while !cur.is_null() {
            // SAFETY: the swap gave us sole ownership of the chain
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next;
            out.push(node.value);
        }
        out.reverse();
        out
    }
}

impl<T> Default for MpscList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for MpscList<T> {
    fn drop(&mut self) {
        drop(self.take_all());
    }
}

// SAFETY: nodes are only reachable through the atomic head and are handed
// over whole; T crosses threads by value.
unsafe impl<T: Send> Send for MpscList<T> {}
unsafe impl<T: Send> Sync for MpscList<T> {}

/// A context waiting for service
#[derive(Debug, Clone)]
pub struct Job {
    context: Arc<DrawContext>,
}

impl Job {
    pub(crate) fn new(context: Arc<DrawContext>) -> Self {
        Self { context }
    }

    /// Context to service
    pub fn context(&self) -> &Arc<DrawContext> {
        &self.context
    }

    /// Context id
    pub fn context_id(&self) -> ContextId {
        self.context.id()
    }
}

struct Bucket {
    new: MpscList<Job>,
    requeue: MpscList<Job>,
}

/// Which list a job goes on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Queue {
    /// Freshly posted work
    New,
    /// Work that must retry before new jobs
    Requeue,
}

/// Per-priority lists of jobs awaiting dispatch
pub struct PendingTable {
    buckets: Vec<Bucket>,
    posted: AtomicUsize,
}

impl PendingTable {
    /// Table with `num_priorities` buckets
    pub fn new(num_priorities: usize) -> Self {
        Self {
            buckets: (0..num_priorities.max(1))
                .map(|_| Bucket {
                    new: MpscList::new(),
                    requeue: MpscList::new(),
                })
                .collect(),
            posted: AtomicUsize::new(0),
        }
    }

    /// Number of priority buckets
    pub fn num_priorities(&self) -> usize {
        self.buckets.len()
    }

    /// Queue `context` for service; detached contexts are skipped.
    ///
    /// Returns whether a job was posted.
    pub(crate) fn post(&self, context: &Arc<DrawContext>, queue: Queue) -> bool {
        if context.is_detached() {
            return false;
        }
        let bucket = &self.buckets[context.priority().min(self.buckets.len() - 1)];
        let job = Job::new(Arc::clone(context));
        match queue {
            Queue::New => bucket.new.push(job),
            Queue::Requeue => bucket.requeue.push(job),
        }
        self.posted.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Drain one bucket: requeued jobs first, then new ones, oldest first
    pub(crate) fn take_bucket(&self, priority: usize) -> Vec<Job> {
        let bucket = &self.buckets[priority];
        let mut jobs = bucket.requeue.take_all();
        jobs.extend(bucket.new.take_all());
        jobs
    }

    /// Whether every bucket is empty
    pub fn is_empty(&self) -> bool {
        self.buckets
            .iter()
            .all(|b| b.new.is_empty() && b.requeue.is_empty())
    }

    /// Jobs posted since creation
    pub fn posted(&self) -> usize {
        self.posted.load(Ordering::Relaxed)
    }

    /// Drop every queued job
    pub(crate) fn clear(&self) {
        for priority in 0..self.buckets.len() {
            drop(self.take_bucket(priority));
        }
    }
}

impl std::fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTable")
            .field("buckets", &self.buckets.len())
            .field("posted", &self.posted())
            .finish()
    }
}
