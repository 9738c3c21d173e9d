//! FIFO of per-frame metadata matching queued input to device output.
//!
//! The device returns output in submission order, so the oldest entry
//! belongs to the next output buffer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crossbeam::utils::CachePadded;

use crate::codec::Rotation;

/// Recorded when a frame is submitted, consumed when its output arrives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameMetadata {
    /// `None` only for the underflow fallback
    pub submitted_at: Option<Instant>,
    pub rotation: Rotation,
}

impl FrameMetadata {
    pub fn new(rotation: Rotation) -> Self {
        Self {
            submitted_at: Some(Instant::now()),
            rotation,
        }
    }

    /// Milliseconds since submission, saturating at `u32::MAX`
    pub fn decode_time_ms(&self) -> Option<u32> {
        self.submitted_at
            .map(|at| u32::try_from(at.elapsed().as_millis()).unwrap_or(u32::MAX))
    }
}

/// Unbounded thread-safe metadata queue
#[derive(Default)]
pub struct CorrelationQueue {
    entries: Mutex<VecDeque<FrameMetadata>>,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    pushed: AtomicUsize,
    popped: AtomicUsize,
    underflows: AtomicUsize,
    rolled_back: AtomicUsize,
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelationStats {
    pub pushed: usize,
    pub popped: usize,
    pub underflows: usize,
    pub rolled_back: usize,
}

impl CorrelationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, metadata: FrameMetadata) {
        self.entries().push_back(metadata);
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Oldest entry, if any
    pub fn pop(&self) -> Option<FrameMetadata> {
        let metadata = self.entries().pop_front();
        match metadata {
            Some(_) => self.stats.popped.fetch_add(1, Ordering::Relaxed),
            None => self.stats.underflows.fetch_add(1, Ordering::Relaxed),
        };
        metadata
    }

    /// Undo the most recent push after a failed submission
    pub fn pop_back(&self) -> Option<FrameMetadata> {
        let metadata = self.entries().pop_back();
        if metadata.is_some() {
            self.stats.rolled_back.fetch_add(1, Ordering::Relaxed);
        }
        metadata
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn stats(&self) -> CorrelationStats {
        CorrelationStats {
            pushed: self.stats.pushed.load(Ordering::Relaxed),
            popped: self.stats.popped.load(Ordering::Relaxed),
            underflows: self.stats.underflows.load(Ordering::Relaxed),
            rolled_back: self.stats.rolled_back.load(Ordering::Relaxed),
        }
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<FrameMetadata>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
