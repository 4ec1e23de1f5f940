//! Timestamp-ordered presentation queue with bounded capacity

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;

use crate::capture::Bitmap;

/// A decoded frame waiting for its presentation time.
#[derive(Debug)]
pub struct QueuedFrame {
    pub timestamp: f64,
    pub bitmap: Bitmap,
}

/// Counters shared with whoever wants to watch the queue from another thread.
#[derive(Debug, Default)]
pub struct FrameCounters {
    pub inserted: AtomicUsize,
    pub presented: AtomicUsize,
    pub evicted: AtomicUsize,
    pub flushed: AtomicUsize,
    /// Frames from before a flush, released on arrival.
    pub stale: AtomicUsize,
    pub depth: AtomicUsize,
}

/// Bounded queue of frames, ordered by non-decreasing timestamp.
///
/// Inserting into a full queue evicts and releases the oldest frame first.
pub struct PresentationQueue {
    frames: VecDeque<QueuedFrame>,
    capacity: usize,

    /// Statistics
    counters: Arc<CachePadded<FrameCounters>>,
}

impl PresentationQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            counters: Arc::new(CachePadded::new(FrameCounters::default())),
        }
    }

    /// Insert a frame at its sorted position.
    ///
    /// Returns the timestamp of the evicted frame, if capacity forced one out.
    pub fn insert(&mut self, frame: QueuedFrame) -> Option<f64> {
        let evicted = if self.frames.len() >= self.capacity {
            self.frames.pop_front().map(|old| {
                let ts = old.timestamp;
                old.bitmap.close();
                self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                ts
            })
        } else {
            None
        };

        // Equal timestamps keep arrival order.
        let at = self
            .frames
            .partition_point(|queued| queued.timestamp <= frame.timestamp);
        self.frames.insert(at, frame);

        self.counters.inserted.fetch_add(1, Ordering::Relaxed);
        self.publish_depth();
        evicted
    }

    /// Remove the head if its timestamp is strictly before `deadline`.
    ///
    /// A head exactly at `deadline` stays queued, so a frame at
    /// `clock + margin` waits for the next tick.
    pub fn pop_due(&mut self, deadline: f64) -> Option<QueuedFrame> {
        if self.frames.front()?.timestamp >= deadline {
            return None;
        }
        let frame = self.frames.pop_front();
        self.counters.presented.fetch_add(1, Ordering::Relaxed);
        self.publish_depth();
        frame
    }

    /// Release every buffered bitmap. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.frames.len();
        for frame in self.frames.drain(..) {
            frame.bitmap.close();
        }
        self.counters.flushed.fetch_add(dropped, Ordering::Relaxed);
        self.publish_depth();
        dropped
    }

    pub fn head_timestamp(&self) -> Option<f64> {
        self.frames.front().map(|f| f.timestamp)
    }

    pub fn newest_timestamp(&self) -> Option<f64> {
        self.frames.back().map(|f| f.timestamp)
    }

    pub fn timestamps(&self) -> Vec<f64> {
        self.frames.iter().map(|f| f.timestamp).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots before insertion starts evicting.
    pub fn room(&self) -> usize {
        self.capacity - self.frames.len()
    }

    pub fn counters(&self) -> Arc<CachePadded<FrameCounters>> {
        self.counters.clone()
    }

    fn publish_depth(&self) {
        self.counters
            .depth
            .store(self.frames.len(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ts: f64, released: &Arc<AtomicUsize>) -> QueuedFrame {
        let released = released.clone();
        QueuedFrame {
            timestamp: ts,
            bitmap: Bitmap::solid(1, 1, [0; 4]).with_release_hook(move || {
                released.fetch_add(1, Ordering::SeqCst);
            }),
        }
    }

    #[test]
    fn full_queue_evicts_oldest() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut queue = PresentationQueue::new(3);
        for ts in [0.0, 1.0, 2.0] {
            assert_eq!(queue.insert(frame(ts, &released)), None);
        }
        assert_eq!(queue.insert(frame(3.0, &released)), Some(0.0));

        assert_eq!(queue.timestamps(), vec![1.0, 2.0, 3.0]);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(queue.counters().evicted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn length_never_exceeds_capacity() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut queue = PresentationQueue::new(4);
        for i in 0..50 {
            queue.insert(frame(i as f64 * 0.1, &released));
            assert!(queue.len() <= 4);
        }
        assert_eq!(released.load(Ordering::SeqCst), 46);
    }

    #[test]
    fn out_of_order_frames_are_sorted() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut queue = PresentationQueue::new(8);
        for ts in [1.0, 3.0, 2.0, 0.5, 3.0] {
            queue.insert(frame(ts, &released));
        }
        assert_eq!(queue.timestamps(), vec![0.5, 1.0, 2.0, 3.0, 3.0]);
    }

    #[test]
    fn pop_due_respects_deadline() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut queue = PresentationQueue::new(8);
        for ts in [2.0, 2.4, 2.6] {
            queue.insert(frame(ts, &released));
        }

        let mut due = Vec::new();
        while let Some(f) = queue.pop_due(2.5 + 0.1) {
            due.push(f.timestamp);
        }
        assert_eq!(due, vec![2.0, 2.4]);
        assert_eq!(queue.timestamps(), vec![2.6]);
        assert_eq!(queue.counters().presented.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn head_at_deadline_is_not_due() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut queue = PresentationQueue::new(2);
        queue.insert(frame(1.0, &released));
        assert!(queue.pop_due(1.0).is_none());
        assert!(queue.pop_due(1.0 + f64::EPSILON).is_some());
    }

    #[test]
    fn clear_releases_everything() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut queue = PresentationQueue::new(8);
        for ts in [0.0, 1.0, 2.0] {
            queue.insert(frame(ts, &released));
        }
        assert_eq!(queue.clear(), 3);
        assert!(queue.is_empty());
        assert_eq!(released.load(Ordering::SeqCst), 3);
        assert_eq!(queue.counters().depth.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn drop_releases_remaining() {
        let released = Arc::new(AtomicUsize::new(0));
        {
            let mut queue = PresentationQueue::new(2);
            queue.insert(frame(0.0, &released));
            queue.insert(frame(1.0, &released));
        }
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }
}
