use parking_lot::Mutex;
use std::sync::Arc;

struct QueueState {
    capacity: usize,
    in_flight: Vec<u64>,
    peak: usize,
}

/// Admission control for frames handed to workers.
///
/// Holds indices only; the frame data travels with the worker. A slot is
/// released when its `QueueSlot` drops, which also covers a panicking worker.
#[derive(Clone)]
pub struct BoundedFrameQueue {
    state: Arc<Mutex<QueueState>>,
}

impl BoundedFrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                capacity: capacity.max(1),
                in_flight: Vec::with_capacity(capacity.max(1)),
                peak: 0,
            })),
        }
    }

    /// Reserve a slot for `index`, or `None` when the queue is full. Never blocks.
    pub fn try_enqueue(&self, index: u64) -> Option<QueueSlot> {
        let mut state = self.state.lock();
        if state.in_flight.len() >= state.capacity {
            return None;
        }
        state.in_flight.push(index);
        state.peak = state.peak.max(state.in_flight.len());
        Some(QueueSlot {
            state: Arc::clone(&self.state),
            index,
        })
    }

    pub fn len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().in_flight.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Highest number of simultaneously admitted indices since creation.
    pub fn peak(&self) -> usize {
        self.state.lock().peak
    }

    /// Change the capacity. Refused while any slot is still held.
    pub fn set_capacity(&self, capacity: usize) -> bool {
        let mut state = self.state.lock();
        if !state.in_flight.is_empty() {
            log::warn!(
                "Cannot resize frame queue with {} frames in flight",
                state.in_flight.len()
            );
            return false;
        }
        state.capacity = capacity.max(1);
        log::debug!("Frame queue capacity set to {}", state.capacity);
        true
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        if !state.in_flight.is_empty() {
            log::debug!("Clearing {} in-flight frame indices", state.in_flight.len());
        }
        state.in_flight.clear();
    }
}

/// A held queue position. Dropping it dequeues the index.
pub struct QueueSlot {
    state: Arc<Mutex<QueueState>>,
    index: u64,
}

impl QueueSlot {
    pub fn index(&self) -> u64 {
        self.index
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Some(pos) = state.in_flight.iter().position(|&i| i == self.index) {
            state.in_flight.swap_remove(pos);
        }
    }
}

impl std::fmt::Debug for QueueSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueSlot").field("index", &self.index).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_when_full() {
        let queue = BoundedFrameQueue::new(2);
        let a = queue.try_enqueue(0).unwrap();
        let _b = queue.try_enqueue(1).unwrap();
        assert!(queue.try_enqueue(2).is_none());
        assert_eq!(queue.len(), 2);

        drop(a);
        assert_eq!(queue.len(), 1);
        assert!(queue.try_enqueue(2).is_some());
        assert_eq!(queue.peak(), 2);
    }

    #[test]
    fn test_slot_released_when_thread_panics() {
        let queue = BoundedFrameQueue::new(1);
        let slot = queue.try_enqueue(7).unwrap();
        let handle = std::thread::spawn(move || {
            let _slot = slot;
            panic!("worker failed");
        });
        assert!(handle.join().is_err());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_capacity_only_changes_when_empty() {
        let queue = BoundedFrameQueue::new(1);
        let slot = queue.try_enqueue(0).unwrap();
        assert!(!queue.set_capacity(4));
        assert_eq!(queue.capacity(), 1);

        drop(slot);
        assert!(queue.set_capacity(4));
        assert_eq!(queue.capacity(), 4);
        assert!(queue.set_capacity(0));
        assert_eq!(queue.capacity(), 1);
    }

    #[test]
    fn test_clear_then_late_release() {
        let queue = BoundedFrameQueue::new(2);
        let slot = queue.try_enqueue(3).unwrap();
        queue.clear();
        assert!(queue.is_empty());
        drop(slot);
        assert!(queue.is_empty());
    }
}
