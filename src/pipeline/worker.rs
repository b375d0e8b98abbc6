use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;

use super::queue::QueueSlot;
use crate::core::{Frame, FrameOutcome};
use crate::video::FrameTransform;

/// Completion message sent from a worker thread to the owning thread.
#[derive(Debug)]
pub struct WorkerDone {
    /// Session the frame was submitted in; older sessions are discarded.
    pub generation: u64,
    pub index: u64,
    pub outcome: FrameOutcome,
}

/// One thread per in-flight frame, bounded by the frame queue.
pub struct WorkerPool {
    transform: Arc<dyn FrameTransform>,
    done_tx: Sender<WorkerDone>,
    handles: Vec<JoinHandle<()>>,
    running: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(transform: Arc<dyn FrameTransform>, done_tx: Sender<WorkerDone>) -> Self {
        Self {
            transform,
            done_tx,
            handles: Vec::new(),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Transform `frame` on a new worker thread. The slot is released when the
    /// worker exits, and a `WorkerDone` is always sent unless the owner is gone.
    pub fn submit_async(&mut self, generation: u64, frame: Frame, slot: QueueSlot) -> std::io::Result<()> {
        self.reap_finished();

        let transform = Arc::clone(&self.transform);
        let done_tx = self.done_tx.clone();
        let running = Arc::clone(&self.running);
        let index = frame.index;

        running.fetch_add(1, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(format!("frame-worker-{}", index))
            .spawn(move || {
                let _slot = slot;
                let _running = RunningGuard(running);
                let outcome = apply_transform(transform.as_ref(), frame);
                if done_tx
                    .send(WorkerDone {
                        generation,
                        index,
                        outcome,
                    })
                    .is_err()
                {
                    log::debug!("Owner gone, dropping result for frame {}", index);
                }
            });

        match spawned {
            Ok(handle) => {
                self.handles.push(handle);
                Ok(())
            }
            Err(e) => {
                // The closure (and the slot it owns) was dropped by the failed spawn
                self.running.fetch_sub(1, Ordering::SeqCst);
                log::error!("Failed to spawn worker for frame {}: {}", index, e);
                Err(e)
            }
        }
    }

    /// Transform `frame` on the calling thread.
    pub fn run_sync(&self, frame: Frame) -> FrameOutcome {
        apply_transform(self.transform.as_ref(), frame)
    }

    /// Wait for every worker spawned so far.
    pub fn join_all(&mut self) {
        let count = self.handles.len();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::warn!("Frame worker exited with a panic");
            }
        }
        if count > 0 {
            log::debug!("Joined {} frame workers", count);
        }
    }

    /// Worker handles not yet joined.
    pub fn live_workers(&self) -> usize {
        self.handles.len()
    }

    /// Worker threads currently executing.
    pub fn running_workers(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    fn reap_finished(&mut self) {
        let (finished, live): (Vec<_>, Vec<_>) = self.handles.drain(..).partition(|h| h.is_finished());
        self.handles = live;
        for handle in finished {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join_all();
    }
}

struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Run the transform, turning errors and panics into `FrameOutcome::Failed`.
pub fn apply_transform(transform: &dyn FrameTransform, frame: Frame) -> FrameOutcome {
    let index = frame.index;
    let result = panic::catch_unwind(AssertUnwindSafe(|| transform.apply(&frame)));
    match result {
        Ok(Ok(image)) => FrameOutcome::Ready(frame.with_image(image)),
        Ok(Err(e)) => {
            log::warn!("Transform failed for frame {}: {}", index, e.reason);
            FrameOutcome::Failed {
                index,
                reason: e.reason,
            }
        }
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            log::error!("Transform panicked on frame {}: {}", index, reason);
            FrameOutcome::Failed { index, reason }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "transform panicked".to_string()
    }
}
