use std::collections::BTreeMap;

use crate::core::FrameOutcome;

/// Releases completed frames strictly in index order.
///
/// A missing index blocks release until it arrives. Failed outcomes still
/// occupy their index so a dropped frame never stalls the display.
#[derive(Debug, Default)]
pub struct DisplayReorderBuffer {
    pending: BTreeMap<u64, FrameOutcome>,
    next: u64,
}

impl DisplayReorderBuffer {
    pub fn new(start: u64) -> Self {
        Self {
            pending: BTreeMap::new(),
            next: start,
        }
    }

    /// Store a completed outcome. Returns `false` for indices already passed.
    pub fn insert(&mut self, outcome: FrameOutcome) -> bool {
        let index = outcome.index();
        if index < self.next {
            log::debug!("Ignoring stale frame {} (next to display: {})", index, self.next);
            return false;
        }
        self.pending.insert(index, outcome);
        true
    }

    pub fn drain_next(&mut self) -> Option<FrameOutcome> {
        let outcome = self.pending.remove(&self.next)?;
        self.next += 1;
        Some(outcome)
    }

    pub fn next_index(&self) -> u64 {
        self.next
    }

    /// Drop everything and continue from `position`.
    pub fn reset(&mut self, position: u64) {
        self.pending.clear();
        self.next = position;
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
