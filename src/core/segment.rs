use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SegmentError {
    #[error("segment start {start} is after end {end}")]
    InvalidRange { start: u64, end: u64 },
}

/// Inclusive frame range recorded as one encoded unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Segment {
    pub start_frame: u64,
    pub end_frame: u64,
}

impl Segment {
    pub fn new(start_frame: u64, end_frame: u64) -> Result<Self, SegmentError> {
        if start_frame > end_frame {
            return Err(SegmentError::InvalidRange {
                start: start_frame,
                end: end_frame,
            });
        }
        Ok(Self {
            start_frame,
            end_frame,
        })
    }

    pub fn frame_count(&self) -> u64 {
        (self.end_frame - self.start_frame).saturating_add(1)
    }

    pub fn contains(&self, index: u64) -> bool {
        index >= self.start_frame && index <= self.end_frame
    }

    /// Audio time range in seconds covering every frame of the segment.
    /// The end is exclusive: frame `end_frame` lasts until `(end_frame + 1) / fps`.
    pub fn audio_range(&self, fps: f64) -> (f64, f64) {
        if fps <= 0.0 {
            return (0.0, 0.0);
        }
        (
            self.start_frame as f64 / fps,
            self.end_frame.saturating_add(1) as f64 / fps,
        )
    }

    /// Limit the end to the last frame before `frame_end` (exclusive).
    /// A segment starting past the media keeps its start and becomes one frame long.
    pub fn clamp_to(&self, frame_end: u64) -> Segment {
        let last = frame_end.saturating_sub(1).max(self.start_frame);
        Segment {
            start_frame: self.start_frame,
            end_frame: self.end_frame.min(last),
        }
    }
}

/// Ordered list of segments plus the cursor of the one being recorded.
#[derive(Debug, Clone, Default)]
pub struct SegmentJob {
    segments: Vec<Segment>,
    current: Option<usize>,
}

impl SegmentJob {
    pub fn new(mut segments: Vec<Segment>) -> Self {
        segments.sort();
        Self {
            segments,
            current: None,
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current(&self) -> Option<&Segment> {
        self.current.and_then(|i| self.segments.get(i))
    }

    /// Move to the next segment; returns `None` once every segment was visited.
    pub fn advance(&mut self) -> Option<(usize, Segment)> {
        let next = self.current.map_or(0, |i| i + 1);
        self.current = Some(next);
        self.segments.get(next).map(|segment| (next, *segment))
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.current = None;
    }
}
