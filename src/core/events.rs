use std::path::PathBuf;
use tokio::sync::broadcast;

/// Notifications published to the UI / job orchestration layer.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    PlaybackStarted,
    SegmentStarted(usize),
    SegmentEnded(usize),
    /// Multi-segment job finished; `output` is `None` when nothing was produced.
    AllSegmentsDone { output: Option<PathBuf> },
    /// Single recording finished; `output` is `None` when nothing was produced.
    RecordingFinished { output: Option<PathBuf> },
    FrameReadError(u64),
    FrameTransformFailed(u64),
    EncoderError(String),
    RecordingSummary {
        frames: u64,
        elapsed_secs: f64,
        average_fps: f64,
    },
    Stopped,
}

const EVENT_CAPACITY: usize = 256;

/// Broadcast sender shared by the engine and its subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: PipelineEvent) {
        log::debug!("Pipeline event: {:?}", event);
        // No subscribers is fine; the pipeline must not depend on a listener
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
