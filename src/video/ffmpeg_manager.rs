use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use anyhow::Result;

/// Tracks ffmpeg processes: caps concurrent one-shot invocations (concat,
/// audio merge) and counts long-running encoder processes still alive.
#[derive(Clone)]
pub struct FFmpegManager {
    active_count: Arc<AtomicUsize>,
    live_encoders: Arc<AtomicUsize>,
}

impl FFmpegManager {
    const MAX_PROCESSES: usize = 4;

    pub fn new() -> Self {
        Self {
            active_count: Arc::new(AtomicUsize::new(0)),
            live_encoders: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Execute an FFmpeg command to completion, returning an error if we're at the limit
    pub fn execute_ffmpeg(&self, mut command: Command) -> Result<Output> {
        let current_count = self.active_count.load(Ordering::SeqCst);

        if current_count >= Self::MAX_PROCESSES {
            return Err(anyhow::anyhow!(
                "Cannot execute FFmpeg: {} processes already running (max: {})",
                current_count,
                Self::MAX_PROCESSES
            ));
        }

        self.active_count.fetch_add(1, Ordering::SeqCst);

        log::debug!("Executing FFmpeg process, active count: {}",
            self.active_count.load(Ordering::SeqCst));

        let result = command.stdin(Stdio::null()).output();

        self.active_count.fetch_sub(1, Ordering::SeqCst);

        log::debug!("FFmpeg process completed, active count: {}",
            self.active_count.load(Ordering::SeqCst));

        result.map_err(|e| anyhow::anyhow!("FFmpeg execution failed: {}", e))
    }

    /// Register a spawned encoder; the count drops when the guard does.
    pub fn track_encoder(&self) -> EncoderProcessGuard {
        let live = self.live_encoders.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!("Encoder process registered, live encoders: {}", live);
        EncoderProcessGuard {
            live_encoders: Arc::clone(&self.live_encoders),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    pub fn live_encoders(&self) -> usize {
        self.live_encoders.load(Ordering::SeqCst)
    }
}

impl Default for FFmpegManager {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EncoderProcessGuard {
    live_encoders: Arc<AtomicUsize>,
}

impl Drop for EncoderProcessGuard {
    fn drop(&mut self) {
        let live = self.live_encoders.fetch_sub(1, Ordering::SeqCst) - 1;
        log::debug!("Encoder process released, live encoders: {}", live);
    }
}

/// True when `<ffmpeg> -version` runs successfully.
pub fn ffmpeg_available(ffmpeg: &Path) -> bool {
    Command::new(ffmpeg)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
