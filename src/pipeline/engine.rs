// =============================================================================
// PLAYBACK ENGINE - READ TICK, DISPLAY TICK, RECORDING MODES
// =============================================================================
//
// The engine is owned by a single thread. Frames are read in index order,
// transformed on worker threads, and come back as `WorkerDone` messages that
// the owner feeds into `handle_worker_done`. The display tick releases them in
// order to the sink and, when recording, to the encoder.
//
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};
use tempfile::TempPath;

use super::queue::BoundedFrameQueue;
use super::reorder::DisplayReorderBuffer;
use super::segments::SegmentRecorder;
use super::worker::{WorkerDone, WorkerPool};
use crate::core::{
    resolve_output_path, EventBus, Frame, FrameOutcome, OutputNaming, PipelineEvent, RecorderConfig,
    MAX_THREADS, MIN_THREADS,
};
use crate::video::{AudioRange, EncoderBackend, EncoderHandle, EncoderParams, FrameTransform, MediaSource, SourceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
    RecordingSingle,
    RecordingSegments,
}

impl PlaybackState {
    pub fn is_active(&self) -> bool {
        !matches!(self, PlaybackState::Idle)
    }

    pub fn is_recording(&self) -> bool {
        matches!(self, PlaybackState::RecordingSingle | PlaybackState::RecordingSegments)
    }
}

/// Receives frames for display, in order.
pub trait FrameSink: Send {
    fn present(&mut self, frame: &Frame);

    /// Display position moved; the UI's scrub position follows it.
    fn position_changed(&mut self, _index: u64) {}
}

/// Discards frames.
pub struct NullSink;

impl FrameSink for NullSink {
    fn present(&mut self, _frame: &Frame) {}
}

/// Tick interval in whole milliseconds: `floor(1000 / fps * factor)`, at least 1.
pub fn tick_interval(fps: f64, factor: f64) -> Duration {
    if fps <= 0.0 {
        return Duration::from_millis(1);
    }
    let millis = (1000.0 / fps * factor).floor().max(1.0);
    Duration::from_millis(millis as u64)
}

struct TickSchedule {
    interval: Duration,
    next_read: Instant,
    next_display: Instant,
}

impl TickSchedule {
    fn start(interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            interval,
            next_read: now,
            next_display: now,
        }
    }
}

pub(super) struct SingleRecording {
    pub(super) encoder: Option<EncoderHandle>,
    pub(super) temp_path: TempPath,
    pub(super) output: PathBuf,
    pub(super) media: PathBuf,
    pub(super) start_frame: u64,
    pub(super) last_written: Option<u64>,
    pub(super) started_at: Instant,
}

pub struct PlaybackEngine {
    pub(super) config: RecorderConfig,
    pub(super) source: Box<dyn MediaSource>,
    pub(super) sink: Box<dyn FrameSink>,
    pub(super) backend: Box<dyn EncoderBackend>,
    pub(super) events: EventBus,
    pub(super) queue: BoundedFrameQueue,
    pub(super) pool: WorkerPool,
    pub(super) done_rx: Receiver<WorkerDone>,
    pub(super) reorder: DisplayReorderBuffer,
    pub(super) state: PlaybackState,
    pub(super) generation: u64,
    /// Next frame index the read tick will pull.
    pub(super) read_position: u64,
    /// Position shown to the user; stop() rewinds the read cursor to it.
    pub(super) scrub_position: u64,
    /// Exclusive end of the current run. Reads and display stop here.
    pub(super) stop_at: u64,
    pub(super) frames_written: u64,
    ticks: Option<TickSchedule>,
    pub(super) single: Option<SingleRecording>,
    pub(super) segments: SegmentRecorder,
}

impl PlaybackEngine {
    pub fn new(
        config: RecorderConfig,
        source: Box<dyn MediaSource>,
        transform: Arc<dyn FrameTransform>,
        sink: Box<dyn FrameSink>,
        backend: Box<dyn EncoderBackend>,
        events: EventBus,
    ) -> Self {
        let config = config.normalized();
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        log::info!(
            "Playback engine ready: {} threads, {:.3} fps, {} frames",
            config.num_threads,
            source.fps(),
            if source.is_live() { "live".to_string() } else { source.frame_count().to_string() }
        );

        Self {
            queue: BoundedFrameQueue::new(config.num_threads),
            pool: WorkerPool::new(transform, done_tx),
            done_rx,
            reorder: DisplayReorderBuffer::new(0),
            state: PlaybackState::Idle,
            generation: 0,
            read_position: 0,
            scrub_position: 0,
            stop_at: 0,
            frames_written: 0,
            ticks: None,
            single: None,
            segments: SegmentRecorder::default(),
            config,
            source,
            sink,
            backend,
            events,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Completion channel the owning thread listens on.
    pub fn completions(&self) -> Receiver<WorkerDone> {
        self.done_rx.clone()
    }

    pub fn scrub_position(&self) -> u64 {
        self.scrub_position
    }

    pub fn read_position(&self) -> u64 {
        self.read_position
    }

    pub fn queue(&self) -> &BoundedFrameQueue {
        &self.queue
    }

    pub fn live_workers(&self) -> usize {
        self.pool.live_workers()
    }

    pub fn live_encoders(&self) -> usize {
        self.backend.live_sessions()
    }

    pub fn num_threads(&self) -> usize {
        self.config.num_threads
    }

    pub fn tick_interval(&self) -> Option<Duration> {
        self.ticks.as_ref().map(|t| t.interval)
    }

    pub(super) fn fps(&self) -> f64 {
        self.source.fps()
    }

    pub(super) fn frame_end(&self) -> u64 {
        if self.source.is_live() {
            u64::MAX
        } else {
            self.source.frame_count()
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    pub fn play(&mut self) -> bool {
        if self.state.is_active() {
            log::warn!("Cannot play: {:?} is active", self.state);
            return false;
        }
        let end = self.frame_end();
        if self.read_position >= end {
            log::warn!("Cannot play: position {} is past the last frame", self.read_position);
            return false;
        }

        let fps = self.config.playback_fps_override.unwrap_or_else(|| self.fps());
        let interval = tick_interval(fps, self.config.playback_speedup);
        log::info!("Playback started at frame {} ({:?} per tick)", self.read_position, interval);

        self.begin_run(PlaybackState::Playing, self.read_position, end, interval);
        self.events.emit(PipelineEvent::PlaybackStarted);
        true
    }

    /// Record from the scrub position to the end of the media into one file.
    pub fn record(&mut self, naming: &OutputNaming) -> bool {
        if self.state.is_active() {
            log::warn!("Cannot record: {:?} is active", self.state);
            return false;
        }
        if self.source.is_live() {
            log::warn!("Recording is not available for live sources");
            return false;
        }
        let media = match self.source.media_path() {
            Some(path) => path.to_path_buf(),
            None => {
                log::warn!("Cannot record: source has no media file for audio");
                return false;
            }
        };
        let start = self.scrub_position;
        let end = self.frame_end();
        if start >= end {
            log::warn!("Cannot record: position {} is past the last frame", start);
            return false;
        }
        let (width, height) = match self.probe_output_dimensions(start) {
            Ok(dims) => dims,
            Err(e) => {
                log::error!("Cannot read first frame for recording: {}", e);
                self.events.emit(PipelineEvent::FrameReadError(start));
                return false;
            }
        };

        let temp_path = match create_recording_temp(&self.config.temp_directory) {
            Ok(path) => path,
            Err(e) => {
                log::error!("Failed to create temp file in {}: {}", self.config.temp_directory.display(), e);
                self.events.emit(PipelineEvent::EncoderError(e.to_string()));
                return false;
            }
        };
        let params = EncoderParams {
            output: temp_path.to_path_buf(),
            width,
            height,
            fps: self.fps(),
            audio: None,
            crf: self.config.crf,
        };
        let encoder = match EncoderHandle::open(self.backend.as_ref(), params, self.config.encoder_close_timeout()) {
            Ok(encoder) => encoder,
            Err(e) => {
                log::error!("Failed to start recording encoder: {}", e);
                self.events.emit(PipelineEvent::EncoderError(e.to_string()));
                return false;
            }
        };

        let output = resolve_output_path(&media, &self.config.output_directory, naming);
        log::info!("Recording from frame {} to {}", start, output.display());
        self.single = Some(SingleRecording {
            encoder: Some(encoder),
            temp_path,
            output,
            media,
            start_frame: start,
            last_written: None,
            started_at: Instant::now(),
        });

        let interval = tick_interval(self.fps(), self.config.playback_speedup);
        self.frames_written = 0;
        self.begin_run(PlaybackState::RecordingSingle, start, end, interval);
        self.events.emit(PipelineEvent::PlaybackStarted);
        true
    }

    /// Cancel whatever is running. Recordings are aborted without output.
    pub fn stop(&mut self) -> bool {
        if !self.state.is_active() {
            return false;
        }
        let previous = self.state;
        log::info!("Stopping {:?}", previous);

        self.halt_workers();
        match previous {
            PlaybackState::RecordingSingle => self.abort_single_recording(),
            PlaybackState::RecordingSegments => self.abort_segments(),
            _ => {}
        }
        self.return_to_idle();
        true
    }

    /// Move the scrub position. Playback restarts from the new position;
    /// recordings refuse to seek.
    pub fn seek(&mut self, index: u64) -> bool {
        if self.state.is_recording() {
            log::warn!("Cannot seek while recording");
            return false;
        }
        if self.source.is_live() {
            log::warn!("Cannot seek a live source");
            return false;
        }
        let last = self.source.frame_count().saturating_sub(1);
        let target = index.min(last);

        let was_playing = self.state == PlaybackState::Playing;
        if was_playing {
            self.halt_workers();
            self.state = PlaybackState::Idle;
        }

        self.scrub_position = target;
        self.read_position = target;
        self.reorder.reset(target);
        if let Err(e) = self.source.seek(target) {
            log::error!("Seek to frame {} failed: {}", target, e);
            self.events.emit(PipelineEvent::FrameReadError(target));
            if was_playing {
                self.return_to_idle();
            }
            return false;
        }
        self.sink.position_changed(target);

        if was_playing {
            let fps = self.config.playback_fps_override.unwrap_or_else(|| self.fps());
            let interval = tick_interval(fps, self.config.playback_speedup);
            let end = self.frame_end();
            self.begin_run(PlaybackState::Playing, target, end, interval);
        }
        true
    }

    /// Read, transform and present the frame at the scrub position.
    pub fn process_current_frame(&mut self) -> bool {
        if self.state.is_recording() {
            log::warn!("Cannot process a single frame while recording");
            return false;
        }
        if self.state == PlaybackState::Playing {
            self.stop();
        }

        let index = self.scrub_position;
        let live = self.source.is_live();
        if !live {
            if let Err(e) = self.source.seek(index) {
                log::error!("Seek to frame {} failed: {}", index, e);
                self.events.emit(PipelineEvent::FrameReadError(index));
                return false;
            }
        }

        let image = match self.source.read() {
            Ok(image) => image,
            Err(e) => {
                log::error!("Failed to read frame {}: {}", index, e);
                self.events.emit(PipelineEvent::FrameReadError(index));
                return false;
            }
        };
        let frame = Frame::new(index, self.fps(), image);

        let presented = match self.pool.run_sync(frame) {
            FrameOutcome::Ready(frame) => {
                self.sink.present(&frame);
                self.sink.position_changed(index);
                true
            }
            FrameOutcome::Failed { index, .. } => {
                self.events.emit(PipelineEvent::FrameTransformFailed(index));
                false
            }
        };

        if !live {
            if let Err(e) = self.source.seek(index) {
                log::warn!("Failed to rewind to frame {}: {}", index, e);
            }
        }
        self.read_position = index;
        presented
    }

    /// Change the worker count. Anything running is stopped first.
    pub fn set_threads(&mut self, count: usize) -> bool {
        let count = count.clamp(MIN_THREADS, MAX_THREADS);
        if self.state.is_active() {
            self.stop();
        }
        if !self.queue.set_capacity(count) {
            return false;
        }
        self.config.num_threads = count;
        log::info!("Worker threads set to {}", count);
        true
    }

    // =========================================================================
    // Ticks
    // =========================================================================

    /// Pull the next frame and hand it to a worker if the queue has room.
    pub fn tick_read(&mut self) {
        if !self.state.is_active() || self.read_position >= self.stop_at {
            return;
        }
        let index = self.read_position;
        let slot = match self.queue.try_enqueue(index) {
            Some(slot) => slot,
            None => return,
        };

        match self.source.read() {
            Ok(image) => {
                self.read_position += 1;
                let frame = Frame::new(index, self.fps(), image);
                if self.pool.submit_async(self.generation, frame, slot).is_err() {
                    self.reorder.insert(FrameOutcome::Failed {
                        index,
                        reason: "worker could not be started".to_string(),
                    });
                }
            }
            Err(e) => {
                drop(slot);
                self.handle_read_failure(index, e);
            }
        }
    }

    /// Release the next frame in order, then finish the run once the end is reached.
    pub fn tick_display(&mut self) {
        if !self.state.is_active() {
            return;
        }
        if self.reorder.next_index() >= self.stop_at {
            self.on_run_complete();
            return;
        }

        match self.reorder.drain_next() {
            None => return,
            Some(FrameOutcome::Failed { index, reason }) => {
                log::warn!("Dropping frame {}: {}", index, reason);
                self.events.emit(PipelineEvent::FrameTransformFailed(index));
            }
            Some(FrameOutcome::Ready(frame)) => self.display_frame(frame),
        }

        if self.state.is_active() && self.reorder.next_index() >= self.stop_at {
            self.on_run_complete();
        }
    }

    pub fn handle_worker_done(&mut self, done: WorkerDone) {
        if done.generation != self.generation || !self.state.is_active() {
            log::debug!(
                "Discarding frame {} from generation {} (current {})",
                done.index,
                done.generation,
                self.generation
            );
            return;
        }
        self.reorder.insert(done.outcome);
    }

    /// Wait up to `wait` for one completion, then take every other pending one.
    pub fn poll_completions(&mut self, wait: Duration) {
        match self.done_rx.recv_timeout(wait) {
            Ok(done) => self.handle_worker_done(done),
            Err(_) => return,
        }
        loop {
            match self.done_rx.try_recv() {
                Ok(done) => self.handle_worker_done(done),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.ticks.as_ref().map(|t| t.next_read.min(t.next_display))
    }

    /// Run the read and display ticks whose deadline has passed.
    pub fn run_due_ticks(&mut self, now: Instant) {
        let read_due = self.ticks.as_ref().is_some_and(|t| now >= t.next_read);
        if read_due {
            if let Some(ticks) = self.ticks.as_mut() {
                ticks.next_read = now + ticks.interval;
            }
            self.tick_read();
        }

        let display_due = self.ticks.as_ref().is_some_and(|t| now >= t.next_display);
        if display_due {
            if let Some(ticks) = self.ticks.as_mut() {
                ticks.next_display = now + ticks.interval;
            }
            self.tick_display();
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    pub(super) fn begin_run(&mut self, state: PlaybackState, start: u64, stop_at: u64, interval: Duration) {
        self.generation += 1;
        self.state = state;
        self.read_position = start;
        self.stop_at = stop_at;
        self.reorder.reset(start);
        self.ticks = Some(TickSchedule::start(interval));
        log::debug!(
            "Run {} started: {:?} frames {}..{} every {:?}",
            self.generation,
            state,
            start,
            stop_at,
            interval
        );
    }

    /// Stop ticking and wait for every worker. Results still in flight are dropped.
    pub(super) fn halt_workers(&mut self) {
        self.ticks = None;
        self.generation += 1;
        self.pool.join_all();
        while self.done_rx.try_recv().is_ok() {}
        self.queue.clear();
        self.reorder.reset(self.read_position);
    }

    pub(super) fn return_to_idle(&mut self) {
        self.ticks = None;
        self.state = PlaybackState::Idle;
        self.read_position = self.scrub_position;
        self.stop_at = self.scrub_position;
        self.reorder.reset(self.scrub_position);
        if !self.source.is_live() {
            if let Err(e) = self.source.seek(self.scrub_position) {
                log::warn!("Failed to rewind source to frame {}: {}", self.scrub_position, e);
            }
        }
        self.events.emit(PipelineEvent::Stopped);
    }

    /// Read one frame at `start` and run the transform on it to learn the
    /// encoder size, then rewind so the pipeline reads `start` again.
    pub(super) fn probe_output_dimensions(&mut self, start: u64) -> Result<(u32, u32), SourceError> {
        self.source.seek(start)?;
        let image = self.source.read()?;
        let frame = Frame::new(start, self.fps(), image);
        let raw = frame.dimensions();

        let dims = match self.pool.run_sync(frame) {
            FrameOutcome::Ready(frame) => frame.dimensions(),
            FrameOutcome::Failed { reason, .. } => {
                log::warn!(
                    "Transform failed on frame {} ({}), using source size {}x{}",
                    start,
                    reason,
                    raw.0,
                    raw.1
                );
                raw
            }
        };
        self.source.seek(start)?;
        log::debug!("Output size for frame {}: {}x{}", start, dims.0, dims.1);
        Ok(dims)
    }

    fn handle_read_failure(&mut self, index: u64, error: SourceError) {
        self.events.emit(PipelineEvent::FrameReadError(index));
        match self.state {
            PlaybackState::Playing => {
                if matches!(error, SourceError::EndOfStream(_)) {
                    log::info!("End of media reached at frame {}", index);
                } else {
                    log::error!("Read failed during playback: {}", error);
                }
                self.stop();
            }
            PlaybackState::RecordingSingle | PlaybackState::RecordingSegments => {
                log::warn!("Read failed at frame {}, ending recording there: {}", index, error);
                self.stop_at = self.stop_at.min(index);
            }
            PlaybackState::Idle => {}
        }
    }

    fn display_frame(&mut self, frame: Frame) {
        self.sink.present(&frame);

        match self.state {
            PlaybackState::Playing => {
                self.scrub_position = frame.index;
                self.sink.position_changed(frame.index);
            }
            PlaybackState::RecordingSingle => {
                self.scrub_position = frame.index;
                self.sink.position_changed(frame.index);
                let written = match self.single.as_mut().and_then(|s| s.encoder.as_mut()) {
                    Some(encoder) => write_to_encoder(encoder, &frame, &self.events),
                    None => false,
                };
                if written {
                    self.frames_written += 1;
                    if let Some(single) = self.single.as_mut() {
                        single.last_written = Some(frame.index);
                    }
                }
            }
            PlaybackState::RecordingSegments => {
                let written = match self.segments.encoder.as_mut() {
                    Some(encoder) => write_to_encoder(encoder, &frame, &self.events),
                    None => false,
                };
                if written {
                    self.frames_written += 1;
                }
            }
            PlaybackState::Idle => {}
        }
    }

    fn on_run_complete(&mut self) {
        match self.state {
            PlaybackState::Playing => {
                log::info!("Playback reached frame {}", self.reorder.next_index());
                self.stop();
            }
            PlaybackState::RecordingSingle => self.finish_single_recording(),
            PlaybackState::RecordingSegments => self.stop_segment(),
            PlaybackState::Idle => {}
        }
    }

    // =========================================================================
    // Single recording
    // =========================================================================

    fn finish_single_recording(&mut self) {
        self.halt_workers();
        let mut recording = match self.single.take() {
            Some(recording) => recording,
            None => {
                self.return_to_idle();
                return;
            }
        };

        if let Some(encoder) = recording.encoder.take() {
            if let Err(e) = encoder.close() {
                log::error!("Recording encoder failed: {}", e);
                self.events.emit(PipelineEvent::EncoderError(e.to_string()));
            }
        }

        let output = match recording.last_written {
            Some(last) if file_has_content(&recording.temp_path) => {
                let fps = self.fps();
                let audio = AudioRange {
                    source: recording.media.clone(),
                    start_sec: recording.start_frame as f64 / fps,
                    end_sec: (last + 1) as f64 / fps,
                };
                self.mux_recording(&recording, &audio)
            }
            _ => {
                log::error!("Recording produced no video");
                None
            }
        };

        let started_at = recording.started_at;
        discard_temp(recording.temp_path);
        self.emit_summary(started_at);
        self.events.emit(PipelineEvent::RecordingFinished { output });
        self.return_to_idle();
    }

    fn mux_recording(&mut self, recording: &SingleRecording, audio: &AudioRange) -> Option<PathBuf> {
        if let Err(e) = prepare_output(&recording.output) {
            log::error!("Cannot prepare output {}: {}", recording.output.display(), e);
            self.events.emit(PipelineEvent::EncoderError(e.to_string()));
            return None;
        }
        match self.backend.mux_audio(&recording.temp_path, audio, &recording.output) {
            Ok(()) => {
                log::info!("Recording saved to {}", recording.output.display());
                Some(recording.output.clone())
            }
            Err(e) => {
                log::error!("Failed to add audio to recording: {}", e);
                self.events.emit(PipelineEvent::EncoderError(e.to_string()));
                None
            }
        }
    }

    fn abort_single_recording(&mut self) {
        if let Some(mut recording) = self.single.take() {
            log::info!("Recording aborted, discarding {}", recording.temp_path.display());
            if let Some(encoder) = recording.encoder.take() {
                if let Err(e) = encoder.close_with_timeout(self.config.abort_close_timeout()) {
                    log::warn!("Encoder did not close cleanly on abort: {}", e);
                }
            }
            discard_temp(recording.temp_path);
        }
    }

    pub(super) fn emit_summary(&mut self, started_at: Instant) {
        let elapsed_secs = started_at.elapsed().as_secs_f64();
        let frames = std::mem::take(&mut self.frames_written);
        let average_fps = if elapsed_secs > 0.0 { frames as f64 / elapsed_secs } else { 0.0 };
        log::info!(
            "Recording finished: {} frames in {:.2}s ({:.2} fps)",
            frames,
            elapsed_secs,
            average_fps
        );
        self.events.emit(PipelineEvent::RecordingSummary {
            frames,
            elapsed_secs,
            average_fps,
        });
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Returns true when the frame reached the encoder.
fn write_to_encoder(encoder: &mut EncoderHandle, frame: &Frame, events: &EventBus) -> bool {
    if encoder.is_input_closed() {
        return false;
    }
    match encoder.write_frame(frame) {
        Ok(()) => true,
        Err(e) => {
            log::error!("Dropping frame {} for {}: {}", frame.index, encoder.output().display(), e);
            if encoder.is_input_closed() {
                events.emit(PipelineEvent::EncoderError(e.to_string()));
            }
            false
        }
    }
}

pub(super) fn file_has_content(path: &std::path::Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

/// Create the parent directory and remove a stale file at `output`.
pub(super) fn prepare_output(output: &std::path::Path) -> std::io::Result<()> {
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    if output.is_file() {
        log::info!("Removing existing output {}", output.display());
        std::fs::remove_file(output)?;
    }
    Ok(())
}

/// Empty `recording_*.mp4` placeholder the encoder overwrites; removed when dropped.
fn create_recording_temp(temp_dir: &std::path::Path) -> std::io::Result<TempPath> {
    std::fs::create_dir_all(temp_dir)?;
    let file = tempfile::Builder::new()
        .prefix("recording_")
        .suffix(".mp4")
        .tempfile_in(temp_dir)?;
    Ok(file.into_temp_path())
}

fn discard_temp(path: TempPath) {
    let display = path.display().to_string();
    match path.close() {
        Ok(()) => log::debug!("Removed temporary file {}", display),
        // The encoder may have replaced the placeholder and failed before writing
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove temporary file {}: {}", display, e),
    }
}
