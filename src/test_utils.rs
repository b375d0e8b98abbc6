//! Test helpers: in-memory media, scripted transforms, a recording sink and an
//! encoder backend that writes inspectable text files instead of video.
//!
//! Every frame produced here is a single solid colour that encodes its index
//! (`r = index & 0xff`, `g = index >> 8`), so files written by the mock encoder
//! can be checked frame by frame.

use std::collections::HashSet;
use std::io::{Error as IoError, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::core::{Frame, PipelineEvent, RecorderConfig};
use crate::pipeline::{FrameSink, PlaybackEngine};
use crate::video::{
    write_concat_list, AudioRange, EncoderBackend, EncoderError, EncoderParams, EncoderProcessGuard,
    EncoderSession, FFmpegManager, FrameTransform, MediaSource, ResizeTransform, SourceError, TransformError,
};

pub const MEDIA_PATH: &str = "/media/input.mp4";

pub fn solid_image(index: u64, width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([(index & 0xff) as u8, ((index >> 8) & 0xff) as u8, 0]))
}

pub fn solid_frame(index: u64, width: u32, height: u32, fps: f64) -> Frame {
    Frame::new(index, fps, solid_image(index, width, height))
}

/// Frame index encoded in the first pixel of raw rgb24 bytes.
pub fn frame_id(bytes: &[u8]) -> u64 {
    bytes[0] as u64 | ((bytes[1] as u64) << 8)
}

/// Config rooted in a scratch directory.
pub fn test_config(root: &Path, threads: usize) -> RecorderConfig {
    RecorderConfig {
        num_threads: threads,
        output_directory: root.join("out"),
        temp_directory: root.join("tmp"),
        ..RecorderConfig::default()
    }
}

// =============================================================================
// MEDIA SOURCE
// =============================================================================

pub struct MemorySource {
    frame_count: u64,
    fps: f64,
    width: u32,
    height: u32,
    position: u64,
    fail_at: Option<u64>,
    live: bool,
    media: Option<PathBuf>,
    reads: Arc<AtomicUsize>,
}

impl MemorySource {
    pub fn new(frame_count: u64, fps: f64, width: u32, height: u32) -> Self {
        Self {
            frame_count,
            fps,
            width,
            height,
            position: 0,
            fail_at: None,
            live: false,
            media: Some(PathBuf::from(MEDIA_PATH)),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every read of `index` fails with a decode error.
    pub fn fail_at(mut self, index: u64) -> Self {
        self.fail_at = Some(index);
        self
    }

    pub fn live(mut self) -> Self {
        self.live = true;
        self.media = None;
        self
    }

    pub fn read_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.reads)
    }
}

impl MediaSource for MemorySource {
    fn read(&mut self) -> Result<RgbImage, SourceError> {
        let index = self.position;
        self.reads.fetch_add(1, Ordering::SeqCst);
        if !self.live && index >= self.frame_count {
            return Err(SourceError::EndOfStream(index));
        }
        if self.fail_at == Some(index) {
            return Err(SourceError::Decode {
                index,
                reason: "corrupt packet".to_string(),
            });
        }
        self.position += 1;
        Ok(solid_image(index, self.width, self.height))
    }

    fn seek(&mut self, index: u64) -> Result<(), SourceError> {
        if self.live {
            return Err(SourceError::Seek {
                index,
                reason: "live".to_string(),
            });
        }
        self.position = index;
        Ok(())
    }

    fn frame_count(&self) -> u64 {
        if self.live {
            0
        } else {
            self.frame_count
        }
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn media_path(&self) -> Option<&Path> {
        self.media.as_deref()
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

// =============================================================================
// TRANSFORMS
// =============================================================================

/// Nearest-neighbour resize keeps the index colour exact.
pub fn exact_resize(width: u32, height: u32) -> ResizeTransform {
    ResizeTransform {
        width,
        height,
        filter: FilterType::Nearest,
    }
}

pub struct FailingTransform {
    indices: Option<HashSet<u64>>,
}

impl FailingTransform {
    pub fn all() -> Self {
        Self { indices: None }
    }

    pub fn at(indices: &[u64]) -> Self {
        Self {
            indices: Some(indices.iter().copied().collect()),
        }
    }
}

impl FrameTransform for FailingTransform {
    fn apply(&self, frame: &Frame) -> Result<RgbImage, TransformError> {
        let fails = match &self.indices {
            None => true,
            Some(indices) => indices.contains(&frame.index),
        };
        if fails {
            Err(TransformError::new(frame.index, "no face detected"))
        } else {
            Ok(frame.image.clone())
        }
    }
}

pub struct PanickingTransform;

impl FrameTransform for PanickingTransform {
    fn apply(&self, _frame: &Frame) -> Result<RgbImage, TransformError> {
        panic!("model crashed");
    }
}

/// Sleeps a per-index pseudo-random time so completions arrive out of order,
/// and records how many transforms ran at once.
pub struct JitterTransform {
    max_delay_ms: u64,
    running: AtomicUsize,
    peak: Arc<AtomicUsize>,
}

impl JitterTransform {
    pub fn new(max_delay_ms: u64) -> Self {
        Self {
            max_delay_ms: max_delay_ms.max(1),
            running: AtomicUsize::new(0),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn peak_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.peak)
    }
}

impl FrameTransform for JitterTransform {
    fn apply(&self, frame: &Frame) -> Result<RgbImage, TransformError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = frame.index.wrapping_mul(7919).wrapping_add(13) % self.max_delay_ms;
        std::thread::sleep(Duration::from_millis(delay));

        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(frame.image.clone())
    }
}

// =============================================================================
// SINK
// =============================================================================

#[derive(Clone, Default)]
pub struct RecordingSink {
    presented: Arc<Mutex<Vec<u64>>>,
    sizes: Arc<Mutex<Vec<(u32, u32)>>>,
    positions: Arc<Mutex<Vec<u64>>>,
}

impl RecordingSink {
    pub fn presented(&self) -> Vec<u64> {
        self.presented.lock().clone()
    }

    pub fn sizes(&self) -> Vec<(u32, u32)> {
        self.sizes.lock().clone()
    }

    pub fn positions(&self) -> Vec<u64> {
        self.positions.lock().clone()
    }
}

impl FrameSink for RecordingSink {
    fn present(&mut self, frame: &Frame) {
        self.presented.lock().push(frame.index);
        self.sizes.lock().push(frame.dimensions());
    }

    fn position_changed(&mut self, index: u64) {
        self.positions.lock().push(index);
    }
}

// =============================================================================
// ENCODER
// =============================================================================

#[derive(Default)]
struct MockState {
    manager: FFmpegManager,
    opened: Mutex<Vec<EncoderParams>>,
    write_attempts: AtomicUsize,
    break_pipe_after: Mutex<Option<usize>>,
    fail_open_at: Mutex<Option<usize>>,
    fail_concat: AtomicBool,
    concat_lists: Mutex<Vec<String>>,
    muxed: Mutex<Vec<AudioRange>>,
}

/// Writes one `frame <index>` line per encoded frame. Concatenation appends
/// the segment files; audio muxing appends an `audio <start> <end>` line.
#[derive(Clone, Default)]
pub struct MockEncoderBackend {
    state: Arc<MockState>,
}

impl MockEncoderBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions accept `count` frames, then report a broken pipe.
    pub fn break_pipe_after(&self, count: usize) {
        *self.state.break_pipe_after.lock() = Some(count);
    }

    /// The session opened `index`-th (zero based) fails to spawn.
    pub fn fail_open_at(&self, index: usize) {
        *self.state.fail_open_at.lock() = Some(index);
    }

    pub fn fail_concat(&self) {
        self.state.fail_concat.store(true, Ordering::SeqCst);
    }

    pub fn opened(&self) -> Vec<EncoderParams> {
        self.state.opened.lock().clone()
    }

    pub fn write_attempts(&self) -> usize {
        self.state.write_attempts.load(Ordering::SeqCst)
    }

    pub fn concat_lists(&self) -> Vec<String> {
        self.state.concat_lists.lock().clone()
    }

    pub fn muxed(&self) -> Vec<AudioRange> {
        self.state.muxed.lock().clone()
    }
}

impl EncoderBackend for MockEncoderBackend {
    fn open(&self, params: &EncoderParams) -> Result<Box<dyn EncoderSession>, EncoderError> {
        let mut opened = self.state.opened.lock();
        if *self.state.fail_open_at.lock() == Some(opened.len()) {
            opened.push(params.clone());
            return Err(EncoderError::Spawn("ffmpeg not found".to_string()));
        }
        opened.push(params.clone());

        Ok(Box::new(MockSession {
            output: params.output.clone(),
            frames: Vec::new(),
            break_after: *self.state.break_pipe_after.lock(),
            state: Arc::clone(&self.state),
            _guard: self.state.manager.track_encoder(),
        }))
    }

    fn concat(&self, inputs: &[PathBuf], list_file: &Path, output: &Path) -> Result<(), EncoderError> {
        if inputs.is_empty() {
            return Err(EncoderError::NoSegments);
        }
        write_concat_list(inputs, list_file)?;
        self.state.concat_lists.lock().push(std::fs::read_to_string(list_file)?);

        if self.state.fail_concat.load(Ordering::SeqCst) {
            return Err(EncoderError::ProcessFailed {
                status: "exit status: 1".to_string(),
                stderr: "concat failed".to_string(),
            });
        }

        let mut joined = String::new();
        for input in inputs {
            joined.push_str(&std::fs::read_to_string(input)?);
        }
        std::fs::write(output, joined)?;
        Ok(())
    }

    fn mux_audio(&self, video: &Path, audio: &AudioRange, output: &Path) -> Result<(), EncoderError> {
        let mut content = std::fs::read_to_string(video)?;
        content.push_str(&format!("audio {:.3} {:.3}\n", audio.start_sec, audio.end_sec));
        std::fs::write(output, content)?;
        self.state.muxed.lock().push(audio.clone());
        Ok(())
    }

    fn live_sessions(&self) -> usize {
        self.state.manager.live_encoders()
    }
}

struct MockSession {
    output: PathBuf,
    frames: Vec<u64>,
    break_after: Option<usize>,
    state: Arc<MockState>,
    _guard: EncoderProcessGuard,
}

impl EncoderSession for MockSession {
    fn write_frame(&mut self, bytes: &[u8]) -> Result<(), EncoderError> {
        self.state.write_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.break_after {
            if self.frames.len() >= limit {
                return Err(EncoderError::Write(IoError::new(ErrorKind::BrokenPipe, "pipe closed")));
            }
        }
        self.frames.push(frame_id(bytes));
        Ok(())
    }

    fn finish(self: Box<Self>, _timeout: Duration) -> Result<(), EncoderError> {
        if self.frames.is_empty() {
            return Err(EncoderError::ProcessFailed {
                status: "exit status: 1".to_string(),
                stderr: "Output file is empty, nothing was encoded".to_string(),
            });
        }
        let content: String = self.frames.iter().map(|id| format!("frame {}\n", id)).collect();
        std::fs::write(&self.output, content)?;
        Ok(())
    }
}

/// Frame indices recorded in a mock-encoded file.
pub fn read_frame_ids(path: &Path) -> Vec<u64> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| line.strip_prefix("frame "))
        .filter_map(|id| id.parse().ok())
        .collect()
}

// =============================================================================
// DRIVING THE ENGINE
// =============================================================================

/// Run ticks until the engine is idle. Returns false on timeout.
pub fn drive_until_idle(engine: &mut PlaybackEngine, timeout: Duration) -> bool {
    let started = Instant::now();
    while engine.state().is_active() {
        if started.elapsed() > timeout {
            return false;
        }
        engine.tick_read();
        engine.poll_completions(Duration::from_millis(1));
        engine.tick_display();
    }
    true
}

/// Run ticks until `condition` holds or the engine goes idle.
pub fn drive_until(engine: &mut PlaybackEngine, timeout: Duration, mut condition: impl FnMut(&PlaybackEngine) -> bool) -> bool {
    let started = Instant::now();
    while !condition(engine) {
        if !engine.state().is_active() || started.elapsed() > timeout {
            return false;
        }
        engine.tick_read();
        engine.poll_completions(Duration::from_millis(1));
        engine.tick_display();
    }
    true
}

pub fn collect_events(rx: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}
