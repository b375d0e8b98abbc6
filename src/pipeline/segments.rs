// =============================================================================
// SEGMENT RECORDING
// =============================================================================
//
// Idle -> Seeking(i) -> Encoding(i) -> Seeking(i + 1) ... -> Finalizing -> Idle
//
// Each segment is encoded to its own file in a per-run workspace. After the
// last segment the files are concatenated losslessly into the output and the
// workspace is removed, whatever the outcome.
//
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Instant;

use tempfile::TempDir;

use super::engine::{file_has_content, prepare_output, tick_interval, PlaybackEngine, PlaybackState};
use crate::core::{resolve_output_path, OutputNaming, PipelineEvent, Segment, SegmentJob};
use crate::video::{AudioRange, EncoderHandle, EncoderParams};

/// Scratch directory `<temp>/segments/run_*` for one segment job, removed on drop.
#[derive(Debug)]
pub struct SegmentWorkspace {
    dir: TempDir,
}

impl SegmentWorkspace {
    pub fn create(temp_dir: &Path) -> std::io::Result<Self> {
        let parent = temp_dir.join("segments");
        std::fs::create_dir_all(&parent)?;
        let dir = tempfile::Builder::new().prefix("run_").tempdir_in(&parent)?;
        log::debug!("Created segment workspace {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn segment_path(&self, index: usize) -> PathBuf {
        self.path().join(format!("segment_{:03}.mp4", index))
    }

    pub fn concat_list_path(&self) -> PathBuf {
        self.path().join("concat_list.txt")
    }

    /// Remove the directory now, logging instead of silently ignoring failures.
    pub fn close(self) {
        let root = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => log::debug!("Removed segment workspace {}", root.display()),
            Err(e) => log::warn!("Failed to remove segment workspace {}: {}", root.display(), e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentPhase {
    Idle,
    Seeking(usize),
    Encoding(usize),
    Finalizing,
}

/// State of the running segment job.
pub struct SegmentRecorder {
    pub(super) job: SegmentJob,
    pub(super) phase: SegmentPhase,
    pub(super) workspace: Option<SegmentWorkspace>,
    pub(super) encoder: Option<EncoderHandle>,
    pub(super) completed: Vec<PathBuf>,
    pub(super) media: Option<PathBuf>,
    pub(super) output: Option<PathBuf>,
    pub(super) started_at: Option<Instant>,
    pub(super) playback_announced: bool,
}

impl Default for SegmentRecorder {
    fn default() -> Self {
        Self {
            job: SegmentJob::default(),
            phase: SegmentPhase::Idle,
            workspace: None,
            encoder: None,
            completed: Vec::new(),
            media: None,
            output: None,
            started_at: None,
            playback_announced: false,
        }
    }
}

impl SegmentRecorder {
    pub fn phase(&self) -> SegmentPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase != SegmentPhase::Idle
    }

    pub fn workspace_path(&self) -> Option<&Path> {
        self.workspace.as_ref().map(|w| w.path())
    }

    pub fn current_segment(&self) -> Option<&Segment> {
        self.job.current()
    }

    /// Drop all job state. The workspace directory goes with it.
    fn reset(&mut self) {
        self.job.clear();
        self.phase = SegmentPhase::Idle;
        self.encoder = None;
        if let Some(workspace) = self.workspace.take() {
            workspace.close();
        }
        self.completed.clear();
        self.media = None;
        self.output = None;
        self.started_at = None;
        self.playback_announced = false;
    }
}

impl PlaybackEngine {
    pub fn segment_phase(&self) -> SegmentPhase {
        self.segments.phase()
    }

    pub fn segment_workspace(&self) -> Option<&Path> {
        self.segments.workspace_path()
    }

    /// Record each segment to its own file, then join them into one output.
    pub fn record_segments(&mut self, segments: Vec<Segment>, naming: &OutputNaming) -> bool {
        if self.state.is_active() || self.segments.is_active() {
            log::warn!("Cannot start segment recording: {:?} is active", self.state);
            return false;
        }
        if segments.is_empty() {
            log::warn!("Cannot start segment recording: no segments");
            return false;
        }
        if self.source.is_live() {
            log::warn!("Segment recording is not available for live sources");
            return false;
        }
        let media = match self.source.media_path() {
            Some(path) => path.to_path_buf(),
            None => {
                log::warn!("Cannot record segments: source has no media file for audio");
                return false;
            }
        };

        let workspace = match SegmentWorkspace::create(&self.config.temp_directory) {
            Ok(workspace) => workspace,
            Err(e) => {
                log::error!("Failed to create segment workspace: {}", e);
                self.events.emit(PipelineEvent::EncoderError(e.to_string()));
                return false;
            }
        };

        let output = resolve_output_path(&media, &self.config.output_directory, naming);
        log::info!(
            "Recording {} segments from {} to {}",
            segments.len(),
            media.display(),
            output.display()
        );

        self.segments.reset();
        self.segments.job = SegmentJob::new(segments);
        self.segments.workspace = Some(workspace);
        self.segments.media = Some(media);
        self.segments.output = Some(output);
        self.segments.started_at = Some(Instant::now());
        self.frames_written = 0;
        self.state = PlaybackState::RecordingSegments;

        self.advance_segment();
        true
    }

    /// Open the next segment, skipping those whose first frame cannot be
    /// read. Finalizes after the last one.
    fn advance_segment(&mut self) {
        loop {
            let (index, segment) = match self.segments.job.advance() {
                Some(next) => next,
                None => {
                    self.finalize_segments();
                    return;
                }
            };
            self.segments.phase = SegmentPhase::Seeking(index);
            log::info!(
                "Segment {}: frames {}..={}",
                index,
                segment.start_frame,
                segment.end_frame
            );

            // Open-ended ranges stop at the last frame of the media
            let segment = segment.clamp_to(self.frame_end());
            let (width, height) = match self.probe_output_dimensions(segment.start_frame) {
                Ok(dims) => dims,
                Err(e) => {
                    log::warn!("Skipping segment {}: {}", index, e);
                    self.events.emit(PipelineEvent::FrameReadError(segment.start_frame));
                    continue;
                }
            };

            let (path, media) = match (&self.segments.workspace, &self.segments.media) {
                (Some(workspace), Some(media)) => (workspace.segment_path(index), media.clone()),
                _ => {
                    log::error!("Segment job lost its workspace");
                    self.fail_segments();
                    return;
                }
            };
            let fps = self.fps();
            let (start_sec, end_sec) = segment.audio_range(fps);
            let params = EncoderParams {
                output: path,
                width,
                height,
                fps,
                audio: Some(AudioRange {
                    source: media,
                    start_sec,
                    end_sec,
                }),
                crf: self.config.crf,
            };

            match EncoderHandle::open(self.backend.as_ref(), params, self.config.encoder_close_timeout()) {
                Ok(encoder) => self.segments.encoder = Some(encoder),
                Err(e) => {
                    log::error!("Failed to start encoder for segment {}: {}", index, e);
                    self.events.emit(PipelineEvent::EncoderError(e.to_string()));
                    self.fail_segments();
                    return;
                }
            }

            self.segments.phase = SegmentPhase::Encoding(index);
            let interval = tick_interval(fps, 1.0);
            self.begin_run(
                PlaybackState::RecordingSegments,
                segment.start_frame,
                segment.end_frame.saturating_add(1),
                interval,
            );
            if !self.segments.playback_announced {
                self.segments.playback_announced = true;
                self.events.emit(PipelineEvent::PlaybackStarted);
            }
            self.events.emit(PipelineEvent::SegmentStarted(index));
            return;
        }
    }

    /// Close the current segment's encoder and move on.
    pub(super) fn stop_segment(&mut self) {
        let index = match self.segments.phase {
            SegmentPhase::Encoding(index) | SegmentPhase::Seeking(index) => index,
            _ => return,
        };
        self.halt_workers();

        if let Some(encoder) = self.segments.encoder.take() {
            let path = encoder.output().to_path_buf();
            let written = encoder.frames_written();
            if let Err(e) = encoder.close() {
                log::error!("Encoder for segment {} failed: {}", index, e);
                self.events.emit(PipelineEvent::EncoderError(e.to_string()));
            }

            if file_has_content(&path) {
                log::info!("Segment {} written: {} frames -> {}", index, written, path.display());
                self.segments.completed.push(path);
            } else {
                log::error!("Segment {} produced no file at {}", index, path.display());
            }
        }

        self.events.emit(PipelineEvent::SegmentEnded(index));
        self.advance_segment();
    }

    fn finalize_segments(&mut self) {
        self.segments.phase = SegmentPhase::Finalizing;
        self.halt_workers();

        let files: Vec<PathBuf> = self
            .segments
            .completed
            .iter()
            .filter(|path| file_has_content(path))
            .cloned()
            .collect();

        let target = self
            .segments
            .output
            .clone()
            .zip(self.segments.workspace.as_ref().map(|w| w.concat_list_path()));

        let output = match target {
            _ if files.is_empty() => {
                log::error!("No segment files were produced, nothing to concatenate");
                None
            }
            Some((output, list)) => self.concat_segments(&files, &list, output),
            None => None,
        };

        let started_at = self.segments.started_at.unwrap_or_else(Instant::now);
        // Workspace is removed here regardless of the outcome
        self.segments.reset();
        self.emit_summary(started_at);
        self.events.emit(PipelineEvent::AllSegmentsDone { output });
        self.return_to_idle();
    }

    fn concat_segments(&mut self, files: &[PathBuf], list: &Path, output: PathBuf) -> Option<PathBuf> {
        if let Err(e) = prepare_output(&output) {
            log::error!("Cannot prepare output {}: {}", output.display(), e);
            self.events.emit(PipelineEvent::EncoderError(e.to_string()));
            return None;
        }
        match self.backend.concat(files, list, &output) {
            Ok(()) => {
                log::info!("Joined {} segments into {}", files.len(), output.display());
                Some(output)
            }
            Err(e) => {
                log::error!("Segment concatenation failed: {}", e);
                self.events.emit(PipelineEvent::EncoderError(e.to_string()));
                None
            }
        }
    }

    /// External stop mid-job: nothing is kept.
    pub(super) fn abort_segments(&mut self) {
        if !self.segments.is_active() {
            return;
        }
        log::info!("Segment recording aborted");
        if let Some(encoder) = self.segments.encoder.take() {
            if let Err(e) = encoder.close_with_timeout(self.config.abort_close_timeout()) {
                log::warn!("Encoder did not close cleanly on abort: {}", e);
            }
        }
        self.frames_written = 0;
        self.segments.reset();
    }

    /// The job cannot continue; report it as failed with no output.
    fn fail_segments(&mut self) {
        self.halt_workers();
        self.abort_segments();
        self.events.emit(PipelineEvent::AllSegmentsDone { output: None });
        self.return_to_idle();
    }
}
