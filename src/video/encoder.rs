// =============================================================================
// ENCODER - ONE FFMPEG PROCESS PER RECORDED UNIT
// =============================================================================
//
// Processed frames are streamed as rgb24 over the encoder's stdin. The audio
// for the same time range is taken from the original media as a second input.
// A handle owns its process: dropping it closes stdin and waits for exit, so
// every exit path of the recorder releases the process.
//
// =============================================================================

use std::ffi::OsString;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

use super::ffmpeg_manager::{EncoderProcessGuard, FFmpegManager};
use crate::core::Frame;

const STDERR_TAIL_LINES: usize = 32;

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("failed to start encoder: {0}")]
    Spawn(String),
    #[error("failed to write frame to encoder: {0}")]
    Write(#[source] std::io::Error),
    #[error("encoder input stream is closed")]
    Closed,
    #[error("frame is {got_width}x{got_height} but encoder expects {width}x{height}")]
    FrameSize {
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },
    #[error("encoder exited with {status}: {stderr}")]
    ProcessFailed { status: String, stderr: String },
    #[error("encoder did not exit within {0:?}")]
    Timeout(Duration),
    #[error("no segment files to concatenate")]
    NoSegments,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EncoderError {
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, EncoderError::Write(e) if e.kind() == ErrorKind::BrokenPipe)
    }
}

/// Time range of the original media's audio track.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioRange {
    pub source: PathBuf,
    pub start_sec: f64,
    pub end_sec: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderParams {
    pub output: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub audio: Option<AudioRange>,
    pub crf: u8,
}

impl EncoderParams {
    pub fn ffmpeg_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        // Input 0: processed frames
        push_args(
            &mut args,
            &[
                "-hide_banner",
                "-loglevel",
                "error",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgb24",
                "-s",
                &format!("{}x{}", self.width, self.height),
                "-r",
                &format!("{}", self.fps),
                "-i",
                "pipe:0",
            ],
        );

        let crf = self.crf.to_string();
        if let Some(audio) = &self.audio {
            // Input 1: original audio, cut to the recorded range
            push_args(
                &mut args,
                &[
                    "-ss",
                    &format!("{:.6}", audio.start_sec),
                    "-to",
                    &format!("{:.6}", audio.end_sec),
                    "-i",
                ],
            );
            args.push(audio.source.clone().into_os_string());
            push_args(&mut args, &["-map", "0:v:0", "-map", "1:a:0?"]);
        }

        push_args(
            &mut args,
            &[
                "-vf",
                "pad=ceil(iw/2)*2:ceil(ih/2)*2,format=yuvj420p",
                "-c:v",
                "libx264",
                "-crf",
                &crf,
            ],
        );
        if self.audio.is_some() {
            push_args(&mut args, &["-c:a", "copy", "-shortest"]);
        }

        args.push(OsString::from("-y"));
        args.push(self.output.clone().into_os_string());
        args
    }

    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

fn push_args(args: &mut Vec<OsString>, values: &[&str]) {
    args.extend(values.iter().map(OsString::from));
}

/// A running encoder accepting raw frames.
pub trait EncoderSession: Send {
    fn write_frame(&mut self, bytes: &[u8]) -> Result<(), EncoderError>;
    /// Close the input stream and wait for the process to exit.
    fn finish(self: Box<Self>, timeout: Duration) -> Result<(), EncoderError>;
}

/// Spawns encoder sessions and runs the one-shot post-processing steps.
pub trait EncoderBackend: Send {
    fn open(&self, params: &EncoderParams) -> Result<Box<dyn EncoderSession>, EncoderError>;
    /// Lossless concatenation of `inputs`, in order, into `output`.
    fn concat(&self, inputs: &[PathBuf], list_file: &Path, output: &Path) -> Result<(), EncoderError>;
    /// Copy-mux an audio range from the original media into a video-only file.
    fn mux_audio(&self, video: &Path, audio: &AudioRange, output: &Path) -> Result<(), EncoderError>;
    /// Encoder processes spawned but not yet awaited.
    fn live_sessions(&self) -> usize;
}

// =============================================================================
// ENCODER HANDLE
// =============================================================================

/// Owned encoder for one output file. Released on `close` or on drop.
pub struct EncoderHandle {
    session: Option<Box<dyn EncoderSession>>,
    params: EncoderParams,
    close_timeout: Duration,
    input_closed: bool,
    frames_written: u64,
    frames_dropped: u64,
}

impl EncoderHandle {
    pub fn open(
        backend: &dyn EncoderBackend,
        params: EncoderParams,
        close_timeout: Duration,
    ) -> Result<Self, EncoderError> {
        log::info!(
            "Creating encoder: {}x{} @ {:.3} fps -> {}",
            params.width,
            params.height,
            params.fps,
            params.output.display()
        );
        if let Some(audio) = &params.audio {
            log::info!(
                "  Audio range: {:.3}s - {:.3}s from {}",
                audio.start_sec,
                audio.end_sec,
                audio.source.display()
            );
        }
        let session = backend.open(&params)?;
        Ok(Self {
            session: Some(session),
            params,
            close_timeout,
            input_closed: false,
            frames_written: 0,
            frames_dropped: 0,
        })
    }

    pub fn params(&self) -> &EncoderParams {
        &self.params
    }

    pub fn output(&self) -> &Path {
        &self.params.output
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    pub fn is_input_closed(&self) -> bool {
        self.input_closed
    }

    /// Stream one frame. Failures drop only this frame; a broken pipe marks the
    /// input closed and later writes are skipped.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), EncoderError> {
        if self.input_closed {
            self.frames_dropped += 1;
            return Err(EncoderError::Closed);
        }
        let (width, height) = frame.dimensions();
        if width != self.params.width || height != self.params.height {
            self.frames_dropped += 1;
            return Err(EncoderError::FrameSize {
                width: self.params.width,
                height: self.params.height,
                got_width: width,
                got_height: height,
            });
        }
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => {
                self.input_closed = true;
                self.frames_dropped += 1;
                return Err(EncoderError::Closed);
            }
        };

        match session.write_frame(frame.as_bytes()) {
            Ok(()) => {
                self.frames_written += 1;
                Ok(())
            }
            Err(e) => {
                self.frames_dropped += 1;
                if e.is_broken_pipe() {
                    log::warn!("Encoder input for {} is broken, skipping further writes", self.params.output.display());
                    self.input_closed = true;
                }
                Err(e)
            }
        }
    }

    pub fn close(mut self) -> Result<(), EncoderError> {
        let timeout = self.close_timeout;
        self.finish_session(timeout)
    }

    /// Close with a shorter wait, used on abort.
    pub fn close_with_timeout(mut self, timeout: Duration) -> Result<(), EncoderError> {
        self.finish_session(timeout)
    }

    fn finish_session(&mut self, timeout: Duration) -> Result<(), EncoderError> {
        self.input_closed = true;
        match self.session.take() {
            Some(session) => {
                log::debug!(
                    "Closing encoder for {} ({} frames written, {} dropped)",
                    self.params.output.display(),
                    self.frames_written,
                    self.frames_dropped
                );
                session.finish(timeout)
            }
            None => Ok(()),
        }
    }
}

impl Drop for EncoderHandle {
    fn drop(&mut self) {
        if self.session.is_some() {
            let timeout = self.close_timeout;
            if let Err(e) = self.finish_session(timeout) {
                log::error!("Encoder for {} failed while closing: {}", self.params.output.display(), e);
            }
        }
    }
}

// =============================================================================
// FFMPEG BACKEND
// =============================================================================

pub struct FfmpegEncoder {
    ffmpeg: PathBuf,
    manager: FFmpegManager,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg: PathBuf, manager: FFmpegManager) -> Self {
        Self { ffmpeg, manager }
    }

    fn map_spawn_error(&self, e: std::io::Error) -> EncoderError {
        if e.kind() == ErrorKind::NotFound {
            EncoderError::Spawn(format!(
                "{} not found. Ensure FFmpeg is installed and in system PATH",
                self.ffmpeg.display()
            ))
        } else {
            EncoderError::Spawn(format!("{}: {}", self.ffmpeg.display(), e))
        }
    }

    fn run_one_shot(&self, args: Vec<OsString>, what: &str) -> Result<(), EncoderError> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(&args);
        let output = self
            .manager
            .execute_ffmpeg(cmd)
            .map_err(|e| EncoderError::Spawn(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            log::error!("FFmpeg command failed during {}: {}", what, stderr);
            log::error!(
                "FFmpeg arguments: {}",
                args.iter().map(|a| a.to_string_lossy()).collect::<Vec<_>>().join(" ")
            );
            return Err(EncoderError::ProcessFailed {
                status: output.status.to_string(),
                stderr,
            });
        }
        Ok(())
    }
}

impl EncoderBackend for FfmpegEncoder {
    fn open(&self, params: &EncoderParams) -> Result<Box<dyn EncoderSession>, EncoderError> {
        if params.width == 0 || params.height == 0 {
            return Err(EncoderError::Spawn("frame dimensions are empty".to_string()));
        }
        if params.output.is_file() {
            if let Err(e) = std::fs::remove_file(&params.output) {
                log::warn!("Could not remove existing file {}: {}", params.output.display(), e);
            }
        }

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(params.ffmpeg_args());
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| self.map_spawn_error(e))?;
        let guard = self.manager.track_encoder();
        let stdin = child.stdin.take();
        let (stderr_tail, stderr_thread) = spawn_stderr_reader(&mut child);

        Ok(Box::new(FfmpegSession {
            child: Some(child),
            stdin,
            stderr_tail,
            stderr_thread,
            _guard: guard,
        }))
    }

    fn concat(&self, inputs: &[PathBuf], list_file: &Path, output: &Path) -> Result<(), EncoderError> {
        if inputs.is_empty() {
            return Err(EncoderError::NoSegments);
        }
        write_concat_list(inputs, list_file)?;

        let args: Vec<OsString> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list_file.as_os_str().to_owned(),
            "-c".into(),
            "copy".into(),
            "-y".into(),
            output.as_os_str().to_owned(),
        ];
        log::info!("Concatenating {} segments into {}", inputs.len(), output.display());
        self.run_one_shot(args, "concatenation")
    }

    fn mux_audio(&self, video: &Path, audio: &AudioRange, output: &Path) -> Result<(), EncoderError> {
        let args: Vec<OsString> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
            video.as_os_str().to_owned(),
            "-ss".into(),
            format!("{:.6}", audio.start_sec).into(),
            "-to".into(),
            format!("{:.6}", audio.end_sec).into(),
            "-i".into(),
            audio.source.as_os_str().to_owned(),
            "-c".into(),
            "copy".into(),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "1:a:0?".into(),
            "-shortest".into(),
            "-y".into(),
            output.as_os_str().to_owned(),
        ];
        log::info!("Adding audio to {}", output.display());
        self.run_one_shot(args, "audio merge")
    }

    fn live_sessions(&self) -> usize {
        self.manager.live_encoders()
    }
}

struct FfmpegSession {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stderr_tail: Arc<Mutex<Vec<String>>>,
    stderr_thread: Option<JoinHandle<()>>,
    _guard: EncoderProcessGuard,
}

impl EncoderSession for FfmpegSession {
    fn write_frame(&mut self, bytes: &[u8]) -> Result<(), EncoderError> {
        let stdin = self.stdin.as_mut().ok_or(EncoderError::Closed)?;
        stdin.write_all(bytes).map_err(EncoderError::Write)
    }

    fn finish(mut self: Box<Self>, timeout: Duration) -> Result<(), EncoderError> {
        // EOF on stdin tells ffmpeg to flush and write the trailer
        drop(self.stdin.take());

        let mut child = match self.child.take() {
            Some(child) => child,
            None => return Ok(()),
        };
        let status = wait_with_timeout(&mut child, timeout);

        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }

        let status = status?;
        if status.success() {
            Ok(())
        } else {
            let stderr = self.stderr_tail.lock().join("\n");
            Err(EncoderError::ProcessFailed {
                status: status.to_string(),
                stderr,
            })
        }
    }
}

impl Drop for FfmpegSession {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            log::warn!("Encoder session dropped without finish, killing process");
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<std::process::ExitStatus, EncoderError> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if started.elapsed() >= timeout {
            log::warn!("Encoder did not terminate within {:?}, killing", timeout);
            let _ = child.kill();
            let _ = child.wait();
            return Err(EncoderError::Timeout(timeout));
        }
        thread::sleep(Duration::from_millis(20));
    }
}

fn spawn_stderr_reader(child: &mut Child) -> (Arc<Mutex<Vec<String>>>, Option<JoinHandle<()>>) {
    let tail: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let tail_for_thread = Arc::clone(&tail);

    let handle = child.stderr.take().map(|stderr| {
        thread::spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(content) => {
                        let trimmed = content.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        log::debug!("ffmpeg: {}", trimmed);
                        let mut lines = tail_for_thread.lock();
                        if lines.len() >= STDERR_TAIL_LINES {
                            lines.remove(0);
                        }
                        lines.push(trimmed.to_string());
                    }
                    Err(e) => {
                        log::warn!("Failed to read FFmpeg stderr: {}", e);
                        break;
                    }
                }
            }
        })
    });

    (tail, handle)
}

/// Concat demuxer list: one `file '<path>'` line per input, absolute paths
/// with forward slashes.
pub fn write_concat_list(inputs: &[PathBuf], list_file: &Path) -> Result<(), EncoderError> {
    let mut content = String::new();
    for input in inputs {
        let absolute = if input.is_absolute() {
            input.clone()
        } else {
            std::env::current_dir()?.join(input)
        };
        let formatted = absolute.to_string_lossy().replace('\\', "/").replace('\'', "'\\''");
        content.push_str(&format!("file '{}'\n", formatted));
    }
    std::fs::write(list_file, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{solid_frame, MockEncoderBackend};

    fn params(output: &Path) -> EncoderParams {
        EncoderParams {
            output: output.to_path_buf(),
            width: 4,
            height: 2,
            fps: 10.0,
            audio: Some(AudioRange {
                source: PathBuf::from("/media/in.mp4"),
                start_sec: 2.0,
                end_sec: 3.0,
            }),
            crf: 18,
        }
    }

    fn as_strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn test_segment_args_include_audio_range() {
        let args = as_strings(&params(Path::new("/tmp/segment_000.mp4")).ffmpeg_args());
        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo -pix_fmt rgb24 -s 4x2 -r 10 -i pipe:0"));
        assert!(joined.contains("-ss 2.000000 -to 3.000000 -i /media/in.mp4"));
        assert!(joined.contains("-map 0:v:0 -map 1:a:0?"));
        assert!(joined.contains("-crf 18"));
        assert!(joined.contains("-shortest"));
        assert_eq!(args.last().unwrap(), "/tmp/segment_000.mp4");
    }

    #[test]
    fn test_video_only_args() {
        let mut p = params(Path::new("out.mp4"));
        p.audio = None;
        let args = as_strings(&p.ffmpeg_args());
        assert!(!args.iter().any(|a| a == "-shortest"));
        assert!(!args.iter().any(|a| a == "1:a:0?"));
    }

    #[test]
    fn test_concat_list_format() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("list.txt");
        let inputs = vec![PathBuf::from("/a/seg 0.mp4"), PathBuf::from("/a/it's.mp4")];
        write_concat_list(&inputs, &list).unwrap();

        let content = std::fs::read_to_string(&list).unwrap();
        assert_eq!(content, "file '/a/seg 0.mp4'\nfile '/a/it'\\''s.mp4'\n");
    }

    #[test]
    fn test_handle_rejects_wrong_frame_size() {
        let backend = MockEncoderBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let mut handle = EncoderHandle::open(&backend, params(&dir.path().join("a.mp4")), Duration::from_secs(1)).unwrap();

        let err = handle.write_frame(&solid_frame(0, 8, 8, 10.0)).unwrap_err();
        assert!(matches!(err, EncoderError::FrameSize { .. }));
        handle.write_frame(&solid_frame(1, 4, 2, 10.0)).unwrap();
        assert_eq!(handle.frames_written(), 1);
        assert_eq!(handle.frames_dropped(), 1);
        handle.close().unwrap();
        assert_eq!(backend.live_sessions(), 0);
    }

    #[test]
    fn test_broken_pipe_stops_further_writes() {
        let backend = MockEncoderBackend::new();
        backend.break_pipe_after(1);
        let dir = tempfile::tempdir().unwrap();
        let mut handle = EncoderHandle::open(&backend, params(&dir.path().join("b.mp4")), Duration::from_secs(1)).unwrap();

        handle.write_frame(&solid_frame(0, 4, 2, 10.0)).unwrap();
        let err = handle.write_frame(&solid_frame(1, 4, 2, 10.0)).unwrap_err();
        assert!(err.is_broken_pipe());
        assert!(handle.is_input_closed());
        assert!(matches!(handle.write_frame(&solid_frame(2, 4, 2, 10.0)), Err(EncoderError::Closed)));
        assert_eq!(backend.write_attempts(), 2);
    }

    #[test]
    fn test_drop_releases_session() {
        let backend = MockEncoderBackend::new();
        let dir = tempfile::tempdir().unwrap();
        {
            let mut handle = EncoderHandle::open(&backend, params(&dir.path().join("c.mp4")), Duration::from_secs(1)).unwrap();
            handle.write_frame(&solid_frame(0, 4, 2, 10.0)).unwrap();
            assert_eq!(backend.live_sessions(), 1);
        }
        assert_eq!(backend.live_sessions(), 0);
        assert!(dir.path().join("c.mp4").exists());
    }

    /// Executable shell script standing in for the ffmpeg binary.
    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-ffmpeg.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_encoder_reports_exit_status_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_ffmpeg(dir.path(), "cat > /dev/null\necho 'simulated encoder failure' >&2\nexit 3");
        let backend = FfmpegEncoder::new(script, FFmpegManager::new());

        let mut handle =
            EncoderHandle::open(&backend, params(&dir.path().join("e.mp4")), Duration::from_secs(10)).unwrap();
        assert_eq!(backend.live_sessions(), 1);
        handle.write_frame(&solid_frame(0, 4, 2, 10.0)).unwrap();

        match handle.close() {
            Err(EncoderError::ProcessFailed { status, stderr }) => {
                assert!(status.contains('3'), "unexpected status {}", status);
                assert_eq!(stderr, "simulated encoder failure");
            }
            other => panic!("expected ProcessFailed, got {:?}", other),
        }
        assert_eq!(backend.live_sessions(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_stuck_encoder_is_killed_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_ffmpeg(dir.path(), "exec sleep 30");
        let backend = FfmpegEncoder::new(script, FFmpegManager::new());

        let handle = EncoderHandle::open(&backend, params(&dir.path().join("f.mp4")), Duration::from_secs(10)).unwrap();
        let started = Instant::now();
        let result = handle.close_with_timeout(Duration::from_millis(200));

        assert!(matches!(result, Err(EncoderError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(backend.live_sessions(), 0);
    }

    #[test]
    fn test_missing_ffmpeg_spawn_error() {
        let backend = FfmpegEncoder::new(PathBuf::from("/definitely/not/ffmpeg"), FFmpegManager::new());
        let dir = tempfile::tempdir().unwrap();
        let result = backend.open(&params(&dir.path().join("d.mp4")));
        assert!(matches!(result, Err(EncoderError::Spawn(_))));
        assert_eq!(backend.live_sessions(), 0);
    }
}
