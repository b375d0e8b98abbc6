use image::RgbImage;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use thiserror::Error;

use super::processor::{MediaInfo, VideoProcessor};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("end of stream at frame {0}")]
    EndOfStream(u64),
    #[error("failed to decode frame {index}: {reason}")]
    Decode { index: u64, reason: String },
    #[error("cannot seek to frame {index}: {reason}")]
    Seek { index: u64, reason: String },
    #[error("failed to start decoder: {0}")]
    Spawn(String),
    #[error("failed to probe media: {0}")]
    Probe(String),
}

/// Seekable decoded-frame reader.
pub trait MediaSource: Send {
    /// Read the frame at the current position and advance by one.
    fn read(&mut self) -> Result<RgbImage, SourceError>;
    fn seek(&mut self, index: u64) -> Result<(), SourceError>;
    fn frame_count(&self) -> u64;
    fn fps(&self) -> f64;
    /// Original media file, used as the audio input when encoding.
    fn media_path(&self) -> Option<&Path> {
        None
    }
    /// Live captures have no end and cannot seek.
    fn is_live(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
enum SourceInput {
    File(PathBuf),
    Capture { format: String, device: String },
}

/// Frames decoded by an ffmpeg child writing rgb24 to its stdout.
pub struct FfmpegSource {
    ffmpeg: PathBuf,
    input: SourceInput,
    info: MediaInfo,
    process: Option<Child>,
    stdout: Option<ChildStdout>,
    position: u64,
}

impl FfmpegSource {
    pub fn open(ffmpeg: &Path, ffprobe: &Path, path: &Path) -> Result<Self, SourceError> {
        let info = VideoProcessor::get_media_info(ffprobe, path)
            .map_err(|e| SourceError::Probe(e.to_string()))?;
        if info.fps <= 0.0 {
            log::warn!("Video source reported invalid FPS, using fallback 30");
        }
        let info = MediaInfo {
            fps: if info.fps > 0.0 { info.fps } else { 30.0 },
            ..info
        };
        log::info!(
            "Opened {}: {}x{} @ {:.3} fps, {} frames, audio: {}",
            path.display(),
            info.width,
            info.height,
            info.fps,
            info.frame_count,
            info.has_audio
        );

        Ok(Self {
            ffmpeg: ffmpeg.to_path_buf(),
            input: SourceInput::File(path.to_path_buf()),
            info,
            process: None,
            stdout: None,
            position: 0,
        })
    }

    /// Live device such as `-f v4l2 /dev/video0` or `-f dshow video=...`.
    pub fn open_capture(
        ffmpeg: &Path,
        format: &str,
        device: &str,
        width: u32,
        height: u32,
        fps: f64,
    ) -> Self {
        Self {
            ffmpeg: ffmpeg.to_path_buf(),
            input: SourceInput::Capture {
                format: format.to_string(),
                device: device.to_string(),
            },
            info: MediaInfo {
                width,
                height,
                fps: if fps > 0.0 { fps } else { 30.0 },
                frame_count: u64::MAX,
                duration: f64::INFINITY,
                has_audio: false,
            },
            process: None,
            stdout: None,
            position: 0,
        }
    }

    pub fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn frame_len(&self) -> usize {
        self.info.width as usize * self.info.height as usize * 3
    }

    fn start_decoder(&mut self) -> Result<(), SourceError> {
        self.kill_decoder();

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-hide_banner").arg("-loglevel").arg("error").arg("-nostdin");

        match &self.input {
            SourceInput::File(path) => {
                let start_time = self.position as f64 / self.info.fps;
                cmd.arg("-ss").arg(format!("{:.6}", start_time));
                cmd.arg("-i").arg(path);
            }
            SourceInput::Capture { format, device } => {
                cmd.arg("-f").arg(format);
                cmd.arg("-video_size").arg(format!("{}x{}", self.info.width, self.info.height));
                cmd.arg("-framerate").arg(format!("{}", self.info.fps));
                cmd.arg("-i").arg(device);
            }
        }

        cmd.arg("-map").arg("0:v:0");
        cmd.arg("-f").arg("rawvideo");
        cmd.arg("-pix_fmt").arg("rgb24");
        cmd.arg("-s").arg(format!("{}x{}", self.info.width, self.info.height));
        cmd.arg("pipe:1");

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());

        let mut process = cmd
            .spawn()
            .map_err(|e| SourceError::Spawn(format!("{}: {}", self.ffmpeg.display(), e)))?;
        self.stdout = process.stdout.take();
        self.process = Some(process);
        log::debug!("Decoder started at frame {}", self.position);
        Ok(())
    }

    fn kill_decoder(&mut self) {
        self.stdout = None;
        if let Some(mut process) = self.process.take() {
            log::debug!("Killing decoder process");
            let _ = process.kill();
            let _ = process.wait();
        }
    }
}

impl MediaSource for FfmpegSource {
    fn read(&mut self) -> Result<RgbImage, SourceError> {
        let index = self.position;
        if !self.is_live() && index >= self.info.frame_count {
            return Err(SourceError::EndOfStream(index));
        }
        if self.stdout.is_none() {
            self.start_decoder()?;
        }

        let mut buffer = vec![0u8; self.frame_len()];
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| SourceError::Spawn("decoder has no stdout".to_string()))?;

        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                self.position += 1;
                RgbImage::from_raw(self.info.width, self.info.height, buffer).ok_or_else(|| {
                    SourceError::Decode {
                        index,
                        reason: "frame buffer size mismatch".to_string(),
                    }
                })
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.kill_decoder();
                Err(SourceError::EndOfStream(index))
            }
            Err(e) => {
                self.kill_decoder();
                Err(SourceError::Decode {
                    index,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn seek(&mut self, index: u64) -> Result<(), SourceError> {
        if self.is_live() {
            return Err(SourceError::Seek {
                index,
                reason: "live capture cannot seek".to_string(),
            });
        }
        if index == self.position && self.stdout.is_some() {
            return Ok(());
        }
        // The decoder restarts lazily on the next read
        self.kill_decoder();
        self.position = index;
        Ok(())
    }

    fn frame_count(&self) -> u64 {
        self.info.frame_count
    }

    fn fps(&self) -> f64 {
        self.info.fps
    }

    fn media_path(&self) -> Option<&Path> {
        match &self.input {
            SourceInput::File(path) => Some(path),
            SourceInput::Capture { .. } => None,
        }
    }

    fn is_live(&self) -> bool {
        matches!(self.input, SourceInput::Capture { .. })
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.kill_decoder();
    }
}
