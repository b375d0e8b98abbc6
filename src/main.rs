use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use faceswap_recorder::core::{EventBus, Frame, OutputNaming, PipelineEvent, RecorderConfig, Segment};
use faceswap_recorder::pipeline::{FrameSink, PlaybackController, PlaybackEngine};
use faceswap_recorder::video::{
    ffmpeg_available, FFmpegManager, FfmpegEncoder, FfmpegSource, FrameTransform, IdentityTransform, ResizeTransform,
};

#[derive(Parser, Debug)]
#[command(name = "faceswap-recorder")]
#[command(about = "Play, record and segment-record video through a frame transform", long_about = None)]
struct Cli {
    /// Worker threads (overrides the config file)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Path to the ffmpeg binary
    #[arg(long)]
    ffmpeg: Option<PathBuf>,

    /// Path to the ffprobe binary
    #[arg(long)]
    ffprobe: Option<PathBuf>,

    /// Output directory (overrides the config file)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Play a video through the transform
    Play {
        input: PathBuf,
        /// Resize frames to WIDTHxHEIGHT
        #[arg(long, value_parser = parse_size)]
        scale: Option<(u32, u32)>,
        /// Playback frame rate override
        #[arg(long)]
        fps: Option<f64>,
        /// First frame to play
        #[arg(long, default_value = "0")]
        start: u64,
    },
    /// Record from a frame to the end of the video
    Record {
        input: PathBuf,
        #[arg(long, value_parser = parse_size)]
        scale: Option<(u32, u32)>,
        #[arg(long, default_value = "0")]
        start: u64,
        /// Output file name (without directory)
        #[arg(long)]
        name: Option<String>,
    },
    /// Record frame ranges and join them into one file
    Segments {
        input: PathBuf,
        /// Inclusive frame range START-END, repeatable
        #[arg(long = "segment", value_parser = parse_segment, required = true)]
        segments: Vec<Segment>,
        #[arg(long, value_parser = parse_size)]
        scale: Option<(u32, u32)>,
        #[arg(long)]
        name: Option<String>,
    },
}

fn parse_size(value: &str) -> Result<(u32, u32), String> {
    let (w, h) = value
        .split_once(|c: char| c == 'x' || c == 'X')
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", value))?;
    let width = w.trim().parse::<u32>().map_err(|e| format!("invalid width: {}", e))?;
    let height = h.trim().parse::<u32>().map_err(|e| format!("invalid height: {}", e))?;
    if width == 0 || height == 0 {
        return Err("size must be non-zero".to_string());
    }
    Ok((width, height))
}

fn parse_segment(value: &str) -> Result<Segment, String> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got '{}'", value))?;
    let start = start.trim().parse::<u64>().map_err(|e| format!("invalid start: {}", e))?;
    let end = end.trim().parse::<u64>().map_err(|e| format!("invalid end: {}", e))?;
    Segment::new(start, end).map_err(|e| e.to_string())
}

/// Logs display progress once per second of video.
#[derive(Default)]
struct ProgressSink {
    presented: u64,
}

impl FrameSink for ProgressSink {
    fn present(&mut self, frame: &Frame) {
        self.presented += 1;
        if frame.timestamp.fract() < 1e-9 || self.presented == 1 {
            log::info!(
                "Frame {} ({:.2}s) {}x{}",
                frame.index,
                frame.timestamp,
                frame.width(),
                frame.height()
            );
        }
    }
}

fn build_transform(scale: Option<(u32, u32)>) -> Arc<dyn FrameTransform> {
    match scale {
        Some((width, height)) => Arc::new(ResizeTransform::new(width, height)),
        None => Arc::new(IdentityTransform),
    }
}

fn naming(name: Option<String>) -> OutputNaming {
    OutputNaming {
        output_file_name: name,
        ..OutputNaming::default()
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match RecorderConfig::load() {
        Ok(config) => config,
        Err(e) => {
            log::warn!("Using default config: {}", e);
            RecorderConfig::default()
        }
    };
    if let Some(threads) = cli.threads {
        config.num_threads = threads;
    }
    if let Some(ffmpeg) = cli.ffmpeg {
        config.ffmpeg_path = Some(ffmpeg);
    }
    if let Some(ffprobe) = cli.ffprobe {
        config.ffprobe_path = Some(ffprobe);
    }
    if let Some(dir) = cli.output_dir {
        config.output_directory = dir;
    }
    if let Command::Play { fps: Some(fps), .. } = &cli.command {
        config.playback_fps_override = Some(*fps);
    }
    let config = config.normalized();
    config.ensure_directories()?;

    let ffmpeg = config.ffmpeg_binary();
    if !ffmpeg_available(&ffmpeg) {
        anyhow::bail!("FFmpeg not found at {}. Ensure FFmpeg is installed and in system PATH", ffmpeg.display());
    }

    let (input, scale) = match &cli.command {
        Command::Play { input, scale, .. } => (input.clone(), *scale),
        Command::Record { input, scale, .. } => (input.clone(), *scale),
        Command::Segments { input, scale, .. } => (input.clone(), *scale),
    };
    let source = FfmpegSource::open(&ffmpeg, &config.ffprobe_binary(), &input)?;
    let backend = FfmpegEncoder::new(ffmpeg, FFmpegManager::new());

    let events = EventBus::new();
    let mut rx = events.subscribe();
    let engine = PlaybackEngine::new(
        config,
        Box::new(source),
        build_transform(scale),
        Box::new(ProgressSink::default()),
        Box::new(backend),
        events,
    );
    let controller = PlaybackController::spawn(engine)?;

    let (started, expects_output) = match cli.command {
        Command::Play { start, .. } => {
            if start > 0 {
                controller.seek(start);
            }
            (controller.play(), false)
        }
        Command::Record { start, name, .. } => {
            if start > 0 {
                controller.seek(start);
            }
            (controller.record(naming(name)), true)
        }
        Command::Segments { segments, name, .. } => (controller.record_segments(segments, naming(name)), true),
    };
    if !started {
        controller.shutdown();
        anyhow::bail!("The pipeline refused to start");
    }

    let mut output: Option<PathBuf> = None;
    loop {
        match rx.blocking_recv() {
            Ok(event) => {
                match &event {
                    PipelineEvent::RecordingFinished { output: produced }
                    | PipelineEvent::AllSegmentsDone { output: produced } => output = produced.clone(),
                    PipelineEvent::FrameReadError(index) => log::warn!("Could not read frame {}", index),
                    PipelineEvent::FrameTransformFailed(index) => log::warn!("Transform failed on frame {}", index),
                    PipelineEvent::EncoderError(message) => log::error!("Encoder error: {}", message),
                    other => log::info!("{:?}", other),
                }
                if event == PipelineEvent::Stopped {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => log::debug!("Skipped {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
    controller.shutdown();

    if expects_output {
        match output {
            Some(path) => println!("{}", path.display()),
            None => anyhow::bail!("Recording produced no output"),
        }
    }
    Ok(())
}
