use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const MIN_THREADS: usize = 1;
pub const MAX_THREADS: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub num_threads: usize,
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
    pub output_directory: PathBuf,
    pub temp_directory: PathBuf,
    pub crf: u8,
    /// Only applies to plain playback; recordings always run at source fps
    pub playback_fps_override: Option<f64>,
    /// Tick interval multiplier, compensates per-tick processing latency
    pub playback_speedup: f64,
    pub encoder_close_timeout_secs: u64,
    pub abort_close_timeout_secs: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            num_threads: 2,
            ffmpeg_path: None,
            ffprobe_path: None,
            output_directory: PathBuf::from("./output"),
            temp_directory: std::env::temp_dir().join("faceswap-recorder"),
            crf: 18,
            playback_fps_override: None,
            playback_speedup: 0.8,
            encoder_close_timeout_secs: 10,
            abort_close_timeout_secs: 5,
        }
    }
}

impl RecorderConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .map_err(|e| anyhow::anyhow!("Failed to read config file at {}: {}", config_path.display(), e))?;

            match serde_json::from_str::<Self>(&content) {
                Ok(config) => {
                    log::info!("Loaded existing config from {}", config_path.display());
                    Ok(config.normalized())
                }
                Err(e) => {
                    log::warn!("Config file exists but has issues ({}), creating new one with defaults", e);
                    let new_config = Self::default();
                    new_config.save()
                        .map_err(|save_err| anyhow::anyhow!("Failed to save new config: {}", save_err))?;
                    Ok(new_config)
                }
            }
        } else {
            log::info!("No config file found, creating default config");
            let config = Self::default();
            config.save()
                .map_err(|e| anyhow::anyhow!("Failed to save default config: {}", e))?;
            log::info!("Created new config file at {}", config_path.display());
            Ok(config)
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("faceswap-recorder")
            .join("config.json")
    }

    /// Clamp values a hand-edited file may have pushed out of range.
    pub fn normalized(mut self) -> Self {
        self.num_threads = self.num_threads.clamp(MIN_THREADS, MAX_THREADS);
        if !(self.playback_speedup > 0.0 && self.playback_speedup <= 1.0) {
            log::warn!("Invalid playback_speedup {}, using 0.8", self.playback_speedup);
            self.playback_speedup = 0.8;
        }
        if let Some(fps) = self.playback_fps_override {
            if fps <= 0.0 {
                self.playback_fps_override = None;
            }
        }
        self
    }

    pub fn ffmpeg_binary(&self) -> PathBuf {
        self.ffmpeg_path.clone().unwrap_or_else(|| PathBuf::from("ffmpeg"))
    }

    pub fn ffprobe_binary(&self) -> PathBuf {
        self.ffprobe_path.clone().unwrap_or_else(|| PathBuf::from("ffprobe"))
    }

    pub fn encoder_close_timeout(&self) -> Duration {
        Duration::from_secs(self.encoder_close_timeout_secs)
    }

    pub fn abort_close_timeout(&self) -> Duration {
        Duration::from_secs(self.abort_close_timeout_secs)
    }

    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        log::debug!("Ensuring directories exist...");

        if let Err(e) = std::fs::create_dir_all(&self.output_directory) {
            log::error!("Failed to create output directory {}: {}", self.output_directory.display(), e);
            return Err(anyhow::anyhow!("Failed to create output directory {}: {}", self.output_directory.display(), e));
        }
        log::debug!("Output directory ensured: {}", self.output_directory.display());

        if let Err(e) = std::fs::create_dir_all(&self.temp_directory) {
            log::error!("Failed to create temp directory {}: {}", self.temp_directory.display(), e);
            return Err(anyhow::anyhow!("Failed to create temp directory {}: {}", self.temp_directory.display(), e));
        }
        log::debug!("Temp directory ensured: {}", self.temp_directory.display());

        Ok(())
    }
}
