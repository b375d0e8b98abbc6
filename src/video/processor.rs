use std::path::Path;
use std::process::Command;

#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: u64,
    pub duration: f64,
    pub has_audio: bool,
}

pub struct VideoProcessor;

impl VideoProcessor {
    pub fn get_media_info(ffprobe: &Path, file_path: &Path) -> anyhow::Result<MediaInfo> {
        let output = Command::new(ffprobe)
            .arg("-v").arg("quiet")
            .arg("-print_format").arg("json")
            .arg("-show_format")
            .arg("-show_streams")
            .arg(file_path)
            .output()
            .map_err(|e| anyhow::anyhow!("Failed to run {}: {}", ffprobe.display(), e))?;

        if !output.status.success() {
            return Err(anyhow::anyhow!("ffprobe failed for {}", file_path.display()));
        }

        let json_str = String::from_utf8(output.stdout)?;
        Self::parse_probe_output(&json_str)
    }

    pub fn parse_probe_output(json_str: &str) -> anyhow::Result<MediaInfo> {
        let info: serde_json::Value = serde_json::from_str(json_str)?;

        let duration = info["format"]["duration"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);

        let empty_vec = vec![];
        let streams = info["streams"].as_array().unwrap_or(&empty_vec);

        let video = streams
            .iter()
            .find(|s| s["codec_type"].as_str() == Some("video"))
            .ok_or_else(|| anyhow::anyhow!("No video stream found"))?;
        let has_audio = streams
            .iter()
            .any(|s| s["codec_type"].as_str() == Some("audio"));

        let width = video["width"].as_u64().unwrap_or(0) as u32;
        let height = video["height"].as_u64().unwrap_or(0) as u32;
        if width == 0 || height == 0 {
            return Err(anyhow::anyhow!("Video stream has no dimensions"));
        }

        let fps = video["avg_frame_rate"]
            .as_str()
            .and_then(parse_frame_rate)
            .or_else(|| video["r_frame_rate"].as_str().and_then(parse_frame_rate))
            .unwrap_or(0.0);

        let stream_duration = video["duration"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(duration);

        let frame_count = video["nb_frames"]
            .as_str()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or_else(|| (stream_duration * fps).round().max(0.0) as u64);

        Ok(MediaInfo {
            width,
            height,
            fps,
            frame_count,
            duration: stream_duration,
            has_audio,
        })
    }
}

/// Parses ffprobe rates such as `30000/1001` or `25`.
pub fn parse_frame_rate(rate: &str) -> Option<f64> {
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let num = num.trim().parse::<f64>().ok()?;
            let den = den.trim().parse::<f64>().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse::<f64>().ok()?,
    };
    (value > 0.0).then_some(value)
}
