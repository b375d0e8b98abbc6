use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

/// Naming overrides supplied by a job; plain recordings use the defaults.
#[derive(Debug, Clone, Default)]
pub struct OutputNaming {
    pub job_name: Option<String>,
    pub use_job_name_for_output: bool,
    pub output_file_name: Option<String>,
}

/// Final recording path inside `output_dir`.
///
/// Precedence: explicit file name, then job name (when enabled), then
/// `<media stem>_<timestamp>`. The extension is always `.mp4`.
pub fn resolve_output_path(media_path: &Path, output_dir: &Path, naming: &OutputNaming) -> PathBuf {
    resolve_output_path_at(media_path, output_dir, naming, Local::now())
}

pub fn resolve_output_path_at(
    media_path: &Path,
    output_dir: &Path,
    naming: &OutputNaming,
    now: DateTime<Local>,
) -> PathBuf {
    let explicit = naming
        .output_file_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty());

    let job = naming
        .job_name
        .as_deref()
        .map(str::trim)
        .filter(|name| naming.use_job_name_for_output && !name.is_empty());

    let stem = match explicit.or(job) {
        Some(name) => sanitize_file_stem(name.strip_suffix(".mp4").unwrap_or(name)),
        None => {
            let media_stem = media_path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("recording");
            format!("{}_{}", media_stem, timestamp_suffix(now))
        }
    };

    output_dir.join(format!("{}.mp4", stem))
}

pub fn timestamp_suffix(now: DateTime<Local>) -> String {
    now.format("%Y_%m_%d_%H_%M_%S").to_string()
}

fn sanitize_file_stem(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}
