//! Source inspection and frame-rate handling.

use std::path::Path;
use std::process::{Command as ProcCommand, Stdio};

use serde::Deserialize;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult, PipelineWarning, Stage};

/// Playback rate used when the source rate is missing or unusable.
pub const DEFAULT_FRAME_RATE: f64 = 30.0;

/// What the pipeline needs to know about the input before it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceInfo {
    /// Rate expression of the first video stream, e.g. `30000/1001`.
    pub frame_rate: String,
    /// Whether the container carries at least one audio stream.
    pub has_audio: bool,
}

/// Parse a rate expression such as `30`, `29.97` or `30000/1001`.
///
/// Returns `None` for anything that is not a finite, positive rate.
pub fn parse_frame_rate(expression: &str) -> Option<f64> {
    let expression = expression.trim();
    let rate = match expression.split_once('/') {
        Some((num, den)) => {
            let num = num.trim().parse::<f64>().ok()?;
            let den = den.trim().parse::<f64>().ok()?;
            num / den
        }
        None => expression.parse::<f64>().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

/// Parse a rate expression, falling back to [`DEFAULT_FRAME_RATE`].
///
/// The fallback is reported as a warning rather than an error.
pub fn frame_rate_or_default(expression: &str) -> (f64, Option<PipelineWarning>) {
    match parse_frame_rate(expression) {
        Some(rate) => (rate, None),
        None => (
            DEFAULT_FRAME_RATE,
            Some(PipelineWarning::FrameRateFallback {
                expression: expression.to_string(),
            }),
        ),
    }
}

/// ffprobe `-print_format json` output, reduced to what is used.
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    r_frame_rate: Option<String>,
}

pub(crate) fn ffprobe_args(input: &Path) -> Vec<String> {
    vec![
        "-v".into(),
        "error".into(),
        "-print_format".into(),
        "json".into(),
        "-show_entries".into(),
        "stream=codec_type,r_frame_rate".into(),
        input.to_string_lossy().to_string(),
    ]
}

/// Read the first video stream's rate and whether any audio stream exists.
pub(crate) fn parse_ffprobe_streams(output: &[u8]) -> PipelineResult<SourceInfo> {
    let probe: FfprobeOutput = serde_json::from_slice(output)
        .map_err(|e| PipelineError::stage(Stage::Probing, format!("unreadable ffprobe output: {}", e)))?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type == "video")
        .ok_or_else(|| PipelineError::stage(Stage::Probing, "no video stream found"))?;

    Ok(SourceInfo {
        frame_rate: video.r_frame_rate.clone().unwrap_or_default(),
        has_audio: probe.streams.iter().any(|s| s.codec_type == "audio"),
    })
}

/// Run ffprobe on `input`.
pub fn probe_source(ffprobe: &str, input: &Path) -> PipelineResult<SourceInfo> {
    let args = ffprobe_args(input);
    debug!(cmd = ffprobe, ?args, "probing source");
    let output = ProcCommand::new(ffprobe)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| PipelineError::stage(Stage::Probing, format!("running {}: {}", ffprobe, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PipelineError::stage(
            Stage::Probing,
            format!("{} exited with {}: {}", ffprobe, output.status, stderr.trim()),
        ));
    }

    parse_ffprobe_streams(&output.stdout)
}
