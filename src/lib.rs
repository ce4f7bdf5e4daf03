//! # vidscale - video upscaling pipeline
//!
//! `vidscale` upscales a video by splitting it into frames, running an
//! external super-resolution engine (waifu2x/Real-ESRGAN style ncnn-vulkan
//! binaries) over them, and muxing the result back together with the original
//! audio.
//!
//! ## Pipeline
//!
//! 1. Extract frames into `<workspace>/in/%08d.png` and copy the audio stream
//!    into `<workspace>/audio.mka`.
//! 2. Launch the engine in the background and watch `<workspace>/out` fill up.
//! 3. Rename whatever the engine produced into a dense `%08d.png` sequence.
//! 4. Encode the frames and audio into the output file.
//!
//! The workspace is removed when the run ends, unless the run failed and
//! [`Job::keep_workspace`] asks for it to be kept, in which case a later run
//! can resume from it.
//!
//! ## Example
//!
//! ```no_run
//! use vidscale::{AppConfig, CancelFlag, Job, Pipeline, ResumePolicy, SystemTools};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::default();
//! let job = Job::from_config(Path::new("clip.mp4"), &config);
//! let tools = SystemTools::from_config(&config);
//! let report = Pipeline::new(&job, &tools, CancelFlag::new()).run(ResumePolicy::Never, |_| Ok(false))?;
//! println!("wrote {} frames to {}", report.frames, report.output.display());
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub mod encoder_progress;
pub mod error;
pub mod frames;
pub mod monitor;
pub mod pipeline;
pub mod probe;
pub mod progress;
pub mod tools;
pub mod workspace;

pub use error::{PipelineError, PipelineResult, PipelineWarning, Stage};
pub use monitor::{BackgroundTask, CancelFlag, Monitor, TaskExit};
pub use pipeline::{JobPhase, Pipeline, RunReport};
pub use progress::{ProgressLine, ProgressSample, ProgressSink};
pub use tools::{EncodeRequest, MediaTools, Notice, SystemTools, ToolOutput};
pub use workspace::{JobState, ResumePolicy, Workspace, WorkspaceGuard};

/// Scale factors the engine accepts.
pub const SUPPORTED_SCALES: &[u32] = &[1, 2, 4, 8, 16, 32];

/// Video codec for the final encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    Libx264,
    Libx265,
    H264Nvenc,
    HevcNvenc,
}

impl VideoCodec {
    /// Name passed to ffmpeg's `-c:v`.
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            VideoCodec::Libx264 => "libx264",
            VideoCodec::Libx265 => "libx265",
            VideoCodec::H264Nvenc => "h264_nvenc",
            VideoCodec::HevcNvenc => "hevc_nvenc",
        }
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self, VideoCodec::H264Nvenc | VideoCodec::HevcNvenc)
    }

    /// ffmpeg option carrying the constant-quality value.
    pub fn quality_flag(&self) -> &'static str {
        if self.is_hardware() {
            "-cq"
        } else {
            "-crf"
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ffmpeg_name())
    }
}

impl FromStr for VideoCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "libx264" | "x264" | "h264" => Ok(VideoCodec::Libx264),
            "libx265" | "x265" | "hevc" => Ok(VideoCodec::Libx265),
            "h264_nvenc" | "nvenc" => Ok(VideoCodec::H264Nvenc),
            "hevc_nvenc" => Ok(VideoCodec::HevcNvenc),
            other => Err(format!(
                "unknown codec '{}', expected one of libx264, libx265, h264_nvenc, hevc_nvenc",
                other
            )),
        }
    }
}

/// Parameters handed to the upscaling engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpscaleOptions {
    /// Engine executable, looked up in `PATH`
    pub engine: String,
    /// Scale factor
    pub scale: u32,
    /// Denoise level (-1 disables denoising)
    pub noise: i32,
    /// Tile size in pixels, 0 lets the engine pick
    pub block_size: u32,
    /// Processing threads
    pub workers: u32,
    /// Model directory, engine default when unset
    pub model: Option<PathBuf>,
}

impl Default for UpscaleOptions {
    fn default() -> Self {
        Self {
            engine: "waifu2x-ncnn-vulkan".to_string(),
            scale: 2,
            noise: 0,
            block_size: 0,
            workers: 2,
            model: None,
        }
    }
}

impl UpscaleOptions {
    pub fn with_scale(mut self, scale: u32) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_noise(mut self, noise: i32) -> Self {
        self.noise = noise;
        self
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_workers(mut self, workers: u32) -> Self {
        self.workers = workers;
        self
    }
}

/// Parameters for the final encode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderOptions {
    pub codec: VideoCodec,
    /// CRF for software codecs, CQ for hardware codecs
    pub quality: u8,
    pub preset: String,
    /// Ask the encoder for a `key=value` progress stream
    pub progress: bool,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            codec: VideoCodec::Libx264,
            quality: 18,
            preset: "slow".to_string(),
            progress: true,
        }
    }
}

/// Application configuration, usually read from `config.toml`.
///
/// Every field has a default, so a partial file is fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Extraction rate such as `"12"` or `"24000/1001"`; native rate when unset
    pub sampling_rate: Option<String>,
    /// Extension of the derived output file
    pub container: String,
    /// Parent directory for workspaces, system temp dir when unset
    pub workspace_dir: Option<PathBuf>,
    pub keep_workspace: bool,
    pub notify: bool,
    /// Upper bound on the upscaling stage, unlimited when unset
    pub engine_timeout_secs: Option<u64>,
    pub ffmpeg: String,
    pub ffprobe: String,
    pub notifier: String,
    pub upscale: UpscaleOptions,
    pub encoder: EncoderOptions,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sampling_rate: None,
            container: "mkv".to_string(),
            workspace_dir: None,
            keep_workspace: false,
            notify: true,
            engine_timeout_secs: None,
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            notifier: "notify-send".to_string(),
            upscale: UpscaleOptions::default(),
            encoder: EncoderOptions::default(),
        }
    }
}

/// One upscaling run. Built once at startup and never changed afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub input: PathBuf,
    pub output: PathBuf,
    pub workspace_root: PathBuf,
    /// Extraction rate expression; the source's native rate when `None`
    pub sampling_rate: Option<String>,
    pub upscale: UpscaleOptions,
    pub encoder: EncoderOptions,
    /// Keep the workspace when the run fails or is interrupted
    pub keep_workspace: bool,
    pub notify: bool,
    pub engine_timeout: Option<Duration>,
}

fn input_stem(input: &Path) -> &str {
    input.file_stem().and_then(|s| s.to_str()).unwrap_or("video")
}

impl Job {
    /// Build a job for `input` from configuration defaults.
    ///
    /// The output lands next to the input as `<stem>_upscaled.<container>`,
    /// the workspace at `<workspace_dir>/vidscale-<stem>`.
    pub fn from_config(input: &Path, config: &AppConfig) -> Self {
        let stem = input_stem(input);
        let parent = input.parent().unwrap_or(Path::new("."));
        let output = parent.join(format!("{}_upscaled.{}", stem, config.container));
        let workspace_parent = config.workspace_dir.clone().unwrap_or_else(std::env::temp_dir);
        let workspace_root = workspace_parent.join(format!("vidscale-{}", stem));

        Self {
            input: input.to_path_buf(),
            output,
            workspace_root,
            sampling_rate: config.sampling_rate.clone(),
            upscale: config.upscale.clone(),
            encoder: config.encoder.clone(),
            keep_workspace: config.keep_workspace,
            notify: config.notify,
            engine_timeout: config.engine_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn with_output(mut self, output: PathBuf) -> Self {
        self.output = output;
        self
    }

    pub fn with_workspace(mut self, root: PathBuf) -> Self {
        self.workspace_root = root;
        self
    }

    /// Check parameters and the input file. Has no side effects.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.input.as_os_str().is_empty() {
            return Err(PipelineError::Usage("missing input video".into()));
        }
        if !self.input.is_file() {
            return Err(PipelineError::InputNotFound(self.input.clone()));
        }
        if !SUPPORTED_SCALES.contains(&self.upscale.scale) {
            return Err(PipelineError::Usage(format!(
                "scale must be one of {:?}, got {}",
                SUPPORTED_SCALES, self.upscale.scale
            )));
        }
        if !(-1..=3).contains(&self.upscale.noise) {
            return Err(PipelineError::Usage(format!(
                "noise level must be between -1 and 3, got {}",
                self.upscale.noise
            )));
        }
        if self.upscale.workers == 0 {
            return Err(PipelineError::Usage("worker count must be at least 1".into()));
        }
        if self.encoder.quality > 51 {
            return Err(PipelineError::Usage(format!(
                "quality must be between 0 and 51, got {}",
                self.encoder.quality
            )));
        }
        if let Some(rate) = &self.sampling_rate {
            if probe::parse_frame_rate(rate).is_none() {
                return Err(PipelineError::Usage(format!("invalid sampling rate '{}'", rate)));
            }
        }
        if self.output == self.input {
            return Err(PipelineError::Usage("output would overwrite the input".into()));
        }
        Ok(())
    }
}
