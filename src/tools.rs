//! External collaborators: ffprobe, ffmpeg, the upscaling engine and the
//! desktop notifier.
//!
//! The pipeline only talks to them through [`MediaTools`], so tests can swap
//! in a scripted implementation. Argument vectors are built by plain functions
//! and can be checked without any binary installed.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command as ProcCommand, Stdio};
use std::thread;

use tracing::debug;

use crate::encoder_progress;
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::frames::{frame_pattern, FRAME_EXTENSION};
use crate::monitor::{BackgroundTask, ChildTask, TaskExit};
use crate::probe::{self, SourceInfo};
use crate::progress::ProgressSink;
use crate::workspace::Workspace;
use crate::{AppConfig, EncoderOptions, Job, UpscaleOptions};

/// Lines of captured stderr kept for error messages.
const STDERR_TAIL_LINES: usize = 20;

/// Result of a blocking tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub exit: TaskExit,
    /// Captured standard error, may be empty
    pub stderr: String,
}

impl ToolOutput {
    pub fn success() -> Self {
        Self {
            exit: TaskExit::code(0),
            stderr: String::new(),
        }
    }

    /// Last few lines of stderr, for error messages.
    pub fn stderr_tail(&self) -> String {
        let lines: Vec<&str> = self.stderr.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
        lines[start..].join("\n")
    }
}

/// Everything the final encode needs.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeRequest {
    /// printf-style pattern of the normalized frames
    pub frames: PathBuf,
    pub frame_rate: f64,
    /// Audio sidecar, `None` for a video-only output
    pub audio: Option<PathBuf>,
    /// Frame count the progress bar is measured against
    pub total_frames: usize,
    pub output: PathBuf,
}

/// Desktop notification contents.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Finished { output: PathBuf },
    Failed { message: String },
}

/// The external tools the pipeline drives.
pub trait MediaTools {
    fn probe(&self, input: &Path) -> PipelineResult<SourceInfo>;

    /// Decode `job.input` into `<workspace>/in/%08d.png`, blocking.
    fn extract_frames(&self, job: &Job, workspace: &Workspace) -> PipelineResult<ToolOutput>;

    /// Copy the first audio stream into the workspace sidecar, blocking.
    fn extract_audio(&self, job: &Job, workspace: &Workspace) -> PipelineResult<ToolOutput>;

    /// Start the engine on `in/ -> out/` and return immediately.
    fn launch_engine(&self, job: &Job, workspace: &Workspace) -> PipelineResult<Box<dyn BackgroundTask>>;

    /// Encode the final output, feeding any progress stream into `sink`.
    fn encode(&self, job: &Job, request: &EncodeRequest, sink: &mut dyn ProgressSink) -> PipelineResult<ToolOutput>;

    /// Best effort; failures must not surface.
    fn notify(&self, notice: &Notice);
}

/// [`MediaTools`] backed by real executables.
#[derive(Debug, Clone)]
pub struct SystemTools {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub notifier: String,
}

impl Default for SystemTools {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl SystemTools {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg.clone(),
            ffprobe: config.ffprobe.clone(),
            notifier: config.notifier.clone(),
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Arguments that decode `input` into a zero-based frame sequence.
pub fn extract_frames_args(input: &Path, sampling_rate: Option<&str>, in_dir: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".into(), "-loglevel".into(), "error".into()];
    args.push("-i".into());
    args.push(path_arg(input));
    args.extend(["-map".into(), "0:v:0".into()]);
    if let Some(rate) = sampling_rate {
        args.push("-vf".into());
        args.push(format!("fps={}", rate));
    }
    args.extend(["-start_number".into(), "0".into()]);
    args.push(path_arg(&frame_pattern(in_dir)));
    args
}

/// Arguments that copy the first audio stream without re-encoding.
pub fn extract_audio_args(input: &Path, audio: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-loglevel".into(),
        "error".into(),
        "-i".into(),
        path_arg(input),
        "-map".into(),
        "0:a:0".into(),
        "-vn".into(),
        "-c:a".into(),
        "copy".into(),
        path_arg(audio),
    ]
}

/// Arguments for an ncnn-vulkan style engine.
pub fn engine_args(options: &UpscaleOptions, in_dir: &Path, out_dir: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-i".into(),
        path_arg(in_dir),
        "-o".into(),
        path_arg(out_dir),
        "-n".into(),
        options.noise.to_string(),
        "-s".into(),
        options.scale.to_string(),
        "-t".into(),
        options.block_size.to_string(),
        "-j".into(),
        format!("1:{}:2", options.workers),
        "-f".into(),
        FRAME_EXTENSION.into(),
    ];
    if let Some(model) = &options.model {
        args.push("-m".into());
        args.push(path_arg(model));
    }
    args
}

/// Arguments that mux the frame sequence and optional audio into the output.
pub fn encode_args(options: &EncoderOptions, request: &EncodeRequest) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".into(), "-loglevel".into(), "error".into()];
    if options.progress {
        args.extend(["-progress".into(), "pipe:1".into(), "-nostats".into()]);
    }
    args.extend([
        "-framerate".into(),
        format!("{}", request.frame_rate),
        "-start_number".into(),
        "0".into(),
        "-i".into(),
        path_arg(&request.frames),
    ]);
    if let Some(audio) = &request.audio {
        args.push("-i".into());
        args.push(path_arg(audio));
    }
    args.extend(["-map".into(), "0:v:0".into()]);
    if request.audio.is_some() {
        // optional so a sidecar without a usable stream cannot fail the mux
        args.extend(["-map".into(), "1:a?".into(), "-c:a".into(), "copy".into()]);
    }
    args.extend([
        "-c:v".into(),
        options.codec.ffmpeg_name().into(),
        options.codec.quality_flag().into(),
        options.quality.to_string(),
        "-preset".into(),
        options.preset.clone(),
        "-pix_fmt".into(),
        "yuv420p".into(),
    ]);
    args.push(path_arg(&request.output));
    args
}

/// Arguments for `notify-send`.
pub fn notify_args(notice: &Notice) -> Vec<String> {
    let (urgency, title, body) = match notice {
        Notice::Finished { output } => ("normal", "Upscaling finished", output.display().to_string()),
        Notice::Failed { message } => ("critical", "Upscaling failed", message.clone()),
    };
    vec![
        "-u".into(),
        urgency.into(),
        "-a".into(),
        "vidscale".into(),
        title.into(),
        body,
    ]
}

fn spawn_error(stage: Stage, program: &str, e: std::io::Error) -> PipelineError {
    PipelineError::stage(stage, format!("running {}: {}", program, e))
}

/// Run to completion with stdout discarded and stderr captured.
fn run_blocking(program: &str, args: &[String], stage: Stage) -> PipelineResult<ToolOutput> {
    debug!(cmd = program, ?args, %stage, "running");
    let output = ProcCommand::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| spawn_error(stage, program, e))?;

    Ok(ToolOutput {
        exit: output.status.into(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

impl MediaTools for SystemTools {
    fn probe(&self, input: &Path) -> PipelineResult<SourceInfo> {
        probe::probe_source(&self.ffprobe, input)
    }

    fn extract_frames(&self, job: &Job, workspace: &Workspace) -> PipelineResult<ToolOutput> {
        let args = extract_frames_args(&job.input, job.sampling_rate.as_deref(), &workspace.input_dir());
        run_blocking(&self.ffmpeg, &args, Stage::Extracting)
    }

    fn extract_audio(&self, job: &Job, workspace: &Workspace) -> PipelineResult<ToolOutput> {
        let args = extract_audio_args(&job.input, &workspace.audio_path());
        run_blocking(&self.ffmpeg, &args, Stage::Extracting)
    }

    fn launch_engine(&self, job: &Job, workspace: &Workspace) -> PipelineResult<Box<dyn BackgroundTask>> {
        let options = &job.upscale;
        let args = engine_args(options, &workspace.input_dir(), &workspace.output_dir());
        // engine chatter would tear the progress line; keep it with the workspace
        let log = File::create(workspace.engine_log_path())?;
        debug!(cmd = %options.engine, ?args, "launching engine");

        let child = ProcCommand::new(&options.engine)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .spawn()
            .map_err(|e| spawn_error(Stage::Upscaling, &options.engine, e))?;

        Ok(Box::new(ChildTask::new(child)))
    }

    fn encode(&self, job: &Job, request: &EncodeRequest, sink: &mut dyn ProgressSink) -> PipelineResult<ToolOutput> {
        let args = encode_args(&job.encoder, request);
        if !job.encoder.progress {
            return run_blocking(&self.ffmpeg, &args, Stage::Assembling);
        }

        debug!(cmd = %self.ffmpeg, ?args, "encoding with progress stream");
        let mut child = ProcCommand::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(Stage::Assembling, &self.ffmpeg, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::stage(Stage::Assembling, "encoder stdout unavailable"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| PipelineError::stage(Stage::Assembling, "encoder stderr unavailable"))?;

        // Drained on its own thread so a chatty encoder never blocks on a full pipe.
        let stderr_reader = thread::spawn(move || {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text);
            text
        });

        let tracked = encoder_progress::track(BufReader::new(stdout), request.total_frames, sink);
        let status = child.wait()?;
        let stderr = stderr_reader.join().unwrap_or_default();
        if let Err(e) = tracked {
            debug!("encoder progress stream ended early: {}", e);
        }

        Ok(ToolOutput {
            exit: status.into(),
            stderr,
        })
    }

    fn notify(&self, notice: &Notice) {
        let result = ProcCommand::new(&self.notifier)
            .args(notify_args(notice))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match result {
            Ok(status) if !status.success() => debug!(%status, "notifier exited unsuccessfully"),
            Err(e) => debug!("notifier unavailable: {}", e),
            _ => {}
        }
    }
}
