use anyhow::{Context, Result};
use clap::Parser;
use console::Term;
use dialoguer::Confirm;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use vidscale::progress::restore_cursor;
use vidscale::{
    AppConfig, CancelFlag, Job, JobState, Pipeline, PipelineError, PipelineResult, ResumePolicy, SystemTools,
    VideoCodec,
};

fn load_config(explicit: Option<&PathBuf>) -> Result<AppConfig> {
    // An explicit path must exist; the others are optional
    if let Some(p) = explicit {
        let text = fs::read_to_string(p).with_context(|| format!("reading config {}", p.display()))?;
        return toml::from_str(&text).with_context(|| format!("parsing config {}", p.display()));
    }

    let mut tried: Vec<PathBuf> = Vec::new();
    if let Some(mut d) = dirs::config_dir() {
        d.push("vidscale");
        d.push("config.toml");
        tried.push(d);
    }
    tried.push(PathBuf::from("vidscale.toml"));

    for p in &tried {
        if p.exists() {
            let text = fs::read_to_string(p).with_context(|| format!("reading config {}", p.display()))?;
            let cfg: AppConfig =
                toml::from_str(&text).with_context(|| format!("parsing config {}", p.display()))?;
            return Ok(cfg);
        }
    }

    // Built-in defaults
    Ok(AppConfig::default())
}

#[derive(Parser, Debug)]
#[command(version, about = "Upscale a video with an external super-resolution engine.")]
struct Args {
    /// Input video file
    #[arg(env = "VIDSCALE_INPUT")]
    input: Option<PathBuf>,

    /// Output video file (default: <input>_upscaled.<container>)
    #[arg(long, short, env = "VIDSCALE_OUTPUT")]
    output: Option<PathBuf>,

    /// Workspace directory (default: <temp>/vidscale-<input stem>)
    #[arg(long, env = "VIDSCALE_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Configuration file
    #[arg(long, env = "VIDSCALE_CONFIG")]
    config: Option<PathBuf>,

    /// Frame sampling rate, e.g. 12 or 24000/1001 (default: native rate)
    #[arg(long, env = "VIDSCALE_FPS")]
    fps: Option<String>,

    /// Scale factor (1, 2, 4, 8, 16, 32)
    #[arg(long, short, env = "VIDSCALE_SCALE")]
    scale: Option<u32>,

    /// Denoise level (-1 to 3)
    #[arg(long, short, env = "VIDSCALE_NOISE", allow_hyphen_values = true)]
    noise: Option<i32>,

    /// Engine tile size, 0 for automatic
    #[arg(long, env = "VIDSCALE_BLOCK_SIZE")]
    block_size: Option<u32>,

    /// Engine processing threads
    #[arg(long, short, env = "VIDSCALE_WORKERS")]
    workers: Option<u32>,

    /// Upscaling engine executable
    #[arg(long, env = "VIDSCALE_ENGINE")]
    engine: Option<String>,

    /// Engine model directory
    #[arg(long, env = "VIDSCALE_MODEL")]
    model: Option<PathBuf>,

    /// Video codec (libx264, libx265, h264_nvenc, hevc_nvenc)
    #[arg(long, env = "VIDSCALE_CODEC")]
    codec: Option<VideoCodec>,

    /// Constant quality value (CRF or CQ, 0-51)
    #[arg(long, short, env = "VIDSCALE_QUALITY")]
    quality: Option<u8>,

    /// Encoder preset
    #[arg(long, env = "VIDSCALE_PRESET")]
    preset: Option<String>,

    /// Do not parse the encoder's progress stream
    #[arg(long, default_value_t = false, env = "VIDSCALE_NO_PROGRESS_STREAM")]
    no_progress_stream: bool,

    /// Keep the workspace when the run fails or is interrupted
    #[arg(long, default_value_t = false, env = "VIDSCALE_KEEP_WORKSPACE")]
    keep_workspace: bool,

    /// Resume a previous run without asking
    #[arg(long, default_value_t = false, conflicts_with = "restart", env = "VIDSCALE_RESUME")]
    resume: bool,

    /// Discard any previous run without asking
    #[arg(long, default_value_t = false, conflicts_with = "resume", env = "VIDSCALE_RESTART")]
    restart: bool,

    /// Disable desktop notifications
    #[arg(long, default_value_t = false, env = "VIDSCALE_NO_NOTIFY")]
    no_notify: bool,

    /// Give up on the upscaling engine after this many seconds
    #[arg(long, env = "VIDSCALE_TIMEOUT")]
    timeout: Option<u64>,

    /// Log debug details
    #[arg(long, short, default_value_t = false, env = "VIDSCALE_VERBOSE")]
    verbose: bool,
}

impl Args {
    /// Fold command line overrides into the loaded configuration.
    fn apply(&self, cfg: &mut AppConfig) {
        if let Some(fps) = &self.fps {
            cfg.sampling_rate = Some(fps.clone());
        }
        if let Some(scale) = self.scale {
            cfg.upscale.scale = scale;
        }
        if let Some(noise) = self.noise {
            cfg.upscale.noise = noise;
        }
        if let Some(block_size) = self.block_size {
            cfg.upscale.block_size = block_size;
        }
        if let Some(workers) = self.workers {
            cfg.upscale.workers = workers;
        }
        if let Some(engine) = &self.engine {
            cfg.upscale.engine = engine.clone();
        }
        if let Some(model) = &self.model {
            cfg.upscale.model = Some(model.clone());
        }
        if let Some(codec) = self.codec {
            cfg.encoder.codec = codec;
        }
        if let Some(quality) = self.quality {
            cfg.encoder.quality = quality;
        }
        if let Some(preset) = &self.preset {
            cfg.encoder.preset = preset.clone();
        }
        if self.no_progress_stream {
            cfg.encoder.progress = false;
        }
        if self.keep_workspace {
            cfg.keep_workspace = true;
        }
        if self.no_notify {
            cfg.notify = false;
        }
        if let Some(secs) = self.timeout {
            cfg.engine_timeout_secs = Some(secs);
        }
    }

    fn resume_policy(&self) -> ResumePolicy {
        if self.resume {
            ResumePolicy::Always
        } else if self.restart {
            ResumePolicy::Never
        } else {
            ResumePolicy::Ask
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .init();
}

fn confirm_resume(state: &JobState) -> PipelineResult<bool> {
    if !Term::stderr().is_term() {
        return Ok(false);
    }
    let JobState::Resumable {
        source_frames,
        processed_frames,
    } = state
    else {
        return Ok(false);
    };
    // An aborted prompt stops the run; it never counts as "no".
    let answer = Confirm::new()
        .with_prompt(format!(
            "A previous run upscaled {} of {} frames. Resume it?",
            processed_frames, source_frames
        ))
        .default(true)
        .interact_opt();
    match answer {
        Ok(Some(resume)) => Ok(resume),
        Ok(None) => Err(PipelineError::Interrupted),
        Err(e) => {
            debug!("resume prompt aborted: {}", e);
            Err(PipelineError::Interrupted)
        }
    }
}

fn run(args: Args) -> Result<()> {
    let input = args
        .input
        .clone()
        .ok_or_else(|| PipelineError::Usage("missing input video".into()))?;

    let mut cfg = load_config(args.config.as_ref())?;
    args.apply(&mut cfg);

    let mut job = Job::from_config(&input, &cfg);
    if let Some(output) = &args.output {
        job = job.with_output(output.clone());
    }
    if let Some(workspace) = &args.workspace {
        job = job.with_workspace(workspace.clone());
    }

    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    ctrlc::set_handler(move || {
        handler_flag.cancel();
        restore_cursor();
    })
    .context("installing interrupt handler")?;

    let tools = SystemTools::from_config(&cfg);
    let report = Pipeline::new(&job, &tools, cancel).run(args.resume_policy(), confirm_resume)?;

    println!(
        "\nUpscaled {} frames at {} fps into {}",
        report.frames,
        report.frame_rate,
        report.output.display()
    );
    if !report.warnings.is_empty() {
        println!("\n--- Warnings ---");
        for warning in &report.warnings {
            println!("{}", warning);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            restore_cursor();
            let code = e.downcast_ref::<PipelineError>().map_or(1, PipelineError::exit_code);
            if matches!(e.downcast_ref::<PipelineError>(), Some(PipelineError::Usage(_))) {
                eprintln!("usage: vidscale [OPTIONS] <INPUT>");
            }
            eprintln!("error: {:#}", e);
            ExitCode::from(code)
        }
    }
}
