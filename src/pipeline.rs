//! Job orchestration: extract, upscale, normalize, assemble.
//!
//! Stages run strictly one after another on the calling thread. The only
//! concurrent activity is the external process of the current stage.

use std::fmt;
use std::path::PathBuf;

use tracing::{error, info, warn};

use crate::error::{PipelineError, PipelineResult, PipelineWarning, Stage};
use crate::frames::{self, count_frames, frame_pattern};
use crate::monitor::{CancelFlag, Monitor};
use crate::probe::frame_rate_or_default;
use crate::progress::{self, ProgressSink};
use crate::tools::{EncodeRequest, MediaTools, Notice, ToolOutput};
use crate::workspace::{JobMetadata, JobState, Outcome, ResumePolicy, Workspace, WorkspaceGuard};
use crate::Job;

/// States of a run. `Failed` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Init,
    Extracting,
    Upscaling,
    Normalizing,
    Assembling,
    Done,
    Failed,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobPhase::Init => "init",
            JobPhase::Extracting => "extracting",
            JobPhase::Upscaling => "upscaling",
            JobPhase::Normalizing => "normalizing",
            JobPhase::Assembling => "assembling",
            JobPhase::Done => "done",
            JobPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub output: PathBuf,
    /// Frames in the assembled output
    pub frames: usize,
    /// Frames extracted from the source
    pub source_frames: usize,
    pub frame_rate: f64,
    pub has_audio: bool,
    pub resumed: bool,
    /// Every phase entered, in order
    pub phases: Vec<JobPhase>,
    pub warnings: Vec<PipelineWarning>,
}

type SinkFactory = Box<dyn Fn(&'static str) -> Box<dyn ProgressSink>>;

/// Drives one [`Job`] through its stages.
pub struct Pipeline<'a> {
    job: &'a Job,
    tools: &'a dyn MediaTools,
    cancel: CancelFlag,
    monitor: Monitor,
    sinks: SinkFactory,
    phases: Vec<JobPhase>,
    warnings: Vec<PipelineWarning>,
}

impl<'a> Pipeline<'a> {
    pub fn new(job: &'a Job, tools: &'a dyn MediaTools, cancel: CancelFlag) -> Self {
        let monitor = Monitor::new(cancel.clone()).with_timeout(job.engine_timeout);
        Self {
            job,
            tools,
            cancel,
            monitor,
            sinks: Box::new(progress::sink_for),
            phases: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Replace the engine monitor, e.g. to poll faster.
    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = monitor;
        self
    }

    /// Replace how progress sinks are created for each monitored stage.
    pub fn with_sinks<F>(mut self, factory: F) -> Self
    where
        F: Fn(&'static str) -> Box<dyn ProgressSink> + 'static,
    {
        self.sinks = Box::new(factory);
        self
    }

    /// Run the job to completion.
    ///
    /// `confirm` is asked whether to resume when `policy` is
    /// [`ResumePolicy::Ask`] and the workspace holds upscaled frames. If it
    /// fails, the run stops before the workspace is touched.
    pub fn run<F>(mut self, policy: ResumePolicy, confirm: F) -> PipelineResult<RunReport>
    where
        F: FnOnce(&JobState) -> PipelineResult<bool>,
    {
        self.enter(JobPhase::Init);
        if let Err(e) = self.job.validate() {
            self.enter(JobPhase::Failed);
            return Err(e);
        }

        // Nothing is touched on disk until the resume question is settled.
        let state = JobState::inspect(&self.job.workspace_root, &self.job.input);
        let resume = match policy.decide(&state, confirm) {
            Ok(resume) => resume,
            Err(e) => {
                self.enter(JobPhase::Failed);
                return Err(e);
            }
        };

        let workspace = match Workspace::prepare(&self.job.workspace_root, resume) {
            Ok(workspace) => workspace,
            Err(e) => return Err(self.fail(e)),
        };
        let guard = WorkspaceGuard::new(workspace, self.job.keep_workspace);

        match self.execute(&guard) {
            Ok((frames, source_frames, frame_rate, has_audio)) => {
                self.enter(JobPhase::Done);
                self.notify(Notice::Finished {
                    output: self.job.output.clone(),
                });
                if let Err(e) = guard.finish(Outcome::Success) {
                    warn!("failed to remove workspace: {}", e);
                }
                Ok(RunReport {
                    output: self.job.output.clone(),
                    frames,
                    source_frames,
                    frame_rate,
                    has_audio,
                    resumed: resume,
                    phases: self.phases,
                    warnings: self.warnings,
                })
            }
            Err(e) => {
                let e = self.fail(e);
                if let Err(teardown) = guard.finish(Outcome::Failure) {
                    warn!("failed to remove workspace: {}", teardown);
                }
                Err(e)
            }
        }
    }

    fn execute(&mut self, workspace: &Workspace) -> PipelineResult<(usize, usize, f64, bool)> {
        let job = self.job;
        let source = self.tools.probe(&job.input)?;

        let (source_frames, has_audio) = if workspace.resumed() {
            let source_frames = workspace
                .read_metadata()
                .map(|m| m.source_frames)
                .unwrap_or_else(|| count_frames(&workspace.input_dir()));
            info!(
                processed = count_frames(&workspace.output_dir()),
                source_frames, "skipping extraction and upscaling"
            );
            (source_frames, workspace.has_audio())
        } else {
            self.enter(JobPhase::Extracting);
            let output = self.tools.extract_frames(job, workspace)?;
            self.check(Stage::Extracting, &output)?;
            let source_frames = count_frames(&workspace.input_dir());
            if source_frames == 0 {
                return Err(PipelineError::stage(Stage::Extracting, "decoder produced no frames"));
            }

            if source.has_audio {
                let output = self.tools.extract_audio(job, workspace)?;
                self.check(Stage::Extracting, &output)?;
            }
            let has_audio = source.has_audio && workspace.has_audio();
            let input = job.input.canonicalize().unwrap_or_else(|_| job.input.clone());
            workspace.write_metadata(&JobMetadata {
                input,
                source_frames,
                has_audio,
            })?;
            info!(frames = source_frames, audio = has_audio, "extraction complete");

            self.enter(JobPhase::Upscaling);
            let mut task = self.tools.launch_engine(job, workspace)?;
            let mut sink = (self.sinks)("upscaling");
            let report = self
                .monitor
                .watch(task.as_mut(), &workspace.output_dir(), source_frames, sink.as_mut())?;
            if !report.exit.success() || report.frames < source_frames {
                self.absorb(PipelineWarning::PartialProcessing {
                    expected: source_frames,
                    produced: report.frames,
                    exit_code: report.exit.code,
                });
            }
            (source_frames, has_audio)
        };
        self.checkpoint()?;

        if !has_audio {
            self.absorb(PipelineWarning::AudioMissing);
        }

        self.enter(JobPhase::Normalizing);
        let normalized = frames::normalize(&workspace.output_dir())
            .map_err(|e| PipelineError::stage(Stage::Normalizing, e.to_string()))?;
        if normalized.frames == 0 {
            return Err(PipelineError::stage(Stage::Upscaling, "engine produced no frames"));
        }
        if workspace.resumed() && normalized.frames < source_frames {
            self.absorb(PipelineWarning::PartialProcessing {
                expected: source_frames,
                produced: normalized.frames,
                exit_code: None,
            });
        }
        info!(frames = normalized.frames, renamed = normalized.renamed, "frames normalized");

        self.checkpoint()?;

        self.enter(JobPhase::Assembling);
        let expression = job.sampling_rate.clone().unwrap_or(source.frame_rate);
        let (frame_rate, fallback) = frame_rate_or_default(&expression);
        if let Some(warning) = fallback {
            self.absorb(warning);
        }
        let request = EncodeRequest {
            frames: frame_pattern(&workspace.output_dir()),
            frame_rate,
            audio: has_audio.then(|| workspace.audio_path()),
            total_frames: normalized.frames,
            output: job.output.clone(),
        };
        let mut sink = (self.sinks)("assembling");
        let output = self.tools.encode(job, &request, sink.as_mut())?;
        self.check(Stage::Assembling, &output)?;
        info!(output = %job.output.display(), frames = normalized.frames, frame_rate, "assembly complete");

        Ok((normalized.frames, source_frames, frame_rate, has_audio))
    }

    fn enter(&mut self, phase: JobPhase) {
        info!(%phase, "entering phase");
        self.phases.push(phase);
    }

    fn absorb(&mut self, warning: PipelineWarning) {
        warn!("{}", warning);
        self.warnings.push(warning);
    }

    fn checkpoint(&self) -> PipelineResult<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Interrupted);
        }
        Ok(())
    }

    /// A child killed by the interrupt reports failure too; report the
    /// interrupt instead.
    fn check(&self, stage: Stage, output: &ToolOutput) -> PipelineResult<()> {
        self.checkpoint()?;
        if output.exit.success() {
            return Ok(());
        }
        let code = output
            .exit
            .code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let tail = output.stderr_tail();
        let message = if tail.is_empty() {
            format!("exited with {}", code)
        } else {
            format!("exited with {}: {}", code, tail)
        };
        Err(PipelineError::stage(stage, message))
    }

    fn fail(&mut self, e: PipelineError) -> PipelineError {
        self.enter(JobPhase::Failed);
        error!("{}", e);
        self.notify(Notice::Failed { message: e.to_string() });
        e
    }

    fn notify(&self, notice: Notice) {
        if self.job.notify {
            self.tools.notify(&notice);
        }
    }
}
