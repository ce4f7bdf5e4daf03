//! End-to-end runs of the orchestrator against scripted tools.

use std::cell::RefCell;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use vidscale::frames::{count_frames, frame_file_name};
use vidscale::probe::SourceInfo;
use vidscale::progress::LogSink;
use vidscale::{
    AppConfig, BackgroundTask, CancelFlag, EncodeRequest, Job, JobPhase, MediaTools, Monitor, Notice, Pipeline,
    PipelineError, PipelineResult, PipelineWarning, ProgressSink, ResumePolicy, Stage, TaskExit, ToolOutput,
    Workspace,
};

/// Writes one unpadded frame per liveness check.
struct FakeEngine {
    out: PathBuf,
    frames: usize,
    written: usize,
    code: i32,
    cancel_after: Option<(usize, CancelFlag)>,
    killed: bool,
}

impl BackgroundTask for FakeEngine {
    fn is_running(&mut self) -> io::Result<bool> {
        if self.killed || self.written == self.frames {
            return Ok(false);
        }
        fs::write(self.out.join(format!("frame{}.png", self.written + 1)), b"png")?;
        self.written += 1;
        if let Some((after, flag)) = &self.cancel_after {
            if self.written == *after {
                flag.cancel();
            }
        }
        Ok(true)
    }

    fn wait(&mut self) -> io::Result<TaskExit> {
        if self.killed {
            return Ok(TaskExit { code: None });
        }
        Ok(TaskExit::code(self.code))
    }

    fn kill(&mut self) -> io::Result<()> {
        self.killed = true;
        Ok(())
    }
}

struct FakeTools {
    frame_rate: String,
    has_audio: bool,
    source_frames: usize,
    extract_fails: bool,
    audio_fails: bool,
    engine_frames: usize,
    engine_code: i32,
    cancel_after: Option<(usize, CancelFlag)>,
    encode_fails: bool,
    calls: RefCell<Vec<&'static str>>,
    encoded: RefCell<Option<EncodeRequest>>,
    notices: RefCell<Vec<Notice>>,
}

impl FakeTools {
    fn new(source_frames: usize, engine_frames: usize) -> Self {
        Self {
            frame_rate: "24000/1001".to_string(),
            has_audio: true,
            source_frames,
            extract_fails: false,
            audio_fails: false,
            engine_frames,
            engine_code: 0,
            cancel_after: None,
            encode_fails: false,
            calls: RefCell::new(Vec::new()),
            encoded: RefCell::new(None),
            notices: RefCell::new(Vec::new()),
        }
    }

    fn called(&self, name: &str) -> bool {
        self.calls.borrow().iter().any(|c| *c == name)
    }
}

impl MediaTools for FakeTools {
    fn probe(&self, _input: &Path) -> PipelineResult<SourceInfo> {
        self.calls.borrow_mut().push("probe");
        Ok(SourceInfo {
            frame_rate: self.frame_rate.clone(),
            has_audio: self.has_audio,
        })
    }

    fn extract_frames(&self, _job: &Job, workspace: &Workspace) -> PipelineResult<ToolOutput> {
        self.calls.borrow_mut().push("extract_frames");
        if self.extract_fails {
            return Ok(ToolOutput {
                exit: TaskExit::code(1),
                stderr: "clip.mp4: moov atom not found\n".to_string(),
            });
        }
        for i in 0..self.source_frames {
            fs::write(workspace.input_dir().join(frame_file_name(i, "png")), b"png")?;
        }
        Ok(ToolOutput::success())
    }

    fn extract_audio(&self, _job: &Job, workspace: &Workspace) -> PipelineResult<ToolOutput> {
        self.calls.borrow_mut().push("extract_audio");
        if self.audio_fails {
            return Ok(ToolOutput {
                exit: TaskExit::code(1),
                stderr: "Stream map '0:a:0' matches no streams.\n".to_string(),
            });
        }
        fs::write(workspace.audio_path(), b"audio")?;
        Ok(ToolOutput::success())
    }

    fn launch_engine(&self, _job: &Job, workspace: &Workspace) -> PipelineResult<Box<dyn BackgroundTask>> {
        self.calls.borrow_mut().push("launch_engine");
        Ok(Box::new(FakeEngine {
            out: workspace.output_dir(),
            frames: self.engine_frames,
            written: 0,
            code: self.engine_code,
            cancel_after: self.cancel_after.clone(),
            killed: false,
        }))
    }

    fn encode(&self, _job: &Job, request: &EncodeRequest, sink: &mut dyn ProgressSink) -> PipelineResult<ToolOutput> {
        self.calls.borrow_mut().push("encode");
        sink.finish();
        if self.encode_fails {
            return Ok(ToolOutput {
                exit: TaskExit::code(1),
                stderr: "frame=    4 fps=0.0\n[libx264 @ 0x5581] broken ffmpeg default settings detected\n".to_string(),
            });
        }
        fs::write(&request.output, b"video")?;
        *self.encoded.borrow_mut() = Some(request.clone());
        Ok(ToolOutput::success())
    }

    fn notify(&self, notice: &Notice) {
        self.notices.borrow_mut().push(notice.clone());
    }
}

fn log_sink(label: &'static str) -> Box<dyn ProgressSink> {
    Box::new(LogSink::new(label))
}

fn job_in(dir: &TempDir) -> Job {
    let input = dir.path().join("clip.mp4");
    fs::write(&input, b"source").unwrap();
    let config = AppConfig {
        workspace_dir: Some(dir.path().join("scratch")),
        ..AppConfig::default()
    };
    Job::from_config(&input, &config)
}

fn run(job: &Job, tools: &FakeTools, cancel: CancelFlag, policy: ResumePolicy) -> PipelineResult<vidscale::RunReport> {
    let monitor = Monitor::new(cancel.clone()).with_interval(Duration::from_millis(1));
    Pipeline::new(job, tools, cancel)
        .with_monitor(monitor)
        .with_sinks(log_sink)
        .run(policy, |_| Ok(false))
}

#[test]
fn test_full_run_succeeds() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir);
    let tools = FakeTools::new(10, 10);

    let report = run(&job, &tools, CancelFlag::new(), ResumePolicy::Never).unwrap();

    assert_eq!(report.frames, 10);
    assert_eq!(report.source_frames, 10);
    assert!(report.has_audio);
    assert!(!report.resumed);
    assert!((report.frame_rate - 23.976).abs() < 0.001);
    assert!(report.warnings.is_empty());
    assert_eq!(
        report.phases,
        vec![
            JobPhase::Init,
            JobPhase::Extracting,
            JobPhase::Upscaling,
            JobPhase::Normalizing,
            JobPhase::Assembling,
            JobPhase::Done,
        ]
    );

    assert!(job.output.exists());
    assert!(!job.workspace_root.exists());

    let request = tools.encoded.borrow().clone().unwrap();
    assert_eq!(request.total_frames, 10);
    assert_eq!(request.audio, Some(job.workspace_root.join("audio.mka")));
    assert_eq!(
        *tools.notices.borrow(),
        vec![Notice::Finished {
            output: job.output.clone()
        }]
    );
}

#[test]
fn test_partial_engine_output_is_assembled() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir);
    let mut tools = FakeTools::new(10, 7);
    tools.engine_code = 1;

    let report = run(&job, &tools, CancelFlag::new(), ResumePolicy::Never).unwrap();

    assert_eq!(report.frames, 7);
    assert_eq!(report.source_frames, 10);
    assert_eq!(
        report.warnings,
        vec![PipelineWarning::PartialProcessing {
            expected: 10,
            produced: 7,
            exit_code: Some(1),
        }]
    );
    assert_eq!(tools.encoded.borrow().as_ref().unwrap().total_frames, 7);
    assert!(job.output.exists());
    assert!(!job.workspace_root.exists());
}

#[test]
fn test_zero_engine_frames_is_fatal() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir);
    let mut tools = FakeTools::new(10, 0);
    tools.engine_code = 1;

    let err = run(&job, &tools, CancelFlag::new(), ResumePolicy::Never).unwrap_err();

    assert!(matches!(
        err,
        PipelineError::StageFailure {
            stage: Stage::Upscaling,
            ..
        }
    ));
    assert!(!tools.called("encode"));
    assert!(!job.output.exists());
    assert!(!job.workspace_root.exists());
    assert!(matches!(tools.notices.borrow().as_slice(), [Notice::Failed { .. }]));
}

#[test]
fn test_extraction_failure_removes_workspace() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir);
    let mut tools = FakeTools::new(10, 10);
    tools.extract_fails = true;

    let err = run(&job, &tools, CancelFlag::new(), ResumePolicy::Never).unwrap_err();

    match &err {
        PipelineError::StageFailure { stage, message } => {
            assert_eq!(*stage, Stage::Extracting);
            assert!(message.contains("moov atom not found"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.exit_code(), 1);
    assert!(!tools.called("launch_engine"));
    assert!(!job.workspace_root.exists());
}

#[test]
fn test_extraction_failure_keeps_workspace_when_asked() {
    let dir = TempDir::new().unwrap();
    let mut job = job_in(&dir);
    job.keep_workspace = true;
    let mut tools = FakeTools::new(10, 10);
    tools.extract_fails = true;

    assert!(run(&job, &tools, CancelFlag::new(), ResumePolicy::Never).is_err());

    assert!(job.workspace_root.join("in").is_dir());
}

#[test]
fn test_interrupt_stops_engine_and_cleans_up() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir);
    let cancel = CancelFlag::new();
    let mut tools = FakeTools::new(10, 10);
    tools.cancel_after = Some((3, cancel.clone()));

    let err = run(&job, &tools, cancel, ResumePolicy::Never).unwrap_err();

    assert!(matches!(err, PipelineError::Interrupted));
    assert_eq!(err.exit_code(), 130);
    assert!(!tools.called("encode"));
    assert!(!job.workspace_root.exists());
}

#[test]
fn test_resume_after_interrupt() {
    let dir = TempDir::new().unwrap();
    let mut job = job_in(&dir);
    job.keep_workspace = true;

    let cancel = CancelFlag::new();
    let mut first = FakeTools::new(10, 10);
    first.cancel_after = Some((3, cancel.clone()));
    assert!(run(&job, &first, cancel, ResumePolicy::Never).is_err());
    assert_eq!(count_frames(&job.workspace_root.join("out")), 3);

    let second = FakeTools::new(10, 10);
    let report = run(&job, &second, CancelFlag::new(), ResumePolicy::Always).unwrap();

    assert!(report.resumed);
    assert_eq!(report.frames, 3);
    assert_eq!(report.source_frames, 10);
    assert!(report.has_audio);
    assert!(!second.called("extract_frames"));
    assert!(!second.called("launch_engine"));
    assert!(report.warnings.contains(&PipelineWarning::PartialProcessing {
        expected: 10,
        produced: 3,
        exit_code: None,
    }));
    assert!(!report.phases.contains(&JobPhase::Extracting));
    assert!(!job.workspace_root.exists());
}

#[test]
fn test_restart_discards_previous_frames() {
    let dir = TempDir::new().unwrap();
    let mut job = job_in(&dir);
    job.keep_workspace = true;

    let cancel = CancelFlag::new();
    let mut first = FakeTools::new(10, 10);
    first.cancel_after = Some((3, cancel.clone()));
    assert!(run(&job, &first, cancel, ResumePolicy::Never).is_err());

    let second = FakeTools::new(10, 10);
    let report = run(&job, &second, CancelFlag::new(), ResumePolicy::Never).unwrap();

    assert!(!report.resumed);
    assert_eq!(report.frames, 10);
    assert!(second.called("extract_frames"));
}

#[test]
fn test_missing_audio_and_bad_rate_are_warnings() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir);
    let mut tools = FakeTools::new(5, 5);
    tools.has_audio = false;
    tools.frame_rate = "0/0".to_string();

    let report = run(&job, &tools, CancelFlag::new(), ResumePolicy::Never).unwrap();

    assert!(!report.has_audio);
    assert_eq!(report.frame_rate, 30.0);
    assert!(!tools.called("extract_audio"));
    assert_eq!(tools.encoded.borrow().as_ref().unwrap().audio, None);
    assert!(report.warnings.contains(&PipelineWarning::AudioMissing));
    assert!(report.warnings.contains(&PipelineWarning::FrameRateFallback {
        expression: "0/0".to_string()
    }));
}

#[test]
fn test_missing_input_is_not_notified() {
    let dir = TempDir::new().unwrap();
    let job = Job::from_config(&dir.path().join("absent.mp4"), &AppConfig::default());
    let tools = FakeTools::new(1, 1);

    let err = run(&job, &tools, CancelFlag::new(), ResumePolicy::Never).unwrap_err();

    assert!(matches!(err, PipelineError::InputNotFound(_)));
    assert!(tools.calls.borrow().is_empty());
    assert!(tools.notices.borrow().is_empty());
}

#[test]
fn test_encoder_failure_is_fatal() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir);
    let mut tools = FakeTools::new(10, 10);
    tools.encode_fails = true;

    let err = run(&job, &tools, CancelFlag::new(), ResumePolicy::Never).unwrap_err();

    match &err {
        PipelineError::StageFailure { stage, message } => {
            assert_eq!(*stage, Stage::Assembling);
            assert!(message.contains("broken ffmpeg default settings"), "message: {message}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.exit_code(), 1);
    assert!(matches!(tools.notices.borrow().as_slice(), [Notice::Failed { .. }]));
    assert!(!job.workspace_root.exists());
}

#[test]
fn test_audio_copy_failure_is_fatal() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir);
    let mut tools = FakeTools::new(10, 10);
    tools.audio_fails = true;

    let err = run(&job, &tools, CancelFlag::new(), ResumePolicy::Never).unwrap_err();

    assert!(matches!(
        err,
        PipelineError::StageFailure {
            stage: Stage::Extracting,
            ..
        }
    ));
    assert!(tools.called("extract_audio"));
    assert!(!tools.called("launch_engine"));
    assert!(!job.workspace_root.exists());
}

#[test]
fn test_aborted_resume_prompt_keeps_workspace() {
    let dir = TempDir::new().unwrap();
    let mut job = job_in(&dir);
    job.keep_workspace = true;

    let cancel = CancelFlag::new();
    let mut first = FakeTools::new(10, 10);
    first.cancel_after = Some((4, cancel.clone()));
    assert!(run(&job, &first, cancel, ResumePolicy::Never).is_err());

    let second = FakeTools::new(10, 10);
    let err = Pipeline::new(&job, &second, CancelFlag::new())
        .with_sinks(log_sink)
        .run(ResumePolicy::Ask, |_| Err(PipelineError::Interrupted))
        .unwrap_err();

    assert!(matches!(err, PipelineError::Interrupted));
    assert!(second.calls.borrow().is_empty());
    assert_eq!(count_frames(&job.workspace_root.join("out")), 4);
}

#[test]
fn test_foreign_workspace_directory_is_left_alone() {
    let dir = TempDir::new().unwrap();
    let user_dir = dir.path().join("Videos");
    fs::create_dir_all(&user_dir).unwrap();
    fs::write(user_dir.join("wedding.mp4"), b"keep me").unwrap();
    let job = job_in(&dir).with_workspace(user_dir.clone());
    let tools = FakeTools::new(10, 10);

    let err = run(&job, &tools, CancelFlag::new(), ResumePolicy::Never).unwrap_err();

    assert!(matches!(err, PipelineError::Usage(_)));
    assert!(user_dir.join("wedding.mp4").exists());
    assert!(!tools.called("extract_frames"));
}

/// Raises the interrupt once the stage it watched is over.
struct InterruptOnFinish(CancelFlag);

impl ProgressSink for InterruptOnFinish {
    fn render(&mut self, _line: &vidscale::ProgressLine) {}

    fn finish(&mut self) {
        self.0.cancel();
    }
}

#[test]
fn test_interrupt_after_upscaling_skips_encode() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir);
    let cancel = CancelFlag::new();
    let tools = FakeTools::new(10, 10);
    let flag = cancel.clone();

    let err = Pipeline::new(&job, &tools, cancel.clone())
        .with_monitor(Monitor::new(cancel).with_interval(Duration::from_millis(1)))
        .with_sinks(move |label| -> Box<dyn ProgressSink> {
            if label == "upscaling" {
                Box::new(InterruptOnFinish(flag.clone()))
            } else {
                log_sink(label)
            }
        })
        .run(ResumePolicy::Never, |_| Ok(false))
        .unwrap_err();

    assert!(matches!(err, PipelineError::Interrupted));
    assert!(tools.called("launch_engine"));
    assert!(!tools.called("encode"));
    assert!(!job.workspace_root.exists());
}
