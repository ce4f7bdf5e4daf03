//! Watching a detached external job whose only progress signal is the
//! number of files it has written.

use std::io;
use std::path::Path;
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult, Stage};
use crate::frames::count_frames;
use crate::progress::{ProgressLine, ProgressSample, ProgressSink};

/// Fixed polling interval of the monitor.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Exit status of an external process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskExit {
    /// Exit code, `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl TaskExit {
    pub fn code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for TaskExit {
    fn from(status: ExitStatus) -> Self {
        Self { code: status.code() }
    }
}

/// Handle to a process running in the background.
pub trait BackgroundTask {
    /// Non-blocking liveness check.
    fn is_running(&mut self) -> io::Result<bool>;

    /// Block until the process has exited.
    fn wait(&mut self) -> io::Result<TaskExit>;

    fn kill(&mut self) -> io::Result<()>;
}

/// A spawned child process.
pub struct ChildTask {
    child: Child,
}

impl ChildTask {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

impl BackgroundTask for ChildTask {
    fn is_running(&mut self) -> io::Result<bool> {
        Ok(self.child.try_wait()?.is_none())
    }

    fn wait(&mut self) -> io::Result<TaskExit> {
        self.child.wait().map(TaskExit::from)
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.child.kill() {
            // already exited
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }
}

/// Shared flag raised by the interrupt handler.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a monitored run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorReport {
    pub exit: TaskExit,
    /// Files present in the output directory after the final wait.
    pub frames: usize,
    pub elapsed: Duration,
}

/// Polls a background task and its output directory until the task exits.
#[derive(Debug, Clone)]
pub struct Monitor {
    interval: Duration,
    timeout: Option<Duration>,
    cancel: CancelFlag,
}

impl Monitor {
    pub fn new(cancel: CancelFlag) -> Self {
        Self {
            interval: POLL_INTERVAL,
            timeout: None,
            cancel,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Block until `task` exits, rendering one progress line per tick.
    ///
    /// A non-zero exit is logged, not returned as an error: the engine may
    /// fail on single frames and still leave a usable majority behind.
    /// Cancellation and the optional timeout kill the task and fail.
    pub fn watch(
        &self,
        task: &mut dyn BackgroundTask,
        output_dir: &Path,
        total_expected: usize,
        sink: &mut dyn ProgressSink,
    ) -> PipelineResult<MonitorReport> {
        let start = Instant::now();

        loop {
            let elapsed = start.elapsed();
            let current = count_frames(output_dir);
            sink.render(&ProgressLine::files(ProgressSample::new(elapsed, current, total_expected)));

            if self.cancel.is_cancelled() {
                Self::abort(task, sink);
                return Err(PipelineError::Interrupted);
            }
            if let Some(limit) = self.timeout {
                if elapsed >= limit {
                    Self::abort(task, sink);
                    return Err(PipelineError::Timeout {
                        stage: Stage::Upscaling,
                        secs: limit.as_secs(),
                    });
                }
            }

            match task.is_running() {
                Ok(true) => thread::sleep(self.interval),
                Ok(false) => break,
                Err(e) => {
                    Self::abort(task, sink);
                    return Err(e.into());
                }
            }
        }

        // The count can plateau before the last write is flushed, so only
        // the exit status is trusted as the end of the job.
        let exit = task.wait()?;
        let elapsed = start.elapsed();
        let frames = count_frames(output_dir);
        sink.render(&ProgressLine::files(ProgressSample::new(elapsed, frames, total_expected)));
        sink.finish();

        if !exit.success() {
            warn!(code = ?exit.code, frames, expected = total_expected, "upscaling engine exited unsuccessfully");
        }
        debug!(frames, elapsed_secs = elapsed.as_secs(), "background task finished");

        Ok(MonitorReport { exit, frames, elapsed })
    }

    fn abort(task: &mut dyn BackgroundTask, sink: &mut dyn ProgressSink) {
        sink.finish();
        if let Err(e) = task.kill() {
            warn!("failed to stop background task: {}", e);
        }
        match task.wait() {
            Ok(exit) => debug!(code = ?exit.code, "background task stopped"),
            Err(e) => debug!("failed to reap background task: {}", e),
        }
    }
}
