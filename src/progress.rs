//! Progress arithmetic and rendering.
//!
//! The arithmetic is pure so it can be tested without a terminal. Rendering
//! goes through a [`ProgressSink`], which is either an in-place terminal bar
//! or plain log lines.

use std::fmt;
use std::time::Duration;

use console::Term;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::info;

/// Cells in the rendered bar.
pub const BAR_WIDTH: usize = 50;

/// Samples at or below this many completed units give no ETA.
pub const ETA_MIN_SAMPLES: usize = 5;

/// Point-in-time observation of a running stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub elapsed: Duration,
    pub done: usize,
    pub total: usize,
}

impl ProgressSample {
    pub fn new(elapsed: Duration, done: usize, total: usize) -> Self {
        Self { elapsed, done, total }
    }

    /// Percent complete, clamped to `0..=100`. Zero when `total` is zero.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.done as f64 * 100.0 / self.total as f64).clamp(0.0, 100.0)
    }

    /// Linear extrapolation from the average time per completed unit.
    ///
    /// `None` until more than [`ETA_MIN_SAMPLES`] units are done.
    pub fn eta(&self) -> Option<Duration> {
        if self.done <= ETA_MIN_SAMPLES {
            return None;
        }
        if self.percent() >= 100.0 {
            return Some(Duration::ZERO);
        }
        let remaining = self.total.saturating_sub(self.done) as f64;
        Some(self.elapsed.mul_f64(remaining / self.done as f64))
    }
}

/// What the counted units are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressUnit {
    /// Files observed in an output directory.
    Files,
    /// Frames reported by the encoder.
    Frames,
}

/// One rendered line of progress output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressLine {
    pub sample: ProgressSample,
    pub unit: ProgressUnit,
}

impl ProgressLine {
    pub fn files(sample: ProgressSample) -> Self {
        Self {
            sample,
            unit: ProgressUnit::Files,
        }
    }

    pub fn frames(sample: ProgressSample) -> Self {
        Self {
            sample,
            unit: ProgressUnit::Frames,
        }
    }
}

impl fmt::Display for ProgressLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sample = &self.sample;
        let percent = sample.percent();
        write!(f, "[{}] {:>3.0}% | ", render_bar(percent), percent)?;
        match self.unit {
            ProgressUnit::Files => write!(f, "{}/{} files", sample.done, sample.total)?,
            ProgressUnit::Frames => write!(f, "frame {}/{}", sample.done, sample.total)?,
        }
        let eta = match sample.eta() {
            Some(eta) => format_duration(eta),
            None => "--:--:--".to_string(),
        };
        write!(f, " | elapsed {} | eta {}", format_duration(sample.elapsed), eta)
    }
}

/// Fixed-width bar scaled by `percent`.
pub fn render_bar(percent: f64) -> String {
    let filled = ((percent.clamp(0.0, 100.0) / 100.0) * BAR_WIDTH as f64) as usize;
    let mut bar = String::with_capacity(BAR_WIDTH);
    bar.extend(std::iter::repeat('#').take(filled));
    bar.extend(std::iter::repeat('.').take(BAR_WIDTH - filled));
    bar
}

/// `HH:MM:SS`, hours not wrapped at 24.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Show the terminal cursor again. Safe to call at any time.
pub fn restore_cursor() {
    let _ = Term::stderr().show_cursor();
}

/// Destination for progress output.
pub trait ProgressSink {
    fn render(&mut self, line: &ProgressLine);

    /// Called once the stage is over.
    fn finish(&mut self) {}
}

/// Redraws a single line in place on standard error.
pub struct TerminalSink {
    bar: ProgressBar,
    finished: bool,
}

impl TerminalSink {
    pub fn new() -> Self {
        let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
        let style = ProgressStyle::default_bar()
            .template("{msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        let _ = Term::stderr().hide_cursor();
        Self { bar, finished: false }
    }
}

impl Default for TerminalSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for TerminalSink {
    fn render(&mut self, line: &ProgressLine) {
        self.bar.set_message(line.to_string());
        self.bar.tick();
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.bar.finish();
            restore_cursor();
        }
    }
}

impl Drop for TerminalSink {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Emits each line through `tracing`, for non-interactive runs.
#[derive(Debug, Default)]
pub struct LogSink {
    label: &'static str,
}

impl LogSink {
    pub fn new(label: &'static str) -> Self {
        Self { label }
    }
}

impl ProgressSink for LogSink {
    fn render(&mut self, line: &ProgressLine) {
        info!("{} {}", self.label, line);
    }
}

/// Terminal bar when standard error is a terminal, log lines otherwise.
pub fn sink_for(label: &'static str) -> Box<dyn ProgressSink> {
    if Term::stderr().is_term() {
        Box::new(TerminalSink::new())
    } else {
        Box::new(LogSink::new(label))
    }
}
