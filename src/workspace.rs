//! Scoped temporary workspace: `in/`, `out/`, the audio sidecar and a small
//! metadata file used to decide whether a previous run can be resumed.

use std::fs;
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::frames::count_frames;
use crate::progress::restore_cursor;

pub const INPUT_DIR: &str = "in";
pub const OUTPUT_DIR: &str = "out";
pub const AUDIO_FILE: &str = "audio.mka";
pub const METADATA_FILE: &str = "job.json";
pub const ENGINE_LOG: &str = "engine.log";

/// Written once extraction has finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Canonical path of the source video
    pub input: PathBuf,
    /// Frames written by the decoder
    pub source_frames: usize,
    pub has_audio: bool,
}

/// Entries a workspace may hold. Anything else means the directory belongs
/// to someone else.
const WORKSPACE_ENTRIES: &[&str] = &[INPUT_DIR, OUTPUT_DIR, AUDIO_FILE, METADATA_FILE, ENGINE_LOG];

/// A directory that is empty or holds only workspace entries.
fn is_workspace_tree(root: &Path) -> io::Result<bool> {
    if !root.is_dir() {
        return Ok(false);
    }
    for entry in fs::read_dir(root)? {
        let name = entry?.file_name();
        if !WORKSPACE_ENTRIES.iter().any(|known| name == *known) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Layout of a workspace rooted at one directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Workspace {
    root: PathBuf,
    resumed: bool,
}

impl Workspace {
    /// Paths only; nothing is touched on disk.
    pub fn at(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            resumed: false,
        }
    }

    /// Create the workspace, or reuse it when `resume` is set and `out/`
    /// already holds frames. Otherwise any existing tree is removed first.
    pub fn prepare(root: &Path, resume: bool) -> PipelineResult<Self> {
        let mut workspace = Self::at(root);

        if resume && count_frames(&workspace.output_dir()) > 0 {
            info!(root = %root.display(), "resuming existing workspace");
            workspace.resumed = true;
            return Ok(workspace);
        }

        if root.exists() {
            if !is_workspace_tree(root)? {
                return Err(PipelineError::Usage(format!(
                    "{} exists and is not a vidscale workspace, refusing to clear it",
                    root.display()
                )));
            }
            debug!(root = %root.display(), "removing stale workspace");
            fs::remove_dir_all(root)?;
        }
        fs::create_dir_all(workspace.input_dir())?;
        fs::create_dir_all(workspace.output_dir())?;
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether [`Workspace::prepare`] reused a previous run.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join(INPUT_DIR)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join(OUTPUT_DIR)
    }

    pub fn audio_path(&self) -> PathBuf {
        self.root.join(AUDIO_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn engine_log_path(&self) -> PathBuf {
        self.root.join(ENGINE_LOG)
    }

    /// Audio sidecar exists and is non-empty.
    pub fn has_audio(&self) -> bool {
        fs::metadata(self.audio_path()).is_ok_and(|m| m.len() > 0)
    }

    pub fn write_metadata(&self, metadata: &JobMetadata) -> PipelineResult<()> {
        let text = serde_json::to_string_pretty(metadata)?;
        fs::write(self.metadata_path(), text)?;
        Ok(())
    }

    pub fn read_metadata(&self) -> Option<JobMetadata> {
        let text = fs::read_to_string(self.metadata_path()).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Recursively remove the tree.
    pub fn teardown(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.root) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// What a workspace directory holds for a given input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// No workspace directory.
    Absent,
    /// Left over from a different input, or from a run that never finished
    /// extracting.
    Stale,
    /// Extracted but nothing upscaled yet.
    Fresh,
    /// Upscaled frames are present.
    Resumable {
        source_frames: usize,
        processed_frames: usize,
    },
}

impl JobState {
    /// Inspect `root` for a run over `input`.
    pub fn inspect(root: &Path, input: &Path) -> Self {
        if !root.exists() {
            return JobState::Absent;
        }
        let workspace = Workspace::at(root);
        let metadata = match workspace.read_metadata() {
            Some(metadata) => metadata,
            None => return JobState::Stale,
        };
        let input = input.canonicalize().unwrap_or_else(|_| input.to_path_buf());
        if metadata.input != input {
            return JobState::Stale;
        }
        match count_frames(&workspace.output_dir()) {
            0 => JobState::Fresh,
            processed_frames => JobState::Resumable {
                source_frames: metadata.source_frames,
                processed_frames,
            },
        }
    }

    pub fn is_resumable(&self) -> bool {
        matches!(self, JobState::Resumable { .. })
    }
}

/// Whether a resumable workspace should be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumePolicy {
    /// Always start over.
    Never,
    /// Resume whenever possible.
    Always,
    /// Ask through the supplied callback.
    #[default]
    Ask,
}

impl ResumePolicy {
    /// Decide from the workspace state alone; `confirm` is only consulted
    /// for [`ResumePolicy::Ask`] and a resumable state. An error from
    /// `confirm` (e.g. an interrupted prompt) is passed through unchanged.
    pub fn decide<F>(&self, state: &JobState, confirm: F) -> PipelineResult<bool>
    where
        F: FnOnce(&JobState) -> PipelineResult<bool>,
    {
        if !state.is_resumable() {
            return Ok(false);
        }
        match self {
            ResumePolicy::Never => Ok(false),
            ResumePolicy::Always => Ok(true),
            ResumePolicy::Ask => confirm(state),
        }
    }
}

/// How a run ended, for teardown purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Owns a workspace and releases it exactly once.
///
/// Release happens through [`WorkspaceGuard::finish`] or, if that is never
/// reached, on drop as a failure. Either way the terminal cursor is shown
/// again.
pub struct WorkspaceGuard {
    workspace: Workspace,
    keep_on_failure: bool,
    released: bool,
}

impl WorkspaceGuard {
    pub fn new(workspace: Workspace, keep_on_failure: bool) -> Self {
        Self {
            workspace,
            keep_on_failure,
            released: false,
        }
    }

    /// Release the workspace. Returns whether the tree was removed.
    pub fn finish(mut self, outcome: Outcome) -> io::Result<bool> {
        self.release(outcome)
    }

    fn release(&mut self, outcome: Outcome) -> io::Result<bool> {
        if self.released {
            return Ok(false);
        }
        self.released = true;
        restore_cursor();

        if outcome == Outcome::Failure && self.keep_on_failure {
            info!(root = %self.workspace.root().display(), "keeping workspace for inspection");
            return Ok(false);
        }
        self.workspace.teardown()?;
        debug!(root = %self.workspace.root().display(), "workspace removed");
        Ok(true)
    }
}

impl Deref for WorkspaceGuard {
    type Target = Workspace;

    fn deref(&self) -> &Workspace {
        &self.workspace
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release(Outcome::Failure) {
            warn!(root = %self.workspace.root().display(), "failed to remove workspace: {}", e);
        }
    }
}
