//! Frame-level encoding building blocks.
//!
//! This crate knows how to turn an ordered batch of captured frames into
//! bytes: it computes changed regions, feeds in-process frame sinks, writes
//! outputs atomically and supervises an external ffmpeg-compatible encoder.
//! Scheduling, status tracking and post-processing live in the `jobs` crate.

use std::path::PathBuf;
use thiserror::Error;

mod archive;
mod cancel;
mod ffmpeg;
mod frame;
mod persist;
mod preprocess;
pub mod sink;

pub use archive::{write_project_archive, ArchiveCompression};
pub use cancel::CancellationToken;
pub use ffmpeg::{
    build_concat_manifest, erase_pass_logs, locate_ffmpeg, parse_progress_frame, split_args,
    CommandPlan, FfmpegKind, FfmpegRequest, FfmpegSupervisor, SupervisorOutcome,
};
pub use frame::{normalize_delay, Frame, Rect, MIN_FRAME_DELAY_MS};
pub use persist::{persist_atomically, remove_if_exists};
pub use preprocess::{assign_full_frame, compute_changed_regions, frame_dimensions};

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("gif encoding error: {0}")]
    Gif(#[from] gif::EncodingError),
    #[error("png encoding error: {0}")]
    Png(#[from] png::EncodingError),
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("no frames to encode")]
    NoFrames,
    #[error("{tool} not found; configure its location or install it on PATH")]
    ToolMissing { tool: String },
    #[error("{message}")]
    Process {
        message: String,
        commands: Vec<String>,
        log: String,
    },
    #[error("failed to persist output to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid frame {index}: {reason}")]
    InvalidFrame { index: usize, reason: String },
}

impl EncodeError {
    /// Extra postmortem text (command lines and captured log) when available.
    pub fn details(&self) -> Option<String> {
        match self {
            EncodeError::Process { commands, log, .. } => Some(format!(
                "Command:\n{}\nResult:\n{}",
                commands.join("\n"),
                log
            )),
            _ => None,
        }
    }
}

/// Receives progress from an encode running on a job's thread.
///
/// Implementations must be callable from any thread; the `jobs` crate
/// forwards these to the job registry and the reporter.
pub trait ProgressSink: Send + Sync {
    /// Switches the progress display between indeterminate and per-frame.
    fn set_indeterminate(&self, indeterminate: bool);

    /// Reports the frame currently being processed.
    fn frame(&self, index: usize, message: &str);
}

/// A sink that drops every update. Handy for tests and one-off tools.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn set_indeterminate(&self, _indeterminate: bool) {}
    fn frame(&self, _index: usize, _message: &str) {}
}
