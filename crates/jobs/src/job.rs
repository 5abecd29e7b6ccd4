use std::fmt;
use std::path::PathBuf;

use media_io::ArchiveCompression;
use serde::{Deserialize, Serialize};

use crate::error::JobFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Gif,
    Apng,
    Psd,
    Video,
    Project,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExportFormat::Gif => "gif",
            ExportFormat::Apng => "apng",
            ExportFormat::Psd => "psd",
            ExportFormat::Video => "video",
            ExportFormat::Project => "project",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderBackend {
    /// In-process encoder.
    Builtin,
    /// External ffmpeg-compatible command line tool.
    Ffmpeg,
    /// Native gifski library.
    Gifski,
}

impl fmt::Display for EncoderBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EncoderBackend::Builtin => "builtin",
            EncoderBackend::Ffmpeg => "ffmpeg",
            EncoderBackend::Gifski => "gifski",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Starting,
    Processing,
    Completed,
    Canceled,
    Error,
    FileDeletedOrMoved,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Starting | JobStatus::Processing)
    }

    /// Terminal states are final, except that a completed output may be
    /// observed as missing and later as present again.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Completed, FileDeletedOrMoved) | (FileDeletedOrMoved, Completed) => true,
            (from, _) => !from.is_terminal(),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobStatus::Starting => "starting",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Canceled => "canceled",
            JobStatus::Error => "error",
            JobStatus::FileDeletedOrMoved => "file deleted or moved",
        })
    }
}

/// What the clipboard stage places on the clipboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyType {
    #[default]
    File,
    FolderPath,
    /// The upload link, or the file path when nothing was uploaded.
    Link,
    FilePath,
}

/// Immutable configuration for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeParameters {
    pub format: ExportFormat,
    pub backend: EncoderBackend,
    pub output_path: PathBuf,
    /// 0 loops forever, `n > 0` repeats `n` times, negative plays once.
    pub repeat_count: i32,
    /// 1..=100; the native encoder falls back to its configured default.
    pub quality: Option<u8>,
    pub looped: Option<bool>,
    /// Substituted for `{W}`/`{H}`; 0 means the first frame's size.
    pub width: u32,
    pub height: u32,
    pub compression: ArchiveCompression,
    pub command_template: Option<String>,
    pub extra_parameters: Option<String>,
    pub detect_unchanged_pixels: bool,
    pub dummy_color: Option<[u8; 4]>,
    pub upload: bool,
    pub copy_to_clipboard: bool,
    pub copy_type: CopyType,
    pub execute_commands: bool,
    pub post_commands: String,
}

impl Default for EncodeParameters {
    fn default() -> Self {
        Self {
            format: ExportFormat::Gif,
            backend: EncoderBackend::Builtin,
            output_path: PathBuf::from("output.gif"),
            repeat_count: 0,
            quality: None,
            looped: None,
            width: 0,
            height: 0,
            compression: ArchiveCompression::default(),
            command_template: None,
            extra_parameters: None,
            detect_unchanged_pixels: false,
            dummy_color: None,
            upload: false,
            copy_to_clipboard: false,
            copy_type: CopyType::default(),
            execute_commands: false,
            post_commands: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadOutcome {
    pub ok: bool,
    pub link: Option<String>,
    pub delete_link: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipboardOutcome {
    pub ok: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub ok: bool,
    pub command: String,
    pub output: String,
    pub error: Option<String>,
}

/// Point-in-time copy of a job's observable state.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub format: ExportFormat,
    pub backend: EncoderBackend,
    pub output_path: PathBuf,
    pub status: JobStatus,
    pub frame_count: usize,
    pub current_frame: usize,
    pub message: Option<String>,
    pub indeterminate: bool,
    pub failure: Option<JobFailure>,
    pub upload: Option<UploadOutcome>,
    pub clipboard: Option<ClipboardOutcome>,
    pub command: Option<CommandOutcome>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_sticky() {
        use JobStatus::*;
        for terminal in [Completed, Canceled, Error, FileDeletedOrMoved] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(Processing));
        }
        assert!(!Canceled.can_transition_to(Completed));
        assert!(!Error.can_transition_to(Canceled));
        assert!(Completed.can_transition_to(FileDeletedOrMoved));
        assert!(FileDeletedOrMoved.can_transition_to(Completed));
        assert!(Starting.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Canceled));
    }

    #[test]
    fn parameters_deserialize_with_defaults() {
        let params: EncodeParameters = serde_json::from_str(
            r#"{ "format": "video", "backend": "ffmpeg", "output_path": "/tmp/a.mp4",
                 "extra_parameters": "-c:v libvpx-vp9 -pass 2" }"#,
        )
        .unwrap();
        assert_eq!(params.format, ExportFormat::Video);
        assert_eq!(params.backend, EncoderBackend::Ffmpeg);
        assert_eq!(params.repeat_count, 0);
        assert!(!params.upload);
        assert_eq!(params.copy_type, CopyType::File);
    }
}
