//! Best-effort work after a successful encode: upload, clipboard and user
//! commands. Each stage records its own outcome and never changes the job's
//! terminal status.

mod clipboard;
mod command;
mod upload;

pub use clipboard::{
    copy_with_retry, Clipboard, ClipboardContent, ClipboardError, CommandClipboard, RetryPolicy,
};
pub use command::{expand_placeholders, run_post_commands};
pub use upload::{ShellUploader, UploadedFile, Uploader};

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use media_io::ProgressSink;
use settings::EncoderSettings;
use tracing::{info, warn};

use crate::job::{ClipboardOutcome, CopyType, EncodeParameters, UploadOutcome};
use crate::runner::JobContext;

/// Collaborators used by the post-processing stages.
pub struct PostProcessors {
    pub uploader: Option<Arc<dyn Uploader>>,
    pub clipboard: Option<Arc<dyn Clipboard>>,
    pub clipboard_retry: RetryPolicy,
}

impl PostProcessors {
    pub fn none() -> Self {
        Self {
            uploader: None,
            clipboard: None,
            clipboard_retry: RetryPolicy::default(),
        }
    }

    pub fn from_settings(settings: &EncoderSettings) -> Self {
        Self {
            uploader: settings
                .upload_command
                .clone()
                .map(|command| Arc::new(ShellUploader::new(command)) as Arc<dyn Uploader>),
            clipboard: CommandClipboard::detect()
                .map(|clipboard| Arc::new(clipboard) as Arc<dyn Clipboard>),
            clipboard_retry: RetryPolicy::default(),
        }
    }
}

/// `sh -c <line>`, or `cmd /C <line>` on Windows.
pub(crate) fn shell_command(line: &str) -> Command {
    let mut command;
    if cfg!(target_os = "windows") {
        command = Command::new("cmd");
        command.arg("/C");
    } else {
        command = Command::new("sh");
        command.arg("-c");
    }
    command.arg(line);
    command
}

pub(crate) fn run(ctx: &JobContext, params: &EncodeParameters, post: &PostProcessors) {
    let output = params.output_path.as_path();
    let mut link = None;

    if params.upload {
        stage(ctx, "Uploading");
        let outcome = upload(output, post.uploader.as_deref());
        link = outcome.link.clone();
        ctx.record_upload(outcome);
    }
    if ctx.token.is_canceled() {
        return;
    }

    if params.copy_to_clipboard {
        let outcome = match post.clipboard.as_deref() {
            Some(clipboard) => {
                let content = clipboard_content(params.copy_type, output, link.as_deref());
                match copy_with_retry(clipboard, &content, post.clipboard_retry) {
                    Ok(attempts) => {
                        info!(job_id = %ctx.id, attempts, "copied to clipboard");
                        ClipboardOutcome {
                            ok: true,
                            error: None,
                        }
                    }
                    Err(e) => {
                        warn!(job_id = %ctx.id, error = %e, "clipboard copy failed");
                        ClipboardOutcome {
                            ok: false,
                            error: Some(e.to_string()),
                        }
                    }
                }
            }
            None => ClipboardOutcome {
                ok: false,
                error: Some("no clipboard available".to_string()),
            },
        };
        ctx.record_clipboard(outcome);
    }
    if ctx.token.is_canceled() {
        return;
    }

    if params.execute_commands && !params.post_commands.trim().is_empty() {
        stage(ctx, "Executing commands");
        let outcome = run_post_commands(&params.post_commands, output, link.as_deref());
        if let Some(error) = &outcome.error {
            warn!(job_id = %ctx.id, error = %error, "post command failed");
        }
        ctx.record_command(outcome);
    }
}

fn stage(ctx: &JobContext, message: &str) {
    ctx.set_indeterminate(true);
    ctx.frame(0, message);
}

fn upload(output: &Path, uploader: Option<&dyn Uploader>) -> UploadOutcome {
    let Some(uploader) = uploader else {
        return UploadOutcome {
            ok: false,
            link: None,
            delete_link: None,
            error: Some("no uploader configured".to_string()),
        };
    };
    match uploader.upload(output) {
        Ok(file) => UploadOutcome {
            ok: true,
            link: Some(file.link),
            delete_link: file.delete_link,
            error: None,
        },
        Err(e) => {
            warn!(error = %format!("{e:#}"), "upload failed");
            UploadOutcome {
                ok: false,
                link: None,
                delete_link: None,
                error: Some(format!("{e:#}")),
            }
        }
    }
}

fn clipboard_content(copy_type: CopyType, output: &Path, link: Option<&str>) -> ClipboardContent {
    let path_text = || output.display().to_string();
    match copy_type {
        CopyType::File => ClipboardContent::File(output.to_path_buf()),
        CopyType::FolderPath => ClipboardContent::Text(
            output
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_else(path_text),
        ),
        CopyType::Link => ClipboardContent::Text(
            link.filter(|l| !l.is_empty())
                .map(str::to_string)
                .unwrap_or_else(path_text),
        ),
        CopyType::FilePath => ClipboardContent::Text(path_text()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_falls_back_to_file_path() {
        let out = Path::new("/tmp/shots/out.gif");
        assert_eq!(
            clipboard_content(CopyType::Link, out, None),
            ClipboardContent::Text("/tmp/shots/out.gif".into())
        );
        assert_eq!(
            clipboard_content(CopyType::Link, out, Some("https://i.example/x")),
            ClipboardContent::Text("https://i.example/x".into())
        );
        assert_eq!(
            clipboard_content(CopyType::FolderPath, out, None),
            ClipboardContent::Text("/tmp/shots".into())
        );
        assert_eq!(
            clipboard_content(CopyType::File, out, None),
            ClipboardContent::File(out.to_path_buf())
        );
    }

    #[test]
    fn missing_uploader_is_a_stage_failure() {
        let outcome = upload(Path::new("/tmp/out.gif"), None);
        assert!(!outcome.ok);
        assert!(outcome.error.is_some());
    }
}
