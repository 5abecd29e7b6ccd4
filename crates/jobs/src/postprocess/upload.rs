use std::io::Read;
use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};

use super::shell_command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub link: String,
    pub delete_link: Option<String>,
}

/// Publishes a finished file somewhere and returns where it ended up.
pub trait Uploader: Send + Sync {
    fn upload(&self, path: &Path) -> Result<UploadedFile>;
}

/// Uploads by running a shell command with the file in `FILENAME`.
///
/// The command must exit with status 0 and print the link on the first line
/// of stdout. An optional second line is taken as the deletion link.
pub struct ShellUploader {
    command: String,
}

impl ShellUploader {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Uploader for ShellUploader {
    fn upload(&self, path: &Path) -> Result<UploadedFile> {
        let mut child = shell_command(&self.command)
            .env("FILENAME", path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to start the upload command")?;

        let mut stdout = String::new();
        if let Some(mut pipe) = child.stdout.take() {
            pipe.read_to_string(&mut stdout)
                .context("failed to read the upload command output")?;
        }
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }

        let status = child.wait().context("failed to wait for the upload command")?;
        if !status.success() {
            bail!("upload command failed with {status}: {}", stderr.trim());
        }

        let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
        let link = lines
            .next()
            .ok_or_else(|| anyhow!("upload command printed no link"))?
            .to_string();
        Ok(UploadedFile {
            link,
            delete_link: lines.next().map(str::to_string),
        })
    }
}
