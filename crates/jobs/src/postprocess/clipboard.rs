use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipboardContent {
    File(PathBuf),
    Text(String),
}

#[derive(Debug, Error)]
pub enum ClipboardError {
    /// Another process holds the clipboard. The only retryable failure.
    #[error("clipboard is busy")]
    Busy,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub trait Clipboard: Send + Sync {
    fn set(&self, content: &ClipboardContent) -> Result<(), ClipboardError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(100),
        }
    }
}

/// Sets the clipboard, retrying while it is busy. Returns the number of
/// attempts used.
pub fn copy_with_retry(
    clipboard: &dyn Clipboard,
    content: &ClipboardContent,
    policy: RetryPolicy,
) -> Result<u32, ClipboardError> {
    let attempts = policy.attempts.max(1);
    for attempt in 1..=attempts {
        match clipboard.set(content) {
            Ok(()) => return Ok(attempt),
            Err(ClipboardError::Busy) if attempt < attempts => {
                debug!(attempt, "clipboard busy, retrying");
                thread::sleep(policy.delay);
            }
            Err(e) => return Err(e),
        }
    }
    Err(ClipboardError::Busy)
}

/// Clipboard backed by the platform's command line tool.
pub struct CommandClipboard {
    program: PathBuf,
    args: &'static [&'static str],
}

const CANDIDATES: &[(&str, &[&str])] = &[
    ("pbcopy", &[]),
    ("wl-copy", &[]),
    ("xclip", &["-selection", "clipboard"]),
    ("clip", &[]),
];

impl CommandClipboard {
    pub fn detect() -> Option<Self> {
        CANDIDATES.iter().find_map(|(name, args)| {
            which::which(name).ok().map(|program| Self {
                program,
                args: *args,
            })
        })
    }

    fn is_uri_capable(&self) -> bool {
        matches!(self.tool_name().as_deref(), Some("wl-copy" | "xclip"))
    }

    fn tool_name(&self) -> Option<String> {
        self.program
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
    }
}

fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

impl Clipboard for CommandClipboard {
    fn set(&self, content: &ClipboardContent) -> Result<(), ClipboardError> {
        let mut command = Command::new(&self.program);
        command.args(self.args);
        let text = match content {
            ClipboardContent::Text(text) => text.clone(),
            ClipboardContent::File(path) if self.is_uri_capable() => {
                if self.tool_name().as_deref() == Some("xclip") {
                    command.args(["-t", "text/uri-list"]);
                } else {
                    command.args(["--type", "text/uri-list"]);
                }
                file_uri(path)
            }
            ClipboardContent::File(path) => path.display().to_string(),
        };

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ClipboardError::Other(e.into()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .map_err(|e| ClipboardError::Other(e.into()))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| ClipboardError::Other(e.into()))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        if stderr.contains("busy") || stderr.contains("locked") {
            return Err(ClipboardError::Busy);
        }
        Err(ClipboardError::Other(anyhow::anyhow!(
            "{} exited with {}: {}",
            self.program.display(),
            output.status,
            stderr.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Instant;

    struct Flaky {
        busy_for: u32,
        calls: Mutex<u32>,
        fatal: bool,
    }

    impl Clipboard for Flaky {
        fn set(&self, _: &ClipboardContent) -> Result<(), ClipboardError> {
            let mut calls = self.calls.lock();
            *calls += 1;
            if self.fatal {
                return Err(ClipboardError::Other(anyhow::anyhow!("denied")));
            }
            if *calls <= self.busy_for {
                Err(ClipboardError::Busy)
            } else {
                Ok(())
            }
        }
    }

    fn flaky(busy_for: u32, fatal: bool) -> Flaky {
        Flaky {
            busy_for,
            calls: Mutex::new(0),
            fatal,
        }
    }

    #[test]
    fn retries_while_busy() {
        let clipboard = flaky(9, false);
        let started = Instant::now();
        let attempts = copy_with_retry(
            &clipboard,
            &ClipboardContent::Text("x".into()),
            RetryPolicy::default(),
        )
        .unwrap();
        assert_eq!(attempts, 10);
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[test]
    fn exhausted_retries_fail() {
        let clipboard = flaky(u32::MAX, false);
        let policy = RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(1),
        };
        let err = copy_with_retry(&clipboard, &ClipboardContent::Text("x".into()), policy);
        assert!(matches!(err, Err(ClipboardError::Busy)));
        assert_eq!(*clipboard.calls.lock(), 3);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let clipboard = flaky(0, true);
        let err = copy_with_retry(
            &clipboard,
            &ClipboardContent::Text("x".into()),
            RetryPolicy::default(),
        );
        assert!(matches!(err, Err(ClipboardError::Other(_))));
        assert_eq!(*clipboard.calls.lock(), 1);
    }
}
