use std::io::Read;
use std::path::Path;
use std::process::Stdio;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::shell_command;
use crate::job::CommandOutcome;

const EXIT_WAIT: Duration = Duration::from_secs(1);

/// Substitutes `{p}` (the output file), `{f}` (its folder) and `{u}` (the
/// uploaded link). Each value is wrapped in double quotes.
pub fn expand_placeholders(template: &str, path: &Path, link: Option<&str>) -> String {
    let folder = path
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    template
        .replace("{p}", &format!("\"{}\"", path.display()))
        .replace("{f}", &format!("\"{folder}\""))
        .replace("{u}", &format!("\"{}\"", link.unwrap_or_default()))
}

/// Runs each non-blank line of `template` through the shell in order.
///
/// Stdout is collected into the outcome. Output on stderr fails the line and
/// skips the rest.
pub fn run_post_commands(template: &str, path: &Path, link: Option<&str>) -> CommandOutcome {
    let command = expand_placeholders(template, path, link);
    let mut output = String::new();

    for line in command.split('\n').map(str::trim).filter(|l| !l.is_empty()) {
        debug!(command = line, "running post command");
        match run_line(line) {
            Ok(stdout) => {
                if !stdout.trim().is_empty() {
                    output.push_str(stdout.trim_end());
                    output.push('\n');
                }
            }
            Err(error) => {
                return CommandOutcome {
                    ok: false,
                    command,
                    output,
                    error: Some(error),
                };
            }
        }
    }

    CommandOutcome {
        ok: true,
        command,
        output,
        error: None,
    }
}

fn run_line(line: &str) -> Result<String, String> {
    let mut child = shell_command(line)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to start `{line}`: {e}"))?;

    let stderr_reader = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = pipe.read_to_string(&mut buf);
            buf
        })
    });
    let mut stdout = String::new();
    if let Some(mut pipe) = child.stdout.take() {
        let _ = pipe.read_to_string(&mut stdout);
    }
    let stderr = stderr_reader
        .and_then(|reader| reader.join().ok())
        .unwrap_or_default();

    let deadline = Instant::now() + EXIT_WAIT;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            Ok(None) => {
                warn!(command = line, "post command did not exit, killing it");
                let _ = child.kill();
                let _ = child.wait();
                break;
            }
            Err(e) => return Err(format!("failed to wait for `{line}`: {e}")),
        }
    }

    if !stderr.trim().is_empty() {
        return Err(stderr.trim().to_string());
    }
    Ok(stdout)
}
