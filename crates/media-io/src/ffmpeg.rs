//! Supervision of an external ffmpeg-compatible encoder.
//!
//! Frames are described to the tool through a concat-demuxer manifest. The
//! tool's diagnostic stream is read line by line on a helper thread for
//! `frame=` progress markers, while the supervisor polls the cancellation
//! token and kills the tool as soon as it is set.

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::persist::remove_if_exists;
use crate::{CancellationToken, EncodeError, Frame, ProgressSink};

const MANIFEST_NAME: &str = "concat.txt";
const SECOND_PASS_MARKER: &str = "-pass 2";
/// How long the supervisor waits on the diagnostic stream before it looks at
/// the cancellation token again.
const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FfmpegKind {
    Gif,
    Apng,
    Video,
}

impl FfmpegKind {
    /// Template used when the caller does not supply one.
    pub fn default_template(self) -> &'static str {
        match self {
            FfmpegKind::Gif | FfmpegKind::Video => {
                r#"-vsync 2 -safe 0 -f concat -i "{I}" {E} -y "{O}""#
            }
            FfmpegKind::Apng => {
                r#"-vsync 2 -safe 0 -f concat -i "{I}" {E} -plays {R} -f apng -y "{O}""#
            }
        }
    }

    fn supports_two_pass(self) -> bool {
        !matches!(self, FfmpegKind::Apng)
    }
}

impl fmt::Display for FfmpegKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FfmpegKind::Gif => "gif",
            FfmpegKind::Apng => "apng",
            FfmpegKind::Video => "video",
        })
    }
}

/// Everything needed to run one encode through the external tool.
#[derive(Debug, Clone)]
pub struct FfmpegRequest<'a> {
    pub kind: FfmpegKind,
    pub frames: &'a [Frame],
    pub output: &'a Path,
    /// Uses `{I}`, `{E}`, `{R}` and `{O}` placeholders.
    pub command_template: &'a str,
    /// Substituted into `{E}` after `{W}`/`{H}` expansion.
    pub extra_parameters: &'a str,
    pub width: u32,
    pub height: u32,
    pub repeat_count: i32,
}

/// Command lines for one encode: a single invocation, or two when the extra
/// parameters ask for a second pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlan {
    pub first: String,
    pub second: Option<String>,
}

impl CommandPlan {
    pub fn build(request: &FfmpegRequest<'_>, manifest: &Path) -> Self {
        let input = format!("file:{}", manifest.display());
        let output = request.output.display().to_string();
        let extra = request
            .extra_parameters
            .replace("{H}", &request.height.to_string())
            .replace("{W}", &request.width.to_string());

        if request.kind.supports_two_pass() && extra.contains(SECOND_PASS_MARKER) {
            let first_extra = extra.replace(SECOND_PASS_MARKER, "-pass 1");
            let pass = |extra: &str| {
                format!(
                    r#"-vsync 2 -safe 0 -f concat -i "{input}" {extra} -passlogfile "{output}" -y "{output}""#
                )
            };
            return CommandPlan {
                first: pass(&first_extra),
                second: Some(format!("-hide_banner {}", pass(&extra))),
            };
        }

        let template = if request.command_template.trim().is_empty() {
            request.kind.default_template()
        } else {
            request.command_template
        };
        CommandPlan {
            first: template
                .replace("{I}", &input)
                .replace("{E}", &extra)
                .replace("{R}", &plays_for(request.repeat_count).to_string())
                .replace("{O}", &output),
            second: None,
        }
    }

    pub fn commands(&self) -> Vec<String> {
        std::iter::once(self.first.clone())
            .chain(self.second.clone())
            .collect()
    }
}

/// ffmpeg's `-plays` uses 0 for infinite; a negative repeat count plays once.
fn plays_for(repeat_count: i32) -> i32 {
    if repeat_count < 0 {
        1
    } else {
        repeat_count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorOutcome {
    Completed,
    Canceled,
}

/// Runs the external encoder and enforces cancellation by killing it.
#[derive(Debug, Clone)]
pub struct FfmpegSupervisor {
    program: PathBuf,
}

impl FfmpegSupervisor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn locate(explicit: Option<&Path>) -> Result<Self, EncodeError> {
        locate_ffmpeg(explicit).map(Self::new)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn run(
        &self,
        request: &FfmpegRequest<'_>,
        token: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> Result<SupervisorOutcome, EncodeError> {
        let first_frame = request.frames.first().ok_or(EncodeError::NoFrames)?;
        remove_if_exists(request.output)?;

        let manifest_dir = first_frame
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        fs::create_dir_all(&manifest_dir)?;
        let manifest = manifest_dir.join(MANIFEST_NAME);
        fs::write(&manifest, build_concat_manifest(request.frames))?;

        let plan = CommandPlan::build(request, &manifest);
        let mut log = String::new();

        progress.set_indeterminate(true);
        progress.frame(0, "Analyzing");
        let mut outcome = self.run_pass(&plan.first, token, progress, &mut log)?;

        if let Some(second) = &plan.second {
            if outcome == SupervisorOutcome::Completed {
                progress.set_indeterminate(true);
                progress.frame(0, "Analyzing (second pass)");
                outcome = self.run_pass(second, token, progress, &mut log)?;
            }
            erase_pass_logs(request.output);
        }

        if outcome == SupervisorOutcome::Canceled || token.is_canceled() {
            return Ok(SupervisorOutcome::Canceled);
        }

        let written = fs::metadata(request.output)
            .map(|m| m.len() > 0)
            .unwrap_or(false);
        if !written {
            return Err(EncodeError::Process {
                message: format!("error while encoding the {} with ffmpeg", request.kind),
                commands: plan.commands(),
                log,
            });
        }
        Ok(SupervisorOutcome::Completed)
    }

    fn run_pass(
        &self,
        command_line: &str,
        token: &CancellationToken,
        progress: &dyn ProgressSink,
        log: &mut String,
    ) -> Result<SupervisorOutcome, EncodeError> {
        info!(program = %self.program.display(), command = command_line, "starting encoder");
        let mut child = Command::new(&self.program)
            .args(split_args(command_line))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let Some(stderr) = child.stderr.take() else {
            child.kill()?;
            return Err(EncodeError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "encoder diagnostic stream unavailable",
            )));
        };

        let (tx, rx) = crossbeam_channel::unbounded::<io::Result<String>>();
        let spawned = thread::Builder::new()
            .name("ffmpeg-stderr".into())
            .spawn(move || {
                let mut reader = BufReader::new(stderr);
                let mut line = Vec::new();
                loop {
                    let sent = match read_diagnostic_line(&mut reader, &mut line) {
                        Ok(true) => tx.send(Ok(String::from_utf8_lossy(&line).into_owned())),
                        Ok(false) => break,
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            break;
                        }
                    };
                    if sent.is_err() {
                        break;
                    }
                }
            });
        if let Err(e) = spawned {
            stop(&mut child);
            return Err(e.into());
        }

        let mut indeterminate = true;
        loop {
            if token.is_canceled() {
                debug!("cancellation requested; killing encoder");
                stop(&mut child);
                return Ok(SupervisorOutcome::Canceled);
            }
            let text = match rx.recv_timeout(CANCEL_POLL) {
                Ok(Ok(text)) => text,
                Ok(Err(e)) => {
                    stop(&mut child);
                    return Err(e.into());
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if text.trim().is_empty() {
                continue;
            }
            log.push('\n');
            log.push_str(&text);

            if let Some(frame) = parse_progress_frame(&text).filter(|&f| f > 0) {
                if indeterminate {
                    progress.set_indeterminate(false);
                    indeterminate = false;
                }
                progress.frame(frame as usize, &format!("Processing frame {frame}"));
            }
        }

        let status = child.wait()?;
        debug!(%status, "encoder exited");
        Ok(SupervisorOutcome::Completed)
    }
}

fn stop(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!(error = %e, "failed to kill encoder");
    }
    let _ = child.wait();
}

/// Reads one line ended by `\n` or `\r` into `buf` (terminator excluded).
/// Returns `false` at end of stream with nothing read.
fn read_diagnostic_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<bool> {
    buf.clear();
    loop {
        let available = match reader.fill_buf() {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if available.is_empty() {
            return Ok(!buf.is_empty());
        }
        match available.iter().position(|&b| b == b'\n' || b == b'\r') {
            Some(end) => {
                buf.extend_from_slice(&available[..end]);
                reader.consume(end + 1);
                return Ok(true);
            }
            None => {
                let len = available.len();
                buf.extend_from_slice(available);
                reader.consume(len);
            }
        }
    }
}

/// Builds the concat-demuxer manifest: a `file` and `duration` line per frame.
pub fn build_concat_manifest(frames: &[Frame]) -> String {
    let mut manifest = String::new();
    for frame in frames {
        let path = frame.path.display().to_string().replace('\'', r"'\''");
        manifest.push_str(&format!("file '{path}'\n"));
        manifest.push_str(&format!("duration {}\n", frame.delay_ms as f64 / 1000.0));
    }
    manifest
}

/// Extracts the frame count from a diagnostic line such as
/// `frame=  321 fps=170 q=-0.0 size=57kB`.
pub fn parse_progress_frame(line: &str) -> Option<i64> {
    let mut tokens = line.split_whitespace();
    tokens.find(|t| *t == "frame=")?;
    tokens.next()?.parse().ok()
}

/// Splits a command line on whitespace, keeping quoted runs together and
/// dropping the quotes.
pub fn split_args(command_line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_arg = false;

    for c in command_line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_arg = true;
            }
            None if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            None => {
                current.push(c);
                in_arg = true;
            }
        }
    }
    if in_arg {
        args.push(current);
    }
    args
}

/// Deletes the statistics files a two-pass run leaves next to the output.
pub fn erase_pass_logs(output: &Path) {
    for suffix in ["-0.log.mbtree", "-0.log"] {
        let mut name = OsString::from(output.as_os_str());
        name.push(suffix);
        let path = PathBuf::from(name);
        if let Err(e) = remove_if_exists(&path) {
            warn!(path = %path.display(), error = %e, "failed to delete pass log");
        }
    }
}

/// Resolves the encoder binary: an explicit location wins, then `PATH`.
pub fn locate_ffmpeg(explicit: Option<&Path>) -> Result<PathBuf, EncodeError> {
    match explicit {
        Some(path) if path.is_file() => Ok(path.to_path_buf()),
        Some(path) => Err(EncodeError::ToolMissing {
            tool: format!("ffmpeg ({})", path.display()),
        }),
        None => which::which("ffmpeg").map_err(|_| EncodeError::ToolMissing {
            tool: "ffmpeg".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn request<'a>(
        kind: FfmpegKind,
        frames: &'a [Frame],
        output: &'a Path,
        extra: &'a str,
    ) -> FfmpegRequest<'a> {
        FfmpegRequest {
            kind,
            frames,
            output,
            command_template: "",
            extra_parameters: extra,
            width: 640,
            height: 480,
            repeat_count: 0,
        }
    }

    #[test]
    fn manifest_lists_files_and_seconds() {
        let frames = vec![
            Frame::new("/tmp/f/0.png", 100),
            Frame::new("/tmp/f/it's.png", 1500),
        ];
        assert_eq!(
            build_concat_manifest(&frames),
            "file '/tmp/f/0.png'\nduration 0.1\nfile '/tmp/f/it'\\''s.png'\nduration 1.5\n"
        );
    }

    #[test]
    fn progress_requires_exact_token() {
        assert_eq!(
            parse_progress_frame("frame=  321 fps=170 q=-0.0 Lsize=57kB"),
            Some(321)
        );
        assert_eq!(parse_progress_frame("frame= 0 fps=0.0"), Some(0));
        assert_eq!(parse_progress_frame("keyframe= 12"), None);
        assert_eq!(parse_progress_frame("frame="), None);
        assert_eq!(parse_progress_frame("Input #0, concat"), None);
    }

    #[test]
    fn splits_quoted_arguments() {
        assert_eq!(
            split_args(r#"-i "file:/a b/concat.txt" -vf 'pad=w:h'  -y "out.mp4""#),
            vec!["-i", "file:/a b/concat.txt", "-vf", "pad=w:h", "-y", "out.mp4"]
        );
        assert_eq!(split_args(r#"-metadata title="""#), vec!["-metadata", "title="]);
    }

    #[test]
    fn second_pass_marker_builds_two_commands() {
        let frames = [Frame::new("/tmp/f/0.png", 10)];
        let out = Path::new("/tmp/out.webm");
        let extra = "-c:v libvpx-vp9 -vf scale={W}:{H} -pass 2";
        let req = request(FfmpegKind::Video, &frames, out, extra);
        let plan = CommandPlan::build(&req, Path::new("/tmp/f/concat.txt"));

        assert!(plan.first.contains("-pass 1"));
        assert!(!plan.first.contains("-pass 2"));
        assert!(plan.first.contains("scale=640:480"));
        let second = plan.second.expect("second pass");
        assert!(second.starts_with("-hide_banner "));
        assert!(second.contains("-pass 2"));
        for cmd in [&plan.first, &second] {
            assert!(cmd.contains(r#"-passlogfile "/tmp/out.webm""#));
            assert!(cmd.ends_with(r#"-y "/tmp/out.webm""#));
        }
    }

    #[test]
    fn apng_never_uses_two_passes() {
        let frames = [Frame::new("/tmp/f/0.png", 10)];
        let out = Path::new("/tmp/out.png");
        let mut req = request(FfmpegKind::Apng, &frames, out, "-pass 2");
        req.repeat_count = -1;
        let plan = CommandPlan::build(&req, Path::new("/tmp/f/concat.txt"));
        assert!(plan.second.is_none());
        assert!(plan.first.contains("-plays 1"));
        assert!(plan.first.contains(r#"-i "file:/tmp/f/concat.txt""#));
    }

    #[test]
    fn reads_carriage_return_lines() {
        let mut reader = io::Cursor::new(b"one\rtwo\nthree".to_vec());
        let mut line = Vec::new();
        let mut seen = Vec::new();
        while read_diagnostic_line(&mut reader, &mut line).unwrap() {
            seen.push(String::from_utf8(line.clone()).unwrap());
        }
        assert_eq!(seen, vec!["one", "two", "three"]);
    }

    #[test]
    fn explicit_missing_tool_is_reported() {
        let err = locate_ffmpeg(Some(Path::new("/definitely/not/ffmpeg"))).unwrap_err();
        assert!(matches!(err, EncodeError::ToolMissing { .. }));
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ProgressSink for Recorder {
        fn set_indeterminate(&self, indeterminate: bool) {
            self.events.lock().unwrap().push(format!("indeterminate={indeterminate}"));
        }
        fn frame(&self, index: usize, _message: &str) {
            self.events.lock().unwrap().push(format!("frame={index}"));
        }
    }

    #[cfg(unix)]
    fn fake_tool(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-ffmpeg");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn supervisor_reports_progress_and_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(
            dir.path(),
            r#"for a; do out="$a"; done
printf 'frame=    0 fps=0.0\r' >&2
printf 'frame=    2 fps=9.0\r' >&2
printf 'frame=    3 fps=9.0\n' >&2
printf 'data' > "$out""#,
        );
        let frames = [Frame::new(dir.path().join("0.png"), 10)];
        let out = dir.path().join("out.gif");
        let recorder = Recorder::default();

        let outcome = FfmpegSupervisor::new(tool)
            .run(
                &request(FfmpegKind::Gif, &frames, &out, ""),
                &CancellationToken::new(),
                &recorder,
            )
            .unwrap();

        assert_eq!(outcome, SupervisorOutcome::Completed);
        assert!(dir.path().join(MANIFEST_NAME).exists());
        let events = recorder.events.into_inner().unwrap();
        assert_eq!(
            events,
            vec!["indeterminate=true", "frame=0", "indeterminate=false", "frame=2", "frame=3"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn empty_output_is_a_process_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(
            dir.path(),
            r#"for a; do out="$a"; done
echo 'Unknown encoder' >&2
: > "$out""#,
        );
        let frames = [Frame::new(dir.path().join("0.png"), 10)];
        let out = dir.path().join("out.mp4");

        let err = FfmpegSupervisor::new(tool)
            .run(
                &request(FfmpegKind::Video, &frames, &out, "-c:v libx264"),
                &CancellationToken::new(),
                &crate::NullProgress,
            )
            .unwrap_err();

        match err {
            EncodeError::Process { commands, log, .. } => {
                assert_eq!(commands.len(), 1);
                assert!(commands[0].contains("-c:v libx264"));
                assert!(log.contains("Unknown encoder"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn canceled_token_kills_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "sleep 5");
        let frames = [Frame::new(dir.path().join("0.png"), 10)];
        let out = dir.path().join("out.gif");
        let token = CancellationToken::new();
        token.cancel();

        let outcome = FfmpegSupervisor::new(tool)
            .run(&request(FfmpegKind::Gif, &frames, &out, ""), &token, &crate::NullProgress)
            .unwrap();
        assert_eq!(outcome, SupervisorOutcome::Canceled);
    }

    /// Cancels its token once the encoder reports `frame`.
    struct CancelAt {
        frame: usize,
        token: CancellationToken,
    }

    impl ProgressSink for CancelAt {
        fn set_indeterminate(&self, _: bool) {}
        fn frame(&self, index: usize, _message: &str) {
            if index == self.frame {
                self.token.cancel();
            }
        }
    }

    #[cfg(unix)]
    #[test]
    fn silent_encoder_is_killed_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(
            dir.path(),
            r#"for a; do out="$a"; done
printf 'frame=    1 fps=1.0\n' >&2
sleep 5
printf 'data' > "$out""#,
        );
        let frames = [Frame::new(dir.path().join("0.png"), 10)];
        let out = dir.path().join("out.gif");
        let token = CancellationToken::new();
        let progress = CancelAt {
            frame: 1,
            token: token.clone(),
        };

        let started = std::time::Instant::now();
        let outcome = FfmpegSupervisor::new(tool)
            .run(&request(FfmpegKind::Gif, &frames, &out, ""), &token, &progress)
            .unwrap();

        assert_eq!(outcome, SupervisorOutcome::Canceled);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!out.exists());
    }

    #[cfg(unix)]
    #[test]
    fn two_pass_runs_both_commands_and_erases_logs() {
        let dir = tempfile::tempdir().unwrap();
        let calls = dir.path().join("calls.txt");
        let tool = fake_tool(
            dir.path(),
            &format!(
                r#"echo "$*" >> "{calls}"
for a; do out="$a"; done
case "$*" in *-passlogfile*) : > "$out-0.log"; : > "$out-0.log.mbtree";; esac
printf 'data' > "$out""#,
                calls = calls.display()
            ),
        );
        let frames = [Frame::new(dir.path().join("0.png"), 10)];
        let out = dir.path().join("out.webm");

        let outcome = FfmpegSupervisor::new(tool)
            .run(
                &request(FfmpegKind::Video, &frames, &out, "-c:v libvpx-vp9 -pass 2"),
                &CancellationToken::new(),
                &crate::NullProgress,
            )
            .unwrap();

        assert_eq!(outcome, SupervisorOutcome::Completed);
        let calls = fs::read_to_string(&calls).unwrap();
        let calls = calls.lines().collect::<Vec<_>>();
        assert_eq!(calls.len(), 2, "{calls:?}");
        assert!(calls[0].contains("-pass 1"));
        assert!(calls[1].starts_with("-hide_banner"));
        assert!(calls[1].contains("-pass 2"));
        assert!(out.exists());
        for suffix in ["-0.log", "-0.log.mbtree"] {
            let mut log = OsString::from(out.as_os_str());
            log.push(suffix);
            assert!(!Path::new(&log).exists(), "{suffix} left behind");
        }
    }
}
