use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use crossbeam_channel::RecvTimeoutError;
use jobs::{
    CopyType, EncodeParameters, EncoderBackend, ExportFormat, Frame, JobEvent, JobStatus,
    JobsHandle, JobsRuntime, SubmitError,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use settings::EncoderSettings;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const FRAME_EXTENSIONS: &[&str] = &["png", "bmp", "gif"];

#[derive(Parser)]
#[command(name = "framepress")]
#[command(about = "Encode frame sequences into GIF, APNG, video or project archives")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode one directory of frames
    Encode {
        /// Directory holding the frame images, encoded in name order
        #[arg(short, long)]
        frames: PathBuf,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// gif, apng, video, project or psd
        #[arg(long, default_value = "gif", value_parser = parse_snake::<ExportFormat>)]
        format: ExportFormat,

        /// builtin, ffmpeg or gifski
        #[arg(long, default_value = "builtin", value_parser = parse_snake::<EncoderBackend>)]
        backend: EncoderBackend,

        /// Delay of every frame in milliseconds
        #[arg(long, default_value = "100")]
        delay: u32,

        /// Loop count: 0 loops forever, -1 plays once
        #[arg(long, default_value = "0")]
        repeat: i32,

        /// Only encode the pixels that changed between frames
        #[arg(long)]
        delta: bool,

        /// Upload the result with this shell command (receives FILENAME)
        #[arg(long)]
        upload_command: Option<String>,

        /// Copy something to the clipboard when done
        #[arg(long, value_enum)]
        copy: Option<CopyArg>,

        /// Command to run after encoding; {p}, {f} and {u} are substituted
        #[arg(long)]
        post_command: Option<String>,

        /// Cancel the job after this many seconds
        #[arg(long)]
        cancel_after: Option<f64>,
    },

    /// Encode every job listed in a JSON manifest concurrently
    Batch {
        /// JSON array of { "frames": dir, "delay": ms, "params": {..} }
        manifest: PathBuf,

        /// Cancel all jobs after this many seconds
        #[arg(long)]
        cancel_after: Option<f64>,
    },

    /// List the registered encoders and whether they can run here
    Encoders,

    /// Show or create the settings file
    Settings {
        /// Print the effective settings
        #[arg(long)]
        show: bool,

        /// Write the default settings if no file exists
        #[arg(long)]
        init: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CopyArg {
    File,
    FolderPath,
    Link,
    FilePath,
}

impl From<CopyArg> for CopyType {
    fn from(arg: CopyArg) -> Self {
        match arg {
            CopyArg::File => CopyType::File,
            CopyArg::FolderPath => CopyType::FolderPath,
            CopyArg::Link => CopyType::Link,
            CopyArg::FilePath => CopyType::FilePath,
        }
    }
}

#[derive(Deserialize)]
struct BatchEntry {
    frames: PathBuf,
    #[serde(default = "default_delay")]
    delay: u32,
    params: EncodeParameters,
}

fn default_delay() -> u32 {
    100
}

fn parse_snake<T: DeserializeOwned>(value: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| format!("unknown value `{value}`"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Encode {
            frames,
            output,
            format,
            backend,
            delay,
            repeat,
            delta,
            upload_command,
            copy,
            post_command,
            cancel_after,
        } => {
            let mut settings = EncoderSettings::load_or_default()?;
            if upload_command.is_some() {
                settings.upload_command = upload_command;
            }
            let post_commands = post_command.unwrap_or_else(|| settings.post_command.clone());
            let params = EncodeParameters {
                format,
                backend,
                output_path: output,
                repeat_count: repeat,
                detect_unchanged_pixels: delta,
                upload: settings.upload_command.is_some(),
                copy_to_clipboard: copy.is_some(),
                copy_type: copy.map(CopyType::from).unwrap_or_default(),
                execute_commands: !post_commands.trim().is_empty(),
                post_commands,
                ..Default::default()
            };
            let handle = JobsRuntime::start(&settings);
            let staged = stage_frames(&frames, delay)?;
            let id = submit_staged(&handle, staged, params)?;
            watch(&handle, vec![id], cancel_after)
        }
        Commands::Batch {
            manifest,
            cancel_after,
        } => batch_command(&manifest, cancel_after),
        Commands::Encoders => encoders_command(),
        Commands::Settings { show, init } => settings_command(show, init),
    }
}

fn batch_command(manifest: &Path, cancel_after: Option<f64>) -> Result<()> {
    let text = fs::read_to_string(manifest)
        .with_context(|| format!("read manifest {}", manifest.display()))?;
    let entries: Vec<BatchEntry> =
        serde_json::from_str(&text).with_context(|| format!("parse {}", manifest.display()))?;
    if entries.is_empty() {
        bail!("manifest {} lists no jobs", manifest.display());
    }

    let settings = EncoderSettings::load_or_default()?;
    let handle = JobsRuntime::start(&settings);
    let mut ids = Vec::new();
    for (index, frames, params) in stage_batch(entries) {
        match submit_staged(&handle, frames, params) {
            Ok(id) => ids.push(id),
            Err(e) => warn!(index, error = %e, "job rejected"),
        }
    }
    if ids.is_empty() {
        bail!("no job could be started");
    }
    info!("Submitted {} jobs", ids.len());

    let result = watch(&handle, ids, cancel_after);
    let cleared = handle.clear_finished();
    debug!(count = cleared.len(), "finished jobs cleared");
    result
}

/// Stages every manifest entry up front. Entries whose frames cannot be
/// staged are logged and skipped so the rest of the batch still runs.
fn stage_batch(entries: Vec<BatchEntry>) -> Vec<(usize, Vec<Frame>, EncodeParameters)> {
    entries
        .into_iter()
        .enumerate()
        .filter_map(
            |(index, entry)| match stage_frames(&entry.frames, entry.delay) {
                Ok(frames) => Some((index, frames, entry.params)),
                Err(e) => {
                    warn!(index, error = %format!("{e:#}"), "frames could not be staged");
                    None
                }
            },
        )
        .collect()
}

/// Submits staged frames, removing the staging directory if the job is
/// rejected.
fn submit_staged(
    handle: &JobsHandle,
    frames: Vec<Frame>,
    params: EncodeParameters,
) -> Result<String, SubmitError> {
    let staging = frames
        .first()
        .and_then(|f| f.path.parent())
        .map(Path::to_path_buf);
    handle.submit(frames, params).inspect_err(|_| {
        if let Some(dir) = &staging {
            if let Err(e) = fs::remove_dir_all(dir) {
                warn!(dir = %dir.display(), error = %e, "failed to remove staged frames");
            }
        }
    })
}

/// Streams events as JSON lines until every job in `ids` has finished or
/// been removed. Fails if any job ended in error.
fn watch(handle: &JobsHandle, ids: Vec<String>, cancel_after: Option<f64>) -> Result<()> {
    let started = Instant::now();
    let cancel_at = cancel_after.map(Duration::from_secs_f64);
    let mut canceled = false;
    let mut pending = ids.iter().cloned().collect::<HashSet<_>>();
    let mut failed = 0usize;

    while !pending.is_empty() {
        match handle.rx_events.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                println!("{}", serde_json::to_string(&event)?);
                if let JobEvent::Status { id, status, .. } = &event {
                    if status.is_terminal() {
                        pending.remove(id);
                        if *status == JobStatus::Error {
                            failed += 1;
                        }
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        // Jobs canceled before they started leave the registry silently.
        pending.retain(|id| handle.status(id).is_some());

        if let Some(limit) = cancel_at {
            if !canceled && started.elapsed() >= limit {
                canceled = true;
                for id in &pending {
                    let outcome = handle.cancel(id);
                    info!(job_id = %id, ?outcome, "cancel requested");
                }
            }
        }
    }

    for id in &ids {
        if let Some(snapshot) = handle.snapshot(id) {
            info!(job_id = %id, status = %snapshot.status, output = %snapshot.output_path.display(), "job finished");
        }
    }
    if failed > 0 {
        bail!("{failed} of {} jobs failed", ids.len());
    }
    Ok(())
}

/// Copies the frame images of `source` into a fresh directory owned by the
/// job, which deletes it when done.
fn stage_frames(source: &Path, delay_ms: u32) -> Result<Vec<Frame>> {
    let mut images = fs::read_dir(source)
        .with_context(|| format!("read frames from {}", source.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_frame_image(path))
        .collect::<Vec<_>>();
    if images.is_empty() {
        bail!("no frame images in {}", source.display());
    }
    images.sort_by(|a, b| frame_order(a).cmp(&frame_order(b)));

    let staging = std::env::temp_dir().join(format!("framepress-{}", Uuid::new_v4()));
    fs::create_dir_all(&staging)
        .with_context(|| format!("create staging directory {}", staging.display()))?;

    let mut frames = Vec::with_capacity(images.len());
    for (index, image) in images.iter().enumerate() {
        let extension = image
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "png".to_string());
        let target = staging.join(format!("{index}.{extension}"));
        if let Err(e) = fs::copy(image, &target) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e).with_context(|| format!("stage frame {}", image.display()));
        }
        frames.push(Frame::new(target, delay_ms));
    }
    debug!(count = frames.len(), dir = %staging.display(), "frames staged");
    Ok(frames)
}

fn is_frame_image(path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .is_some_and(|e| FRAME_EXTENSIONS.contains(&e.as_str()))
}

/// Numeric stems sort by value, the rest by name after them.
fn frame_order(path: &Path) -> (u64, String) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    (stem.parse::<u64>().unwrap_or(u64::MAX), stem)
}

fn encoders_command() -> Result<()> {
    let settings = EncoderSettings::load_or_default()?;
    let handle = JobsRuntime::start(&settings);

    println!("Registered encoders:");
    for (format, backend, strategy) in handle.strategies() {
        let availability = match strategy.check_available() {
            Ok(()) => "available".to_string(),
            Err(e) => format!("unavailable ({e})"),
        };
        println!(
            "  {:<8} {:<8} {:<16} {availability}",
            format.to_string(),
            backend.to_string(),
            strategy.name()
        );
    }
    Ok(())
}

fn settings_command(show: bool, init: bool) -> Result<()> {
    let path = settings::settings_path();
    if init {
        if path.exists() {
            info!("Settings already exist at {:?}", path);
        } else {
            let written = EncoderSettings::default().save()?;
            info!("Default settings written to {:?}", written);
        }
    }
    if show || !init {
        let settings = EncoderSettings::load_or_default()?;
        println!("{}", serde_json::to_string_pretty(&settings)?);
        println!("# {}", path.display());
    }
    Ok(())
}
