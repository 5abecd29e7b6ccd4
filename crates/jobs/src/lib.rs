//! Frame-batch encoding jobs.
//!
//! Each submitted job runs on its own thread: it resolves an encoder
//! strategy, encodes the frames, runs the post-processing stages and reports
//! every step to a [`Reporter`]. [`JobsHandle`] is the caller's side of it.

mod dispatch;
mod error;
mod job;
pub mod postprocess;
mod registry;
mod report;
mod runner;

pub use dispatch::{
    EncodeRequest, EncodeStrategy, FfmpegStrategy, NativeStrategy, ProjectStrategy, SinkStrategy,
    StrategyTable,
};
pub use error::{ConfigurationError, JobFailure, SubmitError};
pub use job::{
    ClipboardOutcome, CommandOutcome, CopyType, EncodeParameters, EncoderBackend, ExportFormat,
    JobSnapshot, JobStatus, UploadOutcome,
};
pub use media_io::Frame;
pub use postprocess::PostProcessors;
pub use registry::{CancelOutcome, JobRegistry};
pub use report::{ChannelReporter, JobEvent, NullReporter, Reporter};

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver};
use media_io::CancellationToken;
use settings::EncoderSettings;
use tracing::{debug, info};
use uuid::Uuid;

use crate::runner::{run_job, JobContext};

#[derive(Clone)]
pub struct JobsHandle {
    registry: Arc<JobRegistry>,
    table: Arc<StrategyTable>,
    post: Arc<PostProcessors>,
    reporter: Arc<dyn Reporter>,
    pub rx_events: Receiver<JobEvent>,
}

pub struct JobsRuntime;

impl JobsRuntime {
    /// The standard encoders and post-processors from `settings`, with events
    /// delivered on [`JobsHandle::rx_events`].
    pub fn start(settings: &EncoderSettings) -> JobsHandle {
        Self::start_with(
            StrategyTable::standard(settings),
            PostProcessors::from_settings(settings),
        )
    }

    pub fn start_with(table: StrategyTable, post: PostProcessors) -> JobsHandle {
        let (tx_events, rx_events) = unbounded::<JobEvent>();
        let mut handle =
            Self::start_with_reporter(table, post, Arc::new(ChannelReporter::new(tx_events)));
        handle.rx_events = rx_events;
        handle
    }

    /// Updates go to `reporter` only; `rx_events` never yields.
    pub fn start_with_reporter(
        table: StrategyTable,
        post: PostProcessors,
        reporter: Arc<dyn Reporter>,
    ) -> JobsHandle {
        JobsHandle {
            registry: Arc::new(JobRegistry::new()),
            table: Arc::new(table),
            post: Arc::new(post),
            reporter,
            rx_events: crossbeam_channel::never(),
        }
    }
}

impl JobsHandle {
    /// Starts a job and returns its id.
    ///
    /// Configuration problems are returned before anything is registered.
    /// The frames' parent directory belongs to the job from here on and is
    /// deleted when the job thread ends.
    pub fn submit(&self, frames: Vec<Frame>, params: EncodeParameters) -> Result<String, SubmitError> {
        let strategy = self.table.resolve(params.format, params.backend)?;
        strategy.check_available()?;
        if frames.is_empty() {
            return Err(ConfigurationError::InvalidParameters("no frames to encode".into()).into());
        }
        if params.output_path.as_os_str().is_empty() {
            return Err(ConfigurationError::InvalidParameters("output path is empty".into()).into());
        }

        let id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        let frame_count = frames.len();
        let (gate_tx, gate_rx) = bounded::<()>(1);

        let ctx = JobContext::new(
            id.clone(),
            token.clone(),
            self.registry.clone(),
            self.reporter.clone(),
        );
        let post = self.post.clone();
        let job_params = params.clone();
        let thread = thread::Builder::new()
            .name(format!("job-{}", &id[..8]))
            .spawn(move || {
                // Wait until the job is registered.
                if gate_rx.recv().is_err() {
                    return;
                }
                run_job(ctx, strategy, frames, job_params, post);
            })
            .map_err(SubmitError::Spawn)?;

        self.registry
            .insert(id.clone(), &params, frame_count, token, thread);
        info!(job_id = %id, format = %params.format, backend = %params.backend, frames = frame_count, "job submitted");
        self.reporter
            .on_status(&id, JobStatus::Starting, None, true, None);
        let _ = gate_tx.send(());
        Ok(id)
    }

    pub fn cancel(&self, id: &str) -> CancelOutcome {
        let outcome = self.registry.cancel(id);
        debug!(job_id = %id, ?outcome, "cancel");
        outcome
    }

    pub fn status(&self, id: &str) -> Option<JobStatus> {
        self.registry.status(id)
    }

    pub fn snapshot(&self, id: &str) -> Option<JobSnapshot> {
        self.registry.snapshot(id)
    }

    pub fn jobs(&self) -> Vec<JobSnapshot> {
        self.registry.list()
    }

    pub fn clear_finished(&self) -> Vec<String> {
        self.registry.clear_finished()
    }

    /// Re-checks finished outputs on disk and reports any status that flipped.
    pub fn refresh_outputs(&self) -> Vec<(String, JobStatus)> {
        self.registry
            .refresh_outputs()
            .into_iter()
            .map(|(id, status, output)| {
                self.reporter
                    .on_status(&id, status, Some(&output), false, None);
                (id, status)
            })
            .collect()
    }

    pub fn strategies(&self) -> Vec<(ExportFormat, EncoderBackend, Arc<dyn EncodeStrategy>)> {
        self.table.entries()
    }

    /// Polls until the job is terminal, gone, or `timeout` elapses. Returns
    /// the last status seen.
    pub fn wait_for(&self, id: &str, timeout: Duration) -> Option<JobStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.registry.status(id);
            match status {
                Some(s) if !s.is_terminal() && Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(10));
                }
                _ => return status,
            }
        }
    }
}
