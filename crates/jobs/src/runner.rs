use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use media_io::{remove_if_exists, CancellationToken, Frame, ProgressSink};
use tracing::{debug, error, info, warn};

use crate::dispatch::{EncodeRequest, EncodeStrategy};
use crate::error::JobFailure;
use crate::job::{ClipboardOutcome, CommandOutcome, EncodeParameters, JobStatus, UploadOutcome};
use crate::postprocess::{self, PostProcessors};
use crate::registry::JobRegistry;
use crate::report::Reporter;

/// A job's view of the shared registry and reporter. Every update lands in
/// both, and nothing reaches the reporter for a job that has been removed.
pub(crate) struct JobContext {
    pub(crate) id: String,
    pub(crate) token: CancellationToken,
    registry: Arc<JobRegistry>,
    reporter: Arc<dyn Reporter>,
}

impl JobContext {
    pub(crate) fn new(
        id: String,
        token: CancellationToken,
        registry: Arc<JobRegistry>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            id,
            token,
            registry,
            reporter,
        }
    }

    pub(crate) fn set_status(&self, status: JobStatus, output: Option<&Path>, indeterminate: bool) {
        if self.registry.set_status(&self.id, status, indeterminate, None) {
            self.reporter
                .on_status(&self.id, status, output, indeterminate, None);
        }
    }

    fn fail(&self, failure: JobFailure) {
        if self
            .registry
            .set_status(&self.id, JobStatus::Error, false, Some(failure.clone()))
        {
            self.reporter
                .on_status(&self.id, JobStatus::Error, None, false, Some(&failure));
        }
    }

    pub(crate) fn record_upload(&self, outcome: UploadOutcome) {
        self.reporter.on_upload(
            &self.id,
            outcome.ok,
            outcome.link.as_deref(),
            outcome.delete_link.as_deref(),
            outcome.error.as_deref(),
        );
        self.registry.record_upload(&self.id, outcome);
    }

    pub(crate) fn record_clipboard(&self, outcome: ClipboardOutcome) {
        self.reporter
            .on_clipboard(&self.id, outcome.ok, outcome.error.as_deref());
        self.registry.record_clipboard(&self.id, outcome);
    }

    pub(crate) fn record_command(&self, outcome: CommandOutcome) {
        self.reporter.on_command(
            &self.id,
            outcome.ok,
            &outcome.command,
            &outcome.output,
            outcome.error.as_deref(),
        );
        self.registry.record_command(&self.id, outcome);
    }
}

impl ProgressSink for JobContext {
    fn set_indeterminate(&self, indeterminate: bool) {
        if let Some(status) = self.registry.set_indeterminate(&self.id, indeterminate) {
            self.reporter
                .on_status(&self.id, status, None, indeterminate, None);
        }
    }

    fn frame(&self, index: usize, message: &str) {
        if self.registry.update_progress(&self.id, index, message) {
            self.reporter.on_progress(&self.id, index, Some(message));
        }
    }
}

/// Recursively deletes the job's frame directory when dropped, whatever the
/// outcome.
struct WorkspaceGuard {
    dir: Option<PathBuf>,
}

impl WorkspaceGuard {
    fn for_frames(frames: &[Frame]) -> Self {
        Self {
            dir: frames
                .first()
                .and_then(|f| f.path.parent())
                .filter(|dir| !dir.as_os_str().is_empty())
                .map(Path::to_path_buf),
        }
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        match fs::remove_dir_all(&dir) {
            Ok(()) => debug!(dir = %dir.display(), "workspace removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %dir.display(), error = %e, "failed to remove workspace"),
        }
    }
}

/// Body of a job thread.
pub(crate) fn run_job(
    ctx: JobContext,
    strategy: Arc<dyn EncodeStrategy>,
    mut frames: Vec<Frame>,
    params: EncodeParameters,
    post: Arc<PostProcessors>,
) {
    let _workspace = WorkspaceGuard::for_frames(&frames);
    let output = params.output_path.as_path();

    if ctx.token.is_canceled() {
        debug!(job_id = %ctx.id, "job removed before it started");
        return;
    }

    ctx.set_status(JobStatus::Processing, None, true);
    info!(job_id = %ctx.id, strategy = strategy.name(), frames = frames.len(), "encoding");

    let result = catch_unwind(AssertUnwindSafe(|| {
        strategy.encode(EncodeRequest {
            frames: &mut frames,
            params: &params,
            token: &ctx.token,
            progress: &ctx,
        })
    }));
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(job_id = %ctx.id, error = %format!("{err:#}"), "encode failed");
            ctx.fail(JobFailure::from_error(&err));
            return;
        }
        Err(payload) => {
            let failure = JobFailure::from_panic(payload.as_ref());
            error!(job_id = %ctx.id, error = %failure.message, "encoder panicked");
            ctx.fail(failure);
            return;
        }
    }

    if ctx.token.is_canceled() {
        finish_canceled(&ctx, output);
        return;
    }

    if output.exists() {
        postprocess::run(&ctx, &params, &post);
    }

    if ctx.token.is_canceled() {
        finish_canceled(&ctx, output);
        return;
    }

    info!(job_id = %ctx.id, output = %output.display(), "encode completed");
    ctx.set_status(JobStatus::Completed, Some(output), false);
}

fn finish_canceled(ctx: &JobContext, output: &Path) {
    match remove_if_exists(output) {
        Ok(true) => debug!(job_id = %ctx.id, "partial output removed"),
        Ok(false) => {}
        Err(e) => warn!(job_id = %ctx.id, error = %e, "failed to remove canceled output"),
    }
    info!(job_id = %ctx.id, "encode canceled");
    ctx.set_status(JobStatus::Canceled, None, false);
}
