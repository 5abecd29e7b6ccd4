use std::path::{Path, PathBuf};

use crossbeam_channel::Sender;
use serde::Serialize;

use crate::error::JobFailure;
use crate::job::JobStatus;

/// Receives job updates. Called from every job thread concurrently, so
/// implementations must serialize delivery to their consumer.
pub trait Reporter: Send + Sync {
    fn on_status(
        &self,
        id: &str,
        status: JobStatus,
        output: Option<&Path>,
        indeterminate: bool,
        error: Option<&JobFailure>,
    );

    fn on_progress(&self, id: &str, frame: usize, message: Option<&str>);

    fn on_upload(
        &self,
        id: &str,
        ok: bool,
        link: Option<&str>,
        delete_link: Option<&str>,
        error: Option<&str>,
    );

    fn on_clipboard(&self, id: &str, ok: bool, error: Option<&str>);

    fn on_command(&self, id: &str, ok: bool, command: &str, output: &str, error: Option<&str>);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Status {
        id: String,
        status: JobStatus,
        output: Option<PathBuf>,
        indeterminate: bool,
        error: Option<JobFailure>,
    },
    Progress {
        id: String,
        frame: usize,
        message: Option<String>,
    },
    Upload {
        id: String,
        ok: bool,
        link: Option<String>,
        delete_link: Option<String>,
        error: Option<String>,
    },
    Clipboard {
        id: String,
        ok: bool,
        error: Option<String>,
    },
    Command {
        id: String,
        ok: bool,
        command: String,
        output: String,
        error: Option<String>,
    },
}

impl JobEvent {
    pub fn id(&self) -> &str {
        match self {
            JobEvent::Status { id, .. }
            | JobEvent::Progress { id, .. }
            | JobEvent::Upload { id, .. }
            | JobEvent::Clipboard { id, .. }
            | JobEvent::Command { id, .. } => id,
        }
    }
}

/// Forwards every update as a [`JobEvent`] to a single consumer.
pub struct ChannelReporter {
    tx: Sender<JobEvent>,
}

impl ChannelReporter {
    pub fn new(tx: Sender<JobEvent>) -> Self {
        Self { tx }
    }

    fn send(&self, event: JobEvent) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl Reporter for ChannelReporter {
    fn on_status(
        &self,
        id: &str,
        status: JobStatus,
        output: Option<&Path>,
        indeterminate: bool,
        error: Option<&JobFailure>,
    ) {
        self.send(JobEvent::Status {
            id: id.to_string(),
            status,
            output: output.map(Path::to_path_buf),
            indeterminate,
            error: error.cloned(),
        });
    }

    fn on_progress(&self, id: &str, frame: usize, message: Option<&str>) {
        self.send(JobEvent::Progress {
            id: id.to_string(),
            frame,
            message: message.map(str::to_string),
        });
    }

    fn on_upload(
        &self,
        id: &str,
        ok: bool,
        link: Option<&str>,
        delete_link: Option<&str>,
        error: Option<&str>,
    ) {
        self.send(JobEvent::Upload {
            id: id.to_string(),
            ok,
            link: link.map(str::to_string),
            delete_link: delete_link.map(str::to_string),
            error: error.map(str::to_string),
        });
    }

    fn on_clipboard(&self, id: &str, ok: bool, error: Option<&str>) {
        self.send(JobEvent::Clipboard {
            id: id.to_string(),
            ok,
            error: error.map(str::to_string),
        });
    }

    fn on_command(&self, id: &str, ok: bool, command: &str, output: &str, error: Option<&str>) {
        self.send(JobEvent::Command {
            id: id.to_string(),
            ok,
            command: command.to_string(),
            output: output.to_string(),
            error: error.map(str::to_string),
        });
    }
}

pub struct NullReporter;

impl Reporter for NullReporter {
    fn on_status(&self, _: &str, _: JobStatus, _: Option<&Path>, _: bool, _: Option<&JobFailure>) {}
    fn on_progress(&self, _: &str, _: usize, _: Option<&str>) {}
    fn on_upload(&self, _: &str, _: bool, _: Option<&str>, _: Option<&str>, _: Option<&str>) {}
    fn on_clipboard(&self, _: &str, _: bool, _: Option<&str>) {}
    fn on_command(&self, _: &str, _: bool, _: &str, _: &str, _: Option<&str>) {}
}
