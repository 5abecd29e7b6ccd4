use std::any::Any;
use std::io;

use media_io::EncodeError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{EncoderBackend, ExportFormat};

/// A job that cannot run at all. Raised before anything is registered.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("no encoder registered for {format} with the {backend} backend")]
    Unsupported {
        format: ExportFormat,
        backend: EncoderBackend,
    },
    #[error("{tool} is not available: {reason}")]
    ToolMissing { tool: String, reason: String },
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("failed to start job thread: {0}")]
    Spawn(#[source] io::Error),
}

/// The failure captured on a job that ended in `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    /// Command lines and tool output, when the failure came from a process.
    pub details: Option<String>,
}

impl JobFailure {
    pub fn from_error(err: &anyhow::Error) -> Self {
        let details = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<EncodeError>())
            .and_then(EncodeError::details);
        Self {
            message: format!("{err:#}"),
            details,
        }
    }

    /// Builds a failure from the payload of a panicking encoder.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let reason = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("unknown panic");
        Self {
            message: format!("encoder panicked: {reason}"),
            details: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn process_failures_keep_their_postmortem() {
        let err = Err::<(), _>(EncodeError::Process {
            message: "error while encoding the video with ffmpeg".into(),
            commands: vec!["-i in -y out.mp4".into()],
            log: "Unknown encoder".into(),
        })
        .context("ffmpeg encode")
        .unwrap_err();

        let failure = JobFailure::from_error(&err);

        assert_eq!(
            failure.message,
            "ffmpeg encode: error while encoding the video with ffmpeg"
        );
        let details = failure.details.unwrap();
        assert!(details.contains("-i in -y out.mp4"));
        assert!(details.contains("Unknown encoder"));
    }

    #[test]
    fn other_failures_have_no_details() {
        let failure = JobFailure::from_error(&anyhow::anyhow!("boom"));
        assert_eq!(failure.message, "boom");
        assert!(failure.details.is_none());
    }

    #[test]
    fn panic_payloads_become_messages() {
        let literal = std::panic::catch_unwind(|| panic!("index out of range")).unwrap_err();
        assert_eq!(
            JobFailure::from_panic(literal.as_ref()).message,
            "encoder panicked: index out of range"
        );

        let formatted = std::panic::catch_unwind(|| panic!("frame {} missing", 3)).unwrap_err();
        assert_eq!(
            JobFailure::from_panic(formatted.as_ref()).message,
            "encoder panicked: frame 3 missing"
        );

        let opaque = std::panic::catch_unwind(|| std::panic::panic_any(7_u8)).unwrap_err();
        assert_eq!(
            JobFailure::from_panic(opaque.as_ref()).message,
            "encoder panicked: unknown panic"
        );
    }
}
