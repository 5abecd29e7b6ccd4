use std::fs;
use std::path::Path;
use std::thread;

use media_io::{normalize_delay, remove_if_exists, CancellationToken, Frame, ProgressSink};
use tracing::{debug, warn};

use crate::abi::{CallingConvention, ErrorCode, NativeCodec, SessionHandle};
use crate::NativeError;

#[derive(Debug, Clone, Copy)]
pub struct NativeOptions {
    pub quality: u8,
    pub looped: bool,
}

impl Default for NativeOptions {
    fn default() -> Self {
        Self {
            quality: 90,
            looped: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeOutcome {
    Completed,
    /// Frame submission stopped early. Whatever the library wrote to the
    /// output is left for the caller to delete.
    Canceled,
}

/// Encodes `frames` into `output` through one native session.
///
/// Cancellation is checked before every frame. Once requested, no further
/// frames are submitted but the session is still finalized so the library
/// can release its resources.
pub fn encode_frames(
    codec: &dyn NativeCodec,
    frames: &[Frame],
    output: &Path,
    options: NativeOptions,
    token: &CancellationToken,
    progress: &dyn ProgressSink,
) -> Result<NativeOutcome, NativeError> {
    remove_if_exists(output)?;
    let convention = codec.convention();
    debug!(version = %codec.version(), ?convention, frames = frames.len(), "starting native session");
    let handle = codec.start(options.quality, options.looped)?;

    let canceled = match convention {
        CallingConvention::Legacy => run_legacy(codec, handle, frames, output, token, progress)?,
        CallingConvention::Streaming => {
            run_streaming(codec, handle, frames, output, token, progress)?
        }
    };
    if canceled {
        return Ok(NativeOutcome::Canceled);
    }

    let written = fs::metadata(output).map(|m| m.len() > 0).unwrap_or(false);
    if !written {
        return Err(NativeError::OutputMissing {
            path: output.to_path_buf(),
        });
    }
    Ok(NativeOutcome::Completed)
}

fn run_streaming(
    codec: &dyn NativeCodec,
    handle: SessionHandle,
    frames: &[Frame],
    output: &Path,
    token: &CancellationToken,
    progress: &dyn ProgressSink,
) -> Result<bool, NativeError> {
    let code = codec.set_output(handle, output);
    if !code.is_ok() {
        finalize_after_failure(codec, handle);
        return Err(NativeError::Code {
            stage: "set_output",
            code,
        });
    }

    let fed = feed(codec, handle, frames, CallingConvention::Streaming, token, progress);
    let finished = codec.end_adding(handle);
    let canceled = fed?;
    if !canceled {
        check(finished, "end_adding")?;
    }
    Ok(canceled)
}

fn run_legacy(
    codec: &dyn NativeCodec,
    handle: SessionHandle,
    frames: &[Frame],
    output: &Path,
    token: &CancellationToken,
    progress: &dyn ProgressSink,
) -> Result<bool, NativeError> {
    thread::scope(|scope| {
        let feeder = scope.spawn(|| {
            let fed = feed(codec, handle, frames, CallingConvention::Legacy, token, progress);
            // Always close the feed so the blocking write below returns.
            let finished = codec.end_adding(handle);
            (fed, finished)
        });

        let written = codec.write(handle, output);
        let (fed, finished) = feeder.join().map_err(|_| NativeError::WorkerLost)?;
        let canceled = fed?;
        if !canceled {
            check(finished, "end_adding")?;
            check(written, "write")?;
        }
        Ok(canceled)
    })
}

/// Submits frames in order. Returns `Ok(true)` when stopped by cancellation.
fn feed(
    codec: &dyn NativeCodec,
    handle: SessionHandle,
    frames: &[Frame],
    convention: CallingConvention,
    token: &CancellationToken,
    progress: &dyn ProgressSink,
) -> Result<bool, NativeError> {
    progress.set_indeterminate(false);
    for (index, frame) in frames.iter().enumerate() {
        if token.is_canceled() {
            debug!(index, "native feed canceled");
            return Ok(true);
        }
        progress.frame(index, &format!("Processing frame {index}"));
        let is_last = match convention {
            CallingConvention::Legacy => None,
            CallingConvention::Streaming => Some(index + 1 == frames.len()),
        };
        let code = codec.add_frame(
            handle,
            index as u32,
            &frame.path,
            normalize_delay(frame.delay_ms),
            is_last,
        );
        check(code, "add_frame")?;
    }
    Ok(false)
}

fn check(code: ErrorCode, stage: &'static str) -> Result<(), NativeError> {
    if code.is_ok() {
        Ok(())
    } else {
        Err(NativeError::Code { stage, code })
    }
}

fn finalize_after_failure(codec: &dyn NativeCodec, handle: SessionHandle) {
    let code = codec.end_adding(handle);
    if !code.is_ok() {
        warn!(%code, "native session did not finalize cleanly");
    }
}
