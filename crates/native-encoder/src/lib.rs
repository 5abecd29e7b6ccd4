//! Native streaming GIF encoder adapter.
//!
//! The encoder library is driven through a handle-based ABI whose calling
//! convention changed between releases. The convention is probed once when
//! the library is loaded and carried as a [`CallingConvention`] value, so the
//! encode path branches in exactly one place ([`encode_frames`]).

use std::path::PathBuf;
use thiserror::Error;

mod abi;
mod gifski;
mod session;

pub use abi::{CallingConvention, ErrorCode, LibraryVersion, NativeCodec, SessionHandle};
pub use gifski::GifskiLibrary;
pub use session::{encode_frames, NativeOptions, NativeOutcome};

#[derive(Debug, Error)]
pub enum NativeError {
    #[error("failed to load native encoder from {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },
    #[error("native encoder is missing symbol `{name}`: {source}")]
    MissingSymbol {
        name: &'static str,
        #[source]
        source: libloading::Error,
    },
    #[error("native encoder refused to start a session")]
    Start,
    #[error("native encoder failed during {stage}: {code}")]
    Code { stage: &'static str, code: ErrorCode },
    #[error("native encoder produced no output at {path}")]
    OutputMissing { path: PathBuf },
    #[error("native encoder feed thread panicked")]
    WorkerLost,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
