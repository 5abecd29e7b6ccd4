use std::fmt;
use std::path::Path;

use crate::NativeError;

/// Opaque session handle returned by [`NativeCodec::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub usize);

/// Status code returned by every session call. Zero means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const OK: ErrorCode = ErrorCode(0);
    pub const NULL_ARG: ErrorCode = ErrorCode(1);
    pub const INVALID_STATE: ErrorCode = ErrorCode(3);
    pub const INVALID_INPUT: ErrorCode = ErrorCode(4);
    pub const IO_ERROR: ErrorCode = ErrorCode(7);
    pub const ABORTED: ErrorCode = ErrorCode(11);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "ok",
            1 => "null argument",
            2 => "thread lost",
            3 => "invalid state",
            4 => "invalid input",
            5 => "out of memory",
            6 => "other",
            7 => "io error",
            8 => "write zero",
            9 => "interrupted",
            10 => "unexpected eof",
            11 => "aborted",
            12 => "timed out",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.name(), self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LibraryVersion {
    pub major: u32,
    pub minor: u32,
}

impl LibraryVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn convention(self) -> CallingConvention {
        if self.major == 0 && self.minor < 9 {
            CallingConvention::Legacy
        } else {
            CallingConvention::Streaming
        }
    }

    /// Parses `major.minor[.patch]`.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().map_or(Some(0), |p| p.parse().ok())?;
        Some(Self { major, minor })
    }
}

impl fmt::Display for LibraryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    /// Before 0.9: frames are fed from a background thread while the caller
    /// blocks in [`NativeCodec::write`].
    Legacy,
    /// 0.9 and later: the output is declared up front and every frame
    /// carries an "is last" flag.
    Streaming,
}

/// Handle-based streaming encoder ABI.
///
/// Implementations must tolerate `add_frame` and `end_adding` being called
/// from a different thread than `write` for the legacy convention.
pub trait NativeCodec: Send + Sync {
    fn version(&self) -> LibraryVersion;

    fn convention(&self) -> CallingConvention {
        self.version().convention()
    }

    fn start(&self, quality: u8, looped: bool) -> Result<SessionHandle, NativeError>;

    /// Streaming convention only.
    fn set_output(&self, handle: SessionHandle, path: &Path) -> ErrorCode;

    /// `is_last` is `Some` under the streaming convention and `None` otherwise.
    fn add_frame(
        &self,
        handle: SessionHandle,
        index: u32,
        path: &Path,
        delay_ms: u32,
        is_last: Option<bool>,
    ) -> ErrorCode;

    fn end_adding(&self, handle: SessionHandle) -> ErrorCode;

    /// Legacy convention only: blocks until every frame is added and the
    /// file is written, then releases the session.
    fn write(&self, handle: SessionHandle, path: &Path) -> ErrorCode;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convention_switches_at_zero_nine() {
        assert_eq!(
            LibraryVersion::new(0, 8).convention(),
            CallingConvention::Legacy
        );
        assert_eq!(
            LibraryVersion::new(0, 9).convention(),
            CallingConvention::Streaming
        );
        assert_eq!(
            LibraryVersion::new(1, 0).convention(),
            CallingConvention::Streaming
        );
    }

    #[test]
    fn parses_versions() {
        assert_eq!(LibraryVersion::parse("0.8.7"), Some(LibraryVersion::new(0, 8)));
        assert_eq!(LibraryVersion::parse("1"), Some(LibraryVersion::new(1, 0)));
        assert_eq!(LibraryVersion::parse("x.1"), None);
    }

    #[test]
    fn error_codes_render_name_and_number() {
        assert_eq!(ErrorCode(4).to_string(), "invalid input (code 4)");
        assert!(ErrorCode::OK.is_ok());
    }
}
