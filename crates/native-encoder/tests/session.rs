use std::fs;
use std::path::{Path, PathBuf};

use media_io::{CancellationToken, Frame, NullProgress};
use native_encoder::{
    encode_frames, ErrorCode, LibraryVersion, NativeCodec, NativeError, NativeOptions,
    NativeOutcome, SessionHandle,
};
use parking_lot::{Condvar, Mutex};

struct FakeCodec {
    version: LibraryVersion,
    fail_at: Option<u32>,
    write_nothing: bool,
    calls: Mutex<Vec<String>>,
    output: Mutex<Option<PathBuf>>,
    ended: Mutex<bool>,
    ended_cv: Condvar,
}

impl FakeCodec {
    fn new(version: LibraryVersion) -> Self {
        Self {
            version,
            fail_at: None,
            write_nothing: false,
            calls: Mutex::new(Vec::new()),
            output: Mutex::new(None),
            ended: Mutex::new(false),
            ended_cv: Condvar::new(),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl NativeCodec for FakeCodec {
    fn version(&self) -> LibraryVersion {
        self.version
    }

    fn start(&self, quality: u8, looped: bool) -> Result<SessionHandle, NativeError> {
        self.calls.lock().push(format!("start {quality} {looped}"));
        Ok(SessionHandle(7))
    }

    fn set_output(&self, _handle: SessionHandle, path: &Path) -> ErrorCode {
        self.calls.lock().push("set_output".to_string());
        *self.output.lock() = Some(path.to_path_buf());
        ErrorCode::OK
    }

    fn add_frame(
        &self,
        handle: SessionHandle,
        index: u32,
        _path: &Path,
        delay_ms: u32,
        is_last: Option<bool>,
    ) -> ErrorCode {
        assert_eq!(handle, SessionHandle(7));
        self.calls
            .lock()
            .push(format!("add {index} {delay_ms} {is_last:?}"));
        if self.fail_at == Some(index) {
            ErrorCode::INVALID_INPUT
        } else {
            ErrorCode::OK
        }
    }

    fn end_adding(&self, _handle: SessionHandle) -> ErrorCode {
        self.calls.lock().push("end_adding".to_string());
        if let Some(path) = self.output.lock().as_ref() {
            if !self.write_nothing {
                fs::write(path, b"GIF89a").unwrap();
            }
        }
        *self.ended.lock() = true;
        self.ended_cv.notify_all();
        ErrorCode::OK
    }

    fn write(&self, _handle: SessionHandle, path: &Path) -> ErrorCode {
        let mut ended = self.ended.lock();
        while !*ended {
            self.ended_cv.wait(&mut ended);
        }
        fs::write(path, b"GIF89a").unwrap();
        self.calls.lock().push("write".to_string());
        ErrorCode::OK
    }
}

fn frames(dir: &Path, delays: &[u32]) -> Vec<Frame> {
    delays
        .iter()
        .enumerate()
        .map(|(i, &delay)| Frame::new(dir.join(format!("{i}.png")), delay))
        .collect()
}

#[test]
fn streaming_convention_flags_last_frame() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.gif");
    let codec = FakeCodec::new(LibraryVersion::new(1, 2));

    let outcome = encode_frames(
        &codec,
        &frames(dir.path(), &[0, 50, 100]),
        &out,
        NativeOptions::default(),
        &CancellationToken::new(),
        &NullProgress,
    )
    .unwrap();

    assert_eq!(outcome, NativeOutcome::Completed);
    assert_eq!(
        codec.calls(),
        vec![
            "start 90 true",
            "set_output",
            "add 0 10 Some(false)",
            "add 1 50 Some(false)",
            "add 2 100 Some(true)",
            "end_adding",
        ]
    );
    assert!(fs::metadata(&out).unwrap().len() > 0);
}

#[test]
fn legacy_convention_feeds_in_background_and_writes() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.gif");
    let codec = FakeCodec::new(LibraryVersion::new(0, 8));

    let outcome = encode_frames(
        &codec,
        &frames(dir.path(), &[20, 20]),
        &out,
        NativeOptions {
            quality: 50,
            looped: false,
        },
        &CancellationToken::new(),
        &NullProgress,
    )
    .unwrap();

    assert_eq!(outcome, NativeOutcome::Completed);
    let calls = codec.calls();
    assert_eq!(calls[0], "start 50 false");
    assert!(calls.contains(&"add 0 20 None".to_string()));
    assert!(calls.contains(&"add 1 20 None".to_string()));
    assert_eq!(calls.last().map(String::as_str), Some("write"));
    assert!(!calls.contains(&"set_output".to_string()));
}

#[test]
fn error_code_aborts_and_is_embedded() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.gif");
    let mut codec = FakeCodec::new(LibraryVersion::new(1, 0));
    codec.fail_at = Some(1);

    let err = encode_frames(
        &codec,
        &frames(dir.path(), &[10, 10, 10]),
        &out,
        NativeOptions::default(),
        &CancellationToken::new(),
        &NullProgress,
    )
    .unwrap_err();

    match err {
        NativeError::Code { stage, code } => {
            assert_eq!(stage, "add_frame");
            assert_eq!(code, ErrorCode::INVALID_INPUT);
        }
        other => panic!("unexpected error: {other}"),
    }
    let calls = codec.calls();
    assert!(!calls.iter().any(|c| c.starts_with("add 2")));
    assert_eq!(calls.last().map(String::as_str), Some("end_adding"));
}

#[test]
fn cancellation_still_finalizes_session() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.gif");
    let codec = FakeCodec::new(LibraryVersion::new(1, 0));
    let token = CancellationToken::new();
    token.cancel();

    let outcome = encode_frames(
        &codec,
        &frames(dir.path(), &[10, 10]),
        &out,
        NativeOptions::default(),
        &token,
        &NullProgress,
    )
    .unwrap();

    assert_eq!(outcome, NativeOutcome::Canceled);
    assert_eq!(
        codec.calls(),
        vec!["start 90 true", "set_output", "end_adding"]
    );
}

#[test]
fn empty_output_fails() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.gif");
    let mut codec = FakeCodec::new(LibraryVersion::new(1, 0));
    codec.write_nothing = true;

    let err = encode_frames(
        &codec,
        &frames(dir.path(), &[10]),
        &out,
        NativeOptions::default(),
        &CancellationToken::new(),
        &NullProgress,
    )
    .unwrap_err();

    assert!(matches!(err, NativeError::OutputMissing { .. }));
}
