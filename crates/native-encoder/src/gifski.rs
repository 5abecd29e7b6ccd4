//! Dynamic binding to `libgifski`.

use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void, CString};
use std::path::{Path, PathBuf};

use libloading::Library;
use parking_lot::Mutex;
use tracing::info;

use crate::abi::{CallingConvention, ErrorCode, LibraryVersion, NativeCodec, SessionHandle};
use crate::NativeError;

/// Version assumed when the newer entry points are present.
const STREAMING_VERSION: LibraryVersion = LibraryVersion::new(0, 9);
/// Version assumed when they are absent.
const LEGACY_VERSION: LibraryVersion = LibraryVersion::new(0, 8);

type Handle = *mut c_void;

#[repr(C)]
struct LegacySettings {
    width: u32,
    height: u32,
    quality: u8,
    once: bool,
    fast: bool,
}

#[repr(C)]
struct StreamingSettings {
    width: u32,
    height: u32,
    quality: u8,
    fast: bool,
    repeat: i16,
}

type NewFn = unsafe extern "C" fn(*const c_void) -> Handle;
type LegacyAddFrameFn = unsafe extern "C" fn(Handle, u32, *const c_char, u16) -> c_int;
type StreamingAddFrameFn = unsafe extern "C" fn(Handle, u32, *const c_char, f64) -> c_int;
type HandleFn = unsafe extern "C" fn(Handle) -> c_int;
type PathFn = unsafe extern "C" fn(Handle, *const c_char) -> c_int;

enum Api {
    Legacy {
        new: NewFn,
        add_frame: LegacyAddFrameFn,
        end_adding: HandleFn,
        write: PathFn,
        release: HandleFn,
    },
    Streaming {
        new: NewFn,
        add_frame: StreamingAddFrameFn,
        set_output: PathFn,
        finish: HandleFn,
    },
}

/// A loaded `libgifski`.
///
/// The function pointers stay valid for as long as `_library` is alive,
/// which is the lifetime of this value.
pub struct GifskiLibrary {
    api: Api,
    version: LibraryVersion,
    path: PathBuf,
    /// Presentation timestamp of the next frame, per streaming session.
    next_pts: Mutex<HashMap<usize, f64>>,
    _library: Library,
}

impl GifskiLibrary {
    /// Loads the library from `path`, or the platform's default library name.
    ///
    /// `version_override` forces a calling convention; otherwise it is
    /// inferred from the presence of `gifski_set_file_output`.
    pub fn load(
        path: Option<&Path>,
        version_override: Option<LibraryVersion>,
    ) -> Result<Self, NativeError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(libloading::library_filename("gifski")));

        // SAFETY: loading runs the library's initializers; libgifski has none
        // beyond the Rust runtime it links.
        let library = unsafe { Library::new(&path) }.map_err(|source| NativeError::Load {
            path: path.clone(),
            source,
        })?;

        let has_streaming = unsafe { library.get::<PathFn>(b"gifski_set_file_output\0") }.is_ok();
        let version = version_override.unwrap_or(if has_streaming {
            STREAMING_VERSION
        } else {
            LEGACY_VERSION
        });

        // SAFETY: the symbol types below mirror gifski.h for each ABI generation.
        let api = unsafe {
            match version.convention() {
                CallingConvention::Legacy => Api::Legacy {
                    new: symbol(&library, "gifski_new")?,
                    add_frame: symbol(&library, "gifski_add_frame_png_file")?,
                    end_adding: symbol(&library, "gifski_end_adding_frames")?,
                    write: symbol(&library, "gifski_write")?,
                    release: symbol(&library, "gifski_drop")?,
                },
                CallingConvention::Streaming => Api::Streaming {
                    new: symbol(&library, "gifski_new")?,
                    add_frame: symbol(&library, "gifski_add_frame_png_file")?,
                    set_output: symbol(&library, "gifski_set_file_output")?,
                    finish: symbol(&library, "gifski_finish")?,
                },
            }
        };

        info!(path = %path.display(), %version, "loaded gifski");
        Ok(Self {
            api,
            version,
            path,
            next_pts: Mutex::new(HashMap::new()),
            _library: library,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

unsafe fn symbol<T: Copy>(library: &Library, name: &'static str) -> Result<T, NativeError> {
    let mut bytes = name.as_bytes().to_vec();
    bytes.push(0);
    library
        .get::<T>(&bytes)
        .map(|sym| *sym)
        .map_err(|source| NativeError::MissingSymbol { name, source })
}

fn c_path(path: &Path) -> Option<CString> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        CString::new(path.as_os_str().as_bytes()).ok()
    }
    #[cfg(not(unix))]
    {
        CString::new(path.to_string_lossy().into_owned()).ok()
    }
}

fn raw(handle: SessionHandle) -> Handle {
    handle.0 as Handle
}

impl NativeCodec for GifskiLibrary {
    fn version(&self) -> LibraryVersion {
        self.version
    }

    fn start(&self, quality: u8, looped: bool) -> Result<SessionHandle, NativeError> {
        let quality = quality.clamp(1, 100);
        // SAFETY: the settings struct matches the loaded ABI generation and
        // outlives the call.
        let handle = unsafe {
            match &self.api {
                Api::Legacy { new, .. } => {
                    let settings = LegacySettings {
                        width: 0,
                        height: 0,
                        quality,
                        once: !looped,
                        fast: false,
                    };
                    new(&settings as *const LegacySettings as *const c_void)
                }
                Api::Streaming { new, .. } => {
                    let settings = StreamingSettings {
                        width: 0,
                        height: 0,
                        quality,
                        fast: false,
                        repeat: if looped { 0 } else { -1 },
                    };
                    new(&settings as *const StreamingSettings as *const c_void)
                }
            }
        };
        if handle.is_null() {
            return Err(NativeError::Start);
        }
        let handle = SessionHandle(handle as usize);
        if matches!(self.api, Api::Streaming { .. }) {
            self.next_pts.lock().insert(handle.0, 0.0);
        }
        Ok(handle)
    }

    fn set_output(&self, handle: SessionHandle, path: &Path) -> ErrorCode {
        let Api::Streaming { set_output, .. } = &self.api else {
            return ErrorCode::INVALID_STATE;
        };
        let Some(path) = c_path(path) else {
            return ErrorCode::INVALID_INPUT;
        };
        // SAFETY: `handle` came from `start` and has not been finished.
        ErrorCode(unsafe { set_output(raw(handle), path.as_ptr()) })
    }

    fn add_frame(
        &self,
        handle: SessionHandle,
        index: u32,
        path: &Path,
        delay_ms: u32,
        _is_last: Option<bool>,
    ) -> ErrorCode {
        let Some(path) = c_path(path) else {
            return ErrorCode::INVALID_INPUT;
        };
        // SAFETY: `handle` came from `start` and has not been finished.
        let code = unsafe {
            match &self.api {
                Api::Legacy { add_frame, .. } => {
                    let centis = (delay_ms / 10).clamp(1, u16::MAX as u32) as u16;
                    add_frame(raw(handle), index, path.as_ptr(), centis)
                }
                Api::Streaming { add_frame, .. } => {
                    let pts = {
                        let mut next = self.next_pts.lock();
                        let slot = next.entry(handle.0).or_insert(0.0);
                        let pts = *slot;
                        *slot += delay_ms as f64 / 1000.0;
                        pts
                    };
                    add_frame(raw(handle), index, path.as_ptr(), pts)
                }
            }
        };
        ErrorCode(code)
    }

    fn end_adding(&self, handle: SessionHandle) -> ErrorCode {
        // SAFETY: `handle` came from `start`; each variant finalizes it once.
        let code = unsafe {
            match &self.api {
                Api::Legacy { end_adding, .. } => end_adding(raw(handle)),
                Api::Streaming { finish, .. } => {
                    self.next_pts.lock().remove(&handle.0);
                    finish(raw(handle))
                }
            }
        };
        ErrorCode(code)
    }

    fn write(&self, handle: SessionHandle, path: &Path) -> ErrorCode {
        let Api::Legacy { write, release, .. } = &self.api else {
            return ErrorCode::INVALID_STATE;
        };
        let Some(path) = c_path(path) else {
            return ErrorCode::INVALID_INPUT;
        };
        // SAFETY: `handle` came from `start`; the legacy write blocks until
        // the feed is closed and the session is released right after.
        unsafe {
            let code = write(raw(handle), path.as_ptr());
            release(raw(handle));
            ErrorCode(code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_is_a_load_error() {
        let result = GifskiLibrary::load(Some(Path::new("/nonexistent/libgifski.so")), None);
        assert!(matches!(result, Err(NativeError::Load { .. })));
    }

    #[test]
    fn paths_become_c_strings() {
        assert_eq!(
            c_path(Path::new("/tmp/a.gif")).unwrap().as_bytes(),
            b"/tmp/a.gif"
        );
    }
}
