use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::EncodeError;

/// Writes `bytes` to `path` through a sibling temporary file that is renamed
/// into place only once fully written. On failure no file is left at `path`.
pub fn persist_atomically(path: &Path, bytes: &[u8]) -> Result<(), EncodeError> {
    persist_with(path, |file| {
        file.write_all(bytes)?;
        Ok(())
    })
}

/// Like [`persist_atomically`], but lets `write` stream into the temp file.
pub fn persist_with<F>(path: &Path, write: F) -> Result<(), EncodeError>
where
    F: FnOnce(&mut File) -> Result<(), EncodeError>,
{
    let persist_err = |source: io::Error| EncodeError::Persist {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(persist_err)?;

    let mut temp = tempfile::Builder::new()
        .prefix(".partial-")
        .tempfile_in(dir)
        .map_err(persist_err)?;
    write(temp.as_file_mut())?;
    temp.as_file_mut().flush().map_err(persist_err)?;
    temp.as_file().sync_all().map_err(persist_err)?;
    finish(temp, path).map_err(persist_err)?;

    debug!(path = %path.display(), "output persisted");
    Ok(())
}

fn finish(temp: NamedTempFile, path: &Path) -> io::Result<()> {
    temp.persist(path).map(|_| ()).map_err(|e| e.error)
}

/// Deletes `path` if present. Returns whether a file was removed.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.gif");
        fs::write(&out, b"old").unwrap();

        persist_atomically(&out, b"new contents").unwrap();

        assert_eq!(fs::read(&out).unwrap(), b"new contents");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn failed_write_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.gif");

        let result = persist_with(&out, |file| {
            file.write_all(b"half")?;
            Err(EncodeError::NoFrames)
        });

        assert!(result.is_err());
        assert!(!out.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn remove_reports_presence() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("x");
        assert!(!remove_if_exists(&out).unwrap());
        fs::write(&out, b"x").unwrap();
        assert!(remove_if_exists(&out).unwrap());
    }
}
