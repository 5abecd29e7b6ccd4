use std::fs::{self, File};
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::persist::persist_with;
use crate::{CancellationToken, EncodeError, ProgressSink};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveCompression {
    Stored,
    Fastest,
    #[default]
    Optimal,
}

impl ArchiveCompression {
    fn options(self) -> FileOptions {
        let options = FileOptions::default();
        match self {
            ArchiveCompression::Stored => options.compression_method(CompressionMethod::Stored),
            ArchiveCompression::Fastest => options
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(1)),
            ArchiveCompression::Optimal => options
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(9)),
        }
    }
}

/// Packs every regular file of `source_dir` (flat, sorted by name) into a zip
/// at `output`. Stops adding entries once `token` is set; the caller decides
/// what to do with the partial archive.
pub fn write_project_archive(
    source_dir: &Path,
    output: &Path,
    compression: ArchiveCompression,
    token: &CancellationToken,
    progress: &dyn ProgressSink,
) -> Result<(), EncodeError> {
    let mut entries = fs::read_dir(source_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect::<Vec<_>>();
    entries.sort();
    if entries.is_empty() {
        return Err(EncodeError::NoFrames);
    }

    persist_with(output, |file| {
        let mut zip = ZipWriter::new(file);
        let options = compression.options();
        for (index, path) in entries.iter().enumerate() {
            if token.is_canceled() {
                debug!(index, "archive interrupted by cancellation");
                break;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            zip.start_file(name, options)?;
            io::copy(&mut File::open(path)?, &mut zip)?;
            progress.frame(index, "Packing project");
        }
        zip.finish()?;
        Ok(())
    })
}
