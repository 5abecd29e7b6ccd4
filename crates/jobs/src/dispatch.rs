//! Encoder strategy dispatch.
//!
//! A [`StrategyTable`] maps `(format, backend)` to the strategy that runs
//! the encode. The table is built once and looked up on every submission.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use media_io::sink::{
    ApngSinkFactory, FrameSinkFactory, GifSinkFactory, PsdSinkFactory, SinkOptions,
};
use media_io::{
    assign_full_frame, compute_changed_regions, frame_dimensions, locate_ffmpeg, normalize_delay,
    persist_atomically, write_project_archive, CancellationToken, FfmpegKind, FfmpegRequest,
    FfmpegSupervisor, Frame, ProgressSink, Rect,
};
use native_encoder::{encode_frames, GifskiLibrary, LibraryVersion, NativeCodec, NativeOptions};
use parking_lot::Mutex;
use settings::EncoderSettings;
use tracing::debug;

use crate::error::ConfigurationError;
use crate::job::{EncodeParameters, EncoderBackend, ExportFormat};

/// Borrowed inputs for one encode, on the job's own thread.
pub struct EncodeRequest<'a> {
    pub frames: &'a mut Vec<Frame>,
    pub params: &'a EncodeParameters,
    pub token: &'a CancellationToken,
    pub progress: &'a dyn ProgressSink,
}

/// One way of turning frames into an output file.
///
/// A canceled encode returns `Ok(())`; the runner checks the token afterwards
/// and discards whatever was written.
pub trait EncodeStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Fails fast when a required tool or library is missing.
    fn check_available(&self) -> Result<(), ConfigurationError> {
        Ok(())
    }

    fn encode(&self, request: EncodeRequest<'_>) -> Result<()>;
}

pub struct StrategyTable {
    entries: HashMap<(ExportFormat, EncoderBackend), Arc<dyn EncodeStrategy>>,
}

impl StrategyTable {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// The built-in registrations. Callers may [`register`](Self::register)
    /// more or replace these.
    pub fn standard(settings: &EncoderSettings) -> Self {
        let mut table = Self::empty();
        table.register(
            ExportFormat::Gif,
            EncoderBackend::Builtin,
            Arc::new(SinkStrategy::new(Arc::new(GifSinkFactory), true)),
        );
        table.register(
            ExportFormat::Apng,
            EncoderBackend::Builtin,
            Arc::new(SinkStrategy::new(Arc::new(ApngSinkFactory), true)),
        );
        // One full-size layer per frame.
        table.register(
            ExportFormat::Psd,
            EncoderBackend::Builtin,
            Arc::new(SinkStrategy::new(Arc::new(PsdSinkFactory), false)),
        );
        for (format, kind) in [
            (ExportFormat::Gif, FfmpegKind::Gif),
            (ExportFormat::Apng, FfmpegKind::Apng),
            (ExportFormat::Video, FfmpegKind::Video),
        ] {
            table.register(
                format,
                EncoderBackend::Ffmpeg,
                Arc::new(FfmpegStrategy::from_settings(kind, settings)),
            );
        }
        table.register(
            ExportFormat::Gif,
            EncoderBackend::Gifski,
            Arc::new(NativeStrategy::from_settings(settings)),
        );
        table.register(
            ExportFormat::Project,
            EncoderBackend::Builtin,
            Arc::new(ProjectStrategy),
        );
        table
    }

    /// Adds or replaces a strategy, returning the one it replaced.
    pub fn register(
        &mut self,
        format: ExportFormat,
        backend: EncoderBackend,
        strategy: Arc<dyn EncodeStrategy>,
    ) -> Option<Arc<dyn EncodeStrategy>> {
        self.entries.insert((format, backend), strategy)
    }

    pub fn resolve(
        &self,
        format: ExportFormat,
        backend: EncoderBackend,
    ) -> Result<Arc<dyn EncodeStrategy>, ConfigurationError> {
        self.entries
            .get(&(format, backend))
            .cloned()
            .ok_or(ConfigurationError::Unsupported { format, backend })
    }

    /// Registrations sorted by format then backend.
    pub fn entries(&self) -> Vec<(ExportFormat, EncoderBackend, Arc<dyn EncodeStrategy>)> {
        let mut entries = self
            .entries
            .iter()
            .map(|(&(format, backend), strategy)| (format, backend, strategy.clone()))
            .collect::<Vec<_>>();
        entries.sort_by_key(|(format, backend, _)| (*format, *backend));
        entries
    }
}

/// Preprocessor plus an in-process frame sink.
pub struct SinkStrategy {
    factory: Arc<dyn FrameSinkFactory>,
    delta_capable: bool,
}

impl SinkStrategy {
    pub fn new(factory: Arc<dyn FrameSinkFactory>, delta_capable: bool) -> Self {
        Self {
            factory,
            delta_capable,
        }
    }
}

impl EncodeStrategy for SinkStrategy {
    fn name(&self) -> &str {
        self.factory.name()
    }

    fn encode(&self, request: EncodeRequest<'_>) -> Result<()> {
        let EncodeRequest {
            frames,
            params,
            token,
            progress,
        } = request;
        let delta = self.delta_capable && params.detect_unchanged_pixels;

        progress.set_indeterminate(true);
        if delta {
            compute_changed_regions(frames, params.dummy_color, token, progress)
                .context("detect unchanged pixels")?;
        } else {
            assign_full_frame(frames).context("measure frames")?;
        }
        if token.is_canceled() {
            return Ok(());
        }

        let options = SinkOptions {
            repeat_count: params.repeat_count,
            transparent_color: if delta { params.dummy_color } else { None },
            quality: params.quality.unwrap_or(90),
        };
        let mut sink = self
            .factory
            .open(&options)
            .with_context(|| format!("open {} encoder", self.factory.name()))?;

        progress.set_indeterminate(false);
        for (index, (path, rect, delay)) in feed_plan(frames, delta).into_iter().enumerate() {
            if token.is_canceled() {
                debug!(index, "frame feed interrupted by cancellation");
                break;
            }
            progress.frame(index, &format!("Processing frame {index}"));
            sink.add_frame(path, rect, delay)
                .with_context(|| format!("add frame {index}"))?;
        }

        let bytes = match sink.close() {
            Ok(bytes) => bytes,
            Err(e) if token.is_canceled() => {
                debug!(error = %e, "encoder close failed after cancellation");
                return Ok(());
            }
            Err(e) => return Err(e).context("finish encoding"),
        };
        if token.is_canceled() {
            return Ok(());
        }
        persist_atomically(&params.output_path, &bytes).context("save output")?;
        Ok(())
    }
}

/// Frames to feed with their normalized delays. With delta encoding, frames
/// without any change are skipped and their delay is added to the frame
/// before them so the timing stays intact.
fn feed_plan(frames: &[Frame], delta: bool) -> Vec<(&Path, Rect, u32)> {
    let mut plan: Vec<(&Path, Rect, u32)> = Vec::with_capacity(frames.len());
    for frame in frames {
        let delay = normalize_delay(frame.delay_ms);
        if delta && !frame.has_area {
            if let Some(last) = plan.last_mut() {
                last.2 += delay;
            }
            continue;
        }
        plan.push((frame.path.as_path(), frame.rect, delay));
    }
    plan
}

/// External ffmpeg-compatible tool.
pub struct FfmpegStrategy {
    kind: FfmpegKind,
    name: String,
    program: Option<PathBuf>,
    default_template: String,
    default_extra: String,
}

impl FfmpegStrategy {
    pub fn from_settings(kind: FfmpegKind, settings: &EncoderSettings) -> Self {
        Self {
            kind,
            name: format!("ffmpeg-{kind}"),
            program: settings.ffmpeg_path.clone(),
            default_template: settings.template_for(kind).to_string(),
            default_extra: settings.extra_parameters_for(kind).to_string(),
        }
    }
}

impl EncodeStrategy for FfmpegStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_available(&self) -> Result<(), ConfigurationError> {
        locate_ffmpeg(self.program.as_deref())
            .map(|_| ())
            .map_err(|e| ConfigurationError::ToolMissing {
                tool: "ffmpeg".to_string(),
                reason: e.to_string(),
            })
    }

    fn encode(&self, request: EncodeRequest<'_>) -> Result<()> {
        let EncodeRequest {
            frames,
            params,
            token,
            progress,
        } = request;
        let supervisor = FfmpegSupervisor::locate(self.program.as_deref())?;

        for frame in frames.iter_mut() {
            frame.delay_ms = normalize_delay(frame.delay_ms);
        }
        let (width, height) = match (params.width, params.height) {
            (0, _) | (_, 0) => match frames.first() {
                Some(first) => frame_dimensions(&first.path).context("measure first frame")?,
                None => (0, 0),
            },
            size => size,
        };

        let request = FfmpegRequest {
            kind: self.kind,
            frames,
            output: &params.output_path,
            command_template: params
                .command_template
                .as_deref()
                .unwrap_or(self.default_template.as_str()),
            extra_parameters: params
                .extra_parameters
                .as_deref()
                .unwrap_or(self.default_extra.as_str()),
            width,
            height,
            repeat_count: params.repeat_count,
        };
        supervisor
            .run(&request, token, progress)
            .with_context(|| format!("encode {} with ffmpeg", self.kind))?;
        Ok(())
    }
}

/// Native streaming encoder. The library is loaded, and its version probed,
/// once on first use.
pub struct NativeStrategy {
    library_path: Option<PathBuf>,
    version_override: Option<LibraryVersion>,
    default_quality: u8,
    default_looped: bool,
    codec: Mutex<Option<Arc<dyn NativeCodec>>>,
}

impl NativeStrategy {
    pub fn from_settings(settings: &EncoderSettings) -> Self {
        Self {
            library_path: settings.gifski_path.clone(),
            version_override: settings
                .gifski_version
                .as_deref()
                .and_then(LibraryVersion::parse),
            default_quality: settings.gifski_quality,
            default_looped: settings.gifski_looped,
            codec: Mutex::new(None),
        }
    }

    /// Uses an already-loaded codec instead of loading the library.
    pub fn with_codec(codec: Arc<dyn NativeCodec>) -> Self {
        Self {
            library_path: None,
            version_override: None,
            default_quality: 90,
            default_looped: true,
            codec: Mutex::new(Some(codec)),
        }
    }

    fn codec(&self) -> Result<Arc<dyn NativeCodec>, ConfigurationError> {
        let mut slot = self.codec.lock();
        if let Some(codec) = slot.as_ref() {
            return Ok(codec.clone());
        }
        let library = GifskiLibrary::load(self.library_path.as_deref(), self.version_override)
            .map_err(|e| ConfigurationError::ToolMissing {
                tool: "gifski".to_string(),
                reason: e.to_string(),
            })?;
        let codec: Arc<dyn NativeCodec> = Arc::new(library);
        *slot = Some(codec.clone());
        Ok(codec)
    }
}

impl EncodeStrategy for NativeStrategy {
    fn name(&self) -> &str {
        "gifski"
    }

    fn check_available(&self) -> Result<(), ConfigurationError> {
        self.codec().map(|_| ())
    }

    fn encode(&self, request: EncodeRequest<'_>) -> Result<()> {
        let codec = self.codec()?;
        let options = NativeOptions {
            quality: request.params.quality.unwrap_or(self.default_quality),
            looped: request.params.looped.unwrap_or(self.default_looped),
        };
        encode_frames(
            codec.as_ref(),
            request.frames,
            &request.params.output_path,
            options,
            request.token,
            request.progress,
        )
        .context("encode gif with gifski")?;
        Ok(())
    }
}

/// Zips the job's frame directory.
pub struct ProjectStrategy;

impl EncodeStrategy for ProjectStrategy {
    fn name(&self) -> &str {
        "project-archive"
    }

    fn encode(&self, request: EncodeRequest<'_>) -> Result<()> {
        let Some(dir) = request.frames.first().and_then(|f| f.path.parent()) else {
            return Err(media_io::EncodeError::NoFrames.into());
        };
        request.progress.set_indeterminate(false);
        write_project_archive(
            dir,
            &request.params.output_path,
            request.params.compression,
            request.token,
            request.progress,
        )
        .context("write project archive")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_table_covers_default_pairs() {
        let table = StrategyTable::standard(&EncoderSettings::default());
        for (format, backend) in [
            (ExportFormat::Gif, EncoderBackend::Builtin),
            (ExportFormat::Gif, EncoderBackend::Ffmpeg),
            (ExportFormat::Gif, EncoderBackend::Gifski),
            (ExportFormat::Apng, EncoderBackend::Builtin),
            (ExportFormat::Apng, EncoderBackend::Ffmpeg),
            (ExportFormat::Video, EncoderBackend::Ffmpeg),
            (ExportFormat::Project, EncoderBackend::Builtin),
            (ExportFormat::Psd, EncoderBackend::Builtin),
        ] {
            assert!(table.resolve(format, backend).is_ok(), "{format}/{backend}");
        }
        assert!(matches!(
            table.resolve(ExportFormat::Psd, EncoderBackend::Ffmpeg),
            Err(ConfigurationError::Unsupported { .. })
        ));
        assert_eq!(table.entries().len(), 8);
    }

    #[test]
    fn unchanged_frames_fold_into_previous_delay() {
        let mut frames = vec![
            Frame::new("0.png", 0),
            Frame::new("1.png", 30),
            Frame::new("2.png", 40),
        ];
        frames[1].has_area = false;

        let plan = feed_plan(&frames, true);
        assert_eq!(
            plan.iter().map(|(_, _, d)| *d).collect::<Vec<_>>(),
            vec![40, 40]
        );

        let plan = feed_plan(&frames, false);
        assert_eq!(
            plan.iter().map(|(_, _, d)| *d).collect::<Vec<_>>(),
            vec![10, 30, 40]
        );
    }

    #[test]
    fn missing_ffmpeg_is_a_configuration_error() {
        let settings = EncoderSettings {
            ffmpeg_path: Some(PathBuf::from("/definitely/not/ffmpeg")),
            ..Default::default()
        };
        let strategy = FfmpegStrategy::from_settings(FfmpegKind::Video, &settings);
        assert!(matches!(
            strategy.check_available(),
            Err(ConfigurationError::ToolMissing { .. })
        ));
    }
}
