//! In-process frame sinks.
//!
//! A sink consumes frames in display order and hands back the finished
//! container bytes on [`FrameSink::close`]. Callers persist those bytes with
//! [`persist_atomically`](crate::persist_atomically) so a failed or partial
//! encode never leaves a truncated file behind.

mod apng;
mod gif;
mod psd;

pub use apng::ApngSinkFactory;
pub use gif::GifSinkFactory;
pub use psd::PsdSinkFactory;

use std::path::Path;

use image::RgbaImage;

use crate::{EncodeError, Rect};

/// Container-level options shared by every sink.
#[derive(Debug, Clone, Default)]
pub struct SinkOptions {
    /// 0 loops forever, `n > 0` repeats `n` times, negative plays once.
    pub repeat_count: i32,
    /// Pixels of exactly this colour are emitted as fully transparent.
    pub transparent_color: Option<[u8; 4]>,
    /// Encoder-specific quality knob (1..=100).
    pub quality: u8,
}

/// Opens sinks for one container format.
pub trait FrameSinkFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self, options: &SinkOptions) -> Result<Box<dyn FrameSink>, EncodeError>;
}

/// An open encoding session for one output.
pub trait FrameSink {
    /// Adds the `rect` region of the image at `path`, shown for `delay_ms`.
    fn add_frame(&mut self, path: &Path, rect: Rect, delay_ms: u32) -> Result<(), EncodeError>;

    /// Finalizes the container and returns its bytes.
    fn close(self: Box<Self>) -> Result<Vec<u8>, EncodeError>;
}

/// Loads `rect` out of the image at `path`, returning the crop and the full
/// image dimensions.
pub(crate) fn load_region(
    path: &Path,
    rect: Rect,
    index: usize,
    transparent: Option<[u8; 4]>,
) -> Result<(RgbaImage, (u32, u32)), EncodeError> {
    let image = image::open(path)?.to_rgba8();
    let (width, height) = image.dimensions();
    if rect.is_empty() || rect.x + rect.width > width || rect.y + rect.height > height {
        return Err(EncodeError::InvalidFrame {
            index,
            reason: format!(
                "region {}x{}+{}+{} outside {}x{} image",
                rect.width, rect.height, rect.x, rect.y, width, height
            ),
        });
    }

    let mut region =
        image::imageops::crop_imm(&image, rect.x, rect.y, rect.width, rect.height).to_image();
    if let Some(color) = transparent {
        for pixel in region.pixels_mut() {
            if pixel.0 == color {
                pixel.0 = [0, 0, 0, 0];
            }
        }
    }
    Ok((region, (width, height)))
}
