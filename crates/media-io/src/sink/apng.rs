//! Animated PNG sink.
//!
//! APNG declares its frame count up front, so frames are buffered and the
//! whole file is written on close.

use std::path::Path;

use image::RgbaImage;
use png::{BitDepth, BlendOp, ColorType, DisposeOp};

use super::{load_region, FrameSink, FrameSinkFactory, SinkOptions};
use crate::{EncodeError, Rect};

pub struct ApngSinkFactory;

impl FrameSinkFactory for ApngSinkFactory {
    fn name(&self) -> &'static str {
        "apng"
    }

    fn open(&self, options: &SinkOptions) -> Result<Box<dyn FrameSink>, EncodeError> {
        Ok(Box::new(ApngSink {
            options: options.clone(),
            canvas: None,
            frames: Vec::new(),
        }))
    }
}

struct PendingFrame {
    rect: Rect,
    delay_ms: u32,
    pixels: RgbaImage,
}

struct ApngSink {
    options: SinkOptions,
    canvas: Option<(u32, u32)>,
    frames: Vec<PendingFrame>,
}

impl FrameSink for ApngSink {
    fn add_frame(&mut self, path: &Path, rect: Rect, delay_ms: u32) -> Result<(), EncodeError> {
        let index = self.frames.len();
        let (pixels, size) = load_region(path, rect, index, self.options.transparent_color)?;
        let canvas = *self.canvas.get_or_insert(size);
        if index == 0 && rect != Rect::full(canvas.0, canvas.1) {
            return Err(EncodeError::InvalidFrame {
                index,
                reason: "the first APNG frame must cover the whole canvas".to_string(),
            });
        }
        self.frames.push(PendingFrame {
            rect,
            delay_ms,
            pixels,
        });
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<Vec<u8>, EncodeError> {
        let Some((width, height)) = self.canvas else {
            return Err(EncodeError::NoFrames);
        };
        let plays = match self.options.repeat_count {
            n if n > 0 => n as u32,
            0 => 0,
            _ => 1,
        };
        let blend = if self.options.transparent_color.is_some() {
            BlendOp::Over
        } else {
            BlendOp::Source
        };

        let mut bytes = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut bytes, width, height);
            encoder.set_color(ColorType::Rgba);
            encoder.set_depth(BitDepth::Eight);
            encoder.set_animated(self.frames.len() as u32, plays)?;
            let mut writer = encoder.write_header()?;

            for frame in &self.frames {
                writer.set_frame_dimension(frame.rect.width, frame.rect.height)?;
                writer.set_frame_position(frame.rect.x, frame.rect.y)?;
                let (numer, denom) = delay_fraction(frame.delay_ms);
                writer.set_frame_delay(numer, denom)?;
                writer.set_dispose_op(DisposeOp::None)?;
                writer.set_blend_op(blend)?;
                writer.write_image_data(frame.pixels.as_raw())?;
            }
            writer.finish()?;
        }
        Ok(bytes)
    }
}

/// Expresses a delay as a u16 fraction of a second, dropping precision for
/// delays that do not fit in milliseconds.
fn delay_fraction(delay_ms: u32) -> (u16, u16) {
    if delay_ms <= u16::MAX as u32 {
        (delay_ms as u16, 1000)
    } else {
        ((delay_ms / 10).min(u16::MAX as u32) as u16, 100)
    }
}
