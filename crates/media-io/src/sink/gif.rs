//! Animated GIF sink backed by the `gif` crate.
//!
//! The logical screen is sized from the first frame's full image. Later
//! frames may cover only their changed region; each one is placed at its
//! offset and kept on screen under the next.

use std::path::Path;

use gif::{DisposalMethod, Encoder, Repeat};

use super::{load_region, FrameSink, FrameSinkFactory, SinkOptions};
use crate::{EncodeError, Rect};

pub struct GifSinkFactory;

impl FrameSinkFactory for GifSinkFactory {
    fn name(&self) -> &'static str {
        "gif"
    }

    fn open(&self, options: &SinkOptions) -> Result<Box<dyn FrameSink>, EncodeError> {
        Ok(Box::new(GifSink {
            encoder: None,
            repeat: repeat_for(options.repeat_count),
            speed: speed_for(options.quality),
            transparent: options.transparent_color,
            frames: 0,
        }))
    }
}

struct GifSink {
    encoder: Option<Encoder<Vec<u8>>>,
    repeat: Repeat,
    speed: i32,
    transparent: Option<[u8; 4]>,
    frames: usize,
}

impl GifSink {
    fn encoder_for(
        &mut self,
        index: usize,
        size: (u32, u32),
    ) -> Result<&mut Encoder<Vec<u8>>, EncodeError> {
        if self.encoder.is_none() {
            let width = to_u16(size.0, index)?;
            let height = to_u16(size.1, index)?;
            let mut encoder = Encoder::new(Vec::new(), width, height, &[])?;
            encoder.set_repeat(self.repeat)?;
            self.encoder = Some(encoder);
        }
        self.encoder.as_mut().ok_or(EncodeError::NoFrames)
    }
}

impl FrameSink for GifSink {
    fn add_frame(&mut self, path: &Path, rect: Rect, delay_ms: u32) -> Result<(), EncodeError> {
        let index = self.frames;
        let (region, size) = load_region(path, rect, index, self.transparent)?;
        let speed = self.speed;
        let encoder = self.encoder_for(index, size)?;

        let (width, height) = region.dimensions();
        let mut pixels = region.into_raw();
        let mut frame = gif::Frame::from_rgba_speed(
            to_u16(width, index)?,
            to_u16(height, index)?,
            &mut pixels,
            speed,
        );
        frame.left = to_u16(rect.x, index)?;
        frame.top = to_u16(rect.y, index)?;
        frame.delay = centiseconds(delay_ms);
        frame.dispose = DisposalMethod::Keep;
        encoder.write_frame(&frame)?;

        self.frames += 1;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<Vec<u8>, EncodeError> {
        match self.encoder {
            Some(encoder) if self.frames > 0 => Ok(encoder.into_inner()?),
            _ => Err(EncodeError::NoFrames),
        }
    }
}

fn to_u16(value: u32, index: usize) -> Result<u16, EncodeError> {
    u16::try_from(value).map_err(|_| EncodeError::InvalidFrame {
        index,
        reason: format!("{value} px exceeds the GIF size limit"),
    })
}

/// GIF delays are in hundredths of a second.
fn centiseconds(delay_ms: u32) -> u16 {
    ((delay_ms + 5) / 10).clamp(1, u16::MAX as u32) as u16
}

fn repeat_for(repeat_count: i32) -> Repeat {
    match repeat_count {
        0 => Repeat::Infinite,
        n if n > 0 => Repeat::Finite(n.min(u16::MAX as i32) as u16),
        _ => Repeat::Finite(0),
    }
}

/// Maps a 1..=100 quality onto the NeuQuant speed range (1 best, 30 fastest).
fn speed_for(quality: u8) -> i32 {
    let quality = quality.clamp(1, 100) as i32;
    (30 - (quality - 1) * 29 / 99).clamp(1, 30)
}
