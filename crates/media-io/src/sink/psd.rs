//! Layered Photoshop document sink.
//!
//! Every frame becomes one RGBA layer positioned at its region, bottom to
//! top in display order. The merged image section holds all layers painted
//! over each other. Channel data is stored uncompressed.

use std::path::Path;

use image::RgbaImage;

use super::{load_region, FrameSink, FrameSinkFactory, SinkOptions};
use crate::{EncodeError, Rect};

/// Largest width or height a version 1 document may declare.
const MAX_DIMENSION: u32 = 30_000;

pub struct PsdSinkFactory;

impl FrameSinkFactory for PsdSinkFactory {
    fn name(&self) -> &'static str {
        "psd"
    }

    fn open(&self, options: &SinkOptions) -> Result<Box<dyn FrameSink>, EncodeError> {
        Ok(Box::new(PsdSink {
            transparent: options.transparent_color,
            canvas: None,
            layers: Vec::new(),
        }))
    }
}

struct Layer {
    rect: Rect,
    pixels: RgbaImage,
    delay_ms: u32,
}

struct PsdSink {
    transparent: Option<[u8; 4]>,
    canvas: Option<(u32, u32)>,
    layers: Vec<Layer>,
}

impl FrameSink for PsdSink {
    fn add_frame(&mut self, path: &Path, rect: Rect, delay_ms: u32) -> Result<(), EncodeError> {
        let index = self.layers.len();
        let (pixels, size) = load_region(path, rect, index, self.transparent)?;
        match self.canvas {
            None if size.0 > MAX_DIMENSION || size.1 > MAX_DIMENSION => {
                return Err(EncodeError::InvalidFrame {
                    index,
                    reason: format!(
                        "{}x{} exceeds the {MAX_DIMENSION} px document limit",
                        size.0, size.1
                    ),
                });
            }
            None => self.canvas = Some(size),
            Some(canvas) if canvas != size => {
                return Err(EncodeError::InvalidFrame {
                    index,
                    reason: format!(
                        "frame is {}x{} but the document is {}x{}",
                        size.0, size.1, canvas.0, canvas.1
                    ),
                });
            }
            Some(_) => {}
        }
        self.layers.push(Layer {
            rect,
            pixels,
            delay_ms,
        });
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<Vec<u8>, EncodeError> {
        let Some((width, height)) = self.canvas else {
            return Err(EncodeError::NoFrames);
        };
        let mut out = Vec::new();

        // File header: RGB, 8 bits, four channels including alpha.
        out.extend_from_slice(b"8BPS");
        put_u16(&mut out, 1);
        out.extend_from_slice(&[0; 6]);
        put_u16(&mut out, 4);
        put_u32(&mut out, height);
        put_u32(&mut out, width);
        put_u16(&mut out, 8);
        put_u16(&mut out, 3);

        // Color mode data and image resources.
        put_u32(&mut out, 0);
        put_u32(&mut out, 0);

        let layer_info = layer_info(&self.layers)?;
        put_u32(&mut out, section_len(layer_info.len() + 8)?);
        put_u32(&mut out, section_len(layer_info.len())?);
        out.extend_from_slice(&layer_info);
        // Global layer mask info.
        put_u32(&mut out, 0);

        let mut merged = RgbaImage::new(width, height);
        for layer in &self.layers {
            for (x, y, pixel) in layer.pixels.enumerate_pixels() {
                if pixel.0[3] != 0 {
                    merged.put_pixel(layer.rect.x + x, layer.rect.y + y, *pixel);
                }
            }
        }
        put_u16(&mut out, 0);
        for channel in 0..4 {
            out.extend(merged.pixels().map(|p| p.0[channel]));
        }
        Ok(out)
    }
}

/// Channel ids in the order their planes are written: red, green, blue and
/// the transparency mask (-1).
const CHANNELS: [(i16, usize); 4] = [(0, 0), (1, 1), (2, 2), (-1, 3)];

fn layer_info(layers: &[Layer]) -> Result<Vec<u8>, EncodeError> {
    let mut info = Vec::new();
    let count = i16::try_from(layers.len()).map_err(|_| EncodeError::InvalidFrame {
        index: layers.len(),
        reason: "too many layers for one document".into(),
    })?;
    info.extend_from_slice(&count.to_be_bytes());

    for (index, layer) in layers.iter().enumerate() {
        let Rect {
            x,
            y,
            width,
            height,
        } = layer.rect;
        for edge in [y, x, y + height, x + width] {
            put_u32(&mut info, edge);
        }
        put_u16(&mut info, CHANNELS.len() as u16);
        let plane = u64::from(width) * u64::from(height);
        for (id, _) in CHANNELS {
            info.extend_from_slice(&id.to_be_bytes());
            put_u32(&mut info, section_len((plane + 2) as usize)?);
        }
        info.extend_from_slice(b"8BIMnorm");
        // Opacity, clipping, flags, filler.
        info.extend_from_slice(&[255, 0, 0, 0]);

        let name = pascal_name(&format!("Frame {} ({} ms)", index + 1, layer.delay_ms));
        put_u32(&mut info, section_len(8 + name.len())?);
        // Empty layer mask and blending ranges.
        put_u32(&mut info, 0);
        put_u32(&mut info, 0);
        info.extend_from_slice(&name);
    }

    for layer in layers {
        for (_, offset) in CHANNELS {
            put_u16(&mut info, 0);
            info.extend(layer.pixels.pixels().map(|p| p.0[offset]));
        }
    }
    if info.len() % 2 == 1 {
        info.push(0);
    }
    Ok(info)
}

/// Length-prefixed name padded to a multiple of four bytes.
fn pascal_name(name: &str) -> Vec<u8> {
    let bytes: Vec<u8> = name.bytes().filter(u8::is_ascii).take(255).collect();
    let mut out = Vec::with_capacity(bytes.len() + 4);
    out.push(bytes.len() as u8);
    out.extend_from_slice(&bytes);
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out
}

fn section_len(len: usize) -> Result<u32, EncodeError> {
    u32::try_from(len).map_err(|_| {
        EncodeError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "document section exceeds 4 GiB",
        ))
    })
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}
