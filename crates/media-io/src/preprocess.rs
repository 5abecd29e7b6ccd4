use std::path::Path;

use image::{Rgba, RgbaImage};
use tracing::debug;

use crate::{CancellationToken, EncodeError, Frame, ProgressSink, Rect};

pub fn frame_dimensions(path: &Path) -> Result<(u32, u32), EncodeError> {
    Ok(image::image_dimensions(path)?)
}

/// Gives every frame a full-frame rectangle sized from the first frame.
pub fn assign_full_frame(frames: &mut [Frame]) -> Result<(), EncodeError> {
    let Some(first) = frames.first() else {
        return Err(EncodeError::NoFrames);
    };
    let (width, height) = frame_dimensions(&first.path)?;
    for frame in frames.iter_mut() {
        frame.rect = Rect::full(width, height);
        frame.has_area = true;
    }
    Ok(())
}

/// Computes, for each frame, the bounding box of pixels that changed since
/// the previous frame.
///
/// With a `dummy_color`, frames keep their full size: every pixel outside the
/// changed box is overwritten with that colour on disk so the container can
/// treat it as transparent, and the rectangle stays full-frame. Frames with
/// no change get `has_area = false` either way.
///
/// Returns early (leaving the remaining frames untouched) once `token` is set.
pub fn compute_changed_regions(
    frames: &mut [Frame],
    dummy_color: Option<[u8; 4]>,
    token: &CancellationToken,
    progress: &dyn ProgressSink,
) -> Result<(), EncodeError> {
    let Some(first) = frames.first_mut() else {
        return Err(EncodeError::NoFrames);
    };
    let mut previous = image::open(&first.path)?.to_rgba8();
    let (width, height) = previous.dimensions();
    first.rect = Rect::full(width, height);
    first.has_area = true;

    for (index, frame) in frames.iter_mut().enumerate().skip(1) {
        if token.is_canceled() {
            debug!(index, "change detection interrupted by cancellation");
            return Ok(());
        }
        progress.frame(index, "Analyzing unchanged pixels");

        let current = image::open(&frame.path)?.to_rgba8();
        if current.dimensions() != (width, height) {
            return Err(EncodeError::InvalidFrame {
                index,
                reason: format!(
                    "expected {}x{}, found {}x{}",
                    width,
                    height,
                    current.width(),
                    current.height()
                ),
            });
        }

        let changed = changed_bounds(&previous, &current);
        frame.has_area = !changed.is_empty();

        match dummy_color {
            Some(color) => {
                let mut painted = current.clone();
                paint_outside(&mut painted, changed, Rgba(color));
                painted.save(&frame.path)?;
                frame.rect = Rect::full(width, height);
            }
            None => frame.rect = changed,
        }

        previous = current;
    }

    Ok(())
}

fn changed_bounds(previous: &RgbaImage, current: &RgbaImage) -> Rect {
    let width = current.width() as usize;
    let mut min_x = usize::MAX;
    let mut min_y = usize::MAX;
    let mut max_x = 0usize;
    let mut max_y = 0usize;

    let before = previous.as_raw().chunks_exact(4);
    let after = current.as_raw().chunks_exact(4);
    for (i, (a, b)) in before.zip(after).enumerate() {
        if a == b {
            continue;
        }
        let (x, y) = (i % width, i / width);
        min_x = min_x.min(x);
        min_y = min_y.min(y);
        max_x = max_x.max(x);
        max_y = max_y.max(y);
    }

    if min_x == usize::MAX {
        return Rect::default();
    }
    Rect::new(
        min_x as u32,
        min_y as u32,
        (max_x - min_x + 1) as u32,
        (max_y - min_y + 1) as u32,
    )
}

fn paint_outside(image: &mut RgbaImage, keep: Rect, color: Rgba<u8>) {
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        if !keep.contains(x, y) {
            *pixel = color;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NullProgress;
    use std::path::PathBuf;

    fn write_frame(dir: &Path, name: &str, paint: &[(u32, u32)]) -> PathBuf {
        let mut img = RgbaImage::from_pixel(8, 6, Rgba([10, 20, 30, 255]));
        for &(x, y) in paint {
            img.put_pixel(x, y, Rgba([200, 0, 0, 255]));
        }
        let path = dir.join(name);
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn bounding_box_covers_all_changed_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let mut frames = vec![
            Frame::new(write_frame(dir.path(), "0.png", &[]), 50),
            Frame::new(write_frame(dir.path(), "1.png", &[(2, 1), (5, 4)]), 50),
            Frame::new(write_frame(dir.path(), "2.png", &[(2, 1), (5, 4)]), 50),
        ];

        compute_changed_regions(&mut frames, None, &CancellationToken::new(), &NullProgress)
            .unwrap();

        assert_eq!(frames[0].rect, Rect::full(8, 6));
        assert_eq!(frames[1].rect, Rect::new(2, 1, 4, 4));
        assert!(frames[1].has_area);
        assert!(frames[2].rect.is_empty());
        assert!(!frames[2].has_area);
    }

    #[test]
    fn dummy_color_paints_unchanged_pixels_and_keeps_full_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut frames = vec![
            Frame::new(write_frame(dir.path(), "0.png", &[]), 50),
            Frame::new(write_frame(dir.path(), "1.png", &[(3, 3)]), 50),
        ];
        let dummy = [0, 255, 0, 255];

        compute_changed_regions(
            &mut frames,
            Some(dummy),
            &CancellationToken::new(),
            &NullProgress,
        )
        .unwrap();

        assert_eq!(frames[1].rect, Rect::full(8, 6));
        let painted = image::open(&frames[1].path).unwrap().to_rgba8();
        assert_eq!(painted.get_pixel(0, 0).0, dummy);
        assert_eq!(painted.get_pixel(3, 3).0, [200, 0, 0, 255]);
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let small = dir.path().join("small.png");
        RgbaImage::new(4, 4).save(&small).unwrap();
        let mut frames = vec![
            Frame::new(write_frame(dir.path(), "0.png", &[]), 50),
            Frame::new(small, 50),
        ];

        let err = compute_changed_regions(
            &mut frames,
            None,
            &CancellationToken::new(),
            &NullProgress,
        )
        .unwrap_err();
        assert!(matches!(err, EncodeError::InvalidFrame { index: 1, .. }));
    }

    #[test]
    fn full_frame_uses_first_frame_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut frames = vec![
            Frame::new(write_frame(dir.path(), "0.png", &[]), 0),
            Frame::new(write_frame(dir.path(), "1.png", &[(1, 1)]), 0),
        ];
        frames[1].has_area = false;

        assign_full_frame(&mut frames).unwrap();

        assert!(frames.iter().all(|f| f.rect == Rect::full(8, 6) && f.has_area));
    }
}
