use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// No container may encode a zero-duration frame; zero delays are raised to this.
pub const MIN_FRAME_DELAY_MS: u32 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && y >= self.y && x < self.x + self.width && y < self.y + self.height
    }
}

/// One captured image handed over by the capture subsystem.
///
/// The bitmap lives in a per-job temporary directory which the job deletes
/// once it reaches any outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub path: PathBuf,
    pub delay_ms: u32,
    #[serde(default)]
    pub rect: Rect,
    #[serde(default = "default_has_area")]
    pub has_area: bool,
}

fn default_has_area() -> bool {
    true
}

impl Frame {
    pub fn new(path: impl Into<PathBuf>, delay_ms: u32) -> Self {
        Self {
            path: path.into(),
            delay_ms,
            rect: Rect::default(),
            has_area: true,
        }
    }
}

pub fn normalize_delay(delay_ms: u32) -> u32 {
    if delay_ms == 0 {
        MIN_FRAME_DELAY_MS
    } else {
        delay_ms
    }
}
