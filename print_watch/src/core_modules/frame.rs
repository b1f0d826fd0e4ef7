// THEORY:
// The `Frame` is the unit of data that flows through every layer of the engine.
// It is a "dumb", immutable container: a colour raster plus the instant it was
// captured. Stages never mutate a frame they receive; annotation produces a new
// frame that shares nothing with the original.
//
// The raster lives behind an `Arc` so a stage can retain the "last frame" for an
// event payload without copying megabytes of pixels on every call.

use image::{GrayImage, RgbImage};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A single captured image from the build-plate camera.
#[derive(Debug, Clone)]
pub struct Frame {
    image: Arc<RgbImage>,
    timestamp: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, timestamp: Instant) -> Self {
        Self {
            image: Arc::new(image),
            timestamp,
        }
    }

    /// The capture instant. Every stage treats this as "now".
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Rec. 601 grayscale conversion of the raster.
    pub fn to_gray(&self) -> GrayImage {
        image::imageops::grayscale(self.image.as_ref())
    }

    /// Returns a new frame with the same timestamp whose raster has been edited by `draw`.
    pub fn annotated(&self, draw: impl FnOnce(&mut RgbImage)) -> Frame {
        let mut canvas = self.image.as_ref().clone();
        draw(&mut canvas);
        Frame {
            image: Arc::new(canvas),
            timestamp: self.timestamp,
        }
    }

    /// Seconds from `earlier` to this frame's capture time, saturating at zero.
    pub fn seconds_since(&self, earlier: Instant) -> f64 {
        seconds_between(earlier, self.timestamp)
    }

    /// True when both frames share the same raster allocation.
    pub fn same_raster(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.image, &other.image)
    }
}

/// Seconds from `from` to `to`; zero if `to` precedes `from`.
pub fn seconds_between(from: Instant, to: Instant) -> f64 {
    to.checked_duration_since(from)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}
