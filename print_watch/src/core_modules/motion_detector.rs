// THEORY:
// The `MotionDetector` is the innermost layer of the chain and the only one that
// looks at raw pixels to decide whether something is moving. Per frame:
// 1.  Convert to grayscale and feed the `BackgroundModel`, which returns the
//     foreground mask and learns from the frame at the same time.
// 2.  Clean the mask (opening, then closing).
// 3.  Trace the outer contours of what is left. Motion is present iff at least
//     one contour encloses more than `min_area` px². The first such contour is
//     boxed in green on the returned frame.
//
// It has no notion of time. Absence of contours is a valid "no motion" answer,
// never an error.

use crate::core_modules::background_model::BackgroundModel;
use crate::core_modules::event_bus::EventBus;
use crate::core_modules::frame::Frame;
use crate::core_modules::morphology::{Kernel, bounding_rect, contour_area, denoise, external_contours};
use crate::core_modules::stage::{FrameStage, LifecycleEvent, StageOutput};
use crate::config::WatchConfig;
use crate::error::StageError;
use image::Rgb;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use tracing::trace;

const BOX_COLOUR: Rgb<u8> = Rgb([0, 255, 0]);

pub struct MotionDetector {
    background: BackgroundModel,
    min_area: f64,
    bus: EventBus,
}

impl MotionDetector {
    pub fn new(min_area: f64, history: u32, var_threshold: f32) -> Self {
        Self {
            background: BackgroundModel::new(history, var_threshold),
            min_area,
            bus: EventBus::new(),
        }
    }

    pub fn from_config(config: &WatchConfig) -> Self {
        Self::new(
            config.min_contour_area,
            config.background_history,
            config.background_var_threshold,
        )
    }

    /// Classifies one frame and returns it with the motion box drawn, if any.
    pub fn detect(&mut self, frame: &Frame) -> (Frame, bool) {
        let mask = denoise(&self.background.apply(&frame.to_gray()), Kernel::Ellipse);

        let moving_region = external_contours(&mask)
            .into_iter()
            .find(|c| contour_area(&c.points) > self.min_area)
            .and_then(|c| bounding_rect(&c.points));

        match moving_region {
            Some(rect) => {
                trace!(x = rect.left(), y = rect.top(), w = rect.width(), h = rect.height(), "motion region");
                (frame.annotated(|canvas| draw_box(canvas, rect)), true)
            }
            None => (frame.clone(), false),
        }
    }
}

/// Two-pixel outline: the rectangle itself plus one ring outside it.
fn draw_box(canvas: &mut image::RgbImage, rect: Rect) {
    draw_hollow_rect_mut(canvas, rect, BOX_COLOUR);
    let outer = Rect::at(rect.left() - 1, rect.top() - 1).of_size(rect.width() + 2, rect.height() + 2);
    draw_hollow_rect_mut(canvas, outer, BOX_COLOUR);
}

impl FrameStage for MotionDetector {
    fn process(&mut self, frame: &Frame) -> Result<StageOutput, StageError> {
        let (annotated, motion_present) = self.detect(frame);
        Ok(StageOutput::quiet(annotated, motion_present))
    }

    fn finish(&mut self) -> Option<LifecycleEvent> {
        None
    }

    fn event_bus(&self) -> &EventBus {
        &self.bus
    }
}
