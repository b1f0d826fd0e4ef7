// THEORY:
// A `FrameStage` is one layer of the detection chain. Every layer answers the
// same question for a single frame: "here is the frame, annotated; was there
// motion; did anything happen that ends the session?" Layers compose by owning
// the layer beneath them and wrapping its answer, so the chain is built by plain
// construction:
//
//     DefectStage::new(MotionTimerStage::new(MotionDetector::new(..), ..), ..)
//
// Notifications travel on the innermost layer's `EventBus`; outer layers hand
// out the same bus so listeners attach in one place regardless of chain depth.

use crate::core_modules::event_bus::EventBus;
use crate::core_modules::frame::Frame;
use crate::error::StageError;

/// A discrete, session-ending transition.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// Motion stopped for longer than the cooldown: the print finished.
    MotionEnded { total_seconds: f64, frame: Option<Frame> },
    /// The print is considered failed.
    DefectDetected {
        elapsed_seconds: f64,
        frame: Option<Frame>,
        message: String,
    },
}

impl LifecycleEvent {
    pub fn is_defect(&self) -> bool {
        matches!(self, LifecycleEvent::DefectDetected { .. })
    }

    pub fn frame(&self) -> Option<&Frame> {
        match self {
            LifecycleEvent::MotionEnded { frame, .. } | LifecycleEvent::DefectDetected { frame, .. } => frame.as_ref(),
        }
    }
}

/// The answer of a stage for one frame.
#[derive(Debug, Clone)]
pub struct StageOutput {
    /// The frame with any visual feedback drawn on it.
    pub frame: Frame,
    pub motion_present: bool,
    /// Events raised while processing this frame, most significant first.
    pub events: Vec<LifecycleEvent>,
}

impl StageOutput {
    pub fn quiet(frame: Frame, motion_present: bool) -> Self {
        Self {
            frame,
            motion_present,
            events: Vec::new(),
        }
    }
}

pub trait FrameStage: Send {
    fn process(&mut self, frame: &Frame) -> Result<StageOutput, StageError>;

    /// Ends the session from the outside (source exhausted or cancelled).
    /// Returns the terminal event owed by this stage, if any.
    fn finish(&mut self) -> Option<LifecycleEvent>;

    fn event_bus(&self) -> &EventBus;
}
