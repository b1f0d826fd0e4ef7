// THEORY:
// The `DefectStage` is the outermost layer of the chain. It lets the inner
// stages classify the frame first, then asks the scorer how closely the frame
// still resembles the known-good reference.
//
// - A coefficient at or below `quality_threshold` is a defect. The stage raises
//   `DefectDetected` with the time since session start and the last raw frame,
//   then halts.
// - A scoring failure is also a defect: the event is built with the error text as
//   its message and handed back inside `StageError::Halted`, so the caller both
//   persists it and stops pulling frames.
// - Once halted the stage is terminal. Frames still flow through the inner layers
//   for annotation, but no scoring happens and no further events escape, so a
//   session can never report two outcomes. Only a fresh stage (a new session)
//   watches again.
//
// When a defect and a motion-ended event land on the same frame, the defect goes
// first in the output list.

use crate::core_modules::event_bus::EventBus;
use crate::core_modules::frame::{Frame, seconds_between};
use crate::core_modules::quality_scorer::{QualityScorer, ReferenceImage, SimilarityScorer};
use crate::core_modules::stage::{FrameStage, LifecycleEvent, StageOutput};
use crate::error::StageError;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefectState {
    Watching,
    Halted,
}

pub struct DefectStage<S, Q = QualityScorer> {
    inner: S,
    scorer: Q,
    reference: Arc<ReferenceImage>,
    quality_threshold: f64,
    session_start: Option<Instant>,
    state: DefectState,
    error_occurred: bool,
    last_frame: Option<Frame>,
}

impl<S: FrameStage, Q: SimilarityScorer> DefectStage<S, Q> {
    /// Wraps `inner`; the scorer reports on the same bus as the inner chain.
    pub fn new(inner: S, mut scorer: Q, reference: Arc<ReferenceImage>, quality_threshold: f64) -> Self {
        scorer.set_event_bus(inner.event_bus().clone());
        Self {
            inner,
            scorer,
            reference,
            quality_threshold,
            session_start: None,
            state: DefectState::Watching,
            error_occurred: false,
            last_frame: None,
        }
    }

    /// Measures elapsed time from `start` instead of the first processed frame.
    pub fn with_session_start(mut self, start: Instant) -> Self {
        self.session_start = Some(start);
        self
    }

    pub fn state(&self) -> DefectState {
        self.state
    }

    pub fn error_occurred(&self) -> bool {
        self.error_occurred
    }

    pub fn last_frame(&self) -> Option<&Frame> {
        self.last_frame.as_ref()
    }

    /// Lifts the scorer's own pause. A halted stage stays halted.
    pub fn resume_scoring(&mut self) {
        self.scorer.resume();
    }

    fn fire(&mut self, now: Instant, message: String) -> LifecycleEvent {
        let elapsed_seconds = self.session_start.map_or(0.0, |start| seconds_between(start, now));
        self.error_occurred = true;
        self.state = DefectState::Halted;
        self.inner.event_bus().notify(&message);
        LifecycleEvent::DefectDetected {
            elapsed_seconds,
            frame: self.last_frame.clone(),
            message,
        }
    }
}

impl<S: FrameStage, Q: SimilarityScorer> FrameStage for DefectStage<S, Q> {
    fn process(&mut self, frame: &Frame) -> Result<StageOutput, StageError> {
        let mut output = self.inner.process(frame)?;
        if self.state == DefectState::Halted {
            output.events.clear();
            return Ok(output);
        }

        let now = frame.timestamp();
        self.session_start.get_or_insert(now);
        self.last_frame = Some(frame.clone());

        match self.scorer.score(&self.reference, frame) {
            Ok(coefficient) if coefficient <= self.quality_threshold => {
                warn!(coefficient, threshold = self.quality_threshold, "print defect detected");
                let message = format!("print defect detected, similarity coefficient = {coefficient:.2}");
                let event = self.fire(now, message);
                output.events.insert(0, event);
                Ok(output)
            }
            Ok(_) => Ok(output),
            Err(source) => {
                error!(%source, "scoring failed, halting session");
                let event = self.fire(now, source.to_string());
                Err(StageError::Halted {
                    event: Box::new(event),
                    source,
                })
            }
        }
    }

    fn finish(&mut self) -> Option<LifecycleEvent> {
        match self.state {
            DefectState::Halted => None,
            DefectState::Watching => self.inner.finish(),
        }
    }

    fn event_bus(&self) -> &EventBus {
        self.inner.event_bus()
    }
}
