// THEORY:
// The `MotionTimerStage` turns the per-frame motion flag into a notion of a
// running print. A printer's visible motion is intermittent (travel moves, layer
// changes, pauses), so a single "no motion" frame means nothing on its own.
//
// State machine:
// - Idle → Active on the first motion frame; start and last-motion times are set.
// - Active → Active on every later motion frame; last-motion time is refreshed.
// - A quiet frame within the cooldown of the last motion is a transient gap and
//   changes nothing.
// - A quiet frame beyond the cooldown closes the burst: its duration
//   (last motion − start) is added to the running total and `MotionEnded` is
//   raised with the total and the last frame that showed motion.
//
// Bursts accumulate into one total for the life of the stage. Each
// Idle → Active → Idle cycle raises exactly one event.

use crate::core_modules::event_bus::EventBus;
use crate::core_modules::frame::{Frame, seconds_between};
use crate::core_modules::stage::{FrameStage, LifecycleEvent, StageOutput};
use crate::error::StageError;
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionState {
    Idle,
    Active { started: Instant, last_motion: Instant },
}

pub struct MotionTimerStage<S> {
    inner: S,
    cooldown_seconds: f64,
    min_motion_duration_seconds: f64,
    state: MotionState,
    accumulated_seconds: f64,
    last_frame: Option<Frame>,
}

impl<S: FrameStage> MotionTimerStage<S> {
    pub fn new(inner: S, cooldown_seconds: f64, min_motion_duration_seconds: f64) -> Self {
        Self {
            inner,
            cooldown_seconds,
            min_motion_duration_seconds,
            state: MotionState::Idle,
            accumulated_seconds: 0.0,
            last_frame: None,
        }
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    /// Total motion time of every closed burst.
    pub fn accumulated_seconds(&self) -> f64 {
        self.accumulated_seconds
    }

    /// Closes the open burst, if any, and returns the event for it.
    fn close_burst(&mut self) -> Option<LifecycleEvent> {
        let MotionState::Active { started, last_motion } = self.state else {
            return None;
        };
        let burst = seconds_between(started, last_motion);
        self.accumulated_seconds += burst;
        self.state = MotionState::Idle;

        if burst < self.min_motion_duration_seconds {
            info!(burst, total = self.accumulated_seconds, "motion burst too short to count");
            self.inner
                .event_bus()
                .notify(&format!("motion ended after {burst:.1}s, too short to count"));
        } else {
            info!(burst, total = self.accumulated_seconds, "motion ended");
            self.inner.event_bus().notify("motion ended");
        }

        Some(self.motion_ended())
    }

    fn motion_ended(&self) -> LifecycleEvent {
        LifecycleEvent::MotionEnded {
            total_seconds: self.accumulated_seconds,
            frame: self.last_frame.clone(),
        }
    }
}

impl<S: FrameStage> FrameStage for MotionTimerStage<S> {
    fn process(&mut self, frame: &Frame) -> Result<StageOutput, StageError> {
        let mut output = self.inner.process(frame)?;
        let now = frame.timestamp();

        if output.motion_present {
            match self.state {
                MotionState::Idle => {
                    self.state = MotionState::Active {
                        started: now,
                        last_motion: now,
                    };
                    info!("motion started");
                    self.inner.event_bus().notify("motion started");
                }
                MotionState::Active { started, .. } => {
                    self.state = MotionState::Active {
                        started,
                        last_motion: now,
                    };
                }
            }
            self.last_frame = Some(frame.clone());
        } else if let MotionState::Active { last_motion, .. } = self.state {
            let quiet = seconds_between(last_motion, now);
            if quiet > self.cooldown_seconds {
                output.events.extend(self.close_burst());
            } else {
                debug!(quiet, cooldown = self.cooldown_seconds, "transient motion gap");
            }
        }

        Ok(output)
    }

    /// Closes any open burst and reports the running total.
    fn finish(&mut self) -> Option<LifecycleEvent> {
        self.inner.finish();
        self.close_burst().or_else(|| Some(self.motion_ended()))
    }

    fn event_bus(&self) -> &EventBus {
        self.inner.event_bus()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::test_support::{Recorder, ScriptedMotion, frame_at};
    use std::sync::Arc;

    fn timer() -> MotionTimerStage<ScriptedMotion> {
        MotionTimerStage::new(ScriptedMotion::default(), 10.0, 5.0)
    }

    fn feed(stage: &mut MotionTimerStage<ScriptedMotion>, t0: Instant, script: &[(f64, bool)]) -> Vec<LifecycleEvent> {
        script
            .iter()
            .flat_map(|&(at, motion)| stage.process(&frame_at(t0, at, motion)).unwrap().events)
            .collect()
    }

    fn total_of(event: &LifecycleEvent) -> f64 {
        match event {
            LifecycleEvent::MotionEnded { total_seconds, .. } => *total_seconds,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn gap_within_cooldown_merges_into_one_burst() {
        let t0 = Instant::now();
        let mut stage = timer();
        let mut script = vec![(0.0, true), (1.0, true)];
        script.extend((2..12).map(|s| (s as f64, false)));
        script.push((12.0, true));

        let events = feed(&mut stage, t0, &script);

        assert!(events.is_empty());
        assert!(matches!(stage.state(), MotionState::Active { .. }));
        let ended = stage.finish().unwrap();
        assert!((total_of(&ended) - 12.0).abs() < 1e-9);
    }

    #[test]
    fn gap_beyond_cooldown_ends_motion_once() {
        let t0 = Instant::now();
        let mut stage = timer();

        let events = feed(&mut stage, t0, &[(0.0, true), (1.0, true), (2.0, false), (13.0, false), (14.0, false)]);

        assert_eq!(events.len(), 1);
        assert!((total_of(&events[0]) - 1.0).abs() < 1e-9);
        assert_eq!(stage.state(), MotionState::Idle);
        // The payload is the last frame that showed motion.
        let frame = events[0].frame().unwrap();
        assert_eq!(frame.timestamp(), t0 + std::time::Duration::from_secs(1));
    }

    #[test]
    fn quiet_exactly_at_cooldown_is_still_a_gap() {
        let t0 = Instant::now();
        let mut stage = timer();

        let events = feed(&mut stage, t0, &[(0.0, true), (10.0, false)]);

        assert!(events.is_empty());
        assert!(matches!(stage.state(), MotionState::Active { .. }));
    }

    #[test]
    fn separate_bursts_accumulate_and_each_fires_once() {
        let t0 = Instant::now();
        let mut stage = timer();

        let first = feed(&mut stage, t0, &[(0.0, true), (2.0, true), (15.0, false)]);
        let second = feed(&mut stage, t0, &[(20.0, true), (25.0, true), (26.0, false), (40.0, false), (60.0, false)]);

        assert_eq!(first.len(), 1);
        assert!((total_of(&first[0]) - 2.0).abs() < 1e-9);
        assert_eq!(second.len(), 1);
        assert!((total_of(&second[0]) - 7.0).abs() < 1e-9);
        assert!((stage.accumulated_seconds() - 7.0).abs() < 1e-9);
    }

    #[test]
    fn no_motion_never_fires() {
        let t0 = Instant::now();
        let mut stage = timer();
        let script: Vec<_> = (0..30).map(|s| (s as f64, false)).collect();

        assert!(feed(&mut stage, t0, &script).is_empty());
        let ended = stage.finish().unwrap();
        assert_eq!(total_of(&ended), 0.0);
        assert!(ended.frame().is_none());
    }

    #[test]
    fn finish_closes_an_open_burst() {
        let t0 = Instant::now();
        let mut stage = timer();
        feed(&mut stage, t0, &[(0.0, true), (3.0, true), (4.5, true), (5.0, false)]);

        let ended = stage.finish().unwrap();

        assert!((total_of(&ended) - 4.5).abs() < 1e-9);
        assert_eq!(stage.state(), MotionState::Idle);
    }

    #[test]
    fn notifies_start_end_and_short_bursts() {
        let t0 = Instant::now();
        let mut stage = timer();
        let recorder = Arc::new(Recorder::default());
        stage.event_bus().attach(recorder.clone());

        feed(&mut stage, t0, &[(0.0, true), (1.0, true), (20.0, false)]);
        feed(&mut stage, t0, &[(30.0, true), (40.0, true), (60.0, false)]);

        let messages = recorder.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], "motion started");
        assert!(messages[1].contains("too short to count"));
        assert_eq!(messages[2], "motion started");
        assert_eq!(messages[3], "motion ended");
    }
}
