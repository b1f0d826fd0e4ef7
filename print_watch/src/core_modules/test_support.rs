// THEORY:
// Fakes shared by the stage, session and host tests. Frames are tiny synthetic
// buffers whose first pixel carries the motion flag, so scripted stages can
// classify them without a background model.

use crate::core_modules::event_bus::{EventBus, Listener};
use crate::core_modules::features::{FeatureExtractor, Features};
use crate::core_modules::frame::Frame;
use crate::core_modules::quality_scorer::{ReferenceImage, SimilarityScorer};
use crate::core_modules::stage::{FrameStage, LifecycleEvent, StageOutput};
use crate::error::{ListenerError, ScoringError, SourceError, StageError, StorageError};
use crate::session::{FrameSource, PrintRecord, StorageSink};
use image::{GrayImage, Rgb, RgbImage};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const MOTION_MARK: u8 = 255;

/// An 8x8 frame captured `seconds` after `t0`; pixel (0,0) carries the motion flag.
pub fn frame_at(t0: Instant, seconds: f64, motion: bool) -> Frame {
    let mark = if motion { MOTION_MARK } else { 0 };
    let image = RgbImage::from_fn(8, 8, |x, y| if x == 0 && y == 0 { Rgb([mark, 0, 0]) } else { Rgb([0, 0, 0]) });
    Frame::new(image, t0 + Duration::from_secs_f64(seconds))
}

/// Inner stage that reports whatever motion flag the frame carries.
#[derive(Default)]
pub struct ScriptedMotion {
    bus: EventBus,
}

impl FrameStage for ScriptedMotion {
    fn process(&mut self, frame: &Frame) -> Result<StageOutput, StageError> {
        let motion = frame.image().get_pixel(0, 0)[0] == MOTION_MARK;
        Ok(StageOutput::quiet(frame.clone(), motion))
    }

    fn finish(&mut self) -> Option<LifecycleEvent> {
        None
    }

    fn event_bus(&self) -> &EventBus {
        &self.bus
    }
}

/// Replays a fixed list of scores, then 1.0 forever; `None` is a scoring failure.
pub struct ScriptedScorer {
    script: VecDeque<Option<f64>>,
    calls: usize,
    resumes: usize,
}

impl ScriptedScorer {
    pub fn new(script: &[Option<f64>]) -> Self {
        Self {
            script: script.iter().copied().collect(),
            calls: 0,
            resumes: 0,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    pub fn resumes(&self) -> usize {
        self.resumes
    }
}

impl SimilarityScorer for ScriptedScorer {
    fn score(&mut self, _: &ReferenceImage, _: &Frame) -> Result<f64, ScoringError> {
        self.calls += 1;
        match self.script.pop_front().unwrap_or(Some(1.0)) {
            Some(value) => Ok(value),
            None => Err(ScoringError::InsufficientNeighbours { query_index: 3 }),
        }
    }

    fn set_event_bus(&mut self, _: EventBus) {}

    fn resume(&mut self) {
        self.resumes += 1;
    }
}

struct NoFeatures;

impl FeatureExtractor for NoFeatures {
    fn detect_and_compute(&self, _: &GrayImage) -> Features {
        Features::default()
    }
}

pub fn blank_reference() -> Arc<ReferenceImage> {
    Arc::new(ReferenceImage::new(GrayImage::new(8, 8), &NoFeatures))
}

/// Yields the queued results in order, then reports end of stream.
pub struct VecSource(pub VecDeque<Result<Frame, SourceError>>);

impl VecSource {
    pub fn motion(t0: Instant, script: &[(f64, bool)]) -> Self {
        Self(script.iter().map(|&(at, motion)| Ok(frame_at(t0, at, motion))).collect())
    }
}

impl FrameSource for VecSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        self.0.pop_front().transpose()
    }
}

/// Never runs dry: one motion frame per second of frame time.
pub struct EndlessMotion {
    t0: Instant,
    next: u64,
}

impl EndlessMotion {
    pub fn new() -> Self {
        Self {
            t0: Instant::now(),
            next: 0,
        }
    }
}

impl FrameSource for EndlessMotion {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        std::thread::sleep(Duration::from_millis(1));
        let frame = frame_at(self.t0, self.next as f64, true);
        self.next += 1;
        Ok(Some(frame))
    }
}

#[derive(Default)]
pub struct MemorySink(pub Mutex<Vec<PrintRecord>>);

impl MemorySink {
    pub fn records(&self) -> Vec<PrintRecord> {
        self.0.lock().unwrap().clone()
    }
}

impl StorageSink for MemorySink {
    fn save(&self, record: &PrintRecord) -> Result<(), StorageError> {
        self.0.lock().unwrap().push(record.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct Recorder(pub Mutex<Vec<String>>);

impl Recorder {
    pub fn messages(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl Listener for Recorder {
    fn update(&self, message: &str) -> Result<(), ListenerError> {
        self.0.lock().unwrap().push(message.to_string());
        Ok(())
    }
}
