// THEORY:
// The `session` module owns the per-frame loop of a single print. A
// `SessionController` pulls one frame at a time from a `FrameSource`, pushes it
// through the stage chain and turns the first lifecycle event it sees into the
// session's one and only outcome:
//
// - `MotionEnded` means the print finished. Status becomes
//   "finished successfully" and a success record is stored.
// - `DefectDetected` (raised normally, or carried by `StageError::Halted`) means
//   the print failed. Status becomes "failed: <message>" and a failure record is
//   stored.
//
// A session can also end from the outside: the source runs dry, the source
// fails, or the caller cancels. In every one of those cases the chain is flushed
// through `finish`, so the accumulated motion time still reaches storage through
// the same success path. Once an outcome exists the controller never pulls
// another frame and never writes another record.
//
// While no outcome exists the controller keeps the `StatusBoard` current:
// "awaiting print" until the first motion frame, then "printing" with the time
// since that frame.

use crate::config::WatchConfig;
use crate::core_modules::defect_stage::DefectStage;
use crate::core_modules::frame::Frame;
use crate::core_modules::motion_detector::MotionDetector;
use crate::core_modules::motion_timer::MotionTimerStage;
use crate::core_modules::quality_scorer::{QualityScorer, ReferenceImage};
use crate::core_modules::stage::{FrameStage, LifecycleEvent};
use crate::error::{EncodeError, SourceError, StageError, StorageError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Supplies frames to a session, one per call. `Ok(None)` is end of stream.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;
}

/// Durable storage for finished prints.
pub trait StorageSink: Send + Sync {
    fn save(&self, record: &PrintRecord) -> Result<(), StorageError>;
}

/// One stored print outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrintRecord {
    pub print_time_seconds: f64,
    pub status: String,
    /// The last frame, JPEG then base64 encoded. Absent when there was no frame
    /// or it could not be encoded.
    pub image_jpeg_base64: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl PrintRecord {
    pub fn success(print_time_seconds: f64, frame: Option<&Frame>, jpeg_quality: u8) -> Self {
        Self::build(print_time_seconds, "printed without errors".to_string(), frame, jpeg_quality)
    }

    pub fn failure(print_time_seconds: f64, frame: Option<&Frame>, message: &str, jpeg_quality: u8) -> Self {
        Self::build(print_time_seconds, format!("print error: {message}"), frame, jpeg_quality)
    }

    fn build(print_time_seconds: f64, status: String, frame: Option<&Frame>, jpeg_quality: u8) -> Self {
        let image_jpeg_base64 = match frame.map(|f| encode_jpeg(f, jpeg_quality)) {
            Some(Ok(bytes)) => Some(STANDARD.encode(bytes)),
            Some(Err(e)) => {
                warn!(error = %e, "could not encode the last frame, storing the record without it");
                None
            }
            None => {
                warn!("no frame to attach to the print record");
                None
            }
        };
        Self {
            print_time_seconds,
            status,
            image_jpeg_base64,
            recorded_at: Utc::now(),
        }
    }
}

/// JPEG-encodes the frame's raster.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, EncodeError> {
    if frame.width() == 0 || frame.height() == 0 {
        return Err(EncodeError::EmptyFrame);
    }
    let mut buf = Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
    frame.image().write_with_encoder(encoder)?;
    Ok(buf.into_inner())
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum PrintStatus {
    #[default]
    AwaitingPrint,
    Printing,
    FinishedSuccessfully,
    Failed(String),
}

impl fmt::Display for PrintStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrintStatus::AwaitingPrint => f.write_str("awaiting print"),
            PrintStatus::Printing => f.write_str("printing"),
            PrintStatus::FinishedSuccessfully => f.write_str("finished successfully"),
            PrintStatus::Failed(message) => write!(f, "failed: {message}"),
        }
    }
}

/// The externally readable state of the current session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionStatus {
    pub status: PrintStatus,
    pub elapsed_seconds: f64,
    pub error: bool,
}

/// Shared, always-readable holder of the latest `SessionStatus`.
#[derive(Clone)]
pub struct StatusBoard {
    tx: Arc<watch::Sender<SessionStatus>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionStatus::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> SessionStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.tx.subscribe()
    }

    pub fn publish(&self, status: SessionStatus) {
        self.tx.send_replace(status);
    }

    /// Back to "awaiting print" with no elapsed time and no error.
    pub fn reset(&self) {
        self.publish(SessionStatus::default());
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Finished { total_seconds: f64 },
    Failed { elapsed_seconds: f64, message: String },
}

/// The result of one controller step.
#[derive(Debug, Clone)]
pub enum Step {
    /// An annotated frame for viewers.
    Frame(Frame),
    /// The session is over; no further frames will be pulled.
    Finished(SessionOutcome),
}

/// The chain used by real sessions.
pub type StandardChain = DefectStage<MotionTimerStage<MotionDetector>, QualityScorer>;

pub fn standard_chain(config: &WatchConfig, reference: Arc<ReferenceImage>) -> StandardChain {
    let timer = MotionTimerStage::new(
        MotionDetector::from_config(config),
        config.motion_cooldown_seconds,
        config.min_motion_duration_seconds,
    );
    DefectStage::new(timer, QualityScorer::from_config(config), reference, config.quality_threshold)
}

pub struct SessionController<S> {
    chain: S,
    source: Box<dyn FrameSource>,
    sink: Arc<dyn StorageSink>,
    board: StatusBoard,
    jpeg_quality: u8,
    printing_since: Option<Instant>,
    last_frame: Option<Frame>,
    outcome: Option<SessionOutcome>,
}

impl<S: FrameStage> SessionController<S> {
    pub fn new(
        chain: S,
        source: Box<dyn FrameSource>,
        sink: Arc<dyn StorageSink>,
        board: StatusBoard,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            chain,
            source,
            sink,
            board,
            jpeg_quality,
            printing_since: None,
            last_frame: None,
            outcome: None,
        }
    }

    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.outcome.as_ref()
    }

    pub fn chain(&self) -> &S {
        &self.chain
    }

    /// Pulls and processes one frame.
    ///
    /// The frame that raises the terminal event is still returned for display;
    /// the outcome is reported by the following call.
    pub fn step(&mut self) -> Step {
        if let Some(outcome) = &self.outcome {
            return Step::Finished(outcome.clone());
        }

        let frame = match self.source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("frame source exhausted, ending session");
                return Step::Finished(self.flush());
            }
            Err(e) => {
                warn!(error = %e, "frame source failed, ending session");
                return Step::Finished(self.flush());
            }
        };

        match self.chain.process(&frame) {
            Ok(output) => {
                self.track_progress(&frame, output.motion_present);
                self.last_frame = Some(frame);
                if let Some(event) = output.events.into_iter().next() {
                    self.conclude(event);
                }
                Step::Frame(output.frame)
            }
            Err(StageError::Halted { event, source }) => {
                warn!(error = %source, "stage chain halted");
                self.last_frame = Some(frame);
                Step::Finished(self.conclude(*event))
            }
        }
    }

    /// Steps until the session ends.
    pub fn run(&mut self) -> SessionOutcome {
        loop {
            if let Step::Finished(outcome) = self.step() {
                return outcome;
            }
        }
    }

    /// Ends the session from the outside, flushing the accumulated motion time.
    pub fn cancel(&mut self) -> SessionOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        info!("session cancelled");
        self.flush()
    }

    fn track_progress(&mut self, frame: &Frame, motion_present: bool) {
        if motion_present && self.printing_since.is_none() {
            info!("print started");
            self.printing_since = Some(frame.timestamp());
        }
        let (status, elapsed_seconds) = match self.printing_since {
            Some(since) => (PrintStatus::Printing, frame.seconds_since(since)),
            None => (PrintStatus::AwaitingPrint, 0.0),
        };
        self.board.publish(SessionStatus {
            status,
            elapsed_seconds,
            error: false,
        });
    }

    fn flush(&mut self) -> SessionOutcome {
        let event = match self.chain.finish() {
            Some(LifecycleEvent::MotionEnded { total_seconds, frame }) => LifecycleEvent::MotionEnded {
                total_seconds,
                frame: frame.or_else(|| self.last_frame.clone()),
            },
            Some(event) => event,
            None => LifecycleEvent::MotionEnded {
                total_seconds: 0.0,
                frame: self.last_frame.clone(),
            },
        };
        self.conclude(event)
    }

    fn conclude(&mut self, event: LifecycleEvent) -> SessionOutcome {
        let (record, outcome, status) = match event {
            LifecycleEvent::MotionEnded { total_seconds, frame } => (
                PrintRecord::success(total_seconds, frame.as_ref(), self.jpeg_quality),
                SessionOutcome::Finished { total_seconds },
                SessionStatus {
                    status: PrintStatus::FinishedSuccessfully,
                    elapsed_seconds: total_seconds,
                    error: false,
                },
            ),
            LifecycleEvent::DefectDetected {
                elapsed_seconds,
                frame,
                message,
            } => (
                PrintRecord::failure(elapsed_seconds, frame.as_ref(), &message, self.jpeg_quality),
                SessionOutcome::Failed {
                    elapsed_seconds,
                    message: message.clone(),
                },
                SessionStatus {
                    status: PrintStatus::Failed(message),
                    elapsed_seconds,
                    error: true,
                },
            ),
        };

        info!(status = %status.status, elapsed = status.elapsed_seconds, "session ended");
        match self.sink.save(&record) {
            Ok(()) => debug!("print record stored"),
            Err(e) => error!(error = %e, "could not store the print record"),
        }
        self.board.publish(status);
        self.outcome = Some(outcome.clone());
        outcome
    }
}
