// THEORY:
// This file is the entry point for the `print_watch` library crate. It exposes
// two levels of API:
//
// - `core_modules`: the detection layers. Each layer implements `FrameStage` and
//   owns the layer beneath it, so a custom chain can be assembled by hand.
// - `session` and `host`: the high-level interface. A `SessionController` drives
//   one chain over one frame source and reports exactly one outcome to storage;
//   a `SessionHost` runs controllers in the background, one at a time, and
//   exposes the annotated frame stream, the live status and resume.
//
// Everything a caller needs for the common case is re-exported here.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod host;
pub mod session;

pub use crate::config::WatchConfig;
pub use crate::core_modules::defect_stage::{DefectStage, DefectState};
pub use crate::core_modules::event_bus::{BroadcastListener, EventBus, Listener, ListenerId, LogListener};
pub use crate::core_modules::frame::Frame;
pub use crate::core_modules::motion_detector::MotionDetector;
pub use crate::core_modules::motion_timer::{MotionState, MotionTimerStage};
pub use crate::core_modules::quality_scorer::{QualityScorer, ReferenceImage, SimilarityScorer};
pub use crate::core_modules::stage::{FrameStage, LifecycleEvent, StageOutput};
pub use crate::error::{EncodeError, ListenerError, ScoringError, SetupError, SourceError, StageError, StorageError};
pub use crate::host::{SessionHost, SessionStream};
pub use crate::session::{
    FrameSource, PrintRecord, PrintStatus, SessionController, SessionOutcome, SessionStatus, StatusBoard, StorageSink,
};
