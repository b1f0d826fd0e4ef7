// THEORY:
// The `SessionHost` is the outward face of the engine. It runs at most one
// session at a time, each on its own blocking worker, and hands the caller a
// stream of annotated frames for display.
//
// - `start_session` validates the configuration, refuses to start while another
//   session is still running, builds a fresh stage chain and spawns the loop.
// - The loop checks a cancellation flag once per frame. When the flag is set, or
//   the frame stream is dropped, the controller is cancelled and flushes its
//   outcome to storage like any natural ending.
// - The worker publishes its outcome on a watch channel. `wait_session` only
//   borrows the slot long enough to subscribe, so a caller blocked on a session
//   that never ends by itself cannot keep stop or resume out.
// - `resume_session` cancels the running session and waits for its final flush
//   while holding the session slot, so a new session can never overlap the
//   previous session's terminal write. Status is then reset and the generation
//   counter moves on.
//
// Frames are offered to viewers with `try_send`: a slow viewer misses frames
// instead of stalling the pipeline.

use crate::config::WatchConfig;
use crate::core_modules::event_bus::{BroadcastListener, LogListener};
use crate::core_modules::frame::Frame;
use crate::core_modules::quality_scorer::ReferenceImage;
use crate::core_modules::stage::FrameStage;
use crate::error::SetupError;
use crate::session::{
    FrameSource, SessionController, SessionOutcome, SessionStatus, StatusBoard, Step, StorageSink, standard_chain,
};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tracing::{debug, error, info, trace};

const FRAME_BUFFER: usize = 32;
const NOTIFICATION_BUFFER: usize = 64;

/// Annotated frames of one session. Ends when the session ends.
pub type SessionStream = Pin<Box<dyn Stream<Item = Frame> + Send>>;

struct ActiveSession {
    generation: u64,
    cancel: watch::Sender<bool>,
    done: watch::Receiver<Option<SessionOutcome>>,
}

impl ActiveSession {
    /// The outcome is published, or the worker died before publishing one.
    fn is_finished(&self) -> bool {
        let published = self.done.borrow().is_some();
        published || self.done.has_changed().is_err()
    }
}

pub struct SessionHost {
    sink: Arc<dyn StorageSink>,
    board: StatusBoard,
    notifications: broadcast::Sender<String>,
    active: Mutex<Option<ActiveSession>>,
    generation: AtomicU64,
}

impl SessionHost {
    pub fn new(sink: Arc<dyn StorageSink>) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self {
            sink,
            board: StatusBoard::new(),
            notifications,
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Starts watching `source` against `reference` with the standard chain.
    pub async fn start_session(
        &self,
        source: Box<dyn FrameSource>,
        reference: Arc<ReferenceImage>,
        config: WatchConfig,
    ) -> Result<SessionStream, SetupError> {
        config.validate()?;
        let chain = standard_chain(&config, reference);
        self.start_with_chain(source, chain, config.jpeg_quality).await
    }

    /// Starts a session over a caller-built chain.
    pub async fn start_with_chain<S>(
        &self,
        source: Box<dyn FrameSource>,
        chain: S,
        jpeg_quality: u8,
    ) -> Result<SessionStream, SetupError>
    where
        S: FrameStage + 'static,
    {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|session| !session.is_finished()) {
            return Err(SetupError::SessionActive);
        }

        chain.event_bus().attach(Arc::new(LogListener));
        chain
            .event_bus()
            .attach(Arc::new(BroadcastListener::new(self.notifications.clone())));

        self.board.reset();
        let controller = SessionController::new(chain, source, Arc::clone(&self.sink), self.board.clone(), jpeg_quality);
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(None);
        let generation = self.generation.load(Ordering::SeqCst);

        tokio::task::spawn_blocking(move || {
            let outcome = drive(controller, frames_tx, cancel_rx);
            done_tx.send_replace(Some(outcome));
        });
        info!(generation, "session started");
        *active = Some(ActiveSession {
            generation,
            cancel: cancel_tx,
            done: done_rx,
        });

        let stream = futures::stream::unfold(frames_rx, |mut rx| async move { rx.recv().await.map(|frame| (frame, rx)) });
        Ok(Box::pin(stream))
    }

    pub fn current_status(&self) -> SessionStatus {
        self.board.current()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.board.subscribe()
    }

    /// Every EventBus notification of every session started after this call.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<String> {
        self.notifications.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn is_active(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|session| !session.is_finished())
    }

    /// Waits for the current session to end, without holding the session slot.
    ///
    /// Stop and resume stay available meanwhile; either one ending the session
    /// also releases this wait. Returns `None` when no session was started.
    pub async fn wait_session(&self) -> Option<SessionOutcome> {
        let (generation, done) = {
            let active = self.active.lock().await;
            let session = active.as_ref()?;
            (session.generation, session.done.clone())
        };
        outcome_of(generation, done).await
    }

    /// Asks the current session to stop and waits for its final flush.
    pub async fn stop_session(&self) -> Option<SessionOutcome> {
        let mut active = self.active.lock().await;
        let session = active.take()?;
        let _ = session.cancel.send(true);
        outcome_of(session.generation, session.done).await
    }

    /// Discards the previous session and arms a fresh one.
    ///
    /// Returns the outcome of the session that was still running, if any.
    pub async fn resume_session(&self) -> Option<SessionOutcome> {
        let mut active = self.active.lock().await;
        let outcome = match active.take() {
            Some(session) => {
                let _ = session.cancel.send(true);
                outcome_of(session.generation, session.done).await
            }
            None => None,
        };
        self.board.reset();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(generation, "session state reset");
        outcome
    }
}

async fn outcome_of(generation: u64, mut done: watch::Receiver<Option<SessionOutcome>>) -> Option<SessionOutcome> {
    let published = done.wait_for(Option::is_some).await.map(|outcome| outcome.clone());
    match published {
        Ok(outcome) => outcome,
        Err(_) => {
            error!(generation, "session worker died without an outcome");
            None
        }
    }
}

fn drive<S: FrameStage>(
    mut controller: SessionController<S>,
    frames: mpsc::Sender<Frame>,
    cancel: watch::Receiver<bool>,
) -> SessionOutcome {
    loop {
        if *cancel.borrow() {
            return controller.cancel();
        }
        match controller.step() {
            Step::Frame(frame) => match frames.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => trace!("viewer is behind, frame dropped"),
                Err(TrySendError::Closed(_)) => {
                    debug!("frame stream dropped");
                    return controller.cancel();
                }
            },
            Step::Finished(outcome) => return outcome,
        }
    }
}
