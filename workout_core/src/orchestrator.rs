//! Session orchestrator.
//!
//! The orchestrator owns the pipeline, the debouncer, the batch accumulator,
//! the delivery queue handle, the timers and the session link, and is the
//! only place session state changes. It runs as a single logical actor:
//! timers, protocol events and delivery results never touch state directly,
//! they post a [`SessionInput`] into the orchestrator inbox, which is drained
//! by [`SessionOrchestrator::pump`], [`SessionOrchestrator::tick`] and at
//! the start of every frame.
//!
//! State flow:
//!
//! ```text
//! Loading ──Started──▶ Running ◀──────────── Hint ◀── Blocked (cool-down)
//!    │                  │  │ ▲                 ▲          ▲
//!    │                  │  │ └── Replacing ────┘          │
//!    │                  │  └── boundary repetition ───────┘
//!    ▼                  ▼
//!  Error ◀── disconnect / delivery exhausted      finish ──▶ Complete
//! ```

use crate::api::WorkoutApi;
use crate::batch::{BatchAccumulator, SessionBatch};
use crate::catalog::ExerciseCatalog;
use crate::config::Config;
use crate::counter::RepetitionCounter;
use crate::hooks::{AnalyticsEvent, SessionHooks};
use crate::pipeline::ExercisePipeline;
use crate::protocol::{SessionEvent, SessionEventSink};
use crate::queue::{enqueue_with_retry, DeliveryQueue, RetryPolicy};
use crate::recognizer::FrameClassifier;
use crate::timers::{SessionTimers, TimerKind};
use crate::transport::{Connector, SessionLink};
use crate::types::{
    CompletionRecord, DisconnectCause, ErrorCategory, ErrorDetail, ExerciseDetails,
    ExerciseSegment, FrameMeta, FrameSnapshot, PosePoint, RecognitionMode, RoomResponse,
    SessionState, WorkoutStatus,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// Minimum landmark confidence for the user to count as in frame
const IN_FRAME_CONFIDENCE: f32 = 0.5;

/// Work posted into the orchestrator inbox
#[derive(Debug)]
pub enum SessionInput {
    Protocol(SessionEvent),
    TimerElapsed {
        kind: TimerKind,
        epoch: u64,
    },
    BatchDelivered {
        batch_id: Uuid,
    },
    DeliveryExhausted {
        op: &'static str,
    },
    StopDelivered,
    ReplaceFinished {
        position: usize,
        result: std::result::Result<ExerciseSegment, String>,
    },
}

/// Forwards protocol events into the orchestrator inbox
struct InboxSink(mpsc::UnboundedSender<SessionInput>);

impl SessionEventSink for InboxSink {
    fn on_event(&self, event: SessionEvent) {
        if self.0.send(SessionInput::Protocol(event)).is_err() {
            tracing::debug!("Orchestrator gone, dropping protocol event");
        }
    }
}

/// What happened to a submitted frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Not running (loading, hint, cool-down, replacing, finished)
    Ignored,
    Accepted,
    /// The frame completed a repetition of the current exercise
    Repetition,
}

/// Summary of a session, for the CLI and for logs
#[derive(Clone, Debug, Serialize)]
pub struct SessionReport {
    pub workout_id: Option<u64>,
    pub state: SessionState,
    pub completed_actions: u32,
    pub total_actions: u32,
    pub progress: f64,
    pub elapsed_secs: u64,
    pub frames_processed: u64,
    pub batches_delivered: u64,
    pub error: Option<ErrorDetail>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Top-level session state machine
pub struct SessionOrchestrator {
    config: Config,
    api: Arc<dyn WorkoutApi>,
    connector: Arc<dyn Connector>,
    classifier: Box<dyn FrameClassifier>,
    hooks: Arc<dyn SessionHooks>,

    catalog: ExerciseCatalog,
    pipeline: ExercisePipeline,
    counter: RepetitionCounter,
    accumulator: BatchAccumulator,
    delivery: DeliveryQueue,
    retry: RetryPolicy,
    timers: SessionTimers,
    link: Option<Box<dyn SessionLink>>,

    inbox_tx: mpsc::UnboundedSender<SessionInput>,
    inbox_rx: mpsc::UnboundedReceiver<SessionInput>,

    state: SessionState,
    error: Option<ErrorDetail>,
    workout_id: Option<u64>,
    next_frame_id: u64,
    frame_meta: FrameMeta,
    in_frame: bool,
    highlight: bool,
    show_replace: bool,
    replace_in_flight: bool,
    finishing: bool,
    /// Completion records never go backwards in frame id
    last_completion_frame: u64,

    last_repetition_at: Instant,
    started_at: Option<Instant>,
    elapsed: Option<Duration>,
    finished_at: Option<DateTime<Utc>>,
    frames_processed: u64,
    batches_delivered: u64,
}

impl SessionOrchestrator {
    /// Create an orchestrator in `Loading`
    ///
    /// Must be called from within a tokio runtime: the delivery worker is
    /// spawned here.
    pub fn new(
        config: Config,
        api: Arc<dyn WorkoutApi>,
        connector: Arc<dyn Connector>,
        classifier: Box<dyn FrameClassifier>,
        hooks: Arc<dyn SessionHooks>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let catalog = ExerciseCatalog::new().with_key_moments(&config.recognition.key_moments);
        let counter = RepetitionCounter::new(catalog.key_moments().clone(), config.recognition.fps);
        let accumulator = BatchAccumulator::new(
            api.token(),
            config.batch.frame_threshold,
            FrameMeta::default(),
        );
        let retry = RetryPolicy::from(&config.delivery);

        Self {
            api,
            connector,
            classifier,
            hooks,
            catalog,
            pipeline: ExercisePipeline::default(),
            counter,
            accumulator,
            delivery: DeliveryQueue::spawn(),
            retry,
            timers: SessionTimers::new(inbox_tx.clone()),
            link: None,
            inbox_tx,
            inbox_rx,
            state: SessionState::Loading,
            error: None,
            workout_id: None,
            next_frame_id: 1,
            frame_meta: FrameMeta::default(),
            in_frame: false,
            highlight: false,
            show_replace: false,
            replace_in_flight: false,
            finishing: false,
            last_completion_frame: 0,
            last_repetition_at: Instant::now(),
            started_at: None,
            elapsed: None,
            finished_at: None,
            frames_processed: 0,
            batches_delivered: 0,
            config,
        }
    }

    // ------------------------------------------------------------------
    // Observables
    // ------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn progress(&self) -> f64 {
        self.pipeline.progress()
    }

    pub fn current_segment(&self) -> Option<&ExerciseSegment> {
        self.pipeline.current_segment()
    }

    pub fn position(&self) -> Option<usize> {
        self.pipeline.position()
    }

    pub fn actions_left(&self) -> u32 {
        self.pipeline.actions_left_for_current()
    }

    pub fn pipeline(&self) -> &ExercisePipeline {
        &self.pipeline
    }

    pub fn error_detail(&self) -> Option<&ErrorDetail> {
        self.error.as_ref()
    }

    pub fn show_replace(&self) -> bool {
        self.show_replace
    }

    pub fn highlight(&self) -> bool {
        self.highlight
    }

    pub fn in_frame(&self) -> bool {
        self.in_frame
    }

    pub fn workout_id(&self) -> Option<u64> {
        self.workout_id
    }

    pub fn current_exercise_details(&self) -> Option<&ExerciseDetails> {
        self.current_segment()
            .and_then(|segment| self.catalog.details(&segment.label))
    }

    /// Session time so far, frozen once the session ends
    pub fn elapsed(&self) -> Duration {
        self.elapsed.unwrap_or_else(|| {
            self.started_at
                .map(|started| started.elapsed())
                .unwrap_or_default()
        })
    }

    pub fn report(&self) -> SessionReport {
        SessionReport {
            workout_id: self.workout_id,
            state: self.state,
            completed_actions: self.pipeline.completed_actions(),
            total_actions: self.pipeline.total(),
            progress: self.progress(),
            elapsed_secs: self.elapsed().as_secs(),
            frames_processed: self.frames_processed,
            batches_delivered: self.batches_delivered,
            error: self.error.clone(),
            finished_at: self.finished_at,
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Load the room, build the pipeline and open the session channel
    ///
    /// The session stays in `Loading` until the channel reports `Started`;
    /// see [`wait_while_loading`](Self::wait_while_loading).
    pub async fn initialize(&mut self) -> SessionState {
        if self.state != SessionState::Loading || self.link.is_some() {
            tracing::warn!("initialize called twice");
            return self.state;
        }
        self.hooks.track(&AnalyticsEvent::RoomOpened);

        let room = match self.api.load_room().await {
            Ok(room) => room,
            Err(e) => {
                tracing::error!("Failed to load room: {}", e);
                self.fail(ErrorCategory::InitializeFailed);
                return self.state;
            }
        };

        if let Some(category) = blocking_condition(&room) {
            tracing::warn!(%category, "Room is blocked");
            self.fail(category);
            return self.state;
        }

        let Some(workout) = room.workout else {
            tracing::error!("Room response carries no workout");
            self.fail(ErrorCategory::InitializeFailed);
            return self.state;
        };

        match self.api.get_exercises().await {
            Ok(details) => self.catalog.set_details(details),
            Err(e) => tracing::warn!("Exercise dictionary unavailable: {}", e),
        }

        self.pipeline = ExercisePipeline::from_program(&workout.program.sets)
            .resume_at(workout.exercises_num);
        let unknown = self
            .catalog
            .validate(self.pipeline.segments().iter().map(|s| s.label.as_str()));
        if !unknown.is_empty() {
            tracing::warn!(?unknown, "Exercises without a key moment will never count");
        }

        self.workout_id = Some(workout.id);
        self.next_frame_id = workout.frame_id + 1;
        tracing::info!(
            workout_id = workout.id,
            segments = self.pipeline.segments().len(),
            total = self.pipeline.total(),
            resumed_at = workout.exercises_num,
            "Workout loaded"
        );

        let sink = Box::new(InboxSink(self.inbox_tx.clone()));
        self.link = Some(self.connector.connect(workout.id, sink));
        self.state
    }

    /// Apply inbox messages until the session leaves `Loading`
    pub async fn wait_while_loading(&mut self) -> SessionState {
        while self.state == SessionState::Loading {
            if !self.tick().await {
                break;
            }
        }
        self.state
    }

    /// Apply inbox messages until the session reaches a terminal state
    pub async fn settle(&mut self) -> SessionState {
        while !self.state.is_terminal() {
            if !self.tick().await {
                break;
            }
        }
        self.state
    }

    /// Wait for one inbox message and apply it
    pub async fn tick(&mut self) -> bool {
        match self.inbox_rx.recv().await {
            Some(input) => {
                self.handle_input(input);
                true
            }
            None => false,
        }
    }

    /// Apply every inbox message that is already waiting
    pub fn pump(&mut self) {
        while let Ok(input) = self.inbox_rx.try_recv() {
            self.handle_input(input);
        }
    }

    // ------------------------------------------------------------------
    // UI actions
    // ------------------------------------------------------------------

    /// Feed one camera frame
    pub async fn process_frame(&mut self, points: Vec<PosePoint>, meta: FrameMeta) -> FrameOutcome {
        self.pump();
        if self.state != SessionState::Running || self.finishing {
            return FrameOutcome::Ignored;
        }

        let frame = FrameSnapshot {
            frame_id: self.next_frame_id,
            points,
        };
        let frame_id = frame.frame_id;
        self.next_frame_id += 1;
        self.frames_processed += 1;
        self.in_frame = frame.in_frame(IN_FRAME_CONFIDENCE);

        if meta != self.frame_meta {
            tracing::debug!(?meta, "Frame geometry changed");
            self.frame_meta = meta;
            self.accumulator.set_frame_meta(meta);
        }

        if !self.show_replace
            && !self.replace_in_flight
            && self.last_repetition_at.elapsed() >= self.config.session.replace_idle()
        {
            tracing::info!("No repetition for a while, offering a replacement");
            self.show_replace = true;
        }

        let label = match self.config.recognition.mode {
            RecognitionMode::OnDevice => {
                let exercise = self
                    .current_segment()
                    .map(|s| s.label.clone())
                    .unwrap_or_default();
                self.classifier.classify(&exercise, &frame).await
            }
            RecognitionMode::Remote => {
                if let Some(link) = &self.link {
                    link.send_frame(&frame, meta);
                }
                None
            }
        };

        self.accumulator.append_frame(frame);
        self.flush_if_ready();
        if self.state.is_terminal() {
            return FrameOutcome::Accepted;
        }

        if self.config.recognition.mode == RecognitionMode::OnDevice {
            if let Some(pose) = self.counter.step(label.as_deref()) {
                let current = self.current_segment().map(|s| s.label.as_str());
                if current == Some(pose.as_str()) {
                    self.record_completion(frame_id);
                    return FrameOutcome::Repetition;
                }
                tracing::debug!(?current, "Matched '{}' outside the current exercise", pose);
            }
        }
        FrameOutcome::Accepted
    }

    /// Ask for a different exercise in the current slot
    ///
    /// Returns `false` when the request is not allowed right now: the
    /// affordance is hidden, a replacement is already in flight, or the
    /// session is not running.
    pub fn replace_exercise(&mut self) -> bool {
        self.pump();
        if self.state != SessionState::Running
            || !self.show_replace
            || self.replace_in_flight
            || self.finishing
        {
            tracing::debug!(state = ?self.state, show = self.show_replace, "Replace rejected");
            return false;
        }
        let Some(position) = self.pipeline.position() else {
            return false;
        };

        self.show_replace = false;
        self.replace_in_flight = true;
        self.timers.cancel(TimerKind::ReplaceReveal);
        self.hooks.track(&AnalyticsEvent::ReplaceRequested { position });
        self.transition(SessionState::Replacing);

        match self.config.recognition.mode {
            RecognitionMode::OnDevice => {
                let api = self.api.clone();
                let inbox = self.inbox_tx.clone();
                let settled = enqueue_with_retry(
                    &self.delivery,
                    self.retry,
                    "replace_exercise",
                    move || {
                        let api = api.clone();
                        async move { api.replace_exercise().await }
                    },
                    |e| tracing::warn!("Replace request abandoned: {}", e),
                );
                tokio::spawn(async move {
                    let result = settled.await.map_err(|e| e.to_string());
                    let _ = inbox.send(SessionInput::ReplaceFinished { position, result });
                });
            }
            RecognitionMode::Remote => {
                if let Some(link) = &self.link {
                    link.request_replace();
                }
                let timeout = Duration::from_secs(self.config.server.request_timeout_secs);
                self.timers.arm(TimerKind::ReplaceTimeout, timeout);
            }
        }
        true
    }

    /// Leave the hint early
    pub fn dismiss_hint(&mut self) {
        self.pump();
        if self.state == SessionState::Hint {
            self.timers.cancel(TimerKind::Hint);
            self.transition(SessionState::Running);
        }
    }

    /// Retune the debouncer for a new capture frame rate
    pub fn update_frame_rate(&mut self, fps: f32) {
        self.counter.update_threshold(fps);
    }

    // ------------------------------------------------------------------
    // Inbox handling
    // ------------------------------------------------------------------

    fn handle_input(&mut self, input: SessionInput) {
        if self.state.is_terminal() {
            tracing::trace!(?input, "Ignoring input after the session ended");
            return;
        }

        match input {
            SessionInput::Protocol(event) => self.handle_event(event),
            SessionInput::TimerElapsed { kind, epoch } => {
                if self.timers.take_fired(kind, epoch) {
                    self.on_timer(kind);
                } else {
                    tracing::trace!(?kind, epoch, "Stale timer");
                }
            }
            SessionInput::BatchDelivered { batch_id } => {
                self.batches_delivered += 1;
                tracing::debug!(%batch_id, "Batch delivered");
            }
            SessionInput::DeliveryExhausted { op } => {
                tracing::error!(op, "Delivery exhausted its retries");
                self.fail(ErrorCategory::DeliveryFailed);
            }
            SessionInput::StopDelivered => self.complete(),
            SessionInput::ReplaceFinished { position, result } => {
                self.replace_in_flight = false;
                match result {
                    Ok(segment) => self.apply_replacement(position, segment),
                    Err(reason) => self.replace_failed(&reason),
                }
            }
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Started => {
                if self.state != SessionState::Loading {
                    tracing::debug!("Duplicate start ignored");
                    return;
                }
                let now = Instant::now();
                self.started_at = Some(now);
                self.last_repetition_at = now;
                self.accumulator.restart_clock();
                if let Some(workout_id) = self.workout_id {
                    self.hooks.track(&AnalyticsEvent::SessionStarted { workout_id });
                }
                self.transition(SessionState::Running);
                self.arm_replace_reveal();
                if self.pipeline.is_finished() {
                    self.begin_finish();
                }
            }
            SessionEvent::RepetitionFound { frame_id } => {
                if self.config.recognition.mode != RecognitionMode::Remote {
                    tracing::debug!("Ignoring server repetition in on-device mode");
                    return;
                }
                if self.state != SessionState::Running || self.finishing {
                    tracing::debug!(state = ?self.state, "Repetition outside running state");
                    return;
                }
                let frame_id = frame_id.unwrap_or_else(|| self.next_frame_id.saturating_sub(1));
                self.record_completion(frame_id);
            }
            SessionEvent::NextExercise { segment, position } => {
                self.on_next_exercise(position, segment)
            }
            SessionEvent::ReplaceExercise { segment, position } => {
                self.replace_in_flight = false;
                self.apply_replacement(position, segment);
            }
            SessionEvent::Disconnected { cause } => self.on_disconnect(cause),
        }
    }

    fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Cooldown => {
                if self.state == SessionState::Blocked {
                    self.enter_hint();
                }
            }
            TimerKind::Hint => {
                if self.state == SessionState::Hint {
                    self.transition(SessionState::Running);
                }
            }
            TimerKind::Highlight => self.highlight = false,
            TimerKind::ReplaceReveal => {
                if !self.finishing && !self.replace_in_flight && self.is_in_exercise() {
                    self.show_replace = true;
                }
            }
            TimerKind::ReplaceTimeout => {
                self.replace_in_flight = false;
                self.replace_failed("no answer from the server");
            }
        }
    }

    fn on_disconnect(&mut self, cause: DisconnectCause) {
        self.hooks.track(&AnalyticsEvent::Disconnected { cause });
        self.link = None;
        match cause.error_category() {
            None => {
                tracing::info!("Server closed the session normally");
                if self.state == SessionState::Loading {
                    self.started_at = Some(Instant::now());
                }
                self.begin_finish();
            }
            Some(category) => {
                tracing::warn!(?cause, "Session channel lost");
                self.fail(category);
            }
        }
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    fn record_completion(&mut self, frame_id: u64) {
        let Some(segment) = self.pipeline.current_segment().cloned() else {
            return;
        };
        let position_before = self.pipeline.position();
        let frame_id = frame_id.max(self.last_completion_frame);
        self.last_completion_frame = frame_id;

        self.pipeline.advance();
        self.accumulator.append_completion(CompletionRecord {
            frame_id,
            label: segment.label.clone(),
        });
        self.last_repetition_at = Instant::now();

        self.highlight = true;
        self.timers
            .arm(TimerKind::Highlight, self.config.session.highlight());

        let completed = self.pipeline.completed_actions();
        tracing::info!(
            label = %segment.label,
            completed,
            total = self.pipeline.total(),
            "Repetition"
        );
        self.hooks.track(&AnalyticsEvent::Repetition {
            label: segment.label,
            progress: self.pipeline.progress(),
        });
        let chime_every = self.config.session.chime_every;
        if chime_every > 0 && completed % chime_every == 0 {
            self.hooks.play_chime();
        }

        if self.pipeline.is_finished() {
            self.begin_finish();
            return;
        }

        if self.pipeline.position() != position_before {
            if let (Some(position), Some(next)) =
                (self.pipeline.position(), self.pipeline.current_segment())
            {
                self.hooks.track(&AnalyticsEvent::NextExercise {
                    label: next.label.clone(),
                    count: next.count,
                    position,
                });
            }
            self.show_replace = false;
            self.arm_replace_reveal();
            self.transition(SessionState::Blocked);
            self.timers
                .arm(TimerKind::Cooldown, self.config.session.blocked_cooldown());
        }
    }

    fn on_next_exercise(&mut self, position: usize, segment: ExerciseSegment) {
        if !self.is_in_exercise() || self.finishing {
            tracing::debug!(state = ?self.state, "NEXT_EXERCISE outside an exercise");
            return;
        }
        match self.pipeline.position() {
            Some(current) if position >= current => {}
            current => {
                tracing::warn!(position, ?current, "Ignoring NEXT_EXERCISE behind the pipeline");
                return;
            }
        }
        if !self.pipeline.replace(position, segment.clone()) {
            tracing::warn!(position, "NEXT_EXERCISE position out of range");
            return;
        }

        self.hooks.track(&AnalyticsEvent::NextExercise {
            label: segment.label,
            count: segment.count,
            position,
        });
        self.show_replace = false;
        self.arm_replace_reveal();
        self.enter_hint();
    }

    fn apply_replacement(&mut self, position: usize, segment: ExerciseSegment) {
        self.timers.cancel(TimerKind::ReplaceTimeout);
        if !self.is_in_exercise() || self.finishing {
            tracing::debug!(state = ?self.state, "Replacement outside an exercise");
            return;
        }
        if !self.pipeline.replace(position, segment.clone()) {
            self.replace_failed("replacement position out of range");
            return;
        }

        tracing::info!(position, label = %segment.label, count = segment.count, "Exercise replaced");
        self.hooks.track(&AnalyticsEvent::ExerciseReplaced {
            label: segment.label,
            count: segment.count,
            position,
        });
        self.last_repetition_at = Instant::now();
        self.show_replace = false;
        self.arm_replace_reveal();
        self.enter_hint();
    }

    fn replace_failed(&mut self, reason: &str) {
        tracing::warn!("Exercise replacement failed: {}", reason);
        if self.state == SessionState::Replacing {
            self.transition(SessionState::Running);
            self.show_replace = true;
        }
    }

    fn enter_hint(&mut self) {
        self.timers.cancel(TimerKind::Cooldown);
        self.transition(SessionState::Hint);
        if let Some(display) = self.config.session.hint_display() {
            self.timers.arm(TimerKind::Hint, display);
        }
    }

    fn arm_replace_reveal(&mut self) {
        match self.config.session.replace_reveal_delay() {
            Some(delay) => self.timers.arm(TimerKind::ReplaceReveal, delay),
            None => self.timers.cancel(TimerKind::ReplaceReveal),
        }
    }

    /// Seal the final batch and queue the stop signal; idempotent
    fn begin_finish(&mut self) {
        if self.finishing || self.state.is_terminal() {
            return;
        }
        self.finishing = true;
        self.show_replace = false;
        for kind in [
            TimerKind::Cooldown,
            TimerKind::Hint,
            TimerKind::ReplaceReveal,
            TimerKind::ReplaceTimeout,
        ] {
            self.timers.cancel(kind);
        }
        tracing::info!("Pipeline finished, delivering final batch");

        match self.accumulator.seal_final() {
            Ok(batch) if batch.is_empty() => tracing::debug!("Final batch is empty"),
            Ok(batch) => self.deliver_batch(batch),
            Err(e) => {
                tracing::error!("Failed to seal final batch: {}", e);
                self.fail(ErrorCategory::DeliveryFailed);
                return;
            }
        }

        let api = self.api.clone();
        let inbox = self.inbox_tx.clone();
        let exhausted = self.inbox_tx.clone();
        let queue = self.delivery.clone();
        let settled = enqueue_with_retry(
            &self.delivery,
            self.retry,
            "stop_workout",
            move || {
                let api = api.clone();
                async move { api.stop_workout().await }
            },
            move |_| {
                // Later jobs must not start before the inbox sees the failure
                queue.clear();
                let _ = exhausted.send(SessionInput::DeliveryExhausted { op: "stop_workout" });
            },
        );
        tokio::spawn(async move {
            if settled.await.is_ok() {
                let _ = inbox.send(SessionInput::StopDelivered);
            }
        });
    }

    fn flush_if_ready(&mut self) {
        match self.accumulator.seal_if_ready() {
            Ok(Some(batch)) => self.deliver_batch(batch),
            Ok(None) => {}
            Err(e) => {
                tracing::error!("Failed to seal batch: {}", e);
                self.fail(ErrorCategory::DeliveryFailed);
            }
        }
    }

    fn deliver_batch(&mut self, batch: SessionBatch) {
        let batch = Arc::new(batch);
        let batch_id = batch.id();
        tracing::debug!(%batch_id, frames = batch.frame_count(), "Queueing batch");

        let api = self.api.clone();
        let inbox = self.inbox_tx.clone();
        let exhausted = self.inbox_tx.clone();
        let queue = self.delivery.clone();
        let settled = enqueue_with_retry(
            &self.delivery,
            self.retry,
            "upload_batch",
            move || {
                let api = api.clone();
                let batch = batch.clone();
                async move { api.upload_batch(&batch).await }
            },
            move |_| {
                queue.clear();
                let _ = exhausted.send(SessionInput::DeliveryExhausted { op: "upload_batch" });
            },
        );
        tokio::spawn(async move {
            if settled.await.is_ok() {
                let _ = inbox.send(SessionInput::BatchDelivered { batch_id });
            }
        });
    }

    fn complete(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.shutdown();
        let total_time_secs = self.elapsed().as_secs();
        tracing::info!(total_time_secs, "Workout complete");
        self.hooks.track(&AnalyticsEvent::Completed { total_time_secs });
        self.transition(SessionState::Complete);
    }

    fn fail(&mut self, category: ErrorCategory) {
        if self.state.is_terminal() {
            tracing::debug!(%category, "Already terminal");
            return;
        }
        tracing::error!(%category, "Session failed");

        let dropped = self.delivery.pending();
        self.delivery.clear();
        if dropped > 0 {
            tracing::warn!(dropped, "Dropping queued deliveries");
        }
        self.shutdown();
        self.error = Some(category.into());
        self.hooks.track(&AnalyticsEvent::Error { category });
        self.transition(SessionState::Error);
    }

    /// Cancel timers, close the channel and freeze the clock
    fn shutdown(&mut self) {
        self.timers.cancel_all();
        self.highlight = false;
        self.show_replace = false;
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.elapsed = Some(self.elapsed());
        self.finished_at = Some(Utc::now());
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            tracing::info!(from = ?self.state, to = ?next, "Session state");
            self.state = next;
        }
    }

    fn is_in_exercise(&self) -> bool {
        matches!(
            self.state,
            SessionState::Running
                | SessionState::Hint
                | SessionState::Blocked
                | SessionState::Replacing
        )
    }
}

/// User-facing error for a room that cannot be run
fn blocking_condition(room: &RoomResponse) -> Option<ErrorCategory> {
    if let Some(error) = room.error.as_deref() {
        return Some(match error {
            "locked" => ErrorCategory::QuotaExhausted,
            other => {
                tracing::warn!("Unrecognised room error '{}'", other);
                ErrorCategory::InitializeFailed
            }
        });
    }
    match room.workout.as_ref()?.status {
        WorkoutStatus::Done => Some(ErrorCategory::AlreadyFinished),
        WorkoutStatus::Banned => Some(ErrorCategory::Banned),
        WorkoutStatus::Recognizing => Some(ErrorCategory::UnderReview),
        WorkoutStatus::Pending | WorkoutStatus::Active | WorkoutStatus::Unknown => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::ScriptedClassifier;
    use crate::types::{WorkoutModel, WorkoutProgram, WorkoutSet};
    use crate::{logging, Error, Result};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    // ------------------------------------------------------------------
    // Doubles
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct MockApi {
        room: Mutex<Option<RoomResponse>>,
        upload_failures: AtomicU32,
        upload_attempts: AtomicU32,
        uploads: Mutex<Vec<SessionBatch>>,
        stops: AtomicU32,
        replacement: Mutex<Option<ExerciseSegment>>,
        replace_calls: AtomicU32,
    }

    impl MockApi {
        fn with_room(room: RoomResponse) -> Arc<Self> {
            let api = Self::default();
            *api.room.lock().unwrap() = Some(room);
            Arc::new(api)
        }
    }

    #[async_trait]
    impl WorkoutApi for MockApi {
        fn token(&self) -> &str {
            "test-token"
        }

        async fn load_room(&self) -> Result<RoomResponse> {
            self.room
                .lock()
                .unwrap()
                .clone()
                .ok_or(Error::Api { status: 401 })
        }

        async fn get_exercises(&self) -> Result<HashMap<String, ExerciseDetails>> {
            let details = ExerciseDetails {
                label: "squat".into(),
                name: "Squat".into(),
                description: String::new(),
                video_url: None,
                side: Default::default(),
            };
            Ok(HashMap::from([("squat".to_string(), details)]))
        }

        async fn upload_batch(&self, batch: &SessionBatch) -> Result<()> {
            self.upload_attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.upload_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.upload_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::Api { status: 503 });
            }
            self.uploads.lock().unwrap().push(batch.clone());
            Ok(())
        }

        async fn stop_workout(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn replace_exercise(&self) -> Result<ExerciseSegment> {
            self.replace_calls.fetch_add(1, Ordering::SeqCst);
            self.replacement
                .lock()
                .unwrap()
                .clone()
                .ok_or(Error::Api { status: 500 })
        }
    }

    #[derive(Default)]
    struct LinkLog {
        frames: Vec<u64>,
        replaces: u32,
        closed: bool,
    }

    struct MockLink(Arc<Mutex<LinkLog>>);

    impl SessionLink for MockLink {
        fn send_frame(&self, frame: &FrameSnapshot, _meta: FrameMeta) {
            self.0.lock().unwrap().frames.push(frame.frame_id);
        }

        fn request_replace(&self) {
            self.0.lock().unwrap().replaces += 1;
        }

        fn close(&self) {
            self.0.lock().unwrap().closed = true;
        }
    }

    struct MockConnector {
        auto_open: bool,
        connected_to: Mutex<Vec<u64>>,
        sink: Mutex<Option<Box<dyn SessionEventSink>>>,
        log: Arc<Mutex<LinkLog>>,
    }

    impl MockConnector {
        fn new(auto_open: bool) -> Arc<Self> {
            Arc::new(Self {
                auto_open,
                connected_to: Mutex::new(Vec::new()),
                sink: Mutex::new(None),
                log: Arc::new(Mutex::new(LinkLog::default())),
            })
        }

        fn emit(&self, event: SessionEvent) {
            if let Some(sink) = self.sink.lock().unwrap().as_ref() {
                sink.on_event(event);
            }
        }
    }

    impl Connector for MockConnector {
        fn connect(&self, workout_id: u64, sink: Box<dyn SessionEventSink>) -> Box<dyn SessionLink> {
            self.connected_to.lock().unwrap().push(workout_id);
            if self.auto_open {
                sink.on_event(SessionEvent::Started);
            }
            *self.sink.lock().unwrap() = Some(sink);
            Box::new(MockLink(self.log.clone()))
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        events: Mutex<Vec<AnalyticsEvent>>,
        chimes: AtomicU32,
    }

    impl SessionHooks for RecordingHooks {
        fn track(&self, event: &AnalyticsEvent) {
            self.events.lock().unwrap().push(event.clone());
        }

        fn play_chime(&self) {
            self.chimes.fetch_add(1, Ordering::SeqCst);
        }
    }

    // ------------------------------------------------------------------
    // Fixtures
    // ------------------------------------------------------------------

    fn room(segments: Vec<ExerciseSegment>) -> RoomResponse {
        RoomResponse {
            user_id: Some(1),
            workout: Some(WorkoutModel {
                id: 42,
                name: "Morning".into(),
                status: WorkoutStatus::Active,
                exercises_num: 0,
                frame_id: 0,
                save_photos: false,
                program: WorkoutProgram {
                    sets: vec![WorkoutSet {
                        name: "main".into(),
                        repeats: 1,
                        exercises: segments,
                    }],
                },
            }),
            error: None,
        }
    }

    fn squat_lunge() -> RoomResponse {
        room(vec![
            ExerciseSegment::new("squat", 3),
            ExerciseSegment::new("lunge", 2),
        ])
    }

    /// Labels for one repetition at 30 fps: an accepted up, then down
    fn rep(pose: &str) -> Vec<Option<String>> {
        let mut labels = vec![Some(format!("{pose}_up")); 3];
        labels.extend(vec![Some(format!("{pose}_down")); 3]);
        labels
    }

    fn points() -> Vec<PosePoint> {
        vec![
            PosePoint {
                x: 0.5,
                y: 0.5,
                z: 0.0,
                confidence: 0.9,
            };
            3
        ]
    }

    fn meta() -> FrameMeta {
        FrameMeta::new(640, 480)
    }

    struct Harness {
        orchestrator: SessionOrchestrator,
        api: Arc<MockApi>,
        connector: Arc<MockConnector>,
        hooks: Arc<RecordingHooks>,
    }

    fn harness(
        config: Config,
        room: RoomResponse,
        labels: Vec<Option<String>>,
        auto_open: bool,
    ) -> Harness {
        logging::init_test();
        let api = MockApi::with_room(room);
        let connector = MockConnector::new(auto_open);
        let hooks = Arc::new(RecordingHooks::default());
        let orchestrator = SessionOrchestrator::new(
            config,
            api.clone(),
            connector.clone(),
            Box::new(ScriptedClassifier::new(labels)),
            hooks.clone(),
        );
        Harness {
            orchestrator,
            api,
            connector,
            hooks,
        }
    }

    async fn running(config: Config, room: RoomResponse, labels: Vec<Option<String>>) -> Harness {
        let mut h = harness(config, room, labels, true);
        h.orchestrator.initialize().await;
        assert_eq!(h.orchestrator.wait_while_loading().await, SessionState::Running);
        h
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        tokio::task::yield_now().await;
    }

    async fn feed(o: &mut SessionOrchestrator, frames: usize) -> Vec<FrameOutcome> {
        let mut outcomes = Vec::with_capacity(frames);
        for _ in 0..frames {
            outcomes.push(o.process_frame(points(), meta()).await);
        }
        outcomes
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_initialize_reaches_running() {
        let h = running(Config::default(), squat_lunge(), Vec::new()).await;
        let o = &h.orchestrator;

        assert_eq!(o.workout_id(), Some(42));
        assert_eq!(o.current_segment(), Some(&ExerciseSegment::new("squat", 3)));
        assert_eq!(o.progress(), 0.0);
        assert_eq!(o.actions_left(), 3);
        assert_eq!(o.current_exercise_details().map(|d| d.name.as_str()), Some("Squat"));
        assert_eq!(*h.connector.connected_to.lock().unwrap(), vec![42]);
        assert!(o.error_detail().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_ignored_until_started() {
        let mut h = harness(Config::default(), squat_lunge(), rep("squat"), false);
        assert_eq!(h.orchestrator.initialize().await, SessionState::Loading);
        assert_eq!(
            h.orchestrator.process_frame(points(), meta()).await,
            FrameOutcome::Ignored
        );

        h.connector.emit(SessionEvent::Started);
        assert_eq!(
            h.orchestrator.process_frame(points(), meta()).await,
            FrameOutcome::Accepted
        );
        assert_eq!(h.orchestrator.state(), SessionState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_conditions() {
        let cases = [
            (Some("locked"), WorkoutStatus::Active, ErrorCategory::QuotaExhausted),
            (None, WorkoutStatus::Done, ErrorCategory::AlreadyFinished),
            (None, WorkoutStatus::Banned, ErrorCategory::Banned),
            (None, WorkoutStatus::Recognizing, ErrorCategory::UnderReview),
        ];

        for (error, status, expected) in cases {
            let mut room = squat_lunge();
            room.error = error.map(String::from);
            if let Some(workout) = room.workout.as_mut() {
                workout.status = status;
            }
            let mut h = harness(Config::default(), room, Vec::new(), true);

            assert_eq!(h.orchestrator.initialize().await, SessionState::Error);
            assert_eq!(h.orchestrator.error_detail().unwrap().category, expected);
            assert!(h.connector.connected_to.lock().unwrap().is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_failure_is_initialize_failed() {
        let mut h = harness(Config::default(), squat_lunge(), Vec::new(), true);
        *h.api.room.lock().unwrap() = None;

        assert_eq!(h.orchestrator.initialize().await, SessionState::Error);
        let detail = h.orchestrator.error_detail().unwrap();
        assert_eq!(detail.category, ErrorCategory::InitializeFailed);
        assert!(detail.category.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_continues_pipeline_and_frame_ids() {
        let mut room = squat_lunge();
        if let Some(workout) = room.workout.as_mut() {
            workout.exercises_num = 1;
            workout.frame_id = 100;
        }
        let mut config = Config::default();
        config.recognition.mode = RecognitionMode::Remote;
        let mut h = running(config, room, Vec::new()).await;

        assert_eq!(h.orchestrator.current_segment(), Some(&ExerciseSegment::new("lunge", 2)));
        assert!((h.orchestrator.progress() - 0.6).abs() < 1e-9);

        feed(&mut h.orchestrator, 2).await;
        assert_eq!(h.connector.log.lock().unwrap().frames, vec![101, 102]);
    }

    // ------------------------------------------------------------------
    // Counting
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_on_device_session_to_completion() {
        let mut labels = rep("squat");
        labels.extend(rep("lunge"));
        let mut config = Config::default();
        config.session.chime_every = 1;
        let room = room(vec![
            ExerciseSegment::new("squat", 1),
            ExerciseSegment::new("lunge", 1),
        ]);
        let mut h = running(config, room, labels).await;
        let o = &mut h.orchestrator;

        let outcomes = feed(o, 6).await;
        assert_eq!(outcomes[5], FrameOutcome::Repetition);
        assert!(outcomes[..5].iter().all(|x| *x == FrameOutcome::Accepted));
        assert!(o.highlight());
        assert_eq!(o.state(), SessionState::Blocked);
        assert_eq!(o.current_segment(), Some(&ExerciseSegment::new("lunge", 1)));

        // Cool-down swallows frames, then the hint is shown
        assert_eq!(o.process_frame(points(), meta()).await, FrameOutcome::Ignored);
        advance(1001).await;
        o.pump();
        assert_eq!(o.state(), SessionState::Hint);
        assert!(!o.highlight());
        advance(3001).await;
        o.pump();
        assert_eq!(o.state(), SessionState::Running);

        let outcomes = feed(o, 6).await;
        assert_eq!(outcomes[5], FrameOutcome::Repetition);
        assert_eq!(o.progress(), 1.0);

        assert_eq!(o.settle().await, SessionState::Complete);
        assert_eq!(h.api.stops.load(Ordering::SeqCst), 1);
        let uploads = h.api.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].frame_count(), 12);
        let labels: Vec<_> = uploads[0]
            .body()
            .exercises
            .iter()
            .map(|c| c.label.as_str())
            .collect();
        assert_eq!(labels, vec!["squat", "lunge"]);
        assert_eq!(uploads[0].body().exercises[0].frame_id, 6);
        assert_eq!(h.hooks.chimes.load(Ordering::SeqCst), 2);
        assert!(h
            .hooks
            .events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, AnalyticsEvent::Completed { .. })));
        assert!(h.connector.log.lock().unwrap().closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_sealed_past_threshold() {
        let mut config = Config::default();
        config.batch.frame_threshold = 4;
        let mut h = running(config, squat_lunge(), Vec::new()).await;

        feed(&mut h.orchestrator, 5).await;
        h.orchestrator.tick().await;
        assert_eq!(h.orchestrator.report().batches_delivered, 1);
        assert_eq!(h.api.uploads.lock().unwrap()[0].frame_count(), 5);
        assert_eq!(h.orchestrator.state(), SessionState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hint_waits_for_dismissal_when_display_disabled() {
        let mut config = Config::default();
        config.session.hint_display_ms = 0;
        let mut h = running(config, squat_lunge(), Vec::new()).await;

        h.connector.emit(SessionEvent::NextExercise {
            segment: ExerciseSegment::new("lunge", 2),
            position: 1,
        });
        h.orchestrator.pump();
        assert_eq!(h.orchestrator.state(), SessionState::Hint);

        advance(60_000).await;
        h.orchestrator.pump();
        assert_eq!(h.orchestrator.state(), SessionState::Hint);

        h.orchestrator.dismiss_hint();
        assert_eq!(h.orchestrator.state(), SessionState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_exercise_event_enters_hint() {
        let mut h = running(Config::default(), squat_lunge(), Vec::new()).await;

        h.connector.emit(SessionEvent::NextExercise {
            segment: ExerciseSegment::new("lunge", 2),
            position: 1,
        });
        h.orchestrator.pump();
        assert_eq!(h.orchestrator.state(), SessionState::Hint);
        assert_eq!(h.orchestrator.position(), Some(1));
        assert!((h.orchestrator.progress() - 0.6).abs() < 1e-9);

        advance(3001).await;
        h.orchestrator.pump();
        assert_eq!(h.orchestrator.state(), SessionState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_repetitions() {
        let mut config = Config::default();
        config.recognition.mode = RecognitionMode::Remote;
        let mut h = running(config, squat_lunge(), Vec::new()).await;

        assert_eq!(
            h.orchestrator.process_frame(points(), meta()).await,
            FrameOutcome::Accepted
        );
        h.connector.emit(SessionEvent::RepetitionFound { frame_id: Some(1) });
        h.orchestrator.pump();

        assert_eq!(h.orchestrator.pipeline().completed_actions(), 1);
        assert_eq!(h.orchestrator.actions_left(), 2);
        assert_eq!(h.connector.log.lock().unwrap().frames, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_remote_frame_id_keeps_completion() {
        let mut config = Config::default();
        config.recognition.mode = RecognitionMode::Remote;
        let mut h = running(config, squat_lunge(), Vec::new()).await;
        feed(&mut h.orchestrator, 1).await;

        h.connector.emit(SessionEvent::RepetitionFound { frame_id: Some(5) });
        h.orchestrator.pump();
        h.connector.emit(SessionEvent::RepetitionFound { frame_id: Some(3) });
        h.orchestrator.pump();
        assert_eq!(h.orchestrator.pipeline().completed_actions(), 2);

        h.connector.emit(SessionEvent::Disconnected {
            cause: DisconnectCause::NormalCompletion,
        });
        assert_eq!(h.orchestrator.settle().await, SessionState::Complete);

        let uploads = h.api.uploads.lock().unwrap();
        let frame_ids: Vec<u64> = uploads[0]
            .body()
            .exercises
            .iter()
            .map(|c| c.frame_id)
            .collect();
        assert_eq!(frame_ids, vec![5, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_repetitions_ignored_on_device() {
        let mut h = running(Config::default(), squat_lunge(), Vec::new()).await;

        h.connector.emit(SessionEvent::RepetitionFound { frame_id: None });
        h.orchestrator.pump();

        assert_eq!(h.orchestrator.pipeline().completed_actions(), 0);
        assert!(h.connector.log.lock().unwrap().frames.is_empty());
    }

    // ------------------------------------------------------------------
    // Failures
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_already_completed_close_is_an_error() {
        let mut h = running(Config::default(), squat_lunge(), Vec::new()).await;

        h.connector.emit(SessionEvent::Disconnected {
            cause: DisconnectCause::AlreadyCompleted,
        });
        h.orchestrator.pump();

        assert_eq!(h.orchestrator.state(), SessionState::Error);
        assert_eq!(
            h.orchestrator.error_detail().unwrap().category,
            ErrorCategory::AlreadyCompleted
        );
        assert_eq!(h.api.stops.load(Ordering::SeqCst), 0);

        // Terminal: nothing moves it any more
        h.connector.emit(SessionEvent::Started);
        h.orchestrator.pump();
        assert_eq!(h.orchestrator.state(), SessionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_close_completes() {
        let mut h = running(Config::default(), squat_lunge(), Vec::new()).await;
        feed(&mut h.orchestrator, 3).await;

        h.connector.emit(SessionEvent::Disconnected {
            cause: DisconnectCause::NormalCompletion,
        });
        assert_eq!(h.orchestrator.settle().await, SessionState::Complete);
        assert_eq!(h.api.stops.load(Ordering::SeqCst), 1);
        assert_eq!(h.api.uploads.lock().unwrap()[0].frame_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_upload_fails_session() {
        let mut config = Config::default();
        config.batch.frame_threshold = 2;
        let mut h = running(config, squat_lunge(), Vec::new()).await;
        h.api.upload_failures.store(u32::MAX, Ordering::SeqCst);

        let start = Instant::now();
        feed(&mut h.orchestrator, 3).await;
        assert_eq!(h.orchestrator.settle().await, SessionState::Error);

        assert_eq!(
            h.orchestrator.error_detail().unwrap().category,
            ErrorCategory::DeliveryFailed
        );
        assert_eq!(h.api.upload_attempts.load(Ordering::SeqCst), 4);
        assert!(start.elapsed() >= Duration::from_millis(9000));

        // Frames after the failure go nowhere
        assert_eq!(
            h.orchestrator.process_frame(points(), meta()).await,
            FrameOutcome::Ignored
        );
        let elapsed = h.orchestrator.elapsed();
        advance(5000).await;
        assert_eq!(h.orchestrator.elapsed(), elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_final_batch_skips_stop() {
        let mut h = running(Config::default(), squat_lunge(), Vec::new()).await;
        h.api.upload_failures.store(u32::MAX, Ordering::SeqCst);
        feed(&mut h.orchestrator, 3).await;

        h.connector.emit(SessionEvent::Disconnected {
            cause: DisconnectCause::NormalCompletion,
        });
        assert_eq!(h.orchestrator.settle().await, SessionState::Error);
        assert_eq!(
            h.orchestrator.error_detail().unwrap().category,
            ErrorCategory::DeliveryFailed
        );
        assert_eq!(h.api.upload_attempts.load(Ordering::SeqCst), 4);

        advance(30_000).await;
        assert_eq!(h.api.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_batch_drops_queued_batches() {
        let mut config = Config::default();
        config.batch.frame_threshold = 2;
        let mut h = running(config, squat_lunge(), Vec::new()).await;
        h.api.upload_failures.store(u32::MAX, Ordering::SeqCst);

        // Two batches queued back to back
        feed(&mut h.orchestrator, 6).await;
        assert_eq!(h.orchestrator.settle().await, SessionState::Error);
        assert_eq!(h.api.upload_attempts.load(Ordering::SeqCst), 4);

        advance(30_000).await;
        assert_eq!(h.api.upload_attempts.load(Ordering::SeqCst), 4);
        assert!(h.api.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_cancels_timers() {
        let room = room(vec![
            ExerciseSegment::new("squat", 1),
            ExerciseSegment::new("lunge", 1),
        ]);
        let mut h = running(Config::default(), room, rep("squat")).await;
        feed(&mut h.orchestrator, 6).await;
        assert_eq!(h.orchestrator.state(), SessionState::Blocked);
        assert!(h.orchestrator.highlight());

        h.connector.emit(SessionEvent::Disconnected {
            cause: DisconnectCause::TransportError,
        });
        h.orchestrator.pump();
        assert_eq!(h.orchestrator.state(), SessionState::Error);
        assert_eq!(
            h.orchestrator.error_detail().unwrap().category,
            ErrorCategory::ConnectionLost
        );
        assert!(!h.orchestrator.highlight());

        // Cool-down, highlight and reveal would all have fired by now
        advance(30_000).await;
        assert!(h.orchestrator.inbox_rx.try_recv().is_err());
        assert_eq!(h.orchestrator.state(), SessionState::Error);
        assert!(!h.orchestrator.highlight());
        assert!(!h.orchestrator.show_replace());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_drops_queued_batches() {
        let mut config = Config::default();
        config.batch.frame_threshold = 2;
        let mut h = running(config, squat_lunge(), Vec::new()).await;
        h.api.upload_failures.store(u32::MAX, Ordering::SeqCst);

        feed(&mut h.orchestrator, 6).await;
        advance(10).await;
        assert_eq!(h.api.upload_attempts.load(Ordering::SeqCst), 1);

        h.connector.emit(SessionEvent::Disconnected {
            cause: DisconnectCause::TransportError,
        });
        h.orchestrator.pump();
        assert_eq!(h.orchestrator.state(), SessionState::Error);

        // The batch in flight finishes its retries; the one behind it never starts
        advance(30_000).await;
        assert_eq!(h.api.upload_attempts.load(Ordering::SeqCst), 4);
        h.orchestrator.pump();
        assert_eq!(
            h.orchestrator.error_detail().unwrap().category,
            ErrorCategory::ConnectionLost
        );
    }

    // ------------------------------------------------------------------
    // Replacement
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_replace_flow_on_device() {
        let mut h = running(Config::default(), squat_lunge(), Vec::new()).await;
        *h.api.replacement.lock().unwrap() = Some(ExerciseSegment::new("pushup", 4));

        assert!(!h.orchestrator.replace_exercise());

        advance(20_001).await;
        h.orchestrator.pump();
        assert!(h.orchestrator.show_replace());

        assert!(h.orchestrator.replace_exercise());
        assert_eq!(h.orchestrator.state(), SessionState::Replacing);
        assert!(!h.orchestrator.replace_exercise());

        while h.orchestrator.state() == SessionState::Replacing {
            assert!(h.orchestrator.tick().await);
        }
        assert_eq!(h.orchestrator.state(), SessionState::Hint);
        assert_eq!(
            h.orchestrator.current_segment(),
            Some(&ExerciseSegment::new("pushup", 4))
        );
        assert_eq!(h.orchestrator.position(), Some(0));
        assert_eq!(h.api.replace_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_failure_restores_affordance() {
        let mut config = Config::default();
        config.session.replace_reveal_delay_secs = 0;
        let mut h = running(config, squat_lunge(), Vec::new()).await;

        // Idle threshold reveals the affordance on the next frame
        advance(60_000).await;
        feed(&mut h.orchestrator, 1).await;
        assert!(h.orchestrator.show_replace());
        assert!(h.orchestrator.replace_exercise());

        while h.orchestrator.state() == SessionState::Replacing {
            assert!(h.orchestrator.tick().await);
        }
        assert_eq!(h.orchestrator.state(), SessionState::Running);
        assert!(h.orchestrator.show_replace());
        assert!(h.orchestrator.error_detail().is_none());
        assert_eq!(h.api.replace_calls.load(Ordering::SeqCst), 4);
        assert_eq!(h.orchestrator.current_segment(), Some(&ExerciseSegment::new("squat", 3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_over_channel_times_out() {
        let mut config = Config::default();
        config.recognition.mode = RecognitionMode::Remote;
        let mut h = running(config, squat_lunge(), Vec::new()).await;

        advance(20_001).await;
        assert!(h.orchestrator.replace_exercise());
        assert_eq!(h.connector.log.lock().unwrap().replaces, 1);

        advance(30_001).await;
        h.orchestrator.pump();
        assert_eq!(h.orchestrator.state(), SessionState::Running);
        assert!(h.orchestrator.show_replace());

        // A late answer from the server still applies
        h.connector.emit(SessionEvent::ReplaceExercise {
            segment: ExerciseSegment::new("crunch", 10),
            position: 0,
        });
        h.orchestrator.pump();
        assert_eq!(h.orchestrator.state(), SessionState::Hint);
        assert_eq!(
            h.orchestrator.current_segment(),
            Some(&ExerciseSegment::new("crunch", 10))
        );
    }
}
