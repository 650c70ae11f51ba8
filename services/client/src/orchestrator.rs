//! Session Orchestration
//!
//! A single task owns every piece of mutable session state: the snapshot
//! store, the countdown, the transcript and the in-flight send. Callers talk
//! to it through an [`OrchestratorHandle`]; gateway calls run on their own
//! tasks and report back over a completion channel, so the loop itself never
//! awaits the network.

use crate::{
    error::{ApiError, OrchestratorError},
    gateway::ApiGateway,
    models::{DialogueTurn, FinalizationResult, InitializedSession},
};
use std::{future::Future, sync::Arc, time::Duration};
use therapy_sim_core::{
    SessionEvent,
    patient::PatientSummary,
    protocol::ProtocolTemplate,
    snapshot::SessionSnapshot,
    store::{RequestTicket, SessionStateStore, SnapshotSubscription},
    timer::{DEFAULT_SESSION_MINUTES, DEFAULT_THRESHOLDS, SessionTimer, TimerEvent, TimerPhase},
    transcript::{Message, Sender, Transcript},
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, Interval, interval_at, sleep_until},
};
use tracing::{Instrument, debug, info, instrument, warn};

/// Tunables for one orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    /// Length of a session when the backend does not report one.
    pub session_minutes: u32,
    /// Wall-clock length of one simulated minute.
    pub tick_interval: Duration,
    /// How long a send may stay unanswered before another is allowed.
    pub send_safety_timeout: Duration,
    /// Remaining-minute marks that raise a warning. Zero is implied.
    pub thresholds: Vec<u32>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            session_minutes: DEFAULT_SESSION_MINUTES,
            tick_interval: Duration::from_secs(60),
            send_safety_timeout: Duration::from_millis(4500),
            thresholds: DEFAULT_THRESHOLDS.to_vec(),
        }
    }
}

/// How a send request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDispatch {
    /// The message was appended and sent.
    Dispatched,
    /// Another message is still awaiting its reply; nothing was sent.
    Busy,
    /// The session has expired or been finalized; nothing was sent.
    SessionEnded,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Initialize(Reply<Result<InitializedSession, ApiError>>),
    Send {
        text: String,
        reply: Reply<Result<SendDispatch, ApiError>>,
    },
    Finalize(Reply<Result<FinalizationResult, ApiError>>),
    RefreshStatus(Reply<Option<SessionSnapshot>>),
    PatientSummary(Reply<Result<PatientSummary, ApiError>>),
    Subscribe(Reply<SnapshotSubscription>),
    Transcript(Reply<Vec<Message>>),
    Shutdown,
}

enum FinalizeTrigger {
    Manual(Reply<Result<FinalizationResult, ApiError>>),
    Expired,
}

/// The outcome of a gateway call, returned to the loop.
enum Completion {
    Initialized {
        result: Result<InitializedSession, ApiError>,
        reply: Reply<Result<InitializedSession, ApiError>>,
    },
    Status {
        ticket: RequestTicket,
        result: Result<SessionSnapshot, ApiError>,
        reply: Reply<Option<SessionSnapshot>>,
    },
    Patient {
        result: Result<PatientSummary, ApiError>,
        reply: Reply<Result<PatientSummary, ApiError>>,
    },
    Replied {
        send_id: u64,
        generation: u64,
        result: Result<DialogueTurn, ApiError>,
    },
    Finalized {
        generation: u64,
        trigger: FinalizeTrigger,
        result: Result<FinalizationResult, ApiError>,
    },
}

struct InFlightSend {
    id: u64,
    deadline: Instant,
}

/// Cloneable front end to a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
}

impl OrchestratorHandle {
    /// Starts a session with a new patient. The returned snapshot has every
    /// protocol item present.
    pub async fn initialize(&self) -> Result<InitializedSession, OrchestratorError> {
        Ok(self.request(Command::Initialize).await??)
    }

    /// Appends an operator message and sends it, unless a previous message
    /// is still awaiting its reply.
    pub async fn send(&self, text: &str) -> Result<SendDispatch, OrchestratorError> {
        let text = text.to_string();
        Ok(self
            .request(|reply| Command::Send { text, reply })
            .await??)
    }

    /// Closes the session. Finalizing an already closed session succeeds.
    pub async fn finalize(&self) -> Result<FinalizationResult, OrchestratorError> {
        Ok(self.request(Command::Finalize).await??)
    }

    /// Reads the backend status and merges it. `None` when no session is
    /// active or the status could not be read.
    pub async fn refresh_status(&self) -> Result<Option<SessionSnapshot>, OrchestratorError> {
        self.request(Command::RefreshStatus).await
    }

    /// Reads the assigned patient. When the backend has none, a session is
    /// initialized and its patient returned instead.
    pub async fn patient_summary(&self) -> Result<PatientSummary, OrchestratorError> {
        match self.request(Command::PatientSummary).await? {
            Err(e) if e.status() == Some(404) => {
                info!("No patient assigned; initializing a session");
                Ok(self.initialize().await?.patient)
            }
            result => Ok(result?),
        }
    }

    pub async fn subscribe(&self) -> Result<SnapshotSubscription, OrchestratorError> {
        self.request(Command::Subscribe).await
    }

    pub async fn transcript(&self) -> Result<Vec<Message>, OrchestratorError> {
        self.request(Command::Transcript).await
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| OrchestratorError::Closed)?;
        rx.await.map_err(|_| OrchestratorError::Closed)
    }
}

pub struct SessionOrchestrator {
    gateway: ApiGateway,
    template: Arc<ProtocolTemplate>,
    settings: OrchestratorSettings,
    store: SessionStateStore,
    timer: SessionTimer,
    ticker: Option<Interval>,
    transcript: Transcript,
    events: mpsc::UnboundedSender<SessionEvent>,
    completions: mpsc::UnboundedSender<Completion>,
    in_flight: Option<InFlightSend>,
    last_send_id: u64,
    /// Bumped whenever a session starts or ends; replies tagged with an
    /// older generation belong to a session that is gone.
    generation: u64,
    /// Set once the session has expired or been finalized.
    terminal: bool,
    completion_notified: bool,
    /// Finalize requests sent but not yet answered.
    finalizing: usize,
}

impl SessionOrchestrator {
    /// Spawns the orchestrator loop.
    ///
    /// Returns the command handle, the session event stream and the loop's
    /// join handle. The loop stops on [`OrchestratorHandle::shutdown`] or
    /// once every handle has been dropped.
    pub fn spawn(
        gateway: ApiGateway,
        template: Arc<ProtocolTemplate>,
        settings: OrchestratorSettings,
    ) -> (
        OrchestratorHandle,
        mpsc::UnboundedReceiver<SessionEvent>,
        JoinHandle<()>,
    ) {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let orchestrator = Self {
            gateway,
            template,
            timer: SessionTimer::new(&settings.thresholds),
            settings,
            store: SessionStateStore::new(),
            ticker: None,
            transcript: Transcript::new(),
            events: events_tx,
            completions: completions_tx,
            in_flight: None,
            last_send_id: 0,
            generation: 0,
            terminal: false,
            completion_notified: false,
            finalizing: 0,
        };
        let join = tokio::spawn(orchestrator.run(commands_rx, completions_rx));
        (
            OrchestratorHandle {
                commands: commands_tx,
            },
            events_rx,
            join,
        )
    }

    #[instrument(name = "session_orchestrator", skip_all)]
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        info!("Session orchestrator started");
        loop {
            let send_deadline = self.in_flight.as_ref().map(|send| send.deadline);
            tokio::select! {
                biased;
                Some(completion) = completions.recv() => self.handle_completion(completion),
                _ = wait_until(send_deadline) => self.release_unanswered_send(),
                _ = next_tick(&mut self.ticker) => {
                    let events = self.timer.tick();
                    self.handle_timer_events(events);
                }
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
            }
        }
        self.ticker = None;
        self.drain_finalizations(&mut completions).await;
        info!("Session orchestrator stopped");
    }

    /// Waits for outstanding finalize requests so that leaving the loop does
    /// not cancel them. Other completions are dropped.
    async fn drain_finalizations(
        &mut self,
        completions: &mut mpsc::UnboundedReceiver<Completion>,
    ) {
        if self.finalizing > 0 {
            info!(pending = self.finalizing, "Waiting for finalize before stopping");
        }
        while self.finalizing > 0 {
            match completions.recv().await {
                Some(completion @ Completion::Finalized { .. }) => {
                    self.handle_completion(completion)
                }
                Some(_) => {}
                None => break,
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initialize(reply) => {
                let gateway = self.gateway.clone();
                self.dispatch(async move {
                    let result = gateway.initialize_session().await;
                    Completion::Initialized { result, reply }
                });
            }
            Command::Send { text, reply } => {
                let _ = reply.send(self.send(&text));
            }
            Command::Finalize(reply) => self.finalize(reply),
            Command::RefreshStatus(reply) => {
                let ticket = self.store.begin_request();
                let gateway = self.gateway.clone();
                self.dispatch(async move {
                    let result = gateway.fetch_status().await;
                    Completion::Status {
                        ticket,
                        result,
                        reply,
                    }
                });
            }
            Command::PatientSummary(reply) => {
                let gateway = self.gateway.clone();
                self.dispatch(async move {
                    let result = gateway.fetch_patient_summary().await;
                    Completion::Patient { result, reply }
                });
            }
            Command::Subscribe(reply) => {
                let _ = reply.send(self.store.subscribe());
            }
            Command::Transcript(reply) => {
                let _ = reply.send(self.transcript.messages().to_vec());
            }
            // Handled by the loop.
            Command::Shutdown => {}
        }
    }

    fn send(&mut self, text: &str) -> Result<SendDispatch, ApiError> {
        if self.terminal {
            debug!("Ignoring send after the session ended");
            return Ok(SendDispatch::SessionEnded);
        }
        if self.in_flight.is_some() {
            debug!("A message is already awaiting its reply");
            return Ok(SendDispatch::Busy);
        }
        let message = Message::new(Sender::Operator, text)
            .ok_or_else(|| ApiError::Validation("El mensaje no puede estar vacío".to_string()))?;

        self.last_send_id += 1;
        let send_id = self.last_send_id;
        self.in_flight = Some(InFlightSend {
            id: send_id,
            deadline: Instant::now() + self.settings.send_safety_timeout,
        });
        self.append(message.clone());

        let generation = self.generation;
        let gateway = self.gateway.clone();
        self.dispatch(async move {
            let result = gateway.send_message(&message.text).await;
            Completion::Replied {
                send_id,
                generation,
                result,
            }
        });
        Ok(SendDispatch::Dispatched)
    }

    fn finalize(&mut self, reply: Reply<Result<FinalizationResult, ApiError>>) {
        if self.terminal {
            let _ = reply.send(Ok(FinalizationResult::already_finalized()));
            return;
        }
        // Keeps a tick from expiring the session while the request is out.
        self.timer.stop();
        self.ticker = None;
        self.dispatch_finalize(FinalizeTrigger::Manual(reply));
    }

    fn dispatch_finalize(&mut self, trigger: FinalizeTrigger) {
        self.finalizing += 1;
        let generation = self.generation;
        let gateway = self.gateway.clone();
        self.dispatch(async move {
            let result = gateway.finalize_session().await;
            Completion::Finalized {
                generation,
                trigger,
                result,
            }
        });
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Initialized { result, reply } => {
                let result = result.map(|initialized| self.start_session(initialized));
                if let Err(e) = &result {
                    self.handle_failure("initialize", e);
                }
                let _ = reply.send(result);
            }
            Completion::Status {
                ticket,
                result,
                reply,
            } => {
                let snapshot = match result {
                    Ok(snapshot) => self.apply_status(ticket, snapshot),
                    Err(e) => {
                        self.handle_failure("status", &e);
                        None
                    }
                };
                let _ = reply.send(snapshot);
            }
            Completion::Patient { result, reply } => {
                if let Err(e) = &result {
                    if e.status() != Some(404) {
                        self.handle_failure("patient summary", e);
                    }
                }
                let _ = reply.send(result);
            }
            Completion::Replied {
                send_id,
                generation,
                result,
            } => self.apply_reply(send_id, generation, result),
            Completion::Finalized {
                generation,
                trigger,
                result,
            } => self.apply_finalization(generation, trigger, result),
        }
    }

    fn start_session(&mut self, mut initialized: InitializedSession) -> InitializedSession {
        initialized.snapshot.active = true;
        initialized.snapshot.checklist = self.template.seed(&initialized.snapshot.checklist);

        let outcome = self.store.start_session(initialized.snapshot.clone());
        self.generation += 1;
        self.terminal = false;
        self.completion_notified = false;
        self.in_flight = None;
        self.transcript = Transcript::new();

        let minutes = match initialized.snapshot.remaining_minutes {
            0 => self.settings.session_minutes,
            remaining => remaining,
        };
        self.start_timer(minutes);
        info!(
            session_id = ?initialized.snapshot.session_id,
            minutes,
            "Session started"
        );
        self.forward_completed_items(outcome.completed_items());
        initialized
    }

    fn apply_status(
        &mut self,
        ticket: RequestTicket,
        mut snapshot: SessionSnapshot,
    ) -> Option<SessionSnapshot> {
        if self.terminal {
            debug!("Session already ended; not merging status");
            return snapshot.active.then_some(snapshot);
        }
        if snapshot.active {
            snapshot.checklist = self.template.seed(&snapshot.checklist);
        }

        let outcome = self.store.merge(ticket, snapshot);
        if !outcome.is_stale() {
            self.forward_completed_items(outcome.completed_items());
            self.follow_backend_clock();
        }
        self.store.current().filter(|s| s.active).cloned()
    }

    /// Aligns the local countdown with the stored remaining time.
    fn follow_backend_clock(&mut self) {
        let Some((active, remaining)) = self
            .store
            .current()
            .map(|s| (s.active, s.remaining_minutes))
        else {
            return;
        };

        if !active {
            if self.timer.is_running() {
                info!("Backend reports no active session; stopping the countdown");
                self.timer.stop();
                self.ticker = None;
            }
            return;
        }
        if self.timer.is_running() {
            let events = self.timer.sync_remaining(remaining);
            self.handle_timer_events(events);
        } else if self.timer.phase() != TimerPhase::Expired && remaining > 0 {
            info!(remaining, "Resuming countdown from backend status");
            self.start_timer(remaining);
        }
    }

    fn apply_reply(
        &mut self,
        send_id: u64,
        generation: u64,
        result: Result<DialogueTurn, ApiError>,
    ) {
        if self.in_flight.as_ref().is_some_and(|send| send.id == send_id) {
            self.in_flight = None;
        }
        if generation != self.generation || send_id != self.last_send_id || self.terminal {
            debug!(send_id, "Discarding superseded reply");
            return;
        }

        let turn = match result {
            Ok(turn) => turn,
            Err(e) => {
                self.handle_failure("send", &e);
                if !matches!(e, ApiError::Auth) {
                    self.emit(SessionEvent::SendFailed {
                        message: e.user_message(),
                    });
                }
                return;
            }
        };

        match Message::new(Sender::Counterpart, &turn.counterpart_text) {
            Some(message) => self.append(message),
            None => debug!("Reply carried no text"),
        }
        if let Some(checklist) = turn.checklist {
            let base = self.store.current().cloned().unwrap_or(SessionSnapshot {
                active: true,
                ..SessionSnapshot::inactive()
            });
            // Status reads issued meanwhile do not supersede a reply.
            let outcome = self
                .store
                .merge_unordered(base.with_checklist(checklist, turn.session_completed));
            self.forward_completed_items(outcome.completed_items());
        }
        if turn.session_completed && !self.completion_notified {
            self.completion_notified = true;
            info!("Session objectives completed");
            self.emit(SessionEvent::SessionCompleted);
        }
    }

    fn apply_finalization(
        &mut self,
        generation: u64,
        trigger: FinalizeTrigger,
        result: Result<FinalizationResult, ApiError>,
    ) {
        self.finalizing = self.finalizing.saturating_sub(1);
        match trigger {
            FinalizeTrigger::Manual(reply) => {
                match &result {
                    Ok(outcome) => {
                        info!(already_finalized = outcome.already_finalized, "Session finalized");
                        self.end_session();
                        self.store.reset();
                    }
                    Err(e) => {
                        self.handle_failure("finalize", e);
                        if !matches!(e, ApiError::Auth) && self.timer.phase() == TimerPhase::Stopped
                        {
                            self.timer.resume();
                            self.arm_ticker();
                        }
                    }
                }
                let _ = reply.send(result);
            }
            FinalizeTrigger::Expired => {
                match &result {
                    Ok(_) => info!("Expired session finalized"),
                    Err(e) => warn!(error = %e, "Could not finalize expired session"),
                }
                // A session started since then must not be wiped.
                if generation == self.generation {
                    self.store.reset();
                }
            }
        }
    }

    fn handle_timer_events(&mut self, events: Vec<TimerEvent>) {
        for event in events {
            match event {
                TimerEvent::ThresholdReached { minutes_remaining } => {
                    info!(minutes_remaining, "Session time threshold reached");
                    self.emit(SessionEvent::ThresholdReached { minutes_remaining });
                }
                TimerEvent::Expired => self.expire(),
            }
        }
        if !self.timer.is_running() {
            self.ticker = None;
        }
    }

    fn expire(&mut self) {
        if self.terminal {
            return;
        }
        warn!("Session time is up; finalizing");
        self.emit(SessionEvent::SessionExpired);
        self.end_session();
        self.dispatch_finalize(FinalizeTrigger::Expired);
    }

    fn release_unanswered_send(&mut self) {
        if let Some(send) = self.in_flight.take() {
            warn!(send_id = send.id, "No reply in time; accepting new messages");
        }
    }

    /// Logs a failed call and, when it was an authentication failure, drops
    /// all session state.
    fn handle_failure(&mut self, operation: &str, error: &ApiError) {
        if !matches!(error, ApiError::Auth) {
            warn!(operation, error = %error, "Backend request failed");
            return;
        }
        warn!(operation, "Not authenticated; clearing session state");
        self.emit(SessionEvent::AuthenticationRequired);
        self.generation += 1;
        self.timer.stop();
        self.ticker = None;
        self.in_flight = None;
        self.store.reset();
    }

    fn end_session(&mut self) {
        self.terminal = true;
        self.generation += 1;
        self.timer.stop();
        self.ticker = None;
        self.in_flight = None;
    }

    fn start_timer(&mut self, minutes: u32) {
        self.timer.start(minutes);
        self.arm_ticker();
    }

    fn arm_ticker(&mut self) {
        let period = self.settings.tick_interval;
        self.ticker = Some(interval_at(Instant::now() + period, period));
    }

    fn append(&mut self, message: Message) {
        self.transcript.push(message.clone());
        self.emit(SessionEvent::MessageAppended(message));
    }

    fn forward_completed_items(&self, ids: &[String]) {
        for id in ids {
            info!(item = %id, "Checklist item completed");
            self.emit(SessionEvent::ChecklistItemCompleted { id: id.clone() });
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.terminal {
            debug!(?event, "Session ended; dropping event");
            return;
        }
        let _ = self.events.send(event);
    }

    /// Runs a gateway call on its own task and feeds the result back.
    fn dispatch<F>(&self, call: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let completions = self.completions.clone();
        tokio::spawn(
            async move {
                let _ = completions.send(call.await);
            }
            .in_current_span(),
        );
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
