use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant};

use crate::call::ringing::{Expiry, IncomingCall, OutgoingCall, RingingController};
use crate::call::session::{CallSession, Role, SessionFailure};
use crate::config::Config;
use crate::error::CallError;
use crate::media::{
    CandidateDisposition, CaptureError, ConnectionManager, ConnectionState, LocalStream,
    MediaConstraints, MediaDevices, MediaError, PeerConnectionFactory, PeerEvent,
    PeerNotification, RemoteTrack, TrackKind,
};
use crate::presence::PresenceTracker;
use crate::signaling::{
    scopes, CallSignal, IceCandidate, SessionDescription, SignalChannel, SignalKind,
};
use crate::store::{BroadcastStore, StoreResult};

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 128;

/// Tunables of one call agent
#[derive(Debug, Clone)]
pub struct CallSettings {
    pub room: String,
    pub username: String,
    pub ring_timeout: Duration,
    pub signal_max_age: Duration,
    pub constraints: MediaConstraints,
}

impl CallSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            room: config.room_code.clone(),
            username: config.username.clone(),
            ring_timeout: config.ring_timeout(),
            signal_max_age: config.signal_max_age(),
            constraints: MediaConstraints::for_viewport(config.viewport_width),
        }
    }
}

/// Why an incoming invitation went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearReason {
    Accepted,
    Rejected,
    TimedOut,
    Cancelled,
}

/// Notifications for the UI boundary
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum CallEvent {
    IncomingCall(IncomingCall),
    IncomingCallCleared { call_id: String, reason: ClearReason },
    OutgoingCall(OutgoingCall),
    OutgoingTimedOut { call_id: String },
    CallRejected { call_id: String },
    StateChanged { state: ConnectionState, role: Role },
    RemoteTrack(RemoteTrack),
    Failed(SessionFailure),
    Ended { call_id: String, remote: bool },
}

/// Point-in-time view of the call for the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub state: ConnectionState,
    pub role: Role,
    pub call_id: Option<String>,
    pub partner: Option<String>,
    pub failure: Option<SessionFailure>,
    pub outgoing: Option<OutgoingCall>,
    pub incoming: Option<IncomingCall>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub remote_tracks: Vec<RemoteTrack>,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    StartCall(Reply<Result<String, CallError>>),
    AcceptCall(Reply<Result<(), CallError>>),
    RejectCall(Reply<Result<(), CallError>>),
    EndCall(Reply<()>),
    Toggle(TrackKind, Reply<bool>),
    Snapshot(Reply<CallSnapshot>),
}

/// Cloneable handle to a running [`CallAgent`]. The agent stops once every
/// handle is dropped.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<CallEvent>,
}

impl CallHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| CallError::AgentStopped)?;
        rx.await.map_err(|_| CallError::AgentStopped)
    }

    /// Ring the room partner. Returns the new call id.
    pub async fn start_call(&self) -> Result<String, CallError> {
        self.request(Command::StartCall).await?
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(Command::AcceptCall).await?
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(Command::RejectCall).await?
    }

    /// Hang up. Safe to call when there is no call.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(Command::EndCall).await
    }

    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::Toggle(TrackKind::Audio, reply)).await
    }

    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::Toggle(TrackKind::Video, reply)).await
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot, CallError> {
        self.request(Command::Snapshot).await
    }
}

async fn ring_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Owns every piece of call state and runs as a single task, handling one
/// command, signal, peer event or ring expiry at a time.
pub struct CallAgent {
    settings: CallSettings,
    presence: PresenceTracker,
    devices: Arc<dyn MediaDevices>,
    ringing_signals: SignalChannel,
    negotiation_signals: SignalChannel,
    ringing: RingingController,
    session: CallSession,
    connection: ConnectionManager,
    peer_events: mpsc::UnboundedReceiver<PeerNotification>,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<CallEvent>,
}

impl CallAgent {
    /// Open both signal channels and start the agent task.
    pub async fn spawn(
        store: Arc<dyn BroadcastStore>,
        presence: PresenceTracker,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn PeerConnectionFactory>,
        settings: CallSettings,
    ) -> StoreResult<CallHandle> {
        let ringing_signals = SignalChannel::open(
            store.clone(),
            scopes::CALL_SIGNALS,
            &settings.room,
            &settings.username,
            settings.signal_max_age,
        )
        .await?;
        let negotiation_signals = SignalChannel::open(
            store,
            scopes::VIDEO_CALLS,
            &settings.room,
            &settings.username,
            settings.signal_max_age,
        )
        .await?;

        let (peer_tx, peer_events) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let agent = Self {
            ringing: RingingController::new(settings.ring_timeout),
            settings,
            presence,
            devices,
            ringing_signals,
            negotiation_signals,
            session: CallSession::new(),
            connection: ConnectionManager::new(factory, peer_tx),
            peer_events,
            commands,
            events: events.clone(),
        };
        tokio::spawn(agent.run());

        Ok(CallHandle {
            commands: command_tx,
            events,
        })
    }

    async fn run(mut self) {
        tracing::info!(
            room = %self.settings.room,
            user = %self.settings.username,
            "Call agent started"
        );

        // Entries already waiting when we subscribed
        self.process_ringing_signals().await;
        self.process_negotiation_signals().await;

        let mut ringing_open = true;
        let mut negotiation_open = true;
        loop {
            let deadline = self.ringing.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                changed = self.ringing_signals.changed(), if ringing_open => match changed {
                    Ok(()) => self.process_ringing_signals().await,
                    Err(e) => {
                        tracing::error!(error = %e, "Ringing channel closed");
                        ringing_open = false;
                    }
                },
                changed = self.negotiation_signals.changed(), if negotiation_open => match changed {
                    Ok(()) => self.process_negotiation_signals().await,
                    Err(e) => {
                        tracing::error!(error = %e, "Negotiation channel closed");
                        negotiation_open = false;
                    }
                },
                Some(notification) = self.peer_events.recv() => {
                    self.handle_peer_event(notification).await;
                }
                _ = ring_deadline(deadline) => self.expire_rings().await,
            }
        }

        self.end_call().await;
        tracing::info!(user = %self.settings.username, "Call agent stopped");
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_state(&self) {
        self.emit(CallEvent::StateChanged {
            state: self.session.state(),
            role: self.session.role(),
        });
    }

    fn me(&self) -> &str {
        &self.settings.username
    }

    fn current_call(&self) -> Option<(String, String)> {
        Some((
            self.session.call_id()?.to_string(),
            self.session.partner()?.to_string(),
        ))
    }

    async fn publish_ringing(&self, signal: CallSignal) {
        let kind = signal.kind;
        if let Err(e) = self.ringing_signals.publish(signal).await {
            tracing::warn!(kind = %kind, error = %e, "Failed to publish ringing signal");
        }
    }

    async fn publish_negotiation(&self, signal: CallSignal) {
        let kind = signal.kind;
        if let Err(e) = self.negotiation_signals.publish(signal).await {
            tracing::warn!(kind = %kind, error = %e, "Failed to publish negotiation signal");
        }
    }

    // ==================== Commands ====================

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartCall(reply) => {
                let result = self.start_call().await;
                let _ = reply.send(result);
            }
            Command::AcceptCall(reply) => {
                let result = self.accept_call().await;
                let _ = reply.send(result);
            }
            Command::RejectCall(reply) => {
                let result = self.reject_call().await;
                let _ = reply.send(result);
            }
            Command::EndCall(reply) => {
                self.end_call().await;
                let _ = reply.send(());
            }
            Command::Toggle(kind, reply) => {
                let enabled = self.connection.toggle(kind);
                tracing::debug!(kind = %kind, enabled, "Local track toggled");
                let _ = reply.send(enabled);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> CallSnapshot {
        let enabled = |kind: TrackKind| {
            self.connection
                .local_tracks()
                .iter()
                .find(|t| t.kind() == kind)
                .is_some_and(|t| t.is_enabled())
        };

        CallSnapshot {
            state: self.session.state(),
            role: self.session.role(),
            call_id: self.session.call_id().map(str::to_string),
            partner: self.session.partner().map(str::to_string),
            failure: self.session.failure().cloned(),
            outgoing: self.ringing.outgoing().cloned(),
            incoming: self.ringing.incoming().cloned(),
            audio_enabled: enabled(TrackKind::Audio),
            video_enabled: enabled(TrackKind::Video),
            remote_tracks: self
                .connection
                .remote_stream()
                .map(|stream| stream.tracks.clone())
                .unwrap_or_default(),
        }
    }

    /// A failed attempt keeps its connection until the user retries or hangs
    /// up; either way it is ended first.
    async fn clear_failed_session(&mut self) {
        if self.session.state() == ConnectionState::Failed {
            tracing::debug!(call_id = ?self.session.call_id(), "Clearing failed call");
            self.end_call().await;
        }
    }

    fn is_busy(&self) -> bool {
        self.session.is_active()
            || self.ringing.outgoing().is_some()
            || self.connection.has_local_media()
    }

    async fn acquire_media(&self) -> Result<LocalStream, CaptureError> {
        if !self.devices.is_supported() {
            return Err(CaptureError::Unsupported);
        }
        if !self.devices.is_secure_context() {
            return Err(CaptureError::InsecureContext);
        }
        self.devices.acquire(&self.settings.constraints).await
    }

    /// Record a capture failure on a session that never reached `connecting`.
    fn capture_failed(&mut self, err: &CaptureError) {
        tracing::warn!(code = err.code(), error = %err, "Local media capture failed");
        if self.session.fail(SessionFailure::capture(err)).is_ok() {
            if let Some(failure) = self.session.failure().cloned() {
                self.emit(CallEvent::Failed(failure));
            }
            self.emit_state();
        }
    }

    async fn start_call(&mut self) -> Result<String, CallError> {
        self.clear_failed_session().await;
        if self.is_busy() {
            return Err(CallError::Busy);
        }
        let partner = self.presence.partner().ok_or(CallError::NoPartner)?;

        self.session.reset();
        let stream = match self.acquire_media().await {
            Ok(stream) => stream,
            Err(e) => {
                self.capture_failed(&e);
                return Err(e.into());
            }
        };
        if let Err(e) = self.connection.open(stream).await {
            self.session.fail(SessionFailure::media(e.to_string()))?;
            self.emit_state();
            return Err(e.into());
        }

        let outgoing = self.ringing.initiate(&partner);
        self.session
            .connecting(&outgoing.call_id, &partner, Role::Undetermined)?;

        let request = CallSignal::call_request(self.me(), &partner, &outgoing.call_id);
        if let Err(e) = self.ringing_signals.publish(request).await {
            self.ringing.cancel_outgoing();
            self.connection.teardown().await;
            self.session.close();
            self.emit_state();
            return Err(e.into());
        }

        tracing::info!(call_id = %outgoing.call_id, partner = %partner, "Calling partner");
        let call_id = outgoing.call_id.clone();
        self.emit(CallEvent::OutgoingCall(outgoing));
        self.emit_state();
        Ok(call_id)
    }

    async fn accept_call(&mut self) -> Result<(), CallError> {
        self.clear_failed_session().await;
        if self.ringing.incoming().is_none() {
            return Err(CallError::NoIncomingCall);
        }
        if self.is_busy() {
            return Err(CallError::Busy);
        }
        let incoming = self.ringing.accept().ok_or(CallError::NoIncomingCall)?;

        self.session.reset();
        let stream = match self.acquire_media().await {
            Ok(stream) => stream,
            Err(e) => {
                // Without media the call cannot proceed
                self.decline_invitation(&incoming).await;
                self.capture_failed(&e);
                return Err(e.into());
            }
        };
        if let Err(e) = self.connection.open(stream).await {
            self.decline_invitation(&incoming).await;
            if self.session.fail(SessionFailure::media(e.to_string())).is_ok() {
                if let Some(failure) = self.session.failure().cloned() {
                    self.emit(CallEvent::Failed(failure));
                }
                self.emit_state();
            }
            return Err(e.into());
        }
        self.session
            .connecting(&incoming.call_id, &incoming.caller, Role::Responder)?;

        let accepted = CallSignal::call_accepted(self.me(), &incoming.caller, &incoming.call_id);
        if let Err(e) = self.ringing_signals.publish(accepted).await {
            tracing::warn!(call_id = %incoming.call_id, error = %e, "Failed to accept call");
            self.connection.teardown().await;
            self.session.close();
            self.decline_invitation(&incoming).await;
            self.emit_state();
            return Err(e.into());
        }

        tracing::info!(call_id = %incoming.call_id, caller = %incoming.caller, "Call accepted");
        self.emit(CallEvent::IncomingCallCleared {
            call_id: incoming.call_id,
            reason: ClearReason::Accepted,
        });
        self.emit_state();
        Ok(())
    }

    /// Tell the caller their invitation is declined and clear it for the UI.
    async fn decline_invitation(&mut self, incoming: &IncomingCall) {
        self.publish_ringing(CallSignal::call_rejected(
            self.me(),
            &incoming.caller,
            &incoming.call_id,
        ))
        .await;
        self.emit(CallEvent::IncomingCallCleared {
            call_id: incoming.call_id.clone(),
            reason: ClearReason::Rejected,
        });
    }

    async fn reject_call(&mut self) -> Result<(), CallError> {
        let incoming = self.ringing.reject().ok_or(CallError::NoIncomingCall)?;
        self.ringing_signals
            .publish(CallSignal::call_rejected(
                self.me(),
                &incoming.caller,
                &incoming.call_id,
            ))
            .await?;

        tracing::info!(call_id = %incoming.call_id, caller = %incoming.caller, "Call rejected");
        self.emit(CallEvent::IncomingCallCleared {
            call_id: incoming.call_id,
            reason: ClearReason::Rejected,
        });
        Ok(())
    }

    /// Release everything and tell the partner, once.
    async fn end_call(&mut self) {
        self.ringing.cancel_outgoing();
        let call = self.current_call();
        let released = self.connection.teardown().await;
        let changed = self.session.close();

        if let Some((call_id, partner)) = call {
            self.publish_ringing(CallSignal::call_ended(self.me(), &partner, &call_id))
                .await;
            tracing::info!(call_id = %call_id, released, "Call ended");
            self.emit(CallEvent::Ended {
                call_id,
                remote: false,
            });
        }
        if changed {
            self.emit_state();
        }
    }

    // ==================== Ringing signals ====================

    async fn process_ringing_signals(&mut self) {
        for delivery in self.ringing_signals.take_pending().await {
            self.ringing_signals.acknowledge(&delivery.id).await;
            self.handle_ringing_signal(delivery.signal).await;
        }
    }

    async fn handle_ringing_signal(&mut self, signal: CallSignal) {
        match signal.kind {
            SignalKind::CallRequest => self.on_call_request(signal).await,
            SignalKind::CallAccepted => self.on_call_accepted(signal).await,
            SignalKind::CallRejected => self.on_call_rejected(signal).await,
            SignalKind::CallEnded => self.on_call_ended(signal).await,
            other => {
                tracing::debug!(kind = %other, "Ignoring negotiation signal on ringing channel");
            }
        }
    }

    async fn on_call_request(&mut self, signal: CallSignal) {
        let Some(call_id) = signal.call_id else {
            tracing::debug!(caller = %signal.sender, "Ignoring call request without call id");
            return;
        };

        self.clear_failed_session().await;
        if self.is_busy() {
            tracing::info!(call_id = %call_id, caller = %signal.sender, "Declining call while busy");
            self.publish_ringing(CallSignal::call_rejected(self.me(), &signal.sender, &call_id))
                .await;
            return;
        }

        let Some(invitation) = self
            .ringing
            .on_request(&signal.sender, &call_id, signal.timestamp)
        else {
            return;
        };
        if let Some(previous) = invitation.displaced {
            tracing::info!(call_id = %previous.call_id, caller = %previous.caller, "Declining call replaced by a newer one");
            self.decline_invitation(&previous).await;
        }
        tracing::info!(call_id = %call_id, caller = %signal.sender, "Incoming call");
        self.emit(CallEvent::IncomingCall(invitation.call));
    }

    async fn on_call_accepted(&mut self, signal: CallSignal) {
        let Some(outgoing) = self.ringing.on_accepted(signal.call_id.as_deref()) else {
            tracing::debug!(call_id = ?signal.call_id, "Ignoring stale call acceptance");
            return;
        };
        if !self.session.assume_initiator() {
            tracing::debug!(call_id = %outgoing.call_id, "Acceptance for a call no longer active");
            return;
        }
        tracing::info!(call_id = %outgoing.call_id, "Call accepted by partner, sending offer");

        if let Err(e) = self.session.ensure_can_offer() {
            tracing::debug!(error = %e, "Not offering");
            return;
        }
        match self.connection.create_offer().await {
            Ok(offer) => {
                self.publish_negotiation(CallSignal::offer(
                    self.me(),
                    &outgoing.target,
                    &outgoing.call_id,
                    offer,
                ))
                .await;
            }
            Err(e) => self.negotiation_step_failed("offer", e),
        }
    }

    async fn on_call_rejected(&mut self, signal: CallSignal) {
        let Some(outgoing) = self.ringing.on_rejected(signal.call_id.as_deref()) else {
            tracing::debug!(call_id = ?signal.call_id, "Ignoring stale call rejection");
            return;
        };

        tracing::info!(call_id = %outgoing.call_id, "Call declined by partner");
        self.connection.teardown().await;
        self.session.close();
        self.emit(CallEvent::CallRejected {
            call_id: outgoing.call_id,
        });
        self.emit_state();
    }

    async fn on_call_ended(&mut self, signal: CallSignal) {
        if signal.matches_call(self.session.call_id()) {
            let call_id = self.session.call_id().unwrap_or_default().to_string();
            tracing::info!(call_id = %call_id, "Partner ended the call");
            self.ringing.cancel_outgoing();
            self.connection.teardown().await;
            self.session.close();
            self.emit(CallEvent::Ended {
                call_id,
                remote: true,
            });
            self.emit_state();
        } else if let Some(incoming) = self.ringing.on_ended(signal.call_id.as_deref()) {
            tracing::info!(call_id = %incoming.call_id, "Caller hung up before answer");
            self.emit(CallEvent::IncomingCallCleared {
                call_id: incoming.call_id,
                reason: ClearReason::Cancelled,
            });
        } else {
            tracing::debug!(call_id = ?signal.call_id, "Ignoring end of unknown call");
        }
    }

    // ==================== Negotiation signals ====================

    async fn process_negotiation_signals(&mut self) {
        for delivery in self.negotiation_signals.take_pending().await {
            self.negotiation_signals.acknowledge(&delivery.id).await;
            self.handle_negotiation_signal(delivery.signal).await;
        }
    }

    async fn handle_negotiation_signal(&mut self, signal: CallSignal) {
        if !signal.matches_call(self.session.call_id())
            || self.session.partner() != Some(signal.sender.as_str())
        {
            tracing::debug!(
                kind = %signal.kind,
                call_id = ?signal.call_id,
                sender = %signal.sender,
                "Ignoring signal for another call"
            );
            return;
        }

        match signal.kind {
            SignalKind::Offer => match signal.offer {
                Some(offer) => self.on_offer(offer).await,
                None => tracing::debug!("Offer signal without description"),
            },
            SignalKind::Answer => match signal.answer {
                Some(answer) => self.on_answer(answer).await,
                None => tracing::debug!("Answer signal without description"),
            },
            SignalKind::IceCandidate => match signal.candidate {
                Some(candidate) => self.on_remote_candidate(candidate).await,
                None => tracing::debug!("Candidate signal without candidate"),
            },
            other => {
                tracing::debug!(kind = %other, "Ignoring ringing signal on negotiation channel");
            }
        }
    }

    async fn on_offer(&mut self, offer: SessionDescription) {
        if let Err(e) = self.session.ensure_can_answer() {
            tracing::debug!(error = %e, "Ignoring offer");
            return;
        }
        match self.connection.accept_offer(offer).await {
            Ok(answer) => {
                let Some((call_id, partner)) = self.current_call() else {
                    return;
                };
                self.publish_negotiation(CallSignal::answer(self.me(), &partner, &call_id, answer))
                    .await;
            }
            Err(e) => self.negotiation_step_failed("answer", e),
        }
    }

    async fn on_answer(&mut self, answer: SessionDescription) {
        if let Err(e) = self.session.ensure_can_offer() {
            tracing::debug!(error = %e, "Ignoring answer");
            return;
        }
        if let Err(e) = self.connection.accept_answer(answer).await {
            self.negotiation_step_failed("remote answer", e);
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        match self.connection.add_remote_candidate(candidate).await {
            Ok(CandidateDisposition::Applied) => tracing::trace!("Remote candidate applied"),
            Ok(CandidateDisposition::Buffered) => {
                tracing::trace!("Remote candidate buffered until remote description")
            }
            Err(e) => tracing::debug!(error = %e, "Failed to apply remote candidate"),
        }
    }

    /// Out-of-order steps are dropped; real failures fail the session.
    fn negotiation_step_failed(&mut self, step: &'static str, err: MediaError) {
        if let MediaError::InvalidNegotiationState(reason) = err {
            tracing::debug!(step, reason = %reason, "Skipping negotiation step");
            return;
        }

        tracing::warn!(step, call_id = ?self.session.call_id(), error = %err, "Negotiation step failed");
        if self.session.fail(SessionFailure::media(err.to_string())).is_ok() {
            if let Some(failure) = self.session.failure().cloned() {
                self.emit(CallEvent::Failed(failure));
            }
            self.emit_state();
        }
    }

    // ==================== Peer events and timers ====================

    async fn handle_peer_event(&mut self, notification: PeerNotification) {
        if !self.connection.is_current(notification.generation) {
            tracing::trace!(generation = notification.generation, "Dropping event from closed connection");
            return;
        }

        match notification.event {
            PeerEvent::IceCandidate(candidate) => {
                let Some((call_id, partner)) = self.current_call() else {
                    return;
                };
                self.publish_negotiation(CallSignal::ice_candidate(
                    self.me(),
                    &partner,
                    &call_id,
                    candidate,
                ))
                .await;
            }
            PeerEvent::Track(track) => {
                self.connection.on_remote_track(track.clone());
                self.emit(CallEvent::RemoteTrack(track));
            }
            PeerEvent::StateChange(state) => {
                if !self.session.mirror(state) {
                    return;
                }
                tracing::info!(call_id = ?self.session.call_id(), state = ?state, "Connection state changed");
                self.emit_state();
                if state == ConnectionState::Failed {
                    if let Some(failure) = self.session.failure().cloned() {
                        self.emit(CallEvent::Failed(failure));
                    }
                }
            }
        }
    }

    async fn expire_rings(&mut self) {
        for expiry in self.ringing.expire(Instant::now()) {
            match expiry {
                Expiry::Outgoing(call) => {
                    tracing::info!(call_id = %call.call_id, "No answer, call timed out");
                    if self.session.call_id() == Some(call.call_id.as_str()) {
                        self.connection.teardown().await;
                        self.session.close();
                        self.emit_state();
                    }
                    self.emit(CallEvent::OutgoingTimedOut {
                        call_id: call.call_id,
                    });
                }
                Expiry::Incoming(call) => {
                    tracing::info!(call_id = %call.call_id, caller = %call.caller, "Incoming call not answered, declining");
                    self.publish_ringing(CallSignal::call_rejected(
                        self.me(),
                        &call.caller,
                        &call.call_id,
                    ))
                    .await;
                    self.emit(CallEvent::IncomingCallCleared {
                        call_id: call.call_id,
                        reason: ClearReason::TimedOut,
                    });
                }
            }
        }
    }
}
