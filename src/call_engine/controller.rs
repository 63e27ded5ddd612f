//! Call Session Controller
//!
//! Zustandsmaschine auf Anruf-Ebene. Der Controller besitzt höchstens eine
//! Session und verarbeitet `ControllerEvent`s strikt nacheinander. Kein
//! Handler wartet: alles, was Zeit braucht, läuft im Worker des
//! `NegotiationContext` und kommt als Event zurück.

use super::notify::{CallNotification, ErrorKind, NotificationSink};
use super::session::{CallRole, CallSession, CallSnapshot, CallState, EndReason, SessionId};
use crate::config::CallConfig;
use crate::media::{MediaKind, MediaSource, MediaTrackManager, TrackPlan, TrackRole};
use crate::negotiation::{
    CandidateDisposition, ConnectionState, DescriptionKind, NegotiationContext, NegotiationError,
    NegotiationEvent, NegotiationOutcome, NegotiationSink, PeerTransportFactory, RemoteApply,
    SessionDescription, TransportEvent,
};
use crate::signaling::{ParticipantId, SignalingEnvelope, SignalingTransport, BUSY_REASON};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Already in a call with {0}")]
    Busy(ParticipantId),

    #[error("No active call")]
    NoActiveCall,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Stale generation {received} (current {current})")]
    StaleGeneration { received: u64, current: u64 },

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Connection to relay lost")]
    TransportLost,

    #[error("Source of kind {kind:?} cannot be used for track {role}")]
    TrackKindMismatch { role: TrackRole, kind: MediaKind },

    #[error("No source for track {0}")]
    NoSuchTrack(TrackRole),

    #[error("Call runtime stopped")]
    RuntimeClosed,
}

impl CallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CallError::Busy(_) => ErrorKind::BusyError,
            CallError::Protocol(_) => ErrorKind::ProtocolError,
            CallError::StaleGeneration { .. } => ErrorKind::StaleGenerationError,
            CallError::Negotiation(_) => ErrorKind::NegotiationFailure,
            CallError::TransportLost => ErrorKind::TransportLost,
            CallError::NoActiveCall
            | CallError::InvalidState(_)
            | CallError::TrackKindMismatch { .. }
            | CallError::NoSuchTrack(_)
            | CallError::RuntimeClosed => ErrorKind::InvalidRequest,
        }
    }
}

impl From<NegotiationError> for CallError {
    fn from(error: NegotiationError) -> Self {
        match error {
            NegotiationError::StaleGeneration { received, current } => {
                CallError::StaleGeneration { received, current }
            }
            NegotiationError::OutOfSequence(message) => CallError::Protocol(message),
            NegotiationError::Closed => {
                CallError::Negotiation("negotiation context closed".to_string())
            }
        }
    }
}

// ============================================================================
// EVENTS
// ============================================================================

pub type Reply<T> = oneshot::Sender<Result<T, CallError>>;

/// Befehle aus der UI
#[derive(Debug)]
pub enum CallCommand {
    PlaceCall {
        remote: ParticipantId,
        reply: Reply<SessionId>,
    },
    Accept {
        reply: Reply<()>,
    },
    Reject {
        reply: Reply<()>,
    },
    Hangup {
        reply: Reply<()>,
    },
    SetTrack {
        role: TrackRole,
        source: MediaSource,
        reply: Reply<TrackPlan>,
    },
    StopTrack {
        role: TrackRole,
        reply: Reply<()>,
    },
    SetDefaultSource {
        role: TrackRole,
        source: MediaSource,
        reply: Reply<()>,
    },
    SetTrackEnabled {
        role: TrackRole,
        enabled: bool,
        reply: Reply<()>,
    },
    SendChat {
        text: String,
        reply: Reply<()>,
    },
}

/// Alles, was der Controller verarbeitet, in Ankunftsreihenfolge
#[derive(Debug)]
pub enum ControllerEvent {
    Command(CallCommand),
    /// Envelope vom Relay
    Inbound(SignalingEnvelope),
    RelayConnectivity {
        connected: bool,
    },
    Presence {
        participant: ParticipantId,
        online: bool,
    },
    /// Ergebnis oder Transport-Event aus dem Negotiation Worker
    Negotiation {
        session: SessionId,
        event: NegotiationEvent,
    },
    RingTimeout {
        session: SessionId,
    },
    RelayGraceExpired {
        epoch: u64,
    },
    Shutdown,
}

// ============================================================================
// CALL CONTROLLER
// ============================================================================

pub struct CallController {
    local_id: ParticipantId,
    config: CallConfig,
    session: Option<CallSession>,
    signaling: Arc<dyn SignalingTransport>,
    factory: Arc<dyn PeerTransportFactory>,
    tracks: MediaTrackManager,
    notifier: NotificationSink,
    /// Rückkanal in die eigene Event-Queue (Worker, Timer)
    events: mpsc::UnboundedSender<ControllerEvent>,
    relay_connected: bool,
    /// Wird bei jeder Änderung der Relay-Verbindung erhöht
    disconnect_epoch: u64,
}

impl CallController {
    pub fn new(
        local_id: ParticipantId,
        config: CallConfig,
        signaling: Arc<dyn SignalingTransport>,
        factory: Arc<dyn PeerTransportFactory>,
        notifier: NotificationSink,
        events: mpsc::UnboundedSender<ControllerEvent>,
    ) -> Self {
        Self {
            local_id,
            config,
            session: None,
            signaling,
            factory,
            tracks: MediaTrackManager::new(),
            notifier,
            events,
            relay_connected: true,
            disconnect_epoch: 0,
        }
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn state(&self) -> CallState {
        self.session
            .as_ref()
            .map(|session| session.state)
            .unwrap_or(CallState::Idle)
    }

    pub fn snapshot(&self) -> Option<CallSnapshot> {
        self.session.as_ref().map(CallSession::snapshot)
    }

    pub fn tracks(&self) -> &MediaTrackManager {
        &self.tracks
    }

    /// Verarbeitet ein einzelnes Event vollständig
    pub fn handle(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Command(command) => self.execute(command),
            ControllerEvent::Inbound(envelope) => self.on_envelope(envelope),
            ControllerEvent::RelayConnectivity { connected } => {
                self.on_relay_connectivity(connected)
            }
            ControllerEvent::Presence {
                participant,
                online,
            } => self.on_presence(participant, online),
            ControllerEvent::Negotiation { session, event } => self.on_negotiation(session, event),
            ControllerEvent::RingTimeout { session } => self.on_ring_timeout(session),
            ControllerEvent::RelayGraceExpired { epoch } => self.on_relay_grace_expired(epoch),
            ControllerEvent::Shutdown => self.shutdown(),
        }
    }

    fn execute(&mut self, command: CallCommand) {
        // Antwortet niemand mehr, ist das Ergebnis egal
        match command {
            CallCommand::PlaceCall { remote, reply } => {
                let _ = reply.send(self.place_call(remote));
            }
            CallCommand::Accept { reply } => {
                let _ = reply.send(self.accept());
            }
            CallCommand::Reject { reply } => {
                let _ = reply.send(self.reject());
            }
            CallCommand::Hangup { reply } => {
                let _ = reply.send(self.hangup());
            }
            CallCommand::SetTrack {
                role,
                source,
                reply,
            } => {
                let _ = reply.send(self.set_track(role, source));
            }
            CallCommand::StopTrack { role, reply } => {
                let _ = reply.send(self.stop_track(role));
            }
            CallCommand::SetDefaultSource {
                role,
                source,
                reply,
            } => {
                let _ = reply.send(self.set_default_source(role, source));
            }
            CallCommand::SetTrackEnabled {
                role,
                enabled,
                reply,
            } => {
                let _ = reply.send(self.set_track_enabled(role, enabled));
            }
            CallCommand::SendChat { text, reply } => {
                let _ = reply.send(self.send_chat(text));
            }
        }
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    /// Startet einen ausgehenden Anruf
    pub fn place_call(&mut self, remote: ParticipantId) -> Result<SessionId, CallError> {
        let result = self.try_place_call(remote);
        self.reported(result)
    }

    /// Nimmt den eingehenden Anruf an
    pub fn accept(&mut self) -> Result<(), CallError> {
        let result = self.try_accept();
        self.reported(result)
    }

    /// Lehnt den eingehenden Anruf ab
    pub fn reject(&mut self) -> Result<(), CallError> {
        let result = self.try_reject();
        self.reported(result)
    }

    /// Beendet den Anruf in jedem Zustand
    pub fn hangup(&mut self) -> Result<(), CallError> {
        if self.session.is_none() {
            return self.reported(Err(CallError::NoActiveCall));
        }
        self.terminate(EndReason::LocalHangup, true);
        Ok(())
    }

    /// Setzt die Quelle eines Tracks
    pub fn set_track(
        &mut self,
        role: TrackRole,
        source: MediaSource,
    ) -> Result<TrackPlan, CallError> {
        let result = self.try_set_track(role, source);
        self.reported(result)
    }

    /// Stoppt die Quelle eines Tracks und stellt ggf. die Standardquelle wieder her
    pub fn stop_track(&mut self, role: TrackRole) -> Result<(), CallError> {
        let result = self.try_stop_track(role);
        self.reported(result)
    }

    /// Setzt die Standardquelle, die nach `stop_track` zurückkehrt
    pub fn set_default_source(
        &mut self,
        role: TrackRole,
        source: MediaSource,
    ) -> Result<(), CallError> {
        let result = self.try_set_default_source(role, source);
        self.reported(result)
    }

    /// Schaltet einen Track stumm bzw. frei; keine neue Verhandlungsrunde
    pub fn set_track_enabled(&mut self, role: TrackRole, enabled: bool) -> Result<(), CallError> {
        let result = match self.tracks.set_enabled(role, enabled) {
            Some(source) => {
                tracing::info!("Track {} ({}) enabled: {}", role, source.id(), enabled);
                Ok(())
            }
            None => Err(CallError::NoSuchTrack(role)),
        };
        self.reported(result)
    }

    /// Schickt eine Chat-Nachricht an den Gesprächspartner
    pub fn send_chat(&mut self, text: String) -> Result<(), CallError> {
        let result = self.try_send_chat(text);
        self.reported(result)
    }

    fn try_place_call(&mut self, remote: ParticipantId) -> Result<SessionId, CallError> {
        if let Some(session) = &self.session {
            return Err(CallError::Busy(session.remote.clone()));
        }
        if remote == self.local_id {
            return Err(CallError::InvalidState("cannot call yourself".to_string()));
        }
        if !self.relay_connected {
            return Err(CallError::TransportLost);
        }

        tracing::info!("Calling {}", remote);

        let mut session = self.open_session(remote, CallRole::Caller, CallState::Dialing, 1);
        if let Err(e) = prepare_offer(&mut self.tracks, &mut session.negotiation) {
            self.tracks.release_session();
            return Err(e.into());
        }

        let id = session.id;
        self.install_session(session);
        Ok(id)
    }

    fn try_accept(&mut self) -> Result<(), CallError> {
        let session = self.session.as_mut().ok_or(CallError::NoActiveCall)?;
        if session.state != CallState::Ringing {
            return Err(CallError::InvalidState(format!(
                "cannot accept in state {:?}",
                session.state
            )));
        }

        session.negotiation.create_answer()?;
        tracing::info!("Accepted call from {}", session.remote);
        self.set_state(CallState::Connecting);
        Ok(())
    }

    fn try_reject(&mut self) -> Result<(), CallError> {
        let session = self.session.as_ref().ok_or(CallError::NoActiveCall)?;
        if session.state != CallState::Ringing {
            return Err(CallError::InvalidState(format!(
                "cannot reject in state {:?}",
                session.state
            )));
        }

        let remote = session.remote.clone();
        self.send(SignalingEnvelope::CallRejected {
            from: self.local_id.clone(),
            to: remote,
        });
        self.terminate(EndReason::RejectedLocally, false);
        Ok(())
    }

    fn try_set_track(
        &mut self,
        role: TrackRole,
        source: MediaSource,
    ) -> Result<TrackPlan, CallError> {
        if source.kind() != role.kind() {
            return Err(CallError::TrackKindMismatch {
                role,
                kind: source.kind(),
            });
        }

        let in_place = self
            .session
            .as_ref()
            .map(|session| session.negotiation.in_place_supported());
        let plan = self.tracks.install(
            role,
            source.clone(),
            in_place.is_some(),
            in_place.unwrap_or(false),
        );
        tracing::info!("Track {} now uses source {} ({:?})", role, source.id(), plan);

        let Some(session) = self.session.as_mut() else {
            return Ok(plan);
        };

        match plan {
            TrackPlan::Stored => {}
            TrackPlan::ReplaceInPlace => session.negotiation.replace_track(role, Some(source))?,
            TrackPlan::Renegotiate { detach_first } => {
                if detach_first {
                    session.negotiation.detach_track(role)?;
                }
                session.negotiation.attach_track(role, source)?;
                self.tracks.mark_attached(role);
                self.request_renegotiation();
            }
        }
        Ok(plan)
    }

    fn try_stop_track(&mut self, role: TrackRole) -> Result<(), CallError> {
        let removed = self.tracks.remove(role).ok_or(CallError::NoSuchTrack(role))?;
        tracing::info!("Stopped {} source {}", role, removed.id());

        if let Some(default) = self.tracks.default_for(role).cloned() {
            if default != removed {
                self.try_set_track(role, default)?;
                return Ok(());
            }
        }

        let attached = self.tracks.is_attached(role);
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if !attached {
            return Ok(());
        }

        if session.negotiation.in_place_supported() {
            session.negotiation.replace_track(role, None)?;
        } else {
            session.negotiation.detach_track(role)?;
            self.tracks.mark_detached(role);
            self.request_renegotiation();
        }
        Ok(())
    }

    fn try_send_chat(&mut self, text: String) -> Result<(), CallError> {
        let session = self.session.as_ref().ok_or(CallError::NoActiveCall)?;
        if !matches!(session.state, CallState::Connecting | CallState::Active) {
            return Err(CallError::InvalidState(format!(
                "cannot chat in state {:?}",
                session.state
            )));
        }

        let text = text.trim();
        if text.is_empty() {
            return Err(CallError::InvalidState("empty chat message".to_string()));
        }

        let envelope = SignalingEnvelope::ChatMessage {
            from: self.local_id.clone(),
            to: session.remote.clone(),
            text: text.to_string(),
            sent_at: Utc::now(),
        };
        self.send(envelope);
        Ok(())
    }

    fn try_set_default_source(
        &mut self,
        role: TrackRole,
        source: MediaSource,
    ) -> Result<(), CallError> {
        if source.kind() != role.kind() {
            return Err(CallError::TrackKindMismatch {
                role,
                kind: source.kind(),
            });
        }

        self.tracks.set_default(role, source.clone());
        if self.tracks.source(role).is_none() {
            self.try_set_track(role, source)?;
        }
        Ok(())
    }

    // ========================================================================
    // INBOUND SIGNALING
    // ========================================================================

    fn on_envelope(&mut self, envelope: SignalingEnvelope) {
        if envelope.to() != &self.local_id {
            tracing::warn!("Dropping {} addressed to {}", envelope.kind(), envelope.to());
            return;
        }

        tracing::debug!(
            "Received {} from {} (generation {:?})",
            envelope.kind(),
            envelope.from(),
            envelope.generation()
        );

        match envelope {
            SignalingEnvelope::Offer {
                from,
                generation,
                sdp,
                ..
            } => self.on_offer(from, generation, sdp),
            SignalingEnvelope::Answer {
                from,
                generation,
                sdp,
                ..
            } => self.on_answer(from, generation, sdp),
            SignalingEnvelope::Candidate {
                from,
                generation,
                candidate,
                ..
            } => self.on_candidate(from, generation, candidate),
            SignalingEnvelope::CallRejected { from, .. } => {
                self.on_remote_termination(&from, EndReason::RemoteRejected)
            }
            SignalingEnvelope::CallEnded { from, .. } => {
                self.on_remote_termination(&from, EndReason::RemoteHangup)
            }
            SignalingEnvelope::CallError { from, reason, .. } => {
                let reason = if reason == BUSY_REASON {
                    EndReason::RemoteBusy
                } else {
                    EndReason::RemoteError(reason)
                };
                self.on_remote_termination(&from, reason)
            }
            SignalingEnvelope::ChatMessage {
                from, text, sent_at, ..
            } => self.on_chat(from, text, sent_at),
        }
    }

    fn on_offer(&mut self, from: ParticipantId, generation: u64, sdp: String) {
        let Some(session) = self.session.as_ref() else {
            self.on_incoming_offer(from, generation, sdp);
            return;
        };

        if session.remote != from {
            tracing::info!("Rejecting call from {}: busy with {}", from, session.remote);
            self.send(SignalingEnvelope::CallError {
                from: self.local_id.clone(),
                to: from,
                reason: BUSY_REASON.to_string(),
            });
            return;
        }

        self.on_renegotiation_offer(generation, sdp);
    }

    fn on_incoming_offer(&mut self, from: ParticipantId, generation: u64, sdp: String) {
        // Jeder Anruf beginnt mit Generation 1
        if generation != 1 || from == self.local_id {
            self.protocol_error(format!("invalid offer from {} (generation {})", from, generation));
            return;
        }

        tracing::info!("Incoming call from {} (generation {})", from, generation);

        let mut session =
            self.open_session(from.clone(), CallRole::Callee, CallState::Ringing, generation);
        let offer = SessionDescription::offer(sdp);
        let ctx = &mut session.negotiation;
        if let Err(e) = prepare_incoming(&mut self.tracks, ctx, generation, offer) {
            self.tracks.release_session();
            let error = CallError::from(e);
            self.report(&error);
            self.send(SignalingEnvelope::CallError {
                from: self.local_id.clone(),
                to: from,
                reason: error.to_string(),
            });
            return;
        }

        self.install_session(session);
        self.notifier.emit(CallNotification::IncomingCall { remote: from });
    }

    /// Offer des aktuellen Peers: Duplikat, überholt, Kollision oder neue Runde
    fn on_renegotiation_offer(&mut self, generation: u64, sdp: String) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let state = session.state;
        let role = session.role;
        let ctx = &mut session.negotiation;
        let current = ctx.generation();

        if generation < current {
            tracing::warn!(
                "Discarding stale offer (generation {}, current {})",
                generation,
                current
            );
            return;
        }
        if generation > current && current.checked_add(1) != Some(generation) {
            self.protocol_error(format!(
                "offer for generation {} skips ahead of {}",
                generation, current
            ));
            return;
        }
        if ctx.offer_outstanding() {
            if generation == current {
                self.on_offer_collision(role, generation, sdp);
            } else {
                self.protocol_error(format!(
                    "offer for generation {} while own offer {} is unanswered",
                    generation, current
                ));
            }
            return;
        }

        if generation == current {
            match ctx.apply_remote_description(generation, SessionDescription::offer(sdp)) {
                Ok(RemoteApply::Duplicate) => {
                    tracing::debug!("Ignoring duplicate offer for generation {}", generation);
                }
                Ok(RemoteApply::Submitted) => {
                    if matches!(state, CallState::Connecting | CallState::Active) {
                        if let Err(e) = ctx.create_answer() {
                            self.report(&e.into());
                        }
                    }
                }
                Err(e) => self.report(&e.into()),
            }
            return;
        }

        if !matches!(state, CallState::Connecting | CallState::Active) {
            self.protocol_error(format!(
                "offer for generation {} in state {:?}",
                generation, state
            ));
            return;
        }

        match answer_renegotiation(ctx, generation, SessionDescription::offer(sdp)) {
            Ok(()) => tracing::info!("Answering renegotiation (generation {})", generation),
            Err(e) => self.fail_negotiation(e.to_string()),
        }
    }

    /// Beide Seiten haben gleichzeitig eine Runde mit derselben Generation
    /// begonnen. Das Offer des Anrufers gewinnt; der Angerufene verwirft
    /// sein eigenes, beantwortet das fremde und bietet danach neu an.
    fn on_offer_collision(&mut self, role: CallRole, generation: u64, sdp: String) {
        if role == CallRole::Caller {
            tracing::info!("Offer collision at generation {}, keeping own offer", generation);
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };

        tracing::info!("Offer collision at generation {}, answering remote offer", generation);
        session.local_sent = None;
        let offer = SessionDescription::offer(sdp);
        if let Err(e) = yield_to_remote_offer(&mut session.negotiation, generation, offer) {
            self.fail_negotiation(e.to_string());
        }
    }

    fn on_answer(&mut self, from: ParticipantId, generation: u64, sdp: String) {
        let Some(session) = self.session.as_mut() else {
            tracing::debug!("Ignoring answer from {}: no active call", from);
            return;
        };
        if session.remote != from {
            tracing::warn!("Ignoring answer from {}: call is with {}", from, session.remote);
            return;
        }

        let dialing = session.state == CallState::Dialing;
        let ctx = &mut session.negotiation;
        let current = ctx.generation();

        if generation < current {
            tracing::warn!(
                "Discarding stale answer (generation {}, current {})",
                generation,
                current
            );
            return;
        }
        if generation > current {
            self.protocol_error(format!(
                "answer for generation {} (current {})",
                generation, current
            ));
            return;
        }
        if ctx.local_kind() != Some(DescriptionKind::Offer) {
            self.protocol_error(format!("answer without offer for generation {}", generation));
            return;
        }

        match ctx.apply_remote_description(generation, SessionDescription::answer(sdp)) {
            Ok(RemoteApply::Duplicate) => {
                tracing::debug!("Ignoring duplicate answer for generation {}", generation);
            }
            Ok(RemoteApply::Submitted) => {
                if dialing {
                    self.set_state(CallState::Connecting);
                }
            }
            Err(e) => self.report(&e.into()),
        }
    }

    fn on_candidate(&mut self, from: ParticipantId, generation: u64, candidate: String) {
        let Some(session) = self.session.as_mut() else {
            tracing::debug!("Ignoring candidate from {}: no active call", from);
            return;
        };
        if session.remote != from {
            tracing::warn!("Ignoring candidate from {}: call is with {}", from, session.remote);
            return;
        }

        match session.negotiation.add_remote_candidate(generation, candidate) {
            Ok(CandidateDisposition::Applied) => {
                tracing::trace!("Applied candidate for generation {}", generation);
            }
            Ok(CandidateDisposition::Buffered) => {
                tracing::debug!("Buffered candidate for generation {}", generation);
            }
            Err(NegotiationError::StaleGeneration { received, current }) => {
                tracing::debug!(
                    "Discarding candidate of generation {} (current {})",
                    received,
                    current
                );
            }
            Err(e) => self.report(&e.into()),
        }
    }

    fn on_chat(&mut self, from: ParticipantId, text: String, sent_at: DateTime<Utc>) {
        let in_call = self.session.as_ref().is_some_and(|session| {
            session.remote == from
                && matches!(session.state, CallState::Connecting | CallState::Active)
        });
        if !in_call {
            tracing::debug!("Ignoring chat message from {}: no matching call", from);
            return;
        }

        self.notifier.emit(CallNotification::ChatReceived {
            remote: from,
            text,
            sent_at,
        });
    }

    fn on_remote_termination(&mut self, from: &ParticipantId, reason: EndReason) {
        let matches = self
            .session
            .as_ref()
            .is_some_and(|session| &session.remote == from);

        if matches {
            self.terminate(reason, false);
        } else {
            tracing::debug!("Ignoring {} from {}: no matching call", reason, from);
        }
    }

    // ========================================================================
    // NEGOTIATION RESULTS
    // ========================================================================

    fn on_negotiation(&mut self, session_id: SessionId, event: NegotiationEvent) {
        if self.session.as_ref().map(|session| session.id) != Some(session_id) {
            tracing::debug!("Discarding negotiation event of closed session {}", session_id);
            return;
        }

        match event {
            NegotiationEvent::Completed {
                generation,
                outcome,
            } => self.on_completed(generation, outcome),
            NegotiationEvent::Transport(event) => self.on_transport_event(event),
        }
    }

    fn on_completed(&mut self, generation: u64, outcome: NegotiationOutcome) {
        match outcome {
            NegotiationOutcome::Failed { operation, error } => {
                self.fail_negotiation(format!("{} failed: {}", operation, error));
            }
            NegotiationOutcome::LocalDescription(desc) => {
                self.on_local_description(generation, desc)
            }
            NegotiationOutcome::RemoteApplied(kind) => self.on_remote_applied(generation, kind),
        }
    }

    fn on_local_description(&mut self, generation: u64, desc: SessionDescription) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if generation != session.negotiation.generation() {
            tracing::debug!(
                "Discarding local {:?} of superseded generation {}",
                desc.kind,
                generation
            );
            return;
        }
        // Ein zurückgerolltes Offer darf den Peer nicht mehr erreichen
        if session.negotiation.local_kind() != Some(desc.kind) {
            tracing::debug!(
                "Discarding rolled back local {:?} (generation {})",
                desc.kind,
                generation
            );
            return;
        }

        let from = session.local.clone();
        let to = session.remote.clone();
        session.local_sent = Some(generation);
        let candidates = std::mem::take(&mut session.outgoing_candidates);

        let envelope = match desc.kind {
            DescriptionKind::Offer => SignalingEnvelope::Offer {
                from: from.clone(),
                to: to.clone(),
                generation,
                sdp: desc.sdp,
            },
            DescriptionKind::Answer => SignalingEnvelope::Answer {
                from: from.clone(),
                to: to.clone(),
                generation,
                sdp: desc.sdp,
            },
        };
        self.send(envelope);

        for candidate in candidates {
            self.send(SignalingEnvelope::Candidate {
                from: from.clone(),
                to: to.clone(),
                generation,
                candidate,
            });
        }

        self.maybe_start_renegotiation();
    }

    fn on_remote_applied(&mut self, generation: u64, kind: DescriptionKind) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        match session.negotiation.on_remote_applied(generation) {
            Ok(flushed) => tracing::debug!(
                "Remote {:?} applied (generation {}, {} buffered candidates)",
                kind,
                generation,
                flushed
            ),
            Err(e) => {
                tracing::debug!("Discarding remote {:?} completion: {}", kind, e);
                return;
            }
        }

        self.maybe_start_renegotiation();
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        match event {
            TransportEvent::StateChanged(ConnectionState::Connected) => {
                if session.state == CallState::Connecting {
                    self.set_state(CallState::Active);
                    self.maybe_start_renegotiation();
                }
            }
            TransportEvent::StateChanged(ConnectionState::Failed) => {
                tracing::error!("Peer connection to {} failed", session.remote);
                self.terminate(EndReason::TransportFailed, true);
            }
            TransportEvent::StateChanged(state) => {
                tracing::debug!("Peer connection to {}: {:?}", session.remote, state);
            }
            TransportEvent::LocalCandidate(candidate) => {
                // Erst nach der eigenen Description, sonst kennt der Peer die Runde nicht
                if session.local_description_sent() {
                    let envelope = SignalingEnvelope::Candidate {
                        from: session.local.clone(),
                        to: session.remote.clone(),
                        generation: session.negotiation.generation(),
                        candidate,
                    };
                    self.send(envelope);
                } else {
                    session.outgoing_candidates.push(candidate);
                }
            }
            TransportEvent::RemoteTrack { role, handle } => {
                tracing::info!("Remote {} track from {}", role, session.remote);
                let remote = session.remote.clone();
                self.notifier.emit(CallNotification::TrackAdded {
                    remote,
                    role,
                    handle,
                });
            }
        }
    }

    // ========================================================================
    // CONNECTIVITY & TIMERS
    // ========================================================================

    fn on_relay_connectivity(&mut self, connected: bool) {
        self.disconnect_epoch += 1;
        self.relay_connected = connected;

        if connected {
            tracing::info!("Relay connection available");
            return;
        }

        tracing::warn!("Relay connection lost");
        if self.session.is_none() {
            return;
        }

        let grace = self.config.relay_grace();
        if grace.is_zero() {
            self.lose_relay();
            return;
        }

        let events = self.events.clone();
        let epoch = self.disconnect_epoch;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = events.send(ControllerEvent::RelayGraceExpired { epoch });
        });
    }

    fn on_relay_grace_expired(&mut self, epoch: u64) {
        if epoch == self.disconnect_epoch && !self.relay_connected {
            self.lose_relay();
        }
    }

    fn lose_relay(&mut self) {
        if self.session.is_some() {
            self.report(&CallError::TransportLost);
            self.terminate(EndReason::TransportLost, false);
        }
    }

    fn on_presence(&mut self, participant: ParticipantId, online: bool) {
        if online {
            tracing::debug!("{} is online", participant);
            return;
        }

        let matches = self
            .session
            .as_ref()
            .is_some_and(|session| session.remote == participant);
        if matches {
            tracing::info!("{} went offline during the call", participant);
            self.terminate(EndReason::PeerLeft, false);
        }
    }

    fn arm_ring_timer(&self, session: SessionId) {
        let Some(timeout) = self.config.ring_timeout() else {
            return;
        };

        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(ControllerEvent::RingTimeout { session });
        });
    }

    fn on_ring_timeout(&mut self, session_id: SessionId) {
        let Some(session) = self.session.as_ref().filter(|session| session.id == session_id) else {
            return;
        };

        match session.state {
            CallState::Dialing => {
                tracing::info!("No answer from {}", session.remote);
                self.terminate(EndReason::RingTimeout, true);
            }
            CallState::Ringing => {
                tracing::info!("Missed call from {}", session.remote);
                let remote = session.remote.clone();
                self.send(SignalingEnvelope::CallRejected {
                    from: self.local_id.clone(),
                    to: remote,
                });
                self.terminate(EndReason::RingTimeout, false);
            }
            _ => {}
        }
    }

    fn shutdown(&mut self) {
        if self.session.is_some() {
            self.terminate(EndReason::LocalHangup, true);
        }
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn open_session(
        &self,
        remote: ParticipantId,
        role: CallRole,
        state: CallState,
        generation: u64,
    ) -> CallSession {
        let id = SessionId::new();
        let events = self.events.clone();
        let sink: NegotiationSink = Arc::new(move |event| {
            let _ = events.send(ControllerEvent::Negotiation { session: id, event });
        });

        let negotiation = NegotiationContext::open(Arc::clone(&self.factory), generation, sink);
        CallSession::new(id, self.local_id.clone(), remote, role, state, negotiation)
    }

    fn install_session(&mut self, session: CallSession) {
        let id = session.id;
        let state = session.state;
        let remote = session.remote.clone();

        self.session = Some(session);
        self.notify_state(state, Some(remote), None);
        self.arm_ring_timer(id);
    }

    fn set_state(&mut self, state: CallState) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.state == state {
            return;
        }

        tracing::info!("Call with {}: {:?} -> {:?}", session.remote, session.state, state);
        session.state = state;
        let remote = session.remote.clone();
        self.notify_state(state, Some(remote), None);
    }

    /// Beendet die Session; genau eine Idle-Notification pro Session
    fn terminate(&mut self, reason: EndReason, notify_peer: bool) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        session.state = CallState::Ending;
        tracing::info!("Ending call with {} ({})", session.remote, reason);

        self.tracks.release_session();
        session.negotiation.close();

        if notify_peer {
            self.send(SignalingEnvelope::CallEnded {
                from: self.local_id.clone(),
                to: session.remote.clone(),
            });
        }

        self.notify_state(CallState::Idle, Some(session.remote), Some(reason));
    }

    fn request_renegotiation(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.negotiation.request_renegotiation();
        }
        self.maybe_start_renegotiation();
    }

    /// Startet eine vorgemerkte Runde, sobald die Session aktiv und die
    /// laufende Runde abgeschlossen ist
    fn maybe_start_renegotiation(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.state != CallState::Active
            || !session.negotiation.is_stable()
            || !session.local_description_sent()
        {
            return;
        }
        if !session.negotiation.take_pending_renegotiation() {
            return;
        }

        if let Err(e) = session.negotiation.begin_renegotiation() {
            self.report(&e.into());
        }
    }

    fn send(&self, envelope: SignalingEnvelope) {
        tracing::debug!("Sending {} to {}", envelope.kind(), envelope.to());
        self.signaling.send(envelope);
    }

    fn notify_state(
        &self,
        state: CallState,
        remote: Option<ParticipantId>,
        reason: Option<EndReason>,
    ) {
        self.notifier.emit(CallNotification::SessionStateChanged {
            state,
            remote,
            reason,
        });
    }

    /// Fehler in der Verhandlung sind für die Session fatal, der Peer wird
    /// benachrichtigt
    fn fail_negotiation(&mut self, message: String) {
        self.report(&CallError::Negotiation(message.clone()));
        self.terminate(EndReason::NegotiationFailed(message), true);
    }

    fn protocol_error(&self, message: String) {
        self.report(&CallError::Protocol(message));
    }

    fn report(&self, error: &CallError) {
        tracing::warn!("Call error: {}", error);
        self.notifier.emit(CallNotification::Error {
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    fn reported<T>(&self, result: Result<T, CallError>) -> Result<T, CallError> {
        if let Err(e) = &result {
            self.report(e);
        }
        result
    }
}

/// Hängt alle lokalen Quellen an eine neue Session
fn attach_sources(
    tracks: &mut MediaTrackManager,
    ctx: &mut NegotiationContext,
) -> Result<(), NegotiationError> {
    let sources: Vec<(TrackRole, MediaSource)> = tracks
        .sources()
        .map(|(role, source)| (role, source.clone()))
        .collect();

    for (role, source) in sources {
        ctx.attach_track(role, source)?;
        tracks.mark_attached(role);
    }
    Ok(())
}

fn prepare_offer(
    tracks: &mut MediaTrackManager,
    ctx: &mut NegotiationContext,
) -> Result<(), NegotiationError> {
    attach_sources(tracks, ctx)?;
    ctx.create_offer()
}

fn prepare_incoming(
    tracks: &mut MediaTrackManager,
    ctx: &mut NegotiationContext,
    generation: u64,
    offer: SessionDescription,
) -> Result<(), NegotiationError> {
    attach_sources(tracks, ctx)?;
    ctx.apply_remote_description(generation, offer)?;
    Ok(())
}

fn answer_renegotiation(
    ctx: &mut NegotiationContext,
    generation: u64,
    offer: SessionDescription,
) -> Result<(), NegotiationError> {
    ctx.adopt_generation(generation)?;
    ctx.apply_remote_description(generation, offer)?;
    ctx.create_answer()
}

/// Eigene Änderungen gehen in der nächsten Runde erneut raus
fn yield_to_remote_offer(
    ctx: &mut NegotiationContext,
    generation: u64,
    offer: SessionDescription,
) -> Result<(), NegotiationError> {
    ctx.rollback_local_offer()?;
    ctx.apply_remote_description(generation, offer)?;
    ctx.create_answer()?;
    ctx.request_renegotiation();
    Ok(())
}
