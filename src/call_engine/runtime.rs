//! Call Runtime
//!
//! Eigener Task, der den `CallController` besitzt und seine Event-Queue
//! abarbeitet. Von außen wird nur über den `CallHandle` gesprochen.

use super::controller::{CallCommand, CallController, CallError, ControllerEvent, Reply};
use super::notify::{CallNotification, NotificationSink};
use super::session::{CallSnapshot, SessionId};
use crate::config::CallConfig;
use crate::media::{MediaSource, TrackPlan, TrackRole};
use crate::negotiation::PeerTransportFactory;
use crate::signaling::{ParticipantId, SignalingEnvelope, SignalingTransport};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Event-Loop des Controllers
pub struct CallRuntime {
    controller: CallController,
    events: mpsc::UnboundedReceiver<ControllerEvent>,
    snapshot: watch::Sender<Option<CallSnapshot>>,
}

impl CallRuntime {
    pub fn new(
        local_id: ParticipantId,
        config: CallConfig,
        signaling: Arc<dyn SignalingTransport>,
        factory: Arc<dyn PeerTransportFactory>,
        notifier: NotificationSink,
    ) -> (Self, CallHandle) {
        let (tx, events) = mpsc::unbounded_channel();
        let (snapshot, snapshot_rx) = watch::channel(None);

        let controller = CallController::new(
            local_id,
            config,
            signaling,
            factory,
            notifier.clone(),
            tx.clone(),
        );

        let runtime = Self {
            controller,
            events,
            snapshot,
        };
        let handle = CallHandle {
            events: tx,
            snapshot: snapshot_rx,
            notifier,
        };
        (runtime, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Verarbeitet Events, bis `CallHandle::shutdown` aufgerufen wird
    pub async fn run(mut self) {
        tracing::info!("Call runtime started for {}", self.controller.local_id());

        while let Some(event) = self.events.recv().await {
            let shutdown = matches!(event, ControllerEvent::Shutdown);
            self.controller.handle(event);
            self.publish_snapshot();

            if shutdown {
                break;
            }
        }

        tracing::info!("Call runtime stopped");
    }

    fn publish_snapshot(&self) {
        let next = self.controller.snapshot();
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

// ============================================================================
// CALL HANDLE
// ============================================================================

/// Asynchrone Befehls-API für die UI
#[derive(Clone)]
pub struct CallHandle {
    events: mpsc::UnboundedSender<ControllerEvent>,
    snapshot: watch::Receiver<Option<CallSnapshot>>,
    notifier: NotificationSink,
}

impl CallHandle {
    pub async fn place_call(&self, remote: ParticipantId) -> Result<SessionId, CallError> {
        self.request(|reply| CallCommand::PlaceCall { remote, reply }).await
    }

    pub async fn accept(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::Accept { reply }).await
    }

    pub async fn reject(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::Reject { reply }).await
    }

    pub async fn hangup(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::Hangup { reply }).await
    }

    pub async fn set_track(
        &self,
        role: TrackRole,
        source: MediaSource,
    ) -> Result<TrackPlan, CallError> {
        self.request(|reply| CallCommand::SetTrack {
            role,
            source,
            reply,
        })
        .await
    }

    pub async fn stop_track(&self, role: TrackRole) -> Result<(), CallError> {
        self.request(|reply| CallCommand::StopTrack { role, reply }).await
    }

    pub async fn set_default_source(
        &self,
        role: TrackRole,
        source: MediaSource,
    ) -> Result<(), CallError> {
        self.request(|reply| CallCommand::SetDefaultSource {
            role,
            source,
            reply,
        })
        .await
    }

    /// Stummschalten (`false`) bzw. wieder freigeben (`true`)
    pub async fn set_track_enabled(&self, role: TrackRole, enabled: bool) -> Result<(), CallError> {
        self.request(|reply| CallCommand::SetTrackEnabled {
            role,
            enabled,
            reply,
        })
        .await
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), CallError> {
        let text = text.into();
        self.request(|reply| CallCommand::SendChat { text, reply }).await
    }

    /// Reicht ein Envelope vom Relay an den Controller weiter
    pub fn deliver(&self, envelope: SignalingEnvelope) {
        self.post(ControllerEvent::Inbound(envelope));
    }

    pub fn relay_connectivity(&self, connected: bool) {
        self.post(ControllerEvent::RelayConnectivity { connected });
    }

    pub fn presence(&self, participant: ParticipantId, online: bool) {
        self.post(ControllerEvent::Presence {
            participant,
            online,
        });
    }

    /// Aktueller Anruf, `None` im Idle-Zustand
    pub fn current_call(&self) -> Option<CallSnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn watch_call(&self) -> watch::Receiver<Option<CallSnapshot>> {
        self.snapshot.clone()
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallNotification> {
        self.notifier.subscribe()
    }

    /// Beendet einen laufenden Anruf und stoppt die Runtime
    pub fn shutdown(&self) {
        self.post(ControllerEvent::Shutdown);
    }

    fn post(&self, event: ControllerEvent) {
        if self.events.send(event).is_err() {
            tracing::warn!("Call runtime is gone, event dropped");
        }
    }

    async fn request<T, F>(&self, build: F) -> Result<T, CallError>
    where
        F: FnOnce(Reply<T>) -> CallCommand,
    {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(ControllerEvent::Command(build(tx)))
            .map_err(|_| CallError::RuntimeClosed)?;
        rx.await.map_err(|_| CallError::RuntimeClosed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::session::CallState;
    use crate::media::MediaKind;
    use crate::negotiation::fake::{ChannelSignaling, FakeTransportFactory};
    use std::time::Duration;

    fn start(name: &str) -> (CallHandle, mpsc::UnboundedReceiver<SignalingEnvelope>) {
        let (signaling, outbox) = ChannelSignaling::new();
        let (runtime, handle) = CallRuntime::new(
            ParticipantId::from(name),
            CallConfig::default(),
            Arc::new(signaling),
            Arc::new(FakeTransportFactory::new(name, true)),
            NotificationSink::new(),
        );
        runtime.spawn();
        (handle, outbox)
    }

    fn relay(mut outbox: mpsc::UnboundedReceiver<SignalingEnvelope>, target: CallHandle) {
        tokio::spawn(async move {
            while let Some(envelope) = outbox.recv().await {
                target.deliver(envelope);
            }
        });
    }

    async fn wait_for_state(handle: &CallHandle, state: CallState) {
        let mut rx = handle.watch_call();
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|call| call.as_ref().map(|c| c.state) == Some(state)),
        )
        .await
        .expect("timed out waiting for state")
        .unwrap();
    }

    #[tokio::test]
    async fn test_call_through_runtimes() {
        let (alice, alice_out) = start("alice");
        let (bob, bob_out) = start("bob");
        relay(alice_out, bob.clone());
        relay(bob_out, alice.clone());

        let mut bob_notes = bob.subscribe();
        let mic = MediaSource::new("mic", MediaKind::Audio, "Mic");
        alice.set_track(TrackRole::MicrophoneAudio, mic).await.unwrap();
        alice.place_call(ParticipantId::from("bob")).await.unwrap();

        loop {
            let note = tokio::time::timeout(Duration::from_secs(2), bob_notes.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(note, CallNotification::IncomingCall { .. }) {
                break;
            }
        }

        bob.accept().await.unwrap();
        wait_for_state(&alice, CallState::Active).await;
        wait_for_state(&bob, CallState::Active).await;

        alice.send_chat("  hallo bob ").await.unwrap();
        loop {
            let note = tokio::time::timeout(Duration::from_secs(2), bob_notes.recv())
                .await
                .unwrap()
                .unwrap();
            if let CallNotification::ChatReceived { remote, text, .. } = note {
                assert_eq!(remote, ParticipantId::from("alice"));
                assert_eq!(text, "hallo bob");
                break;
            }
        }

        alice.hangup().await.unwrap();
        assert_eq!(alice.current_call(), None);

        let mut rx = bob.watch_call();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(Option::is_none))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_fail() {
        let (alice, _out) = start("alice");
        alice.shutdown();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(alice.hangup().await, Err(CallError::RuntimeClosed));
    }
}
