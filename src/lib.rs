//! Pulse Call - P2P Call Signaling und Session Negotiation
//!
//! Kern einer P2P Audio/Video-Call-Applikation mit:
//! - WebSocket-Relay als Signaling-Server
//! - WebRTC für die Peer Connection
//! - Einer Call-Zustandsmaschine mit Renegotiation (Screen Share)

pub mod call_engine;
pub mod config;
pub mod media;
pub mod negotiation;
pub mod signaling;

use anyhow::Context;
use call_engine::{CallHandle, CallNotification, CallRuntime, NotificationSink};
use config::CallConfig;
use negotiation::{RtcMediaTracks, RtcTransportFactory};
use signaling::{ParticipantId, SignalingClient, SignalingEvent, SignalingTransport};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Default Log-Filter, falls `RUST_LOG` nicht gesetzt ist
const DEFAULT_LOG_FILTER: &str = "pulse_call=debug,webrtc=warn";

/// Initialisiert Logging
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));

    // Ein bereits installierter Subscriber (z.B. in Tests) bleibt aktiv
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// APPLICATION
// ============================================================================

/// Verbundener Call-Core: Relay-Client, WebRTC-Factory und Controller
pub struct CallApp {
    local_id: ParticipantId,
    handle: CallHandle,
    client: Arc<SignalingClient>,
    media: RtcMediaTracks,
    tasks: Vec<JoinHandle<()>>,
}

impl CallApp {
    /// Verbindet mit dem Relay, registriert `username` und startet die Runtime
    pub async fn start(config: CallConfig, username: String) -> anyhow::Result<Self> {
        tracing::info!("Starting call core as {}", username);

        let mut client = SignalingClient::new(config.signaling_url.clone());
        let local_id = client
            .connect_and_register(username)
            .await
            .context("failed to register with signaling server")?;
        let client = Arc::new(client);

        let factory = RtcTransportFactory::new(&config.ice_servers);
        let media = factory.media();
        let heartbeat_interval = config.heartbeat_interval();

        let signaling: Arc<dyn SignalingTransport> = client.clone();
        let (runtime, handle) = CallRuntime::new(
            local_id.clone(),
            config,
            signaling,
            Arc::new(factory),
            NotificationSink::new(),
        );

        let forward = handle.clone();
        let tasks = vec![
            runtime.spawn(),
            client.on_receive(move |event| forward_signaling_event(&forward, event)),
            Arc::clone(&client).start_heartbeat(heartbeat_interval),
        ];

        tracing::info!("Call core ready (peer id {})", local_id);

        Ok(Self {
            local_id,
            handle,
            client,
            media,
            tasks,
        })
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Befehls-API für Anrufe
    pub fn handle(&self) -> &CallHandle {
        &self.handle
    }

    /// RTP-Tracks der laufenden Session für Erfassung und Wiedergabe
    pub fn media(&self) -> &RtcMediaTracks {
        &self.media
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallNotification> {
        self.handle.subscribe()
    }

    pub fn subscribe_signaling(&self) -> broadcast::Receiver<SignalingEvent> {
        self.client.subscribe()
    }

    /// Beendet einen laufenden Anruf und trennt vom Relay
    pub async fn shutdown(self) {
        self.handle.shutdown();

        let mut tasks = self.tasks.into_iter();
        if let Some(runtime) = tasks.next() {
            let _ = runtime.await;
        }
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        match Arc::try_unwrap(self.client) {
            Ok(mut client) => client.disconnect(),
            Err(_) => tracing::warn!("Signaling client still in use, not disconnecting"),
        }
        tracing::info!("Call core stopped");
    }
}

// ============================================================================
// EVENT HANDLER
// ============================================================================

/// Leitet Relay-Events an den Controller weiter
fn forward_signaling_event(handle: &CallHandle, event: SignalingEvent) {
    match event {
        SignalingEvent::Connected => handle.relay_connectivity(true),
        SignalingEvent::Disconnected => handle.relay_connectivity(false),
        SignalingEvent::Registered { peer_id, username } => {
            tracing::info!("Registered as {} (peer_id: {})", username, peer_id);
        }
        SignalingEvent::Envelope(envelope) => handle.deliver(envelope),
        SignalingEvent::Roster(participants) => {
            for participant in participants {
                handle.presence(participant, true);
            }
        }
        SignalingEvent::ParticipantOnline(participant) => handle.presence(participant, true),
        SignalingEvent::ParticipantOffline(participant) => handle.presence(participant, false),
        SignalingEvent::Error { code, message } => {
            tracing::error!("Signaling error {}: {}", code, message);
        }
    }
}
