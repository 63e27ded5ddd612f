//! Negotiation Context - Zustand einer Peer Connection
//!
//! Hält die Generation der aktuellen Verhandlungsrunde, puffert Remote-
//! Candidates bis zur passenden Remote Description und reicht alle
//! Transport-Operationen an einen seriellen Worker weiter.
//!
//! Der Kontext selbst blockiert nie: jede Operation wird nur eingereiht.
//! Ergebnisse kommen als `NegotiationEvent::Completed` zurück, markiert mit
//! der Generation, für die sie angestoßen wurden.

use super::transport::{
    DescriptionKind, PeerTransport, PeerTransportFactory, SessionDescription, TransportError,
    TransportEvent, TransportEventSink,
};
use crate::media::{MediaSource, TrackRole};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Stale generation {received} (current {current})")]
    StaleGeneration { received: u64, current: u64 },

    #[error("Out of sequence: {0}")]
    OutOfSequence(String),

    #[error("Negotiation context closed")]
    Closed,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Ergebnis einer abgeschlossenen Worker-Operation
#[derive(Debug, Clone)]
pub enum NegotiationOutcome {
    /// Local Description wurde erzeugt und gesetzt
    LocalDescription(SessionDescription),
    /// Remote Description wurde angewendet
    RemoteApplied(DescriptionKind),
    /// Operation ist fehlgeschlagen; für die Session fatal
    Failed {
        operation: &'static str,
        error: TransportError,
    },
}

/// Events aus dem Worker an den Controller
#[derive(Debug, Clone)]
pub enum NegotiationEvent {
    Completed {
        generation: u64,
        outcome: NegotiationOutcome,
    },
    Transport(TransportEvent),
}

/// Rückkanal für `NegotiationEvent`s
pub type NegotiationSink = Arc<dyn Fn(NegotiationEvent) + Send + Sync>;

/// Ergebnis von `apply_remote_description`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    Submitted,
    /// Gleiche Generation bereits angewendet oder eingereiht
    Duplicate,
}

/// Ergebnis von `add_remote_candidate`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Buffered,
}

// ============================================================================
// WORKER OPERATIONS
// ============================================================================

enum NegotiationOp {
    CreateOffer {
        generation: u64,
    },
    CreateAnswer {
        generation: u64,
    },
    ApplyRemote {
        generation: u64,
        desc: SessionDescription,
    },
    Rollback {
        generation: u64,
    },
    AddCandidate {
        generation: u64,
        candidate: String,
    },
    AttachTrack {
        generation: u64,
        role: TrackRole,
        source: MediaSource,
    },
    ReplaceTrack {
        generation: u64,
        role: TrackRole,
        source: Option<MediaSource>,
    },
    DetachTrack {
        generation: u64,
        role: TrackRole,
    },
    Close,
}

impl NegotiationOp {
    fn generation(&self) -> Option<u64> {
        match self {
            Self::CreateOffer { generation }
            | Self::CreateAnswer { generation }
            | Self::ApplyRemote { generation, .. }
            | Self::Rollback { generation }
            | Self::AddCandidate { generation, .. }
            | Self::AttachTrack { generation, .. }
            | Self::ReplaceTrack { generation, .. }
            | Self::DetachTrack { generation, .. } => Some(*generation),
            Self::Close => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::CreateOffer { .. } => "create_offer",
            Self::CreateAnswer { .. } => "create_answer",
            Self::ApplyRemote { .. } => "set_remote_description",
            Self::Rollback { .. } => "rollback_local_offer",
            Self::AddCandidate { .. } => "add_ice_candidate",
            Self::AttachTrack { .. } => "attach_track",
            Self::ReplaceTrack { .. } => "replace_track",
            Self::DetachTrack { .. } => "detach_track",
            Self::Close => "close",
        }
    }
}

// ============================================================================
// NEGOTIATION CONTEXT
// ============================================================================

/// Verhandlungszustand einer einzelnen Session
pub struct NegotiationContext {
    generation: u64,
    local: Option<(u64, DescriptionKind)>,
    remote_requested: Option<(u64, DescriptionKind)>,
    remote_applied: Option<u64>,
    pending_candidates: Vec<(u64, String)>,
    renegotiation_pending: bool,
    in_place_supported: bool,
    ops: mpsc::UnboundedSender<NegotiationOp>,
    /// Geteilt mit dem Worker; eingereihte Operationen verfallen danach
    closing: Arc<AtomicBool>,
    closed: bool,
}

impl NegotiationContext {
    /// Erstellt den Kontext und startet den Worker, der die Peer Connection
    /// anlegt und alle Operationen der Reihe nach ausführt
    pub fn open(
        factory: Arc<dyn PeerTransportFactory>,
        generation: u64,
        sink: NegotiationSink,
    ) -> Self {
        let (ops, rx) = mpsc::unbounded_channel();
        let in_place_supported = factory.supports_in_place_replacement();
        let closing = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_worker(factory, generation, sink, rx, Arc::clone(&closing)));

        Self {
            generation,
            local: None,
            remote_requested: None,
            remote_applied: None,
            pending_candidates: Vec::new(),
            renegotiation_pending: false,
            in_place_supported,
            ops,
            closing,
            closed: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn in_place_supported(&self) -> bool {
        self.in_place_supported
    }

    /// Art der Local Description der aktuellen Generation
    pub fn local_kind(&self) -> Option<DescriptionKind> {
        self.local
            .filter(|(generation, _)| *generation == self.generation)
            .map(|(_, kind)| kind)
    }

    /// Ob die Remote Description der aktuellen Generation angewendet ist
    pub fn remote_applied(&self) -> bool {
        self.remote_applied == Some(self.generation)
    }

    /// Ob die Remote Description der aktuellen Generation angekommen ist,
    /// auch wenn der Worker sie noch nicht angewendet hat
    pub fn remote_received(&self) -> bool {
        matches!(self.remote_requested, Some((generation, _)) if generation == self.generation)
    }

    /// Eigenes Offer der aktuellen Runde wartet noch auf die Answer
    pub fn offer_outstanding(&self) -> bool {
        self.local_kind() == Some(DescriptionKind::Offer) && !self.remote_received()
    }

    /// Lokale und Remote Description der aktuellen Runde sind gesetzt
    pub fn is_stable(&self) -> bool {
        self.local_kind().is_some() && self.remote_applied()
    }

    pub fn buffered_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Merkt eine Verhandlungsrunde vor, die erst später starten kann
    pub fn request_renegotiation(&mut self) {
        self.renegotiation_pending = true;
    }

    pub fn take_pending_renegotiation(&mut self) -> bool {
        std::mem::take(&mut self.renegotiation_pending)
    }

    /// Erzeugt das Offer der aktuellen Generation
    pub fn create_offer(&mut self) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if self.local_kind().is_some() {
            return Err(NegotiationError::OutOfSequence(format!(
                "local description already created for generation {}",
                self.generation
            )));
        }

        self.local = Some((self.generation, DescriptionKind::Offer));
        self.submit(NegotiationOp::CreateOffer {
            generation: self.generation,
        })
    }

    /// Erzeugt die Answer auf das Remote Offer der aktuellen Generation
    pub fn create_answer(&mut self) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if self.remote_requested != Some((self.generation, DescriptionKind::Offer)) {
            return Err(NegotiationError::OutOfSequence(format!(
                "no remote offer for generation {}",
                self.generation
            )));
        }
        if self.local_kind().is_some() {
            return Err(NegotiationError::OutOfSequence(format!(
                "local description already created for generation {}",
                self.generation
            )));
        }

        self.local = Some((self.generation, DescriptionKind::Answer));
        self.submit(NegotiationOp::CreateAnswer {
            generation: self.generation,
        })
    }

    /// Übernimmt die nächste Generation aus einem Remote Offer
    ///
    /// Nur `generation + 1` ist erlaubt; eine Runde kann nicht übersprungen
    /// werden.
    pub fn adopt_generation(&mut self, generation: u64) -> Result<(), NegotiationError> {
        if generation <= self.generation {
            return Err(NegotiationError::StaleGeneration {
                received: generation,
                current: self.generation,
            });
        }
        if self.generation.checked_add(1) != Some(generation) {
            return Err(NegotiationError::OutOfSequence(format!(
                "generation {} skips ahead of {}",
                generation, self.generation
            )));
        }

        tracing::debug!("Adopting negotiation generation {} -> {}", self.generation, generation);
        self.generation = generation;
        self.pending_candidates.retain(|(g, _)| *g >= generation);
        Ok(())
    }

    /// Startet eine neue Verhandlungsrunde mit eigenem Offer
    pub fn begin_renegotiation(&mut self) -> Result<u64, NegotiationError> {
        self.ensure_open()?;
        if !self.is_stable() {
            return Err(NegotiationError::OutOfSequence(format!(
                "generation {} still negotiating",
                self.generation
            )));
        }

        self.generation = self.generation.checked_add(1).ok_or_else(|| {
            NegotiationError::OutOfSequence(format!("generation {} exhausted", self.generation))
        })?;
        self.renegotiation_pending = false;
        self.pending_candidates.retain(|(g, _)| *g >= self.generation);
        tracing::info!("Starting renegotiation, generation {}", self.generation);
        self.create_offer()?;
        Ok(self.generation)
    }

    /// Wendet eine Remote Description an; Duplikate derselben Generation
    /// sind ein No-op
    pub fn apply_remote_description(
        &mut self,
        generation: u64,
        desc: SessionDescription,
    ) -> Result<RemoteApply, NegotiationError> {
        self.ensure_open()?;
        if generation < self.generation {
            return Err(NegotiationError::StaleGeneration {
                received: generation,
                current: self.generation,
            });
        }
        if generation > self.generation {
            return Err(NegotiationError::OutOfSequence(format!(
                "{:?} for future generation {} (current {})",
                desc.kind, generation, self.generation
            )));
        }
        if matches!(self.remote_requested, Some((g, _)) if g == generation) {
            return Ok(RemoteApply::Duplicate);
        }

        self.remote_requested = Some((generation, desc.kind));
        self.submit(NegotiationOp::ApplyRemote { generation, desc })?;
        Ok(RemoteApply::Submitted)
    }

    /// Verwirft das eigene, unbeantwortete Offer der aktuellen Generation,
    /// damit ein Remote Offer derselben Generation beantwortet werden kann
    pub fn rollback_local_offer(&mut self) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if !self.offer_outstanding() {
            return Err(NegotiationError::OutOfSequence(format!(
                "no outstanding local offer for generation {}",
                self.generation
            )));
        }

        self.local = None;
        self.submit(NegotiationOp::Rollback {
            generation: self.generation,
        })
    }

    /// Nimmt einen Remote Candidate an
    ///
    /// Vor der passenden Remote Description wird gepuffert, danach sofort
    /// angewendet. Gepuffert wird höchstens für die nächste Generation.
    pub fn add_remote_candidate(
        &mut self,
        generation: u64,
        candidate: String,
    ) -> Result<CandidateDisposition, NegotiationError> {
        self.ensure_open()?;
        if generation < self.generation {
            return Err(NegotiationError::StaleGeneration {
                received: generation,
                current: self.generation,
            });
        }
        if generation > self.generation.saturating_add(1) {
            return Err(NegotiationError::OutOfSequence(format!(
                "candidate for generation {} (current {})",
                generation, self.generation
            )));
        }

        if self.remote_applied == Some(generation) {
            self.submit(NegotiationOp::AddCandidate {
                generation,
                candidate,
            })?;
            Ok(CandidateDisposition::Applied)
        } else {
            self.pending_candidates.push((generation, candidate));
            Ok(CandidateDisposition::Buffered)
        }
    }

    /// Wird aufgerufen, wenn der Worker die Remote Description einer
    /// Generation angewendet hat. Gibt die Anzahl der geflushten Candidates
    /// zurück.
    pub fn on_remote_applied(&mut self, generation: u64) -> Result<usize, NegotiationError> {
        if generation != self.generation {
            return Err(NegotiationError::StaleGeneration {
                received: generation,
                current: self.generation,
            });
        }

        self.remote_applied = Some(generation);

        let pending = std::mem::take(&mut self.pending_candidates);
        let mut flushed = 0;
        for (g, candidate) in pending {
            if g == generation {
                self.submit(NegotiationOp::AddCandidate {
                    generation,
                    candidate,
                })?;
                flushed += 1;
            } else if g > generation {
                self.pending_candidates.push((g, candidate));
            }
        }

        if flushed > 0 {
            tracing::debug!(
                "Flushed {} buffered candidates for generation {}",
                flushed,
                generation
            );
        }
        Ok(flushed)
    }

    pub fn attach_track(
        &mut self,
        role: TrackRole,
        source: MediaSource,
    ) -> Result<(), NegotiationError> {
        self.submit(NegotiationOp::AttachTrack {
            generation: self.generation,
            role,
            source,
        })
    }

    pub fn replace_track(
        &mut self,
        role: TrackRole,
        source: Option<MediaSource>,
    ) -> Result<(), NegotiationError> {
        self.submit(NegotiationOp::ReplaceTrack {
            generation: self.generation,
            role,
            source,
        })
    }

    pub fn detach_track(&mut self, role: TrackRole) -> Result<(), NegotiationError> {
        self.submit(NegotiationOp::DetachTrack {
            generation: self.generation,
            role,
        })
    }

    /// Schließt die Peer Connection, nachdem die laufende Operation fertig ist;
    /// noch eingereihte Operationen verfallen
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.closing.store(true, Ordering::SeqCst);
            self.pending_candidates.clear();
            let _ = self.ops.send(NegotiationOp::Close);
        }
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.closed {
            Err(NegotiationError::Closed)
        } else {
            Ok(())
        }
    }

    fn submit(&self, op: NegotiationOp) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        tracing::trace!("Queueing {} (generation {:?})", op.name(), op.generation());
        self.ops.send(op).map_err(|_| NegotiationError::Closed)
    }
}

impl Drop for NegotiationContext {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for NegotiationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationContext")
            .field("generation", &self.generation)
            .field("local", &self.local)
            .field("remote_applied", &self.remote_applied)
            .field("buffered_candidates", &self.pending_candidates.len())
            .field("closed", &self.closed)
            .finish()
    }
}

// ============================================================================
// WORKER
// ============================================================================

/// Legt die Peer Connection an und führt alle Operationen seriell aus
async fn run_worker(
    factory: Arc<dyn PeerTransportFactory>,
    generation: u64,
    sink: NegotiationSink,
    mut ops: mpsc::UnboundedReceiver<NegotiationOp>,
    closing: Arc<AtomicBool>,
) {
    let transport_sink: TransportEventSink = {
        let sink = Arc::clone(&sink);
        Arc::new(move |event| sink(NegotiationEvent::Transport(event)))
    };

    let transport = match factory.create(transport_sink).await {
        Ok(transport) => transport,
        Err(error) => {
            tracing::error!("Failed to create peer connection: {}", error);
            sink(NegotiationEvent::Completed {
                generation,
                outcome: NegotiationOutcome::Failed {
                    operation: "create_peer_connection",
                    error,
                },
            });
            return;
        }
    };

    while let Some(op) = ops.recv().await {
        let Some(generation) = op.generation() else {
            break;
        };
        if closing.load(Ordering::SeqCst) {
            tracing::debug!("Dropping queued {} after close", op.name());
            break;
        }
        let operation = op.name();

        match execute(transport.as_ref(), op).await {
            Ok(Some(outcome)) => sink(NegotiationEvent::Completed {
                generation,
                outcome,
            }),
            Ok(None) => {}
            Err(error) => {
                tracing::warn!("{} failed (generation {}): {}", operation, generation, error);
                sink(NegotiationEvent::Completed {
                    generation,
                    outcome: NegotiationOutcome::Failed { operation, error },
                });
                break;
            }
        }
    }

    transport.close().await;
    tracing::debug!("Negotiation worker finished");
}

async fn execute(
    transport: &dyn PeerTransport,
    op: NegotiationOp,
) -> Result<Option<NegotiationOutcome>, TransportError> {
    match op {
        NegotiationOp::CreateOffer { .. } => {
            let sdp = transport.create_offer().await?;
            Ok(Some(NegotiationOutcome::LocalDescription(
                SessionDescription::offer(sdp),
            )))
        }
        NegotiationOp::CreateAnswer { .. } => {
            let sdp = transport.create_answer().await?;
            Ok(Some(NegotiationOutcome::LocalDescription(
                SessionDescription::answer(sdp),
            )))
        }
        NegotiationOp::ApplyRemote { desc, .. } => {
            let kind = desc.kind;
            transport.set_remote_description(desc).await?;
            Ok(Some(NegotiationOutcome::RemoteApplied(kind)))
        }
        NegotiationOp::Rollback { .. } => {
            transport.rollback_local_offer().await?;
            Ok(None)
        }
        NegotiationOp::AddCandidate { candidate, .. } => {
            transport.add_ice_candidate(&candidate).await?;
            Ok(None)
        }
        NegotiationOp::AttachTrack { role, source, .. } => {
            transport.attach_track(role, &source).await?;
            Ok(None)
        }
        NegotiationOp::ReplaceTrack { role, source, .. } => {
            transport.replace_track(role, source.as_ref()).await?;
            Ok(None)
        }
        NegotiationOp::DetachTrack { role, .. } => {
            transport.detach_track(role).await?;
            Ok(None)
        }
        NegotiationOp::Close => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::fake::{FakeCall, FakeTransportFactory};
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Harness {
        ctx: NegotiationContext,
        events: mpsc::UnboundedReceiver<NegotiationEvent>,
        log: Arc<Mutex<Vec<FakeCall>>>,
    }

    fn open_with(factory: FakeTransportFactory, generation: u64) -> Harness {
        let log = factory.log_handle();
        let (tx, events) = mpsc::unbounded_channel();
        let sink: NegotiationSink = Arc::new(move |event| {
            let _ = tx.send(event);
        });

        Harness {
            ctx: NegotiationContext::open(Arc::new(factory), generation, sink),
            events,
            log,
        }
    }

    fn open(generation: u64) -> Harness {
        open_with(FakeTransportFactory::new("local", true), generation)
    }

    impl Harness {
        async fn next_completion(&mut self) -> (u64, NegotiationOutcome) {
            loop {
                let event = tokio::time::timeout(Duration::from_secs(1), self.events.recv())
                    .await
                    .unwrap()
                    .unwrap();
                if let NegotiationEvent::Completed { generation, outcome } = event {
                    return (generation, outcome);
                }
            }
        }

        fn added_candidates(&self) -> Vec<String> {
            self.log
                .lock()
                .iter()
                .filter_map(|call| match call {
                    FakeCall::AddCandidate(c) => Some(c.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn test_answer_requires_remote_offer() {
        let mut h = open(1);
        assert!(matches!(
            h.ctx.create_answer(),
            Err(NegotiationError::OutOfSequence(_))
        ));
    }

    #[tokio::test]
    async fn test_local_description_once_per_generation() {
        let mut h = open(1);
        h.ctx.create_offer().unwrap();
        assert!(h.ctx.create_offer().is_err());
        assert_eq!(h.ctx.local_kind(), Some(DescriptionKind::Offer));

        let (generation, outcome) = h.next_completion().await;
        assert_eq!(generation, 1);
        assert!(matches!(
            outcome,
            NegotiationOutcome::LocalDescription(SessionDescription {
                kind: DescriptionKind::Offer,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_remote_description_generation_rules() {
        let mut h = open(2);

        assert_eq!(
            h.ctx.apply_remote_description(2, SessionDescription::offer("fake:remote:")),
            Ok(RemoteApply::Submitted)
        );
        assert_eq!(
            h.ctx.apply_remote_description(2, SessionDescription::offer("fake:remote:")),
            Ok(RemoteApply::Duplicate)
        );
        assert_eq!(
            h.ctx.apply_remote_description(1, SessionDescription::offer("fake:remote:")),
            Err(NegotiationError::StaleGeneration { received: 1, current: 2 })
        );
        assert!(matches!(
            h.ctx.apply_remote_description(3, SessionDescription::answer("fake:remote:")),
            Err(NegotiationError::OutOfSequence(_))
        ));
    }

    #[tokio::test]
    async fn test_candidates_flushed_in_order_after_remote_applied() {
        let mut h = open(1);

        for candidate in ["a", "b"] {
            assert_eq!(
                h.ctx.add_remote_candidate(1, candidate.to_string()),
                Ok(CandidateDisposition::Buffered)
            );
        }
        h.ctx.add_remote_candidate(2, "future".to_string()).unwrap();
        assert_eq!(h.ctx.buffered_candidates(), 3);

        h.ctx
            .apply_remote_description(1, SessionDescription::offer("fake:remote:"))
            .unwrap();
        let (generation, outcome) = h.next_completion().await;
        assert!(matches!(outcome, NegotiationOutcome::RemoteApplied(DescriptionKind::Offer)));

        assert_eq!(h.ctx.on_remote_applied(generation), Ok(2));
        assert_eq!(h.ctx.buffered_candidates(), 1);
        assert_eq!(
            h.ctx.add_remote_candidate(1, "c".to_string()),
            Ok(CandidateDisposition::Applied)
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.added_candidates(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_renegotiation_requires_stable_round() {
        let mut h = open(1);
        h.ctx.create_offer().unwrap();
        assert!(h.ctx.begin_renegotiation().is_err());

        h.ctx
            .apply_remote_description(1, SessionDescription::answer("fake:remote:"))
            .unwrap();
        h.next_completion().await;
        let (generation, _) = h.next_completion().await;
        h.ctx.on_remote_applied(generation).unwrap();
        assert!(h.ctx.is_stable());

        h.ctx.request_renegotiation();
        assert_eq!(h.ctx.begin_renegotiation(), Ok(2));
        assert!(!h.ctx.take_pending_renegotiation());
        assert_eq!(h.ctx.generation(), 2);
        assert_eq!(h.ctx.local_kind(), Some(DescriptionKind::Offer));
        assert!(!h.ctx.remote_applied());

        let (generation, outcome) = h.next_completion().await;
        assert_eq!(generation, 2);
        assert!(matches!(outcome, NegotiationOutcome::LocalDescription(_)));
    }

    #[tokio::test]
    async fn test_adopt_generation_drops_older_candidates() {
        let mut h = open(1);
        h.ctx.add_remote_candidate(1, "old".to_string()).unwrap();
        h.ctx.add_remote_candidate(2, "next".to_string()).unwrap();

        h.ctx.adopt_generation(2).unwrap();
        assert_eq!(h.ctx.generation(), 2);
        assert_eq!(h.ctx.buffered_candidates(), 1);
        assert_eq!(
            h.ctx.adopt_generation(2),
            Err(NegotiationError::StaleGeneration { received: 2, current: 2 })
        );
        assert!(matches!(
            h.ctx.adopt_generation(4),
            Err(NegotiationError::OutOfSequence(_))
        ));
        assert!(matches!(
            h.ctx.adopt_generation(u64::MAX),
            Err(NegotiationError::OutOfSequence(_))
        ));
        assert_eq!(h.ctx.generation(), 2);
    }

    #[tokio::test]
    async fn test_candidates_beyond_next_generation_are_rejected() {
        let mut h = open(1);

        for generation in 3..1000 {
            assert!(matches!(
                h.ctx.add_remote_candidate(generation, "far".to_string()),
                Err(NegotiationError::OutOfSequence(_))
            ));
        }
        assert!(h.ctx.add_remote_candidate(u64::MAX, "far".to_string()).is_err());
        assert_eq!(h.ctx.buffered_candidates(), 0);

        assert_eq!(
            h.ctx.add_remote_candidate(2, "next".to_string()),
            Ok(CandidateDisposition::Buffered)
        );
        assert_eq!(h.ctx.buffered_candidates(), 1);
    }

    #[tokio::test]
    async fn test_renegotiation_at_last_generation_fails_cleanly() {
        let mut h = open(u64::MAX);
        h.ctx.create_offer().unwrap();
        h.ctx
            .apply_remote_description(u64::MAX, SessionDescription::answer("fake:remote:"))
            .unwrap();
        h.next_completion().await;
        let (generation, _) = h.next_completion().await;
        h.ctx.on_remote_applied(generation).unwrap();
        assert!(h.ctx.is_stable());

        assert!(matches!(
            h.ctx.begin_renegotiation(),
            Err(NegotiationError::OutOfSequence(_))
        ));
        assert_eq!(h.ctx.generation(), u64::MAX);
        assert!(h.ctx.is_stable());
    }

    #[tokio::test]
    async fn test_rollback_lets_remote_offer_be_answered() {
        let mut h = open(1);
        assert!(h.ctx.rollback_local_offer().is_err());

        h.ctx.create_offer().unwrap();
        assert!(h.ctx.offer_outstanding());
        h.ctx.rollback_local_offer().unwrap();
        assert_eq!(h.ctx.local_kind(), None);

        h.ctx
            .apply_remote_description(1, SessionDescription::offer("fake:remote:"))
            .unwrap();
        h.ctx.create_answer().unwrap();
        assert_eq!(h.ctx.local_kind(), Some(DescriptionKind::Answer));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let log = h.log.lock().clone();
        assert_eq!(
            log,
            vec![
                FakeCall::CreateOffer,
                FakeCall::Rollback,
                FakeCall::SetRemote(DescriptionKind::Offer),
                FakeCall::CreateAnswer,
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_context_rejects_operations() {
        let mut h = open(1);
        h.ctx.close();

        assert_eq!(h.ctx.create_offer(), Err(NegotiationError::Closed));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.log.lock().last(), Some(&FakeCall::Close));
    }

    #[tokio::test]
    async fn test_close_drops_queued_operations() {
        let mut h = open(1);
        h.ctx.create_offer().unwrap();
        h.ctx.close();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*h.log.lock(), vec![FakeCall::Close]);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transport_failure_is_reported() {
        let factory = FakeTransportFactory::new("local", true);
        factory.fail_remote_handle().store(true, Ordering::SeqCst);
        let mut h = open_with(factory, 1);

        h.ctx
            .apply_remote_description(1, SessionDescription::offer("fake:remote:"))
            .unwrap();

        let (generation, outcome) = h.next_completion().await;
        assert_eq!(generation, 1);
        assert!(matches!(
            outcome,
            NegotiationOutcome::Failed {
                operation: "set_remote_description",
                error: TransportError::InvalidSdp(_),
            }
        ));
    }
}
