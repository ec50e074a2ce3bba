//! Transport negotiation
//!
//! ```text
//!          Start{prefer_rtc}               Connected
//!   Idle ─────────────────▶ Connecting(Rtc) ─────────▶ Connected(Rtc)
//!    │                            │ Failed                   │
//!    │ Start{force_fallback}      ▼                          │ Lost(Rtc)
//!    └──────────────────▶ Connecting(Fallback) ──Connected──▶ Connected(Fallback)
//!                                 │ Failed                   │ Lost(Fallback)
//!                                 ▼                          ▼
//!                                Idle ◀────────────────────Idle
//! ```
//!
//! `Stopped` returns to `Idle` from anywhere.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

use crate::config::{TransportConfig, TransportPolicy};
use crate::constants::TRANSPORT_HISTORY_LEN;
use crate::error::TransportError;
use crate::network::stream::PcmStream;
use crate::protocol::{IngestMessage, Outbound};

#[cfg(feature = "rtc")]
use crate::network::rtc::RtcSession;

/// Delivery channel kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// WebRTC media track (unreliable, low latency)
    Rtc,
    /// WebSocket raw PCM (reliable byte stream)
    Fallback,
}

/// Transport lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportState {
    #[default]
    Idle,
    Connecting(TransportKind),
    Connected(TransportKind),
}

/// Inputs to the transport state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Start { policy: TransportPolicy },
    Connected,
    Failed,
    Stopped,
    Lost(TransportKind),
}

impl TransportState {
    /// Single synchronous transition; events that do not apply leave the state unchanged
    pub fn next(self, event: TransportEvent) -> Self {
        use TransportKind::*;
        use TransportState::*;

        match (self, event) {
            (_, TransportEvent::Stopped) => Idle,
            (Idle, TransportEvent::Start { policy }) => match policy {
                TransportPolicy::PreferRtc => Connecting(Rtc),
                TransportPolicy::ForceFallback => Connecting(Fallback),
            },
            (Connecting(kind), TransportEvent::Connected) => Connected(kind),
            (Connecting(Rtc), TransportEvent::Failed) => Connecting(Fallback),
            (Connecting(Fallback), TransportEvent::Failed) => Idle,
            (Connected(kind), TransportEvent::Lost(lost)) if kind == lost => Idle,
            (state, _) => state,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, TransportState::Connected(_))
    }

    pub fn kind(&self) -> Option<TransportKind> {
        match self {
            TransportState::Idle => None,
            TransportState::Connecting(kind) | TransportState::Connected(kind) => Some(*kind),
        }
    }
}

/// One recorded transition
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub from: TransportState,
    pub event: TransportEvent,
    pub to: TransportState,
    pub at: Instant,
}

struct Shared {
    state_tx: watch::Sender<TransportState>,
    history: Mutex<VecDeque<Transition>>,
    /// Bumped on every start; stale loss reports are ignored
    generation: AtomicU64,
    lost_generation: AtomicU64,
}

impl Shared {
    fn apply(&self, event: TransportEvent) -> TransportState {
        let mut history = self.history.lock();
        let from = *self.state_tx.borrow();
        let to = from.next(event);
        self.state_tx.send_replace(to);

        if history.len() == TRANSPORT_HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(Transition {
            from,
            event,
            to,
            at: Instant::now(),
        });
        tracing::debug!(?from, ?event, ?to, "Transport transition");
        to
    }
}

/// Handed to a transport's reader so it can report a dropped connection
#[derive(Clone)]
pub struct LossNotifier {
    shared: Arc<Shared>,
    generation: u64,
    kind: TransportKind,
}

impl LossNotifier {
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn lost(&self) {
        self.shared.lost_generation.store(self.generation, Ordering::SeqCst);
        if self.shared.generation.load(Ordering::SeqCst) == self.generation {
            self.shared.apply(TransportEvent::Lost(self.kind));
        }
    }
}

enum ActiveTransport {
    #[cfg(feature = "rtc")]
    Rtc(RtcSession),
    Stream(PcmStream),
}

impl ActiveTransport {
    fn kind(&self) -> TransportKind {
        match self {
            #[cfg(feature = "rtc")]
            ActiveTransport::Rtc(_) => TransportKind::Rtc,
            ActiveTransport::Stream(_) => TransportKind::Fallback,
        }
    }

    fn control_sender(&self) -> mpsc::Sender<Outbound> {
        match self {
            #[cfg(feature = "rtc")]
            ActiveTransport::Rtc(session) => session.control_sender(),
            ActiveTransport::Stream(stream) => stream.control_sender(),
        }
    }

    async fn close(&mut self) {
        match self {
            #[cfg(feature = "rtc")]
            ActiveTransport::Rtc(session) => session.close().await,
            ActiveTransport::Stream(stream) => stream.close().await,
        }
    }
}

/// Owns at most one live transport
pub struct TransportManager {
    config: TransportConfig,
    shared: Arc<Shared>,
    active: Option<ActiveTransport>,
}

impl TransportManager {
    pub fn new(config: TransportConfig) -> Self {
        let (state_tx, _) = watch::channel(TransportState::Idle);
        Self {
            config,
            shared: Arc::new(Shared {
                state_tx,
                history: Mutex::new(VecDeque::with_capacity(TRANSPORT_HISTORY_LEN)),
                generation: AtomicU64::new(0),
                lost_generation: AtomicU64::new(0),
            }),
            active: None,
        }
    }

    /// Establish a transport feeding `ingest_tx`.
    ///
    /// Returns immediately if already connected. Fails only when every
    /// allowed transport failed.
    pub async fn start(
        &mut self,
        ingest_tx: mpsc::Sender<IngestMessage>,
    ) -> Result<TransportKind, TransportError> {
        if let (Some(active), true) = (&self.active, self.state().is_connected()) {
            return Ok(active.kind());
        }
        // A transport that dropped on its own still holds resources
        self.close_active().await;

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let policy = self.config.policy;
        self.shared.apply(TransportEvent::Start { policy });

        let preferred_error = match policy {
            TransportPolicy::PreferRtc => {
                let notifier = self.notifier(generation, TransportKind::Rtc);
                match self.connect_preferred(ingest_tx.clone(), notifier).await {
                    Ok(active) => return Ok(self.activate(active, generation)),
                    Err(e) => {
                        tracing::warn!(error = %e, "Preferred transport failed, falling back");
                        self.shared.apply(TransportEvent::Failed);
                        e.to_string()
                    }
                }
            }
            TransportPolicy::ForceFallback => "skipped by policy".to_string(),
        };

        let notifier = self.notifier(generation, TransportKind::Fallback);
        let timeout_ms = self.config.fallback_timeout_ms;
        let connect = PcmStream::connect(&self.config.stream_url, ingest_tx, notifier);
        let result = match tokio::time::timeout(Duration::from_millis(timeout_ms), connect).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectTimeout(timeout_ms)),
        };

        match result {
            Ok(stream) => Ok(self.activate(ActiveTransport::Stream(stream), generation)),
            Err(e) => {
                tracing::error!(error = %e, "Fallback transport failed");
                self.shared.apply(TransportEvent::Failed);
                Err(TransportError::AllTransportsFailed {
                    preferred: preferred_error,
                    fallback: e.to_string(),
                })
            }
        }
    }

    /// Tear down whatever is active. Idempotent.
    pub async fn stop(&mut self) {
        // Invalidate loss reports from the transport being closed
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.close_active().await;
        if self.state() != TransportState::Idle {
            self.shared.apply(TransportEvent::Stopped);
        }
    }

    pub fn state(&self) -> TransportState {
        *self.shared.state_tx.borrow()
    }

    /// Observe state changes
    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.shared.state_tx.subscribe()
    }

    /// Kind of the connected transport, if any
    pub fn active_kind(&self) -> Option<TransportKind> {
        match self.state() {
            TransportState::Connected(kind) => Some(kind),
            _ => None,
        }
    }

    /// Queue for upstream control messages on the active transport
    pub fn control_sender(&self) -> Option<mpsc::Sender<Outbound>> {
        self.active.as_ref().map(|a| a.control_sender())
    }

    /// Recent transitions, oldest first
    pub fn history(&self) -> Vec<Transition> {
        self.shared.history.lock().iter().copied().collect()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub(crate) fn notifier(&self, generation: u64, kind: TransportKind) -> LossNotifier {
        LossNotifier {
            shared: self.shared.clone(),
            generation,
            kind,
        }
    }

    fn activate(&mut self, active: ActiveTransport, generation: u64) -> TransportKind {
        let kind = active.kind();
        self.active = Some(active);
        self.shared.apply(TransportEvent::Connected);
        tracing::info!(?kind, "Transport connected");

        // Lost before Connected was recorded
        if self.shared.lost_generation.load(Ordering::SeqCst) == generation {
            self.shared.apply(TransportEvent::Lost(kind));
        }
        kind
    }

    async fn close_active(&mut self) {
        if let Some(mut active) = self.active.take() {
            let kind = active.kind();
            active.close().await;
            tracing::info!(?kind, "Transport closed");
        }
    }

    #[cfg(feature = "rtc")]
    async fn connect_preferred(
        &self,
        ingest_tx: mpsc::Sender<IngestMessage>,
        notifier: LossNotifier,
    ) -> Result<ActiveTransport, TransportError> {
        RtcSession::connect(&self.config, ingest_tx, notifier)
            .await
            .map(ActiveTransport::Rtc)
    }

    #[cfg(not(feature = "rtc"))]
    async fn connect_preferred(
        &self,
        _ingest_tx: mpsc::Sender<IngestMessage>,
        _notifier: LossNotifier,
    ) -> Result<ActiveTransport, TransportError> {
        Err(TransportError::Unavailable)
    }
}
