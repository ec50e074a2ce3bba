//! Client session
//!
//! [`StreamClient`] is the consumer-facing surface: it owns the transport
//! manager, the ingest task and the reporter task for one stream, and
//! guarantees that `stop` leaves nothing running.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::audio::playback::SinkFactory;
use crate::config::AppConfig;
use crate::constants::{INGEST_QUEUE_DEPTH, STATUS_QUEUE_DEPTH};
use crate::error::Result;
use crate::ingest::{IngestChannel, IngestStats};
use crate::network::manager::{TransportKind, TransportManager, TransportState, Transition};
use crate::report::BackpressureReporter;

/// Longest wait for the ingest task to release the output on stop
const INGEST_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

struct ActiveSession {
    id: Uuid,
    ingest: JoinHandle<IngestStats>,
    reporter: JoinHandle<()>,
}

/// One live audio stream from a producer to the local output
pub struct StreamClient {
    config: AppConfig,
    sink_factory: SinkFactory,
    transport: TransportManager,
    active: Option<ActiveSession>,
}

impl StreamClient {
    pub fn new(config: AppConfig, sink_factory: SinkFactory) -> Self {
        let transport = TransportManager::new(config.transport.clone());
        Self {
            config,
            sink_factory,
            transport,
            active: None,
        }
    }

    /// Connect and wire the transport to the audio path.
    ///
    /// Returns once a transport is connected. Calling it on a connected
    /// client does nothing.
    pub async fn start(&mut self) -> Result<()> {
        if self.active.is_some() {
            if self.transport.state().is_connected() {
                return Ok(());
            }
            // Transport dropped since the last start
            self.stop().await;
        }

        let id = Uuid::new_v4();
        let span = tracing::info_span!("session", %id);

        let (ingest_tx, ingest_rx) = mpsc::channel(INGEST_QUEUE_DEPTH);
        let (status_tx, status_rx) = crossbeam_channel::bounded(STATUS_QUEUE_DEPTH);
        let ingest = IngestChannel::new(
            self.config.buffer.clone(),
            &self.config.report,
            (self.sink_factory)(),
            status_tx,
        );
        let ingest = tokio::spawn(ingest.run(ingest_rx).instrument(span.clone()));

        let kind = match self.transport.start(ingest_tx).instrument(span.clone()).await {
            Ok(kind) => kind,
            Err(e) => {
                ingest.abort();
                let _ = ingest.await;
                return Err(e.into());
            }
        };

        let reporter = match self.transport.control_sender() {
            Some(control_tx) => {
                let reporter = BackpressureReporter::new(Duration::from_millis(self.config.report.min_interval_ms));
                let poll = Duration::from_millis(self.config.report.poll_interval_ms.max(1));
                tokio::spawn(reporter.run(status_rx, control_tx, poll).instrument(span.clone()))
            }
            None => tokio::spawn(async {}),
        };

        span.in_scope(|| tracing::info!(?kind, "Session started"));
        self.active = Some(ActiveSession { id, ingest, reporter });
        Ok(())
    }

    /// Tear down transport, ingest and reporting. Idempotent.
    pub async fn stop(&mut self) {
        self.transport.stop().await;

        let Some(session) = self.active.take() else {
            return;
        };
        session.reporter.abort();
        let _ = session.reporter.await;

        // Transport senders are gone, so ingest drains and releases the output
        let mut ingest = session.ingest;
        match tokio::time::timeout(INGEST_DRAIN_TIMEOUT, &mut ingest).await {
            Ok(Ok(stats)) => tracing::info!(id = %session.id, ?stats, "Session stopped"),
            Ok(Err(e)) => tracing::warn!(id = %session.id, error = %e, "Ingest task failed"),
            Err(_) => {
                ingest.abort();
                let _ = ingest.await;
                tracing::warn!(id = %session.id, "Ingest did not drain, aborted");
            }
        }
    }

    /// Observe transport state changes
    pub fn state(&self) -> watch::Receiver<TransportState> {
        self.transport.subscribe()
    }

    pub fn active_kind(&self) -> Option<TransportKind> {
        self.transport.active_kind()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.active.as_ref().map(|s| s.id)
    }

    pub fn transport_history(&self) -> Vec<Transition> {
        self.transport.history()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        if let Some(session) = self.active.take() {
            session.reporter.abort();
            session.ingest.abort();
        }
    }
}
