//! Backpressure reporting
//!
//! The render callback drops [`StatusReport`]s into a bounded queue. This side
//! drains it on the tokio runtime and forwards `buffer_status` upstream when
//! the underrun count moved or the report interval elapsed. Throttling is the
//! producer's decision; the client only reports.

use crossbeam_channel::{Receiver, TryRecvError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;

use crate::audio::controller::StatusReport;
use crate::protocol::{Outbound, StatusMessage};

/// Decides which snapshots are worth sending
#[derive(Debug)]
pub struct BackpressureReporter {
    min_interval: Duration,
    last_underruns: Option<u64>,
    last_emit: Option<Instant>,
    emitted: u64,
}

impl BackpressureReporter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_underruns: None,
            last_emit: None,
            emitted: 0,
        }
    }

    /// One transition per snapshot
    pub fn observe(&mut self, report: &StatusReport, now: Instant) -> Option<StatusMessage> {
        let changed = self.last_underruns != Some(report.underruns);
        let due = self
            .last_emit
            .map_or(true, |last| now.saturating_duration_since(last) >= self.min_interval);
        if !(changed || due) {
            return None;
        }
        self.last_underruns = Some(report.underruns);
        self.last_emit = Some(now);
        self.emitted += 1;
        Some(report.to_message())
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Poll `status_rx` every `poll_interval` until either side disconnects
    pub async fn run(
        mut self,
        status_rx: Receiver<StatusReport>,
        control_tx: mpsc::Sender<Outbound>,
        poll_interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        'outer: loop {
            ticker.tick().await;
            if control_tx.is_closed() {
                break;
            }
            loop {
                let report = match status_rx.try_recv() {
                    Ok(report) => report,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'outer,
                };
                let Some(msg) = self.observe(&report, Instant::now()) else {
                    continue;
                };
                match control_tx.try_send(Outbound::Status(msg)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => tracing::debug!("Control queue full, status dropped"),
                    Err(TrySendError::Closed(_)) => break 'outer,
                }
            }
        }
        tracing::debug!(emitted = self.emitted, "Reporter finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn report(underruns: u64) -> StatusReport {
        StatusReport {
            buffer_ms: 100.0,
            target_ms: 120.0,
            underruns,
            dropped: 0,
            started: true,
        }
    }

    #[test]
    fn test_first_report_always_emitted() {
        let mut reporter = BackpressureReporter::new(Duration::from_secs(1));
        assert!(reporter.observe(&report(0), Instant::now()).is_some());
    }

    #[test]
    fn test_suppressed_until_interval() {
        let mut reporter = BackpressureReporter::new(Duration::from_secs(1));
        let t0 = Instant::now();
        reporter.observe(&report(0), t0);
        assert!(reporter.observe(&report(0), t0 + Duration::from_millis(500)).is_none());
        assert!(reporter.observe(&report(0), t0 + Duration::from_millis(999)).is_none());
        assert!(reporter.observe(&report(0), t0 + Duration::from_millis(1000)).is_some());
        assert_eq!(reporter.emitted(), 2);
    }

    #[test]
    fn test_underrun_change_emits_immediately() {
        let mut reporter = BackpressureReporter::new(Duration::from_secs(1));
        let t0 = Instant::now();
        reporter.observe(&report(0), t0);
        let msg = reporter.observe(&report(1), t0 + Duration::from_millis(10)).unwrap();
        assert_eq!(
            msg,
            StatusMessage::BufferStatus {
                buffer_ms: 100.0,
                target_ms: Some(120.0),
                underruns: 1,
            }
        );
        assert!(reporter.observe(&report(1), t0 + Duration::from_millis(20)).is_none());
    }

    #[tokio::test]
    async fn test_run_forwards_and_exits_on_disconnect() {
        let (status_tx, status_rx) = bounded(8);
        let (control_tx, mut control_rx) = mpsc::channel(8);
        let reporter = BackpressureReporter::new(Duration::from_secs(60));
        let task = tokio::spawn(reporter.run(status_rx, control_tx, Duration::from_millis(5)));

        status_tx.send(report(0)).unwrap();
        status_tx.send(report(0)).unwrap();
        status_tx.send(report(2)).unwrap();

        let first = control_rx.recv().await.unwrap();
        assert!(matches!(first, Outbound::Status(StatusMessage::BufferStatus { underruns: 0, .. })));
        let second = control_rx.recv().await.unwrap();
        assert!(matches!(second, Outbound::Status(StatusMessage::BufferStatus { underruns: 2, .. })));

        drop(status_tx);
        task.await.unwrap();
        assert!(control_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_run_exits_when_transport_gone() {
        let (status_tx, status_rx) = bounded::<StatusReport>(8);
        let (control_tx, control_rx) = mpsc::channel(8);
        drop(control_rx);
        let reporter = BackpressureReporter::new(Duration::from_secs(1));
        status_tx.send(report(0)).unwrap();
        tokio::time::timeout(
            Duration::from_secs(1),
            reporter.run(status_rx, control_tx, Duration::from_millis(5)),
        )
        .await
        .unwrap();
    }
}
