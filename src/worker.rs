//! Dedicated capture worker.
//!
//! One task owns the scanner. It waits only for the next chunk or the stop
//! signal and pushes results onto an unbounded channel, so emitting never
//! blocks the read side.
//!
//! # Architecture
//!
//! ```text
//! transport ─► mpsc::Receiver<Bytes> ─► Worker Task ─► UnboundedReceiver<CaptureEvent>
//!                                        (scanner + pipeline)
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::pipeline::{CaptureEvent, PacketPipeline};
use crate::protocol::{FrameScanner, ScannerConfig, ScannerSnapshot, ScannerStats};

/// Capture worker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub scanner: ScannerConfig,
    /// On stop, keep an open frame in a snapshot instead of reporting it.
    pub persist_on_stop: bool,
    /// Resume from a snapshot taken by an earlier worker.
    pub resume: Option<ScannerSnapshot>,
}

impl WorkerConfig {
    /// Set the scanner configuration.
    pub fn with_scanner(mut self, scanner: ScannerConfig) -> Self {
        self.scanner = scanner;
        self
    }

    /// Persist the scanner state on stop.
    pub fn persist_on_stop(mut self, persist: bool) -> Self {
        self.persist_on_stop = persist;
        self
    }

    /// Resume from an earlier snapshot.
    pub fn resume_from(mut self, snapshot: ScannerSnapshot) -> Self {
        self.resume = Some(snapshot);
        self
    }
}

/// Why the worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Stop requested (or the handle was dropped).
    Signal,
    /// The chunk sender was dropped.
    InputClosed,
    /// Nobody is listening for events any more.
    OutputClosed,
}

/// Final account of a worker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub reason: StopReason,
    pub stats: ScannerStats,
    pub records: u64,
    pub incidents: u64,
    /// Scanner state, when `persist_on_stop` was set.
    pub snapshot: Option<ScannerSnapshot>,
}

/// Handle for stopping the worker.
///
/// Dropping the handle also stops the worker.
#[derive(Debug)]
pub struct CaptureHandle {
    stop: oneshot::Sender<()>,
}

impl CaptureHandle {
    /// Request a cooperative stop.
    pub fn stop(self) {
        // The worker may already be gone; nothing to do then.
        let _ = self.stop.send(());
    }
}

/// Spawn the capture worker.
///
/// # Returns
///
/// `(CaptureHandle, event receiver, JoinHandle)`; the join handle yields
/// the [`WorkerSummary`] once the worker stops.
pub fn spawn_capture_worker(
    chunks: mpsc::Receiver<Bytes>,
    pipeline: PacketPipeline,
    config: WorkerConfig,
) -> (
    CaptureHandle,
    mpsc::UnboundedReceiver<CaptureEvent>,
    JoinHandle<WorkerSummary>,
) {
    let (stop_tx, stop_rx) = oneshot::channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(capture_loop(chunks, stop_rx, events_tx, pipeline, config));

    (CaptureHandle { stop: stop_tx }, events_rx, task)
}

struct Emitter {
    tx: mpsc::UnboundedSender<CaptureEvent>,
    records: u64,
    incidents: u64,
}

impl Emitter {
    /// Returns false once the receiver is gone.
    fn emit(&mut self, event: CaptureEvent) -> bool {
        match &event {
            CaptureEvent::Record(_) => self.records += 1,
            CaptureEvent::Incident(_) => self.incidents += 1,
        }
        self.tx.send(event).is_ok()
    }
}

async fn capture_loop(
    mut chunks: mpsc::Receiver<Bytes>,
    mut stop: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    pipeline: PacketPipeline,
    config: WorkerConfig,
) -> WorkerSummary {
    let mut scanner = match config.resume {
        Some(snapshot) => FrameScanner::restore(snapshot, config.scanner),
        None => FrameScanner::with_config(config.scanner),
    };
    let mut out = Emitter {
        tx: events,
        records: 0,
        incidents: 0,
    };

    let reason = 'run: loop {
        tokio::select! {
            biased;
            _ = &mut stop => break 'run StopReason::Signal,
            chunk = chunks.recv() => {
                let Some(chunk) = chunk else {
                    break 'run StopReason::InputClosed;
                };
                for event in scanner.push(&chunk) {
                    if !out.emit(pipeline.handle(event)) {
                        break 'run StopReason::OutputClosed;
                    }
                }
            }
        }
    };

    let snapshot = if config.persist_on_stop {
        Some(scanner.snapshot())
    } else {
        for event in scanner.close() {
            if !out.emit(pipeline.handle(event)) {
                break;
            }
        }
        None
    };

    let stats = scanner.stats();
    tracing::debug!(
        ?reason,
        frames = stats.frames,
        resyncs = stats.resyncs,
        records = out.records,
        incidents = out.incidents,
        "capture worker stopped"
    );

    WorkerSummary {
        reason,
        stats,
        records: out.records,
        incidents: out.incidents,
        snapshot,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::pipeline::IncidentKind;
    use crate::schedule::{EngineConfig, FixtureTable, KeyScheduleEngine, ObservedKeySchedule};

    fn pipeline() -> PacketPipeline {
        let engine = KeyScheduleEngine::try_new(
            ObservedKeySchedule::builtin(),
            FixtureTable::builtin().unwrap(),
            EngineConfig::default(),
        )
        .unwrap();
        PacketPipeline::new(Arc::new(engine))
    }

    fn move_frame() -> Bytes {
        let fixtures = FixtureTable::builtin().unwrap();
        fixtures.get("move").unwrap().frame().raw_bytes()
    }

    #[tokio::test]
    async fn test_worker_decodes_fragmented_chunks() {
        let (tx, rx) = mpsc::channel(8);
        let (_handle, mut events, task) = spawn_capture_worker(rx, pipeline(), WorkerConfig::default());

        let frame = move_frame();
        tx.send(frame.slice(..5)).await.unwrap();
        tx.send(frame.slice(5..)).await.unwrap();
        drop(tx);

        let event = events.recv().await.unwrap();
        assert_eq!(event.record().unwrap().function_code(), 0x0BC5);

        let summary = task.await.unwrap();
        assert_eq!(summary.reason, StopReason::InputClosed);
        assert_eq!(summary.records, 1);
        assert_eq!(summary.incidents, 0);
        assert_eq!(summary.stats.frames, 1);
    }

    #[tokio::test]
    async fn test_stop_reports_open_frame() {
        let (tx, rx) = mpsc::channel(8);
        let (handle, mut events, task) = spawn_capture_worker(rx, pipeline(), WorkerConfig::default());

        tx.send(move_frame().slice(..10)).await.unwrap();
        // Let the worker consume the chunk before stopping.
        while tx.capacity() < 8 {
            tokio::task::yield_now().await;
        }
        handle.stop();

        let summary = task.await.unwrap();
        assert_eq!(summary.reason, StopReason::Signal);
        assert!(summary.snapshot.is_none());

        let event = events.recv().await.unwrap();
        let incident = event.incident().unwrap();
        assert_eq!(incident.kind, IncidentKind::Framing);
        assert!(incident.message.contains("stream closed mid-frame"));
        drop(tx);
    }

    #[tokio::test]
    async fn test_persist_on_stop_then_resume() {
        let frame = move_frame();

        let (tx, rx) = mpsc::channel(8);
        let config = WorkerConfig::default().persist_on_stop(true);
        let (handle, mut events, task) = spawn_capture_worker(rx, pipeline(), config);
        tx.send(frame.slice(..10)).await.unwrap();
        while tx.capacity() < 8 {
            tokio::task::yield_now().await;
        }
        handle.stop();

        let summary = task.await.unwrap();
        let snapshot = summary.snapshot.unwrap();
        assert_eq!(snapshot.buffer.len(), 10);
        assert!(events.recv().await.is_none());

        let (tx, rx) = mpsc::channel(8);
        let config = WorkerConfig::default().resume_from(snapshot);
        let (_handle, mut events, task) = spawn_capture_worker(rx, pipeline(), config);
        tx.send(frame.slice(10..)).await.unwrap();
        drop(tx);

        let event = events.recv().await.unwrap();
        assert_eq!(event.record().unwrap().frame().raw(), &frame[..]);
        assert_eq!(task.await.unwrap().reason, StopReason::InputClosed);
    }

    #[tokio::test]
    async fn test_worker_stops_when_output_dropped() {
        let (tx, rx) = mpsc::channel(8);
        let (_handle, events, task) = spawn_capture_worker(rx, pipeline(), WorkerConfig::default());
        drop(events);

        tx.send(move_frame()).await.unwrap();
        let summary = task.await.unwrap();
        assert_eq!(summary.reason, StopReason::OutputClosed);
    }
}
