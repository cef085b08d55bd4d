//! Replay - decode the built-in capture corpus as one byte stream.
//!
//! This example demonstrates:
//! - Building a validated key schedule engine
//! - Feeding chunked bytes to the capture worker
//! - Collecting records into a session log and exporting it as JSON
//! - Scoring the key strategy with the validation harness
//!
//! Garbage and a truncated frame are mixed in so the incident path shows up.
//!
//! ```text
//! RUST_LOG=mirwire=debug cargo run --example replay
//! ```

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use mirwire::harness::ValidationHarness;
use mirwire::pipeline::{CaptureEvent, PacketPipeline};
use mirwire::record::SessionLog;
use mirwire::schedule::{function_name, EngineConfig, FixtureTable, KeyScheduleEngine, ObservedKeySchedule};
use mirwire::worker::{spawn_capture_worker, WorkerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mirwire=info")))
        .init();

    let fixtures = FixtureTable::builtin()?;
    let engine = Arc::new(KeyScheduleEngine::try_new(
        ObservedKeySchedule::builtin(),
        fixtures.clone(),
        EngineConfig::default(),
    )?);

    let report = ValidationHarness::run(&engine, &fixtures)?;
    println!(
        "strategy '{}': {:.1}% of fields, {}/{} frames",
        report.strategy,
        report.accuracy(),
        report.matched_frames(),
        report.outcomes.len()
    );

    // Noise in front, a cut-off frame at the end.
    let mut stream = vec![0x00, 0x17, 0x42];
    for fixture in &fixtures {
        stream.extend_from_slice(fixture.frame().raw());
    }
    stream.extend_from_slice(&[0x23, 0x36, 0x3C, 0x3C]);
    let stream = Bytes::from(stream);

    let (tx, rx) = mpsc::channel(16);
    let (_handle, mut events, task) =
        spawn_capture_worker(rx, PacketPipeline::new(Arc::clone(&engine)), WorkerConfig::default());

    tokio::spawn(async move {
        for start in (0..stream.len()).step_by(7) {
            let end = (start + 7).min(stream.len());
            if tx.send(stream.slice(start..end)).await.is_err() {
                break;
            }
        }
    });

    let mut log = SessionLog::new();
    while let Some(event) = events.recv().await {
        match event {
            CaptureEvent::Record(record) => {
                let name = function_name(record.function_code()).unwrap_or("unknown");
                println!(
                    "seq {} {:<12} {} [{}]",
                    record.sequence(),
                    name,
                    record.plaintext(),
                    record.confidence()
                );
                log.push(record);
            }
            CaptureEvent::Incident(incident) => {
                println!("incident {:?}: {} ({})", incident.kind, incident.message, incident.raw_hex);
            }
        }
    }

    let summary = task.await?;
    println!(
        "{} records, {} incidents, {} resyncs",
        summary.records, summary.incidents, summary.stats.resyncs
    );

    log.write_json(std::io::stdout().lock())?;
    println!();
    Ok(())
}
