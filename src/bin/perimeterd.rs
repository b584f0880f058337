//! perimeterd - live intrusion monitoring for one camera
//!
//! Loads the camera's zone, acquires the configured video source in the
//! background and evaluates every frame against the zone until interrupted.

use anyhow::{anyhow, Result};
use perimeter_kernel::config::ConsoleConfig;
use perimeter_kernel::detect::{JsonLinesDetector, ObjectDetector, ScriptedDetector};
use perimeter_kernel::evidence::DEFAULT_EVIDENCE_QUEUE;
use perimeter_kernel::source::{
    device_backend, AcquisitionTask, Commit, HeadlessTarget, HttpFetcher, SourceAcquirer,
    SourceController,
};
use perimeter_kernel::zone::{load_zone, SqliteZoneStore};
use perimeter_kernel::{
    EvidenceWriter, FilesystemEvidenceStore, IntrusionMonitor, SqliteEventLog, TickSinks,
    TickStatus,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const RETRY_AFTER: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = ConsoleConfig::load()?;
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .map_err(|e| anyhow!("failed to install signal handler: {}", e))?;
    }

    let mut zone_store = SqliteZoneStore::open(&cfg.db_path)?;
    let mut event_log = SqliteEventLog::open(&cfg.db_path)?;
    let mut evidence = EvidenceWriter::spawn(
        FilesystemEvidenceStore::new(&cfg.evidence_dir)?,
        DEFAULT_EVIDENCE_QUEUE,
    )?;

    let mut monitor = IntrusionMonitor::new(cfg.monitor.clone());
    match load_zone(&mut zone_store, &cfg.camera_id)? {
        Some(zone) => {
            log::info!(
                "zone {} \"{}\" loaded for {} ({} points)",
                zone.id(),
                zone.name(),
                cfg.camera_id,
                zone.points().len()
            );
            monitor.upsert_zone(zone);
        }
        None => log::warn!(
            "no zone configured for {}; draw one with zonectl set",
            cfg.camera_id
        ),
    }

    let mut detector: Box<dyn ObjectDetector> = match std::env::var("PERIMETER_DETECTION_FEED")
    {
        Ok(path) if !path.trim().is_empty() => Box::new(JsonLinesDetector::open(Path::new(&path))?),
        _ => {
            log::warn!("PERIMETER_DETECTION_FEED not set; no objects will be reported");
            Box::new(ScriptedDetector::new())
        }
    };
    detector.warm_up()?;

    let settings = cfg.acquire_settings();
    let acquirer = SourceAcquirer::new(
        device_backend(cfg.source.device_backend)?,
        Arc::new(HttpFetcher::new(
            cfg.source.probe_timeout,
            settings.max_download_bytes,
        )),
        settings,
    );
    let mut controller = SourceController::new(Box::new(HeadlessTarget::new()));
    let mut task = Some(AcquisitionTask::spawn(
        acquirer.clone(),
        controller.request(cfg.source.kind.clone()),
        cfg.source.probe_timeout,
    )?);
    let mut failed_at: Option<Instant> = None;

    if !monitor.start_monitoring(perimeter_kernel::now_ms()?) {
        log::warn!("monitoring idle until a zone is configured");
    }

    log::info!(
        "perimeterd running. camera={} source={} db={}",
        cfg.camera_id,
        cfg.source.kind,
        cfg.db_path
    );

    let mut last_health_log = Instant::now();
    let mut frames = 0u64;
    let mut intrusions = 0u64;
    let mut events = 0u64;

    while running.load(Ordering::SeqCst) {
        if let Some(outcome) = task.as_mut().and_then(|t| t.poll()) {
            task = None;
            match controller.complete(&outcome.acquisition, outcome.result) {
                Commit::Committed => log::info!("source {} streaming", cfg.source.kind),
                Commit::Discarded => log::debug!("stale acquisition discarded"),
                Commit::Failed(err) => {
                    log::error!("{} ({})", err.operator_message(), err);
                    failed_at = Some(Instant::now());
                }
            }
        }

        if failed_at.is_some_and(|at| at.elapsed() >= RETRY_AFTER) {
            failed_at = None;
            controller.acknowledge_failure();
            log::info!("retrying source {}", cfg.source.kind);
            task = Some(AcquisitionTask::spawn(
                acquirer.clone(),
                controller.request(cfg.source.kind.clone()),
                cfg.source.probe_timeout,
            )?);
        }

        match controller.next_frame() {
            Ok(Some(frame)) => {
                frames += 1;
                let status = monitor.tick(
                    detector.as_mut(),
                    &frame,
                    cfg.surface,
                    perimeter_kernel::now_ms()?,
                    TickSinks {
                        camera_id: &cfg.camera_id,
                        events: &mut event_log,
                        evidence: &mut evidence,
                    },
                );
                if let TickStatus::Evaluated {
                    intrusions: found,
                    events_created,
                    ..
                } = status
                {
                    intrusions += found as u64;
                    events += events_created as u64;
                }
            }
            Ok(None) => {}
            Err(err) => {
                log::error!("{} ({})", err.operator_message(), err);
                failed_at = Some(Instant::now());
            }
        }

        if last_health_log.elapsed() >= Duration::from_secs(5) {
            log::info!(
                "source={} frames={} intrusions={} events={} monitoring={}",
                controller.state().name(),
                frames,
                intrusions,
                events,
                monitor.is_monitoring()
            );
            last_health_log = Instant::now();
        }

        std::thread::sleep(Duration::from_millis(100));
    }

    log::info!("shutting down");
    monitor.stop_monitoring();
    controller.stop();
    if evidence.dropped() > 0 {
        log::warn!("{} evidence snapshot(s) dropped", evidence.dropped());
    }
    evidence.stop()?;
    Ok(())
}
