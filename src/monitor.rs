//! Intrusion monitor.
//!
//! One `tick` per rendered frame while monitoring is on:
//!
//! 1. ask the detector for the frame's objects;
//! 2. keep relevant labels above the confidence floor;
//! 3. rescale boxes from the detector's frame onto the rendering surface;
//! 4. test every object against every active zone (also placed on the
//!    surface) with the sampled overlap ratio;
//! 5. for each intrusion bump the zone counters, push an alert and request
//!    evidence; the event log receives at most one event per throttle window;
//! 6. publish all objects and intrusions as the tick's `DetectionResult`,
//!    replacing the previous one.
//!
//! Detector errors skip the tick. Event and evidence failures are logged and
//! never stop monitoring.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};

use crate::detect::{DetectedObject, Detections, ObjectDetector};
use crate::events::{EventSink, SecurityEvent};
use crate::evidence::{EvidenceMetadata, EvidenceSink};
use crate::frame::VideoFrame;
use crate::geometry::{bbox_inside_ratio, FrameSize, SampleGrid};
use crate::zone::Zone;

pub const DEFAULT_LABELS: [&str; 8] = [
    "person",
    "dog",
    "cat",
    "bird",
    "car",
    "truck",
    "motorcycle",
    "bicycle",
];

#[derive(Clone, Debug, PartialEq)]
pub struct MonitorConfig {
    /// Labels that can trigger an intrusion.
    pub labels: Vec<String>,
    /// Detections must score strictly above this.
    pub min_confidence: f64,
    /// Overlap ratio at or above which an object intrudes.
    pub overlap_threshold: f64,
    pub grid: SampleGrid,
    pub event_throttle_ms: u64,
    pub alert_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            labels: DEFAULT_LABELS.iter().map(|l| l.to_string()).collect(),
            min_confidence: 0.3,
            overlap_threshold: 0.1,
            grid: SampleGrid::default(),
            event_throttle_ms: 3_000,
            alert_capacity: 10,
        }
    }
}

impl MonitorConfig {
    pub fn is_relevant(&self, label: &str, confidence: f64) -> bool {
        confidence > self.min_confidence && self.labels.iter().any(|l| l == label)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Intrusion,
    Warning,
    Success,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Alert {
    pub id: u64,
    pub message: String,
    pub kind: AlertKind,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Intrusion {
    pub object: DetectedObject,
    pub zone_id: String,
    pub overlap: f64,
    pub timestamp_ms: u64,
}

/// Everything the renderer draws for one tick.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DetectionResult {
    pub objects: Vec<DetectedObject>,
    pub intrusions: Vec<Intrusion>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ZoneStats {
    pub intrusion_count: u64,
    pub last_intrusion_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TickStatus {
    /// Monitoring is off; nothing ran.
    Inactive,
    /// Detector failed; the tick was skipped.
    DetectorFailed,
    Evaluated {
        objects: usize,
        intrusions: usize,
        events_created: usize,
    },
}

/// The collaborators a tick reports to.
pub struct TickSinks<'a> {
    pub camera_id: &'a str,
    pub events: &'a mut dyn EventSink,
    pub evidence: &'a mut dyn EvidenceSink,
}

pub struct IntrusionMonitor {
    config: MonitorConfig,
    zones: Vec<Zone>,
    stats: HashMap<String, ZoneStats>,
    alerts: VecDeque<Alert>,
    next_alert_id: u64,
    last_event_at_ms: Option<u64>,
    monitoring_active: bool,
    last_result: Option<DetectionResult>,
}

impl IntrusionMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            zones: Vec::new(),
            stats: HashMap::new(),
            alerts: VecDeque::new(),
            next_alert_id: 1,
            last_event_at_ms: None,
            monitoring_active: false,
            last_result: None,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    // -------------------- zones --------------------

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    /// Insert `zone`, or replace the zone with the same id (counters kept).
    pub fn upsert_zone(&mut self, zone: Zone) {
        self.stats.entry(zone.id().to_string()).or_default();
        match self.zones.iter_mut().find(|z| z.id() == zone.id()) {
            Some(existing) => *existing = zone,
            None => self.zones.push(zone),
        }
    }

    /// Flip a zone's active flag; returns the new state.
    pub fn toggle_zone(&mut self, zone_id: &str) -> Option<bool> {
        let zone = self.zones.iter_mut().find(|z| z.id() == zone_id)?;
        let active = !zone.is_active();
        zone.set_active(active);
        log::info!(
            "zone {} {}",
            zone_id,
            if active { "activated" } else { "deactivated" }
        );
        Some(active)
    }

    pub fn remove_zone(&mut self, zone_id: &str) -> Option<Zone> {
        let index = self.zones.iter().position(|z| z.id() == zone_id)?;
        self.stats.remove(zone_id);
        Some(self.zones.remove(index))
    }

    pub fn stats(&self, zone_id: &str) -> Option<ZoneStats> {
        self.stats.get(zone_id).copied()
    }

    // -------------------- lifecycle --------------------

    pub fn is_monitoring(&self) -> bool {
        self.monitoring_active
    }

    /// Refuses, with a warning alert, when no zone is configured.
    pub fn start_monitoring(&mut self, now_ms: u64) -> bool {
        if self.zones.is_empty() {
            self.push_alert(
                AlertKind::Warning,
                "Draw a detection zone before starting monitoring".to_string(),
                now_ms,
            );
            return false;
        }
        self.monitoring_active = true;
        self.push_alert(
            AlertKind::Success,
            format!("Monitoring started ({} zone(s))", self.zones.len()),
            now_ms,
        );
        log::info!("monitoring started with {} zone(s)", self.zones.len());
        true
    }

    pub fn stop_monitoring(&mut self) {
        self.monitoring_active = false;
        self.last_result = None;
        log::info!("monitoring stopped");
    }

    // -------------------- alerts --------------------

    /// Newest first.
    pub fn alerts(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter()
    }

    pub fn clear_alerts(&mut self) {
        self.alerts.clear();
    }

    pub fn push_alert(&mut self, kind: AlertKind, message: String, now_ms: u64) {
        let alert = Alert {
            id: self.next_alert_id,
            message,
            kind,
            timestamp_ms: now_ms,
        };
        self.next_alert_id += 1;
        self.alerts.push_front(alert);
        self.alerts.truncate(self.config.alert_capacity);
    }

    /// Result published by the latest evaluated tick.
    pub fn last_result(&self) -> Option<&DetectionResult> {
        self.last_result.as_ref()
    }

    // -------------------- evaluation --------------------

    pub fn tick(
        &mut self,
        detector: &mut dyn ObjectDetector,
        frame: &VideoFrame,
        surface: FrameSize,
        now_ms: u64,
        mut sinks: TickSinks<'_>,
    ) -> TickStatus {
        if !self.monitoring_active {
            return TickStatus::Inactive;
        }
        let detections = match detector.detect(frame) {
            Ok(detections) => detections,
            Err(err) => {
                log::warn!("detector {} failed; skipping tick: {:#}", detector.name(), err);
                return TickStatus::DetectorFailed;
            }
        };

        let result = self.evaluate(&detections, surface, now_ms);
        let mut events_created = 0;
        for intrusion in &result.intrusions {
            if self.record_intrusion(intrusion, frame, now_ms, &mut sinks) {
                events_created += 1;
            }
        }
        let status = TickStatus::Evaluated {
            objects: result.objects.len(),
            intrusions: result.intrusions.len(),
            events_created,
        };
        self.last_result = Some(result);
        status
    }

    /// Pure evaluation of one set of detections against the active zones.
    pub fn evaluate(
        &self,
        detections: &Detections,
        surface: FrameSize,
        now_ms: u64,
    ) -> DetectionResult {
        let (sx, sy) = detections.frame_size.scale_to(surface).unwrap_or_else(|| {
            log::warn!(
                "detector frame size {:?} unusable; boxes left unscaled",
                detections.frame_size
            );
            (1.0, 1.0)
        });
        let objects: Vec<DetectedObject> = detections
            .objects
            .iter()
            .filter(|raw| self.config.is_relevant(&raw.label, raw.confidence))
            .map(|raw| DetectedObject::from_raw(raw, sx, sy))
            .collect();

        let mut intrusions = Vec::new();
        for zone in self.zones.iter().filter(|z| z.is_active()) {
            let polygon = zone.normalize(surface);
            for object in &objects {
                let overlap = bbox_inside_ratio(&object.bbox, &polygon, self.config.grid);
                if overlap >= self.config.overlap_threshold {
                    intrusions.push(Intrusion {
                        object: object.clone(),
                        zone_id: zone.id().to_string(),
                        overlap,
                        timestamp_ms: now_ms,
                    });
                }
            }
        }
        DetectionResult {
            objects,
            intrusions,
        }
    }

    /// Counters, alert, evidence and (throttled) event for one intrusion.
    /// Returns whether an event was created.
    fn record_intrusion(
        &mut self,
        intrusion: &Intrusion,
        frame: &VideoFrame,
        now_ms: u64,
        sinks: &mut TickSinks<'_>,
    ) -> bool {
        let zone_name = self
            .zones
            .iter()
            .find(|z| z.id() == intrusion.zone_id)
            .map(|z| z.name().to_string())
            .unwrap_or_else(|| intrusion.zone_id.clone());
        let label = &intrusion.object.label;

        let stats = self.stats.entry(intrusion.zone_id.clone()).or_default();
        stats.intrusion_count += 1;
        stats.last_intrusion_ms = Some(now_ms);
        log::info!(
            "intrusion: {} ({:.2}) in zone {} overlap {:.2}",
            label,
            intrusion.object.confidence,
            intrusion.zone_id,
            intrusion.overlap
        );

        self.push_alert(
            AlertKind::Intrusion,
            format!("INTRUSION DETECTED! {} entered zone \"{}\"", label, zone_name),
            now_ms,
        );

        let metadata = EvidenceMetadata {
            camera_id: sinks.camera_id.to_string(),
            zone_id: intrusion.zone_id.clone(),
            zone_name: zone_name.clone(),
            object_label: label.clone(),
            confidence: intrusion.object.confidence,
            timestamp_ms: now_ms,
        };
        if let Err(err) = sinks.evidence.capture(frame, &metadata) {
            log::warn!("evidence capture for zone {} failed: {:#}", intrusion.zone_id, err);
        }

        if !self.event_window_open(now_ms) {
            log::debug!("event for zone {} suppressed by throttle", intrusion.zone_id);
            return false;
        }
        let event = SecurityEvent::intrusion(
            sinks.camera_id,
            &intrusion.zone_id,
            &zone_name,
            label,
            intrusion.object.confidence,
            intrusion.object.bbox,
            now_ms,
        );
        match sinks.events.create_event(&event) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("security event for zone {} failed: {:#}", intrusion.zone_id, err);
                false
            }
        }
    }

    /// Read-compare-write of the throttle timestamp. The window is claimed
    /// even if the event log then fails, so a broken log is not hammered.
    fn event_window_open(&mut self, now_ms: u64) -> bool {
        let open = match self.last_event_at_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) > self.config.event_throttle_ms,
        };
        if open {
            self.last_event_at_ms = Some(now_ms);
        }
        open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{RawDetection, ScriptedDetector};
    use crate::events::InMemoryEventLog;
    use crate::evidence::InMemoryEvidence;
    use crate::geometry::{BoundingBox, Point};

    const SURFACE: FrameSize = FrameSize::new(640.0, 480.0);

    fn gate() -> Zone {
        Zone::new(
            "zone:gate",
            "Gate",
            vec![
                Point::new(10.0, 10.0),
                Point::new(10.0, 100.0),
                Point::new(100.0, 100.0),
                Point::new(100.0, 10.0),
            ],
            Some(SURFACE),
        )
        .unwrap()
    }

    fn person_at(bbox: BoundingBox) -> Detections {
        Detections::new(SURFACE, vec![RawDetection::new("person", 0.9, bbox)])
    }

    fn inside() -> Detections {
        person_at(BoundingBox::new(20.0, 20.0, 80.0, 80.0))
    }

    struct Harness {
        monitor: IntrusionMonitor,
        events: InMemoryEventLog,
        evidence: InMemoryEvidence,
        frame: VideoFrame,
    }

    impl Harness {
        fn new() -> Self {
            let mut monitor = IntrusionMonitor::new(MonitorConfig::default());
            monitor.upsert_zone(gate());
            assert!(monitor.start_monitoring(0));
            Self {
                monitor,
                events: InMemoryEventLog::new(),
                evidence: InMemoryEvidence::new(),
                frame: VideoFrame::filled(4, 4, [0, 0, 0], 0).unwrap(),
            }
        }

        fn tick(&mut self, detector: &mut dyn ObjectDetector, now_ms: u64) -> TickStatus {
            self.monitor.tick(
                detector,
                &self.frame,
                SURFACE,
                now_ms,
                TickSinks {
                    camera_id: "camera:front",
                    events: &mut self.events,
                    evidence: &mut self.evidence,
                },
            )
        }
    }

    #[test]
    fn enclosed_person_is_one_intrusion() {
        let mut h = Harness::new();
        assert_eq!(h.monitor.stats("zone:gate").unwrap().intrusion_count, 0);
        let mut detector = ScriptedDetector::new().then(inside());

        let status = h.tick(&mut detector, 1_000);
        assert_eq!(
            status,
            TickStatus::Evaluated {
                objects: 1,
                intrusions: 1,
                events_created: 1
            }
        );
        let result = h.monitor.last_result().unwrap();
        assert_eq!(result.intrusions[0].overlap, 1.0);
        assert_eq!(result.intrusions[0].zone_id, "zone:gate");

        let stats = h.monitor.stats("zone:gate").unwrap();
        assert_eq!(stats.intrusion_count, 1);
        assert_eq!(stats.last_intrusion_ms, Some(1_000));

        let newest = h.monitor.alerts().next().unwrap();
        assert_eq!(newest.kind, AlertKind::Intrusion);
        assert_eq!(newest.message, "INTRUSION DETECTED! person entered zone \"Gate\"");
        assert_eq!(h.evidence.captured.len(), 1);
        assert_eq!(h.evidence.captured[0].zone_name, "Gate");
        assert_eq!(h.events.events[0].camera_id, "camera:front");
    }

    #[test]
    fn events_are_throttled_to_one_per_window() {
        let mut h = Harness::new();
        let mut detector = ScriptedDetector::new()
            .then(inside())
            .then(inside())
            .then(inside());
        h.tick(&mut detector, 0);
        h.tick(&mut detector, 1_000);
        h.tick(&mut detector, 4_000);

        assert_eq!(h.events.events.len(), 2);
        assert_eq!(h.events.events[1].timestamp_ms, 4_000);
        // Counters, alerts and evidence are not throttled.
        assert_eq!(h.monitor.stats("zone:gate").unwrap().intrusion_count, 3);
        assert_eq!(h.evidence.captured.len(), 3);
    }

    #[test]
    fn failing_event_log_still_claims_the_window() {
        let mut h = Harness::new();
        h.events.fail_with = Some("offline".to_string());
        let mut detector = ScriptedDetector::new().then(inside()).then(inside());
        assert!(matches!(
            h.tick(&mut detector, 0),
            TickStatus::Evaluated { events_created: 0, .. }
        ));
        h.events.fail_with = None;
        h.tick(&mut detector, 500);
        assert!(h.events.events.is_empty());
        assert_eq!(h.monitor.stats("zone:gate").unwrap().intrusion_count, 2);
    }

    #[test]
    fn detector_failure_skips_tick_and_monitoring_continues() {
        let mut h = Harness::new();
        let mut detector = ScriptedDetector::new()
            .then(inside())
            .then_fail("model reload")
            .then(Detections::empty(SURFACE));
        h.tick(&mut detector, 0);
        assert_eq!(h.tick(&mut detector, 100), TickStatus::DetectorFailed);
        assert_eq!(h.monitor.last_result().unwrap().intrusions.len(), 1);

        assert!(matches!(
            h.tick(&mut detector, 200),
            TickStatus::Evaluated { objects: 0, .. }
        ));
        // Replaced, never merged.
        assert!(h.monitor.last_result().unwrap().intrusions.is_empty());
        assert!(h.monitor.is_monitoring());
    }

    #[test]
    fn irrelevant_or_weak_detections_are_dropped() {
        let monitor = {
            let mut m = IntrusionMonitor::new(MonitorConfig::default());
            m.upsert_zone(gate());
            m
        };
        let bbox = BoundingBox::new(20.0, 20.0, 80.0, 80.0);
        let detections = Detections::new(
            SURFACE,
            vec![
                RawDetection::new("chair", 0.99, bbox),
                RawDetection::new("person", 0.3, bbox),
                RawDetection::new("dog", 0.31, bbox),
            ],
        );
        let result = monitor.evaluate(&detections, SURFACE, 0);
        assert_eq!(result.objects.len(), 1);
        assert_eq!(result.objects[0].label, "dog");
    }

    #[test]
    fn boxes_are_scaled_from_detector_frame() {
        let mut monitor = IntrusionMonitor::new(MonitorConfig::default());
        monitor.upsert_zone(gate());
        let detections = Detections::new(
            FrameSize::new(320.0, 240.0),
            vec![RawDetection::new(
                "car",
                0.8,
                BoundingBox::new(10.0, 10.0, 40.0, 40.0),
            )],
        );
        let result = monitor.evaluate(&detections, SURFACE, 0);
        assert_eq!(result.objects[0].bbox, BoundingBox::new(20.0, 20.0, 80.0, 80.0));
        assert_eq!(result.objects[0].center, Point::new(50.0, 50.0));
        assert_eq!(result.intrusions.len(), 1);
    }

    #[test]
    fn zones_are_placed_on_the_current_surface() {
        let mut monitor = IntrusionMonitor::new(MonitorConfig::default());
        monitor.upsert_zone(gate());
        // Same zone viewed at double size: the box sits at the zone's new spot.
        let big = FrameSize::new(1280.0, 960.0);
        let result = monitor.evaluate(
            &Detections::new(
                big,
                vec![RawDetection::new(
                    "person",
                    0.9,
                    BoundingBox::new(40.0, 40.0, 160.0, 160.0),
                )],
            ),
            big,
            0,
        );
        assert_eq!(result.intrusions.len(), 1);
    }

    #[test]
    fn small_overlap_below_threshold_is_ignored() {
        let mut monitor = IntrusionMonitor::new(MonitorConfig::default());
        monitor.upsert_zone(gate());
        // Grazes the zone's corner; no sample point lands inside.
        let result = monitor.evaluate(
            &person_at(BoundingBox::new(95.0, 95.0, 155.0, 155.0)),
            SURFACE,
            0,
        );
        assert!(result.intrusions.is_empty());
        assert_eq!(result.objects.len(), 1);
    }

    #[test]
    fn inactive_zones_are_skipped_and_counters_survive_toggle() {
        let mut h = Harness::new();
        let mut detector = ScriptedDetector::new().then(inside()).then(inside());
        h.tick(&mut detector, 0);
        assert_eq!(h.monitor.toggle_zone("zone:gate"), Some(false));
        assert!(matches!(
            h.tick(&mut detector, 5_000),
            TickStatus::Evaluated { intrusions: 0, .. }
        ));
        assert_eq!(h.monitor.stats("zone:gate").unwrap().intrusion_count, 1);
        assert_eq!(h.monitor.toggle_zone("zone:gate"), Some(true));
        assert_eq!(h.monitor.toggle_zone("zone:missing"), None);
    }

    #[test]
    fn start_refuses_without_zones() {
        let mut monitor = IntrusionMonitor::new(MonitorConfig::default());
        assert!(!monitor.start_monitoring(10));
        assert!(!monitor.is_monitoring());
        assert_eq!(monitor.alerts().next().unwrap().kind, AlertKind::Warning);
    }

    #[test]
    fn stop_clears_published_result() {
        let mut h = Harness::new();
        let mut detector = ScriptedDetector::new().then(inside());
        h.tick(&mut detector, 0);
        h.monitor.stop_monitoring();
        assert!(h.monitor.last_result().is_none());
        assert_eq!(h.tick(&mut detector, 10), TickStatus::Inactive);
        assert_eq!(detector.calls(), 1);
    }

    #[test]
    fn alert_buffer_keeps_newest_ten() {
        let mut monitor = IntrusionMonitor::new(MonitorConfig::default());
        for i in 0..15u64 {
            monitor.push_alert(AlertKind::Warning, format!("alert {}", i), i);
        }
        let messages: Vec<&str> = monitor.alerts().map(|a| a.message.as_str()).collect();
        assert_eq!(messages.len(), 10);
        assert_eq!(messages[0], "alert 14");
        assert_eq!(messages[9], "alert 5");
        monitor.clear_alerts();
        assert_eq!(monitor.alerts().count(), 0);
    }

    #[test]
    fn remove_zone_drops_counters() {
        let mut monitor = IntrusionMonitor::new(MonitorConfig::default());
        monitor.upsert_zone(gate());
        assert!(monitor.remove_zone("zone:gate").is_some());
        assert!(monitor.stats("zone:gate").is_none());
        assert!(monitor.zones().is_empty());
    }
}
