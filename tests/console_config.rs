use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use perimeter_kernel::config::ConsoleConfig;
use perimeter_kernel::source::{DeviceBackendChoice, DeviceSelector};
use perimeter_kernel::{SampleGrid, SourceKind};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PERIMETER_CONFIG",
        "PERIMETER_DB_PATH",
        "PERIMETER_CAMERA_ID",
        "PERIMETER_SOURCE",
        "PERIMETER_PROBE_TIMEOUT_MS",
        "PERIMETER_LABELS",
        "PERIMETER_MIN_ZONE_AREA",
        "PERIMETER_EVIDENCE_DIR",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = ConsoleConfig::load().expect("load config");
    assert_eq!(cfg.db_path, "perimeter.db");
    assert_eq!(cfg.camera_id, "camera:front_door");
    assert_eq!((cfg.surface.width, cfg.surface.height), (800.0, 600.0));
    assert_eq!(cfg.source.kind, SourceKind::LiveDevice(DeviceSelector::Default));
    assert_eq!(cfg.source.probe_timeout, Duration::from_millis(5000));
    assert_eq!(cfg.source.poll_interval, Duration::from_millis(200));
    assert_eq!(cfg.monitor.labels.len(), 8);
    assert_eq!(cfg.monitor.min_confidence, 0.3);
    assert_eq!(cfg.monitor.overlap_threshold, 0.1);
    assert_eq!(cfg.monitor.grid, SampleGrid::new(6, 4));
    assert_eq!(cfg.monitor.event_throttle_ms, 3000);
    assert_eq!(cfg.min_zone_area_px2, 1000.0);
    assert_eq!(cfg.evidence_dir, PathBuf::from("evidence"));
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "db_path": "lot.db",
            "camera_id": "camera:loading_bay",
            "surface": { "width": 1280, "height": 720 },
            "source": { "kind": "file", "file": "/var/footage/bay.mjpeg", "poll_interval_ms": 500 },
            "monitor": {
                "labels": ["person", "truck"],
                "overlap_threshold": 0.25,
                "grid": { "cols": 8 },
                "event_throttle_ms": 10000
            },
            "zones": { "min_area_px2": 400 },
            "evidence": { "dir": "/var/evidence" }
        }"#,
    );
    std::env::set_var("PERIMETER_CONFIG", file.path());
    std::env::set_var("PERIMETER_SOURCE", "https://cam.example/snapshot.jpg");
    std::env::set_var("PERIMETER_LABELS", "Person, car, person");
    std::env::set_var("PERIMETER_MIN_ZONE_AREA", "2500");

    let cfg = ConsoleConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "lot.db");
    assert_eq!(cfg.camera_id, "camera:loading_bay");
    assert_eq!((cfg.surface.width, cfg.surface.height), (1280.0, 720.0));
    assert_eq!(
        cfg.source.kind,
        SourceKind::RemoteProxiedVideo("https://cam.example/snapshot.jpg".to_string())
    );
    assert_eq!(cfg.acquire_settings().poll_interval, Duration::from_millis(500));
    assert_eq!(cfg.monitor.labels, vec!["person", "car"]);
    assert_eq!(cfg.monitor.overlap_threshold, 0.25);
    assert_eq!(cfg.monitor.grid, SampleGrid::new(8, 4));
    assert_eq!(cfg.monitor.event_throttle_ms, 10_000);
    assert_eq!(cfg.min_zone_area_px2, 2500.0);
    assert_eq!(cfg.evidence_dir, PathBuf::from("/var/evidence"));

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    for json in [
        r#"{ "camera_id": "front door" }"#,
        r#"{ "monitor": { "overlap_threshold": 0 } }"#,
        r#"{ "monitor": { "min_confidence": 1.5 } }"#,
        r#"{ "monitor": { "labels": [] } }"#,
        r#"{ "monitor": { "grid": { "cols": 0, "rows": 4 } } }"#,
        r#"{ "surface": { "width": 0, "height": 600 } }"#,
        r#"{ "source": { "kind": "file" } }"#,
        r#"{ "source": { "kind": "carrier-pigeon" } }"#,
    ] {
        let file = write_config(json);
        std::env::set_var("PERIMETER_CONFIG", file.path());
        assert!(ConsoleConfig::load().is_err(), "accepted {}", json);
    }

    clear_env();
    std::env::set_var("PERIMETER_SOURCE", "rtsp://camera-1");
    assert!(ConsoleConfig::load().is_err());
    std::env::set_var("PERIMETER_SOURCE", "device:0");
    std::env::set_var("PERIMETER_PROBE_TIMEOUT_MS", "soon");
    assert!(ConsoleConfig::load().is_err());

    clear_env();
}

#[test]
fn device_source_from_env_picks_hardware_backend() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PERIMETER_SOURCE", "device:webcam://2");
    let cfg = ConsoleConfig::load().expect("load config");
    assert_eq!(cfg.source.kind, SourceKind::LiveDevice(DeviceSelector::Index(2)));
    assert_eq!(cfg.source.device_backend, DeviceBackendChoice::V4l2);

    std::env::set_var("PERIMETER_SOURCE", "device:stub://default");
    let cfg = ConsoleConfig::load().expect("load config");
    assert_eq!(cfg.source.device_backend, DeviceBackendChoice::Synthetic);

    clear_env();
}
