use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::geometry::{FrameSize, SampleGrid, DEFAULT_MIN_AREA_PX2};
use crate::monitor::MonitorConfig;
use crate::source::{AcquireSettings, DeviceBackendChoice, DeviceSelector, SourceKind};

const DEFAULT_DB_PATH: &str = "perimeter.db";
const DEFAULT_CAMERA_ID: &str = "camera:front_door";
const DEFAULT_SURFACE_WIDTH: f64 = 800.0;
const DEFAULT_SURFACE_HEIGHT: f64 = 600.0;
const DEFAULT_DEVICE: &str = "stub://default";
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_EVIDENCE_DIR: &str = "evidence";

#[derive(Debug, Deserialize, Default)]
struct ConsoleConfigFile {
    db_path: Option<String>,
    camera_id: Option<String>,
    surface: Option<SurfaceConfigFile>,
    source: Option<SourceConfigFile>,
    monitor: Option<MonitorConfigFile>,
    zones: Option<ZonesConfigFile>,
    evidence: Option<EvidenceConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SurfaceConfigFile {
    width: Option<f64>,
    height: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    kind: Option<String>,
    device: Option<String>,
    file: Option<PathBuf>,
    url: Option<String>,
    probe_timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    file_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    labels: Option<Vec<String>>,
    min_confidence: Option<f64>,
    overlap_threshold: Option<f64>,
    grid: Option<GridConfigFile>,
    event_throttle_ms: Option<u64>,
    alert_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct GridConfigFile {
    cols: Option<u32>,
    rows: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ZonesConfigFile {
    min_area_px2: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct EvidenceConfigFile {
    dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    pub db_path: String,
    pub camera_id: String,
    /// Size of the rendering surface zones are drawn on.
    pub surface: FrameSize,
    pub source: SourceSettings,
    pub monitor: MonitorConfig,
    pub min_zone_area_px2: f64,
    pub evidence_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub kind: SourceKind,
    /// Backend serving `kind` when it is a live device.
    pub device_backend: DeviceBackendChoice,
    pub probe_timeout: Duration,
    pub poll_interval: Duration,
    pub file_fps: u32,
}

impl ConsoleConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PERIMETER_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ConsoleConfigFile) -> Result<Self> {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let camera_id = file
            .camera_id
            .unwrap_or_else(|| DEFAULT_CAMERA_ID.to_string());
        let surface = FrameSize::new(
            file.surface
                .as_ref()
                .and_then(|s| s.width)
                .unwrap_or(DEFAULT_SURFACE_WIDTH),
            file.surface
                .as_ref()
                .and_then(|s| s.height)
                .unwrap_or(DEFAULT_SURFACE_HEIGHT),
        );

        let source_file = file.source.unwrap_or_default();
        let defaults = AcquireSettings::default();
        let source = SourceSettings {
            kind: source_kind_from_file(&source_file)?,
            device_backend: DeviceBackendChoice::for_selector(
                source_file.device.as_deref().unwrap_or(DEFAULT_DEVICE),
            ),
            probe_timeout: Duration::from_millis(
                source_file
                    .probe_timeout_ms
                    .unwrap_or(DEFAULT_PROBE_TIMEOUT_MS),
            ),
            poll_interval: source_file
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            file_fps: source_file.file_fps.unwrap_or(defaults.file_fps),
        };

        let mut monitor = MonitorConfig::default();
        if let Some(m) = file.monitor {
            if let Some(labels) = m.labels {
                monitor.labels = labels;
            }
            if let Some(value) = m.min_confidence {
                monitor.min_confidence = value;
            }
            if let Some(value) = m.overlap_threshold {
                monitor.overlap_threshold = value;
            }
            if let Some(grid) = m.grid {
                monitor.grid = SampleGrid::new(
                    grid.cols.unwrap_or(monitor.grid.cols),
                    grid.rows.unwrap_or(monitor.grid.rows),
                );
            }
            if let Some(value) = m.event_throttle_ms {
                monitor.event_throttle_ms = value;
            }
            if let Some(value) = m.alert_capacity {
                monitor.alert_capacity = value;
            }
        }

        let min_zone_area_px2 = file
            .zones
            .and_then(|z| z.min_area_px2)
            .unwrap_or(DEFAULT_MIN_AREA_PX2);
        let evidence_dir = file
            .evidence
            .and_then(|e| e.dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_EVIDENCE_DIR));

        Ok(Self {
            db_path,
            camera_id,
            surface,
            source,
            monitor,
            min_zone_area_px2,
            evidence_dir,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("PERIMETER_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(camera_id) = std::env::var("PERIMETER_CAMERA_ID") {
            if !camera_id.trim().is_empty() {
                self.camera_id = camera_id;
            }
        }
        if let Ok(source) = std::env::var("PERIMETER_SOURCE") {
            if !source.trim().is_empty() {
                self.source.kind = parse_source_spec(&source)?;
                if let Some(selector) = source.trim().strip_prefix("device:") {
                    self.source.device_backend = DeviceBackendChoice::for_selector(selector);
                }
            }
        }
        if let Ok(timeout) = std::env::var("PERIMETER_PROBE_TIMEOUT_MS") {
            let ms: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("PERIMETER_PROBE_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.source.probe_timeout = Duration::from_millis(ms);
        }
        if let Ok(labels) = std::env::var("PERIMETER_LABELS") {
            let parsed = split_csv(&labels);
            if !parsed.is_empty() {
                self.monitor.labels = parsed;
            }
        }
        if let Ok(area) = std::env::var("PERIMETER_MIN_ZONE_AREA") {
            self.min_zone_area_px2 = area
                .trim()
                .parse()
                .map_err(|_| anyhow!("PERIMETER_MIN_ZONE_AREA must be a number of px²"))?;
        }
        if let Ok(dir) = std::env::var("PERIMETER_EVIDENCE_DIR") {
            if !dir.trim().is_empty() {
                self.evidence_dir = PathBuf::from(dir);
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.camera_id = self.camera_id.trim().to_lowercase();
        crate::validate_camera_id(&self.camera_id)?;

        if !self.surface.is_usable() {
            return Err(anyhow!(
                "surface must have positive width and height (got {}x{})",
                self.surface.width,
                self.surface.height
            ));
        }
        check_unit_interval("monitor.min_confidence", self.monitor.min_confidence)?;
        check_unit_interval("monitor.overlap_threshold", self.monitor.overlap_threshold)?;

        let mut labels: Vec<String> = Vec::new();
        for label in &self.monitor.labels {
            let label = label.trim().to_lowercase();
            if !label.is_empty() && !labels.contains(&label) {
                labels.push(label);
            }
        }
        self.monitor.labels = labels;
        if self.monitor.labels.is_empty() {
            return Err(anyhow!("monitor.labels must name at least one label"));
        }
        if self.monitor.grid.total() == 0 {
            return Err(anyhow!("monitor.grid must have non-zero cols and rows"));
        }
        if self.monitor.alert_capacity == 0 {
            return Err(anyhow!("monitor.alert_capacity must be greater than zero"));
        }
        if !self.min_zone_area_px2.is_finite() || self.min_zone_area_px2 < 0.0 {
            return Err(anyhow!("zones.min_area_px2 must be a non-negative number"));
        }
        if self.source.probe_timeout.is_zero() {
            return Err(anyhow!("source.probe_timeout_ms must be greater than zero"));
        }
        if self.source.file_fps == 0 {
            return Err(anyhow!("source.file_fps must be greater than zero"));
        }
        Ok(())
    }

    pub fn acquire_settings(&self) -> AcquireSettings {
        AcquireSettings {
            poll_interval: self.source.poll_interval,
            file_fps: self.source.file_fps,
            ..AcquireSettings::default()
        }
    }
}

/// `device:<selector>`, `file:<path>`, or an `http(s)://` URL.
pub fn parse_source_spec(raw: &str) -> Result<SourceKind> {
    let raw = raw.trim();
    if let Some(selector) = raw.strip_prefix("device:") {
        return Ok(SourceKind::LiveDevice(DeviceSelector::parse(selector)));
    }
    if let Some(path) = raw.strip_prefix("file:") {
        if path.trim().is_empty() {
            return Err(anyhow!("file source needs a path"));
        }
        return Ok(SourceKind::LocalFile(PathBuf::from(path.trim())));
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Ok(SourceKind::RemoteProxiedVideo(raw.to_string()));
    }
    Err(anyhow!(
        "source must be device:<selector>, file:<path> or an http(s) URL (got {:?})",
        raw
    ))
}

fn source_kind_from_file(file: &SourceConfigFile) -> Result<SourceKind> {
    match file.kind.as_deref().unwrap_or("device") {
        "device" => Ok(SourceKind::LiveDevice(DeviceSelector::parse(
            file.device.as_deref().unwrap_or(DEFAULT_DEVICE),
        ))),
        "file" => file
            .file
            .clone()
            .map(SourceKind::LocalFile)
            .ok_or_else(|| anyhow!("source.kind \"file\" requires source.file")),
        "remote" => file
            .url
            .as_deref()
            .ok_or_else(|| anyhow!("source.kind \"remote\" requires source.url"))
            .and_then(parse_source_spec),
        other => Err(anyhow!(
            "unknown source.kind {:?} (expected device, file or remote)",
            other
        )),
    }
}

fn check_unit_interval(key: &str, value: f64) -> Result<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(anyhow!("{} must be in (0, 1] (got {})", key, value))
    }
}

fn read_config_file(path: &Path) -> Result<ConsoleConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
