use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::FatalError;

const DEFAULT_EDGE_MODE: bool = true;
const DEFAULT_DEVICE_ID: &str = "default_device";
const DEFAULT_SOURCE: &str = "stub://front_camera";
const DEFAULT_TARGET_FPS: u32 = 10;
const DEFAULT_FRAME_WIDTH: u32 = 640;
const DEFAULT_FRAME_HEIGHT: u32 = 480;
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_BASE_MS: u64 = 500;
const DEFAULT_RECONNECT_MAX_MS: u64 = 8_000;
const DEFAULT_READ_TIMEOUT_MS: u64 = 2_000;

const DEFAULT_MODEL: &str = "stub://";
const DEFAULT_MODEL_INPUT: u32 = 300;
const DEFAULT_PERSON_CLASS_ID: u32 = 0;

const EDGE_FRAME_SKIP: u64 = 5;
const FULL_FRAME_SKIP: u64 = 1;
const EDGE_CORE_BUDGET: usize = 1;

const DEFAULT_PERSON_THRESHOLD: f32 = 0.5;
const DEFAULT_DENSITY_MEDIUM: u32 = 5;
const DEFAULT_DENSITY_HIGH: u32 = 15;
const DEFAULT_TREND_WINDOW: usize = 5;
const DEFAULT_TREND_EPSILON: f32 = 0.1;
const DEFAULT_ANOMALY_THRESHOLD: u32 = 10;

const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:5000/receive_data";
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_SPOOL_CAPACITY: usize = 1_000;
const DEFAULT_SPOOL_PATH: &str = "crowdwatch_spool.db";
const DEFAULT_QUEUE_CAPACITY: usize = 256;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_BACKOFF_BASE_MS: u64 = 250;
const DEFAULT_BACKOFF_MAX_MS: u64 = 10_000;
const DEFAULT_FLUSH_GRACE_MS: u64 = 5_000;

#[derive(Debug, Deserialize, Default)]
struct EdgeConfigFile {
    edge_mode: Option<bool>,
    device_id: Option<String>,
    source: Option<SourceConfigFile>,
    model: Option<ModelConfigFile>,
    schedule: Option<ScheduleConfigFile>,
    aggregate: Option<AggregateConfigFile>,
    uplink: Option<UplinkConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    spec: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    reconnect_attempts: Option<u32>,
    reconnect_base_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    path: Option<String>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    person_class_id: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ScheduleConfigFile {
    frame_skip_interval: Option<u64>,
    cpu_core_budget: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct AggregateConfigFile {
    person_confidence_threshold: Option<f32>,
    density_medium_threshold: Option<u32>,
    density_high_threshold: Option<u32>,
    trend_window_size: Option<usize>,
    trend_epsilon: Option<f32>,
    anomaly_threshold: Option<u32>,
    include_detections: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct UplinkConfigFile {
    server_url: Option<String>,
    health_url: Option<String>,
    compression_enabled: Option<bool>,
    max_uplink_retries: Option<u32>,
    uplink_spool_capacity: Option<usize>,
    spool_path: Option<PathBuf>,
    queue_capacity: Option<usize>,
    request_timeout_ms: Option<u64>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    backoff_jitter: Option<bool>,
    flush_grace_ms: Option<u64>,
}

/// Process-wide configuration. Loaded once at startup and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub edge_mode: bool,
    /// Identifier sent with every uplink record.
    pub device_id: String,
    pub source: SourceSettings,
    pub model: ModelSettings,
    pub schedule: ScheduleSettings,
    pub aggregate: AggregateSettings,
    pub uplink: UplinkSettings,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    /// `camera:N`, `rtsp://...`, `http(s)://...`, `stub://...` or a file path.
    pub spec: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    pub reconnect_attempts: u32,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub read_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    /// `stub://...` or a path to an ONNX model.
    pub path: String,
    pub input_width: u32,
    pub input_height: u32,
    pub person_class_id: u32,
}

#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    /// Run inference on one of every K frames.
    pub frame_skip_interval: u64,
    /// Number of CPU cores the process may use.
    pub cpu_core_budget: usize,
}

#[derive(Debug, Clone)]
pub struct AggregateSettings {
    pub person_confidence_threshold: f32,
    /// T1: counts at or above this are at least `medium`.
    pub density_medium_threshold: u32,
    /// T2: counts at or above this are `high`.
    pub density_high_threshold: u32,
    pub trend_window_size: usize,
    pub trend_epsilon: f32,
    /// Counts strictly above this are flagged as anomalies.
    pub anomaly_threshold: u32,
    pub include_detections: bool,
}

#[derive(Debug, Clone)]
pub struct UplinkSettings {
    pub server_url: String,
    pub health_url: Option<String>,
    pub compression_enabled: bool,
    /// Total delivery attempts per record before it is spooled.
    pub max_uplink_retries: u32,
    pub uplink_spool_capacity: usize,
    /// SQLite spool location. `None` (an empty path in the file or environment) keeps
    /// the spool in memory, where it is lost at exit.
    pub spool_path: Option<PathBuf>,
    pub queue_capacity: usize,
    pub request_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_jitter: bool,
    pub flush_grace: Duration,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self::from_file(EdgeConfigFile::default())
    }
}

impl EdgeConfig {
    /// Load from the file named by `CROWDWATCH_CONFIG` (if any), then the environment.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CROWDWATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit file (if any), then the environment.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => EdgeConfigFile::default(),
        };
        // Edge mode picks the defaults below, so it has to be settled first.
        if let Some(edge_mode) = env_bool("CROWDWATCH_EDGE_MODE")? {
            file_cfg.edge_mode = Some(edge_mode);
        }
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: EdgeConfigFile) -> Self {
        let edge_mode = file.edge_mode.unwrap_or(DEFAULT_EDGE_MODE);
        let source = file.source.unwrap_or_default();
        let model = file.model.unwrap_or_default();
        let schedule = file.schedule.unwrap_or_default();
        let aggregate = file.aggregate.unwrap_or_default();
        let uplink = file.uplink.unwrap_or_default();

        let (default_skip, default_budget) = if edge_mode {
            (EDGE_FRAME_SKIP, EDGE_CORE_BUDGET)
        } else {
            (FULL_FRAME_SKIP, available_cores())
        };

        Self {
            edge_mode,
            device_id: file
                .device_id
                .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string()),
            source: SourceSettings {
                spec: source.spec.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
                target_fps: source.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
                width: source.width.unwrap_or(DEFAULT_FRAME_WIDTH),
                height: source.height.unwrap_or(DEFAULT_FRAME_HEIGHT),
                reconnect_attempts: source
                    .reconnect_attempts
                    .unwrap_or(DEFAULT_RECONNECT_ATTEMPTS),
                reconnect_base: Duration::from_millis(
                    source.reconnect_base_ms.unwrap_or(DEFAULT_RECONNECT_BASE_MS),
                ),
                reconnect_max: Duration::from_millis(
                    source.reconnect_max_ms.unwrap_or(DEFAULT_RECONNECT_MAX_MS),
                ),
                read_timeout: Duration::from_millis(
                    source.read_timeout_ms.unwrap_or(DEFAULT_READ_TIMEOUT_MS),
                ),
            },
            model: ModelSettings {
                path: model.path.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                input_width: model.input_width.unwrap_or(DEFAULT_MODEL_INPUT),
                input_height: model.input_height.unwrap_or(DEFAULT_MODEL_INPUT),
                person_class_id: model.person_class_id.unwrap_or(DEFAULT_PERSON_CLASS_ID),
            },
            schedule: ScheduleSettings {
                frame_skip_interval: schedule.frame_skip_interval.unwrap_or(default_skip),
                cpu_core_budget: schedule.cpu_core_budget.unwrap_or(default_budget),
            },
            aggregate: AggregateSettings {
                person_confidence_threshold: aggregate
                    .person_confidence_threshold
                    .unwrap_or(DEFAULT_PERSON_THRESHOLD),
                density_medium_threshold: aggregate
                    .density_medium_threshold
                    .unwrap_or(DEFAULT_DENSITY_MEDIUM),
                density_high_threshold: aggregate
                    .density_high_threshold
                    .unwrap_or(DEFAULT_DENSITY_HIGH),
                trend_window_size: aggregate.trend_window_size.unwrap_or(DEFAULT_TREND_WINDOW),
                trend_epsilon: aggregate.trend_epsilon.unwrap_or(DEFAULT_TREND_EPSILON),
                anomaly_threshold: aggregate
                    .anomaly_threshold
                    .unwrap_or(DEFAULT_ANOMALY_THRESHOLD),
                include_detections: aggregate.include_detections.unwrap_or(true),
            },
            uplink: UplinkSettings {
                server_url: uplink
                    .server_url
                    .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string()),
                health_url: uplink.health_url,
                compression_enabled: uplink.compression_enabled.unwrap_or(true),
                max_uplink_retries: uplink.max_uplink_retries.unwrap_or(DEFAULT_MAX_RETRIES),
                uplink_spool_capacity: uplink
                    .uplink_spool_capacity
                    .unwrap_or(DEFAULT_SPOOL_CAPACITY),
                spool_path: spool_location(
                    uplink
                        .spool_path
                        .unwrap_or_else(|| PathBuf::from(DEFAULT_SPOOL_PATH)),
                ),
                queue_capacity: uplink.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
                request_timeout: Duration::from_millis(
                    uplink
                        .request_timeout_ms
                        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
                ),
                backoff_base: Duration::from_millis(
                    uplink.backoff_base_ms.unwrap_or(DEFAULT_BACKOFF_BASE_MS),
                ),
                backoff_max: Duration::from_millis(
                    uplink.backoff_max_ms.unwrap_or(DEFAULT_BACKOFF_MAX_MS),
                ),
                backoff_jitter: uplink.backoff_jitter.unwrap_or(true),
                flush_grace: Duration::from_millis(
                    uplink.flush_grace_ms.unwrap_or(DEFAULT_FLUSH_GRACE_MS),
                ),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(source) = std::env::var("CROWDWATCH_SOURCE") {
            if !source.trim().is_empty() {
                self.source.spec = source;
            }
        }
        if let Ok(device_id) = std::env::var("CROWDWATCH_DEVICE_ID") {
            if !device_id.trim().is_empty() {
                self.device_id = device_id;
            }
        }
        if let Ok(model) = std::env::var("CROWDWATCH_MODEL") {
            if !model.trim().is_empty() {
                self.model.path = model;
            }
        }
        if let Ok(url) = std::env::var("CROWDWATCH_SERVER_URL") {
            if !url.trim().is_empty() {
                self.uplink.server_url = url;
            }
        }
        if let Ok(path) = std::env::var("CROWDWATCH_SPOOL_PATH") {
            self.uplink.spool_path = spool_location(PathBuf::from(path.trim()));
        }
        if let Ok(skip) = std::env::var("CROWDWATCH_FRAME_SKIP") {
            self.schedule.frame_skip_interval = skip.trim().parse().map_err(|_| {
                FatalError::config("CROWDWATCH_FRAME_SKIP must be a positive integer")
            })?;
        }
        if let Ok(budget) = std::env::var("CROWDWATCH_CORE_BUDGET") {
            self.schedule.cpu_core_budget = budget.trim().parse().map_err(|_| {
                FatalError::config("CROWDWATCH_CORE_BUDGET must be a positive integer")
            })?;
        }
        if let Some(enabled) = env_bool("CROWDWATCH_COMPRESSION")? {
            self.uplink.compression_enabled = enabled;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.device_id = self.device_id.trim().to_string();
        if self.device_id.is_empty() {
            return Err(FatalError::config("device_id must not be empty").into());
        }
        if self.source.spec.trim().is_empty() {
            return Err(FatalError::config("source spec must not be empty").into());
        }
        if self.schedule.frame_skip_interval == 0 {
            return Err(FatalError::config("frame_skip_interval must be >= 1").into());
        }
        if self.schedule.cpu_core_budget == 0 {
            return Err(FatalError::config("cpu_core_budget must be >= 1").into());
        }

        let agg = &self.aggregate;
        if !(0.0..=1.0).contains(&agg.person_confidence_threshold) {
            return Err(FatalError::config(format!(
                "person_confidence_threshold must be within [0, 1], got {}",
                agg.person_confidence_threshold
            ))
            .into());
        }
        if agg.density_medium_threshold > agg.density_high_threshold {
            return Err(FatalError::config(format!(
                "density_medium_threshold ({}) must not exceed density_high_threshold ({})",
                agg.density_medium_threshold, agg.density_high_threshold
            ))
            .into());
        }
        if agg.trend_window_size == 0 {
            return Err(FatalError::config("trend_window_size must be >= 1").into());
        }
        if !(0.0..1.0).contains(&agg.trend_epsilon) {
            return Err(FatalError::config("trend_epsilon must be within [0, 1)").into());
        }

        let up = &self.uplink;
        if up.max_uplink_retries == 0 {
            return Err(FatalError::config("max_uplink_retries must be >= 1").into());
        }
        if up.uplink_spool_capacity == 0 {
            return Err(FatalError::config("uplink_spool_capacity must be >= 1").into());
        }
        if up.queue_capacity == 0 {
            return Err(FatalError::config("uplink queue_capacity must be >= 1").into());
        }
        if up.backoff_base > up.backoff_max {
            return Err(FatalError::config("backoff_base_ms must not exceed backoff_max_ms").into());
        }
        validate_http_url("server_url", &up.server_url)?;
        if let Some(health_url) = &up.health_url {
            validate_http_url("health_url", health_url)?;
        }
        Ok(())
    }
}

fn validate_http_url(field: &str, value: &str) -> Result<()> {
    let parsed = url::Url::parse(value)
        .map_err(|e| FatalError::config(format!("invalid {} '{}': {}", field, value, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(FatalError::config(format!(
            "{} must use http or https, got '{}'",
            field, other
        ))
        .into()),
    }
}

fn read_config_file(path: &Path) -> Result<EdgeConfigFile> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        FatalError::config(format!(
            "failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let parsed = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("{}", e))
    } else {
        serde_json::from_str(&raw).map_err(|e| anyhow!("{}", e))
    };
    parsed.map_err(|e| {
        FatalError::config(format!("invalid config file {}: {}", path.display(), e)).into()
    })
}

/// An empty path opts out of the on-disk spool.
fn spool_location(path: PathBuf) -> Option<PathBuf> {
    (!path.as_os_str().is_empty()).then_some(path)
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    let Ok(value) = std::env::var(key) else {
        return Ok(None);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "" => Ok(None),
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(FatalError::config(format!("{} must be a boolean, got '{}'", key, value)).into()),
    }
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
