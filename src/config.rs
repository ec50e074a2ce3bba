//! Application configuration
//!
//! All tuning lives here as static configuration loaded from TOML. Nothing in
//! this module is adjustable at runtime through the client API.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::Error;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub buffer: BufferTuning,
    pub transport: TransportConfig,
    pub output: OutputConfig,
    pub report: ReportConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: AppConfig =
            toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, falling back to defaults when absent
    pub fn load_or_default() -> Result<Self, Error> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    /// Platform config path, e.g. `~/.config/live-pcm-stream/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "live-pcm-stream")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn to_toml(&self) -> Result<String, Error> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.buffer.validate()?;
        self.transport.validate()?;
        Ok(())
    }
}

/// Named starting point for `[buffer]`; keys set alongside it override it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferPreset {
    #[default]
    Standard,
    LowLatency,
    Robust,
}

impl BufferPreset {
    pub fn tuning(self) -> BufferTuning {
        match self {
            BufferPreset::Standard => BufferTuning::default(),
            BufferPreset::LowLatency => BufferTuning::low_latency(),
            BufferPreset::Robust => BufferTuning::robust(),
        }
    }
}

/// Adaptive buffer tuning. Values are heuristics: grow fast on underrun,
/// shrink slowly once stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "BufferSection")]
pub struct BufferTuning {
    /// Target latency before the first underrun
    pub initial_target_ms: f32,
    pub min_ms: f32,
    pub max_ms: f32,
    /// Extra buffered audio tolerated above the target before dropping
    pub headroom_ms: f32,
    /// Ring capacity; raised to `max_ms + headroom_ms` if smaller
    pub capacity_ms: f32,
    /// Multiplier applied to the target on underrun
    pub growth_factor: f32,
    /// Amount removed from the target per decay step
    pub decay_step_ms: f32,
    /// Underrun-free rendering required before decaying
    pub stable_ms: f32,
    /// Minimum rendered time between two decay steps
    pub cooldown_ms: f32,
    /// Fade length applied to the last real audio before an underrun gap
    pub fade_ms: f32,
}

impl Default for BufferTuning {
    fn default() -> Self {
        Self {
            initial_target_ms: DEFAULT_TARGET_MS,
            min_ms: 60.0,
            max_ms: 1000.0,
            headroom_ms: 150.0,
            capacity_ms: 2000.0,
            growth_factor: 1.5,
            decay_step_ms: 10.0,
            stable_ms: 5000.0,
            cooldown_ms: 2000.0,
            fade_ms: 5.0,
        }
    }
}

/// `[buffer]` as written: a preset plus optional per-key overrides
#[derive(Deserialize, Default)]
#[serde(default)]
struct BufferSection {
    preset: BufferPreset,
    initial_target_ms: Option<f32>,
    min_ms: Option<f32>,
    max_ms: Option<f32>,
    headroom_ms: Option<f32>,
    capacity_ms: Option<f32>,
    growth_factor: Option<f32>,
    decay_step_ms: Option<f32>,
    stable_ms: Option<f32>,
    cooldown_ms: Option<f32>,
    fade_ms: Option<f32>,
}

impl From<BufferSection> for BufferTuning {
    fn from(section: BufferSection) -> Self {
        let base = section.preset.tuning();
        Self {
            initial_target_ms: section.initial_target_ms.unwrap_or(base.initial_target_ms),
            min_ms: section.min_ms.unwrap_or(base.min_ms),
            max_ms: section.max_ms.unwrap_or(base.max_ms),
            headroom_ms: section.headroom_ms.unwrap_or(base.headroom_ms),
            capacity_ms: section.capacity_ms.unwrap_or(base.capacity_ms),
            growth_factor: section.growth_factor.unwrap_or(base.growth_factor),
            decay_step_ms: section.decay_step_ms.unwrap_or(base.decay_step_ms),
            stable_ms: section.stable_ms.unwrap_or(base.stable_ms),
            cooldown_ms: section.cooldown_ms.unwrap_or(base.cooldown_ms),
            fade_ms: section.fade_ms.unwrap_or(base.fade_ms),
        }
    }
}

impl BufferTuning {
    /// Tight latency for wired LANs
    pub fn low_latency() -> Self {
        Self {
            initial_target_ms: 60.0,
            min_ms: 30.0,
            max_ms: 400.0,
            headroom_ms: 60.0,
            capacity_ms: 1000.0,
            growth_factor: 1.3,
            stable_ms: 3000.0,
            ..Self::default()
        }
    }

    /// Generous buffering for Wi-Fi and WAN links
    pub fn robust() -> Self {
        Self {
            initial_target_ms: 250.0,
            min_ms: 120.0,
            max_ms: 2000.0,
            headroom_ms: 300.0,
            capacity_ms: 4000.0,
            growth_factor: 2.0,
            decay_step_ms: 5.0,
            stable_ms: 10_000.0,
            cooldown_ms: 5000.0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |msg: &str| Err(Error::Config(format!("buffer: {}", msg)));
        if !(self.min_ms > 0.0) {
            return invalid("min_ms must be positive");
        }
        if self.min_ms > self.max_ms {
            return invalid("min_ms exceeds max_ms");
        }
        if !(self.min_ms..=self.max_ms).contains(&self.initial_target_ms) {
            return invalid("initial_target_ms outside [min_ms, max_ms]");
        }
        if !(self.growth_factor > 1.0) {
            return invalid("growth_factor must be greater than 1");
        }
        if self.decay_step_ms < 0.0 || self.headroom_ms < 0.0 || self.fade_ms < 0.0 {
            return invalid("negative duration");
        }
        if self.stable_ms < 0.0 || self.cooldown_ms < 0.0 {
            return invalid("negative duration");
        }
        if self.capacity_ms < self.max_ms + self.headroom_ms {
            return invalid("capacity_ms smaller than max_ms + headroom_ms");
        }
        Ok(())
    }
}

/// Which transport to try first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportPolicy {
    /// WebRTC first, WebSocket PCM on failure
    #[default]
    PreferRtc,
    /// Skip WebRTC entirely
    ForceFallback,
}

/// ICE server entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Transport negotiation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub policy: TransportPolicy,
    /// WebSocket endpoint for WebRTC signaling
    pub signaling_url: String,
    /// WebSocket endpoint for raw PCM
    pub stream_url: String,
    pub signaling_timeout_ms: u64,
    pub track_timeout_ms: u64,
    pub fallback_timeout_ms: u64,
    /// Diagnostics polling period while WebRTC is active
    pub stats_interval_ms: u64,
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            policy: TransportPolicy::default(),
            signaling_url: format!("ws://127.0.0.1:{}/ws/rtc", DEFAULT_HTTP_PORT),
            stream_url: format!("ws://127.0.0.1:{}/ws/audio", DEFAULT_HTTP_PORT),
            signaling_timeout_ms: 3000,
            track_timeout_ms: 5000,
            fallback_timeout_ms: 5000,
            stats_interval_ms: 5000,
            ice_servers: Vec::new(),
        }
    }
}

impl TransportConfig {
    /// Point both endpoints at one producer host, e.g. `192.168.1.20:8000`
    pub fn for_host(host: &str) -> Self {
        Self {
            signaling_url: format!("ws://{}/ws/rtc", host),
            stream_url: format!("ws://{}/ws/audio", host),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        for (name, url) in [("signaling_url", &self.signaling_url), ("stream_url", &self.stream_url)] {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(Error::Config(format!(
                    "transport: {} must be a ws:// or wss:// URL, got {:?}",
                    name, url
                )));
            }
        }
        if self.signaling_timeout_ms == 0 || self.track_timeout_ms == 0 || self.fallback_timeout_ms == 0 {
            return Err(Error::Config("transport: timeouts must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Audio output settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output device id (`output:<name>`); default device when unset
    pub device_id: Option<String>,
}

/// Status reporting cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Rendered audio between two status snapshots
    pub status_interval_ms: u64,
    /// Longest silence between two upstream reports
    pub min_interval_ms: u64,
    /// How often the control side drains status snapshots
    pub poll_interval_ms: u64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            status_interval_ms: 500,
            min_interval_ms: 1000,
            poll_interval_ms: 50,
        }
    }
}

impl ReportConfig {
    /// Snapshot interval clamped to the supported 250..=2000 ms range
    pub fn status_interval_ms(&self) -> u64 {
        self.status_interval_ms
            .clamp(MIN_STATUS_INTERVAL_MS, MAX_STATUS_INTERVAL_MS)
    }
}
