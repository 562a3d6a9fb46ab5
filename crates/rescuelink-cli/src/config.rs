//! Configuration file – reads/writes `~/.rescuelink/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rescuelink_kernel::{MissionConfig, RetryPolicy};
use rescuelink_perception::HazardPolicy;
use rescuelink_runtime::SystemConfig;
use rescuelink_types::{MissionPlan, Waypoint};

/// One mission waypoint as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaypointEntry {
    pub lat: f64,
    pub lon: f64,
    pub alt: f32,
}

/// Settings for the simulated vehicle and camera the CLI flies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimSettings {
    #[serde(default = "default_sim_battery")]
    pub battery_pct: f32,
    /// Battery lost per telemetry poll.
    #[serde(default = "default_sim_drain")]
    pub drain_per_poll: f32,
    /// Telemetry polls before a sent waypoint counts as reached.
    #[serde(default = "default_sim_reach_polls")]
    pub reach_after_polls: u32,
    /// First frame (inclusive) on which the simulated detector sees a person.
    #[serde(default = "default_sim_hazard_start")]
    pub hazard_from_frame: u64,
    /// Frame (exclusive) after which the person is gone.
    #[serde(default = "default_sim_hazard_end")]
    pub hazard_until_frame: u64,
    /// Fail every n-th capture; 0 disables.
    #[serde(default)]
    pub camera_fail_every: u64,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            battery_pct: default_sim_battery(),
            drain_per_poll: default_sim_drain(),
            reach_after_polls: default_sim_reach_polls(),
            hazard_from_frame: default_sim_hazard_start(),
            hazard_until_frame: default_sim_hazard_end(),
            camera_fail_every: 0,
        }
    }
}

/// Persisted configuration stored in `~/.rescuelink/config.toml`.
///
/// Plain values come first: TOML requires them before any table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Reported in emergency telemetry.
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// COCO class ids treated as hazards.
    #[serde(default = "default_hazard_classes")]
    pub hazard_classes: Vec<u32>,

    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    /// Eligible detections needed to raise the hazard.
    #[serde(default = "default_raise_count")]
    pub raise_count: usize,

    #[serde(default = "default_raise_window_ms")]
    pub raise_window_ms: u64,

    /// Quiet period before the hazard clears and the mission resumes.
    #[serde(default = "default_clear_after_ms")]
    pub clear_after_ms: u64,

    #[serde(default = "default_low_battery_pct")]
    pub low_battery_pct: f32,

    #[serde(default = "default_tick_rate_hz")]
    pub tick_rate_hz: f64,

    /// Attempts per command before the link is declared dead.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    #[serde(default = "default_idle_loiter_ms")]
    pub idle_loiter_interval_ms: u64,

    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,

    #[serde(default = "default_waypoints")]
    pub waypoints: Vec<WaypointEntry>,

    #[serde(default)]
    pub sim: SimSettings,
}

fn default_device_id() -> String {
    "rescuelink-01".to_string()
}
fn default_hazard_classes() -> Vec<u32> {
    vec![0, 1, 2, 3, 5, 7]
}
fn default_confidence_threshold() -> f32 {
    0.6
}
fn default_raise_count() -> usize {
    3
}
fn default_raise_window_ms() -> u64 {
    500
}
fn default_clear_after_ms() -> u64 {
    1000
}
fn default_low_battery_pct() -> f32 {
    20.0
}
fn default_tick_rate_hz() -> f64 {
    10.0
}
fn default_max_retries() -> u32 {
    3
}
fn default_command_timeout_ms() -> u64 {
    2000
}
fn default_backoff_base_ms() -> u64 {
    100
}
fn default_backoff_cap_ms() -> u64 {
    2000
}
fn default_idle_loiter_ms() -> u64 {
    5000
}
fn default_frame_interval_ms() -> u64 {
    33
}
fn default_waypoints() -> Vec<WaypointEntry> {
    vec![
        WaypointEntry { lat: 28.6139, lon: 77.2090, alt: 30.0 },
        WaypointEntry { lat: 28.6150, lon: 77.2105, alt: 30.0 },
        WaypointEntry { lat: 28.6162, lon: 77.2118, alt: 25.0 },
    ]
}
fn default_sim_battery() -> f32 {
    100.0
}
fn default_sim_drain() -> f32 {
    0.05
}
fn default_sim_reach_polls() -> u32 {
    20
}
fn default_sim_hazard_start() -> u64 {
    60
}
fn default_sim_hazard_end() -> u64 {
    90
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            hazard_classes: default_hazard_classes(),
            confidence_threshold: default_confidence_threshold(),
            raise_count: default_raise_count(),
            raise_window_ms: default_raise_window_ms(),
            clear_after_ms: default_clear_after_ms(),
            low_battery_pct: default_low_battery_pct(),
            tick_rate_hz: default_tick_rate_hz(),
            max_retries: default_max_retries(),
            command_timeout_ms: default_command_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            idle_loiter_interval_ms: default_idle_loiter_ms(),
            frame_interval_ms: default_frame_interval_ms(),
            waypoints: default_waypoints(),
            sim: SimSettings::default(),
        }
    }
}

impl Config {
    /// Validate and convert into the runtime configuration and mission plan.
    pub fn to_system_config(&self) -> Result<(SystemConfig, MissionPlan), String> {
        let clear_after = Duration::from_millis(self.clear_after_ms);
        let system = SystemConfig {
            hazard: HazardPolicy {
                hazard_classes: self.hazard_classes.iter().copied().collect(),
                confidence_threshold: self.confidence_threshold,
                raise_count: self.raise_count,
                raise_window: Duration::from_millis(self.raise_window_ms),
                clear_after,
            },
            mission: MissionConfig {
                low_battery_pct: self.low_battery_pct,
                max_retries: self.max_retries,
                clear_after,
                idle_loiter_interval: Duration::from_millis(self.idle_loiter_interval_ms),
                device_id: self.device_id.clone(),
            },
            retry: RetryPolicy {
                max_attempts: self.max_retries,
                timeout: Duration::from_millis(self.command_timeout_ms),
                backoff_base: Duration::from_millis(self.backoff_base_ms),
                backoff_cap: Duration::from_millis(self.backoff_cap_ms),
            },
            tick_rate_hz: self.tick_rate_hz,
            frame_interval: Duration::from_millis(self.frame_interval_ms),
            ..SystemConfig::default()
        };
        system.validate().map_err(|e| e.to_string())?;

        let plan = MissionPlan::new(
            self.waypoints
                .iter()
                .enumerate()
                .map(|(i, w)| Waypoint::new(i, w.lat, w.lon, w.alt))
                .collect(),
        )
        .map_err(|e| e.to_string())?;

        Ok((system, plan))
    }
}

/// Return the path to `~/.rescuelink/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".rescuelink").join("config.toml")
}

/// Load the config from `path`.  Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `RESCUELINK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `RESCUELINK_DEVICE_ID` | `device_id` |
/// | `RESCUELINK_TICK_RATE_HZ` | `tick_rate_hz` |
/// | `RESCUELINK_CONFIDENCE_THRESHOLD` | `confidence_threshold` |
/// | `RESCUELINK_LOW_BATTERY_PCT` | `low_battery_pct` |
/// | `RESCUELINK_MAX_RETRIES` | `max_retries` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("RESCUELINK_DEVICE_ID") {
        cfg.device_id = v;
    }
    if let Ok(v) = std::env::var("RESCUELINK_TICK_RATE_HZ")
        && let Ok(hz) = v.parse::<f64>()
    {
        cfg.tick_rate_hz = hz;
    }
    if let Ok(v) = std::env::var("RESCUELINK_CONFIDENCE_THRESHOLD")
        && let Ok(threshold) = v.parse::<f32>()
    {
        cfg.confidence_threshold = threshold;
    }
    if let Ok(v) = std::env::var("RESCUELINK_LOW_BATTERY_PCT")
        && let Ok(pct) = v.parse::<f32>()
    {
        cfg.low_battery_pct = pct;
    }
    if let Ok(v) = std::env::var("RESCUELINK_MAX_RETRIES")
        && let Ok(n) = v.parse::<u32>()
    {
        cfg.max_retries = n;
    }
}

/// Save the config to `path`, creating the parent directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
