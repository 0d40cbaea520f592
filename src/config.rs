//! Configuration management for Button Audio GW
//!
//! Handles loading and parsing of the YAML configuration file. The config is
//! loaded once at startup and passed into each component's constructor; no
//! component does ambient config lookups.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::fs;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub audio: AudioConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub usb: UsbConfig,
    #[serde(default)]
    pub indicator: IndicatorConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Audio playback configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    /// Local directory holding the mapped audio files
    #[serde(default = "default_audio_dir")]
    pub audio_dir: PathBuf,
    /// Audio key -> logical filename, e.g. "button1" -> "button1.wav"
    pub mappings: BTreeMap<String, String>,
    /// Whether hold events select the "hold<N>" key instead of "button<N>"
    #[serde(default = "default_true")]
    pub hold_detection_enabled: bool,
    /// Default playback volume in [0.0, 1.0]
    #[serde(default = "default_volume")]
    pub default_volume: f32,
}

/// Serial link to the button receiver
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerialConfig {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Candidate device paths, tried in order until one opens
    #[serde(default = "default_candidate_ports")]
    pub candidate_ports: Vec<String>,
}

/// USB hot-plug storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UsbConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Root under which per-device mount directories are allocated
    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,
    /// Audio subdirectory expected on each mounted device
    #[serde(default = "default_usb_audio_dir")]
    pub audio_dir: String,
    /// Seconds between enumeration polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Seconds before a mount/unmount operation is treated as failed
    #[serde(default = "default_mount_timeout")]
    pub mount_timeout_secs: u64,
}

/// Status LED configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndicatorConfig {
    /// Base brightness of the status channel in ready state (0-100)
    #[serde(default = "default_ready_brightness")]
    pub ready_brightness: u8,
    /// Single-shot pulse duration in milliseconds
    #[serde(default = "default_pulse_ms")]
    pub pulse_ms: u64,
}

/// HTTP trigger boundary
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl AppConfig {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML config: {}", path))?;

        Ok(config)
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            candidate_ports: default_candidate_ports(),
        }
    }
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mount_root: default_mount_root(),
            audio_dir: default_usb_audio_dir(),
            poll_interval_secs: default_poll_interval(),
            mount_timeout_secs: default_mount_timeout(),
        }
    }
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            ready_brightness: default_ready_brightness(),
            pulse_ms: default_pulse_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

// Default value functions
fn default_audio_dir() -> PathBuf { PathBuf::from("audio_files") }
fn default_true() -> bool { true }
fn default_volume() -> f32 { 0.7 }
fn default_baud_rate() -> u32 { 115_200 }
fn default_candidate_ports() -> Vec<String> {
    [
        "/dev/ttyACM0",
        "/dev/ttyACM1",
        "/dev/ttyUSB0",
        "/dev/ttyUSB1",
        "/dev/serial0",
        "/dev/ttyAMA0",
        "/dev/ttyS0",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_mount_root() -> PathBuf { PathBuf::from("/media/usb") }
fn default_usb_audio_dir() -> String { "audio_files".to_string() }
fn default_poll_interval() -> u64 { 5 }
fn default_mount_timeout() -> u64 { 10 }
fn default_ready_brightness() -> u8 { 50 }
fn default_pulse_ms() -> u64 { 100 }
fn default_bind() -> String { "0.0.0.0:8080".to_string() }
