//! Status LED indication
//!
//! Owns the indicator channels and layers transient pulses over a persistent
//! base state. Pulses and blink patterns execute on a single worker task, so
//! issuance never blocks trigger handling or mount processing, transients
//! never interleave on the status channel, and a pulse always restores the
//! exact base brightness that was active before it started.
//!
//! The physical drive is abstracted behind [`LevelDrive`] so deployments can
//! plug in a PWM-backed implementation while tests use [`SoftLevelDrive`].

use crate::config::IndicatorConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Channel carrying the system status pulses and ready state
pub const STATUS_CHANNEL: &str = "status";
/// Channel toggled around playback when USB storage is enabled
pub const STORAGE_CHANNEL: &str = "storage";

/// Capability to set a duty cycle (0-100) on a named indicator channel.
///
/// Implementations must be cheap and non-blocking; failures are reported but
/// the indicator never propagates them to callers.
pub trait LevelDrive: Send + Sync {
    fn set_level(&self, channel: &str, percent: u8) -> anyhow::Result<()>;
}

/// Software-only drive recording every level commanded per channel.
#[derive(Default)]
pub struct SoftLevelDrive {
    levels: Mutex<HashMap<String, Vec<u8>>>,
}

impl SoftLevelDrive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last level commanded on a channel, if any.
    pub fn level(&self, channel: &str) -> Option<u8> {
        self.levels
            .lock()
            .get(channel)
            .and_then(|levels| levels.last().copied())
    }

    /// Every level commanded on a channel, in order.
    pub fn history(&self, channel: &str) -> Vec<u8> {
        self.levels.lock().get(channel).cloned().unwrap_or_default()
    }
}

impl LevelDrive for SoftLevelDrive {
    fn set_level(&self, channel: &str, percent: u8) -> anyhow::Result<()> {
        debug!("indicator {} -> {}%", channel, percent);
        self.levels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(percent.min(100));
        Ok(())
    }
}

/// Fixed multi-blink patterns (count, on/off interval).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlinkPattern {
    SystemReady,
    MountSuccess,
    MountError,
    SystemError,
}

impl BlinkPattern {
    fn shape(self) -> (u32, Duration) {
        match self {
            BlinkPattern::SystemReady => (1, Duration::from_millis(500)),
            BlinkPattern::MountSuccess => (2, Duration::from_millis(300)),
            BlinkPattern::MountError => (3, Duration::from_millis(200)),
            BlinkPattern::SystemError => (5, Duration::from_millis(100)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BaseState {
    on: bool,
    brightness: u8,
}

/// A transient status-channel indication, executed by the worker.
enum Transient {
    Pulse(Duration),
    Pattern(BlinkPattern),
}

/// Status indicator with a base state and transient pulse/blink overlays.
pub struct SignalIndicator {
    drive: Arc<dyn LevelDrive>,
    base: Arc<Mutex<BaseState>>,
    pulse_active: Arc<AtomicBool>,
    pulse_duration: Duration,
    transient_tx: mpsc::UnboundedSender<Transient>,
}

impl SignalIndicator {
    /// Create the indicator and spawn its transient worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(cfg: &IndicatorConfig, drive: Arc<dyn LevelDrive>) -> Self {
        let base = Arc::new(Mutex::new(BaseState {
            on: false,
            brightness: cfg.ready_brightness.min(100),
        }));
        let pulse_active = Arc::new(AtomicBool::new(false));
        let (transient_tx, transient_rx) = mpsc::unbounded_channel();

        tokio::spawn(transient_worker(
            drive.clone(),
            base.clone(),
            pulse_active.clone(),
            transient_rx,
        ));

        Self {
            drive,
            base,
            pulse_active,
            pulse_duration: Duration::from_millis(cfg.pulse_ms),
            transient_tx,
        }
    }

    /// Set the persistent ready state: base on at the configured brightness,
    /// or base off.
    pub fn set_ready(&self, ready: bool) {
        let brightness = {
            let mut base = self.base.lock();
            base.on = ready;
            if base.on {
                base.brightness
            } else {
                0
            }
        };
        // A pulse in flight will restore the new base when it finishes.
        if !self.pulse_active.load(Ordering::SeqCst) {
            apply_level(&self.drive, STATUS_CHANNEL, brightness);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.base.lock().on
    }

    /// Single-shot full-intensity pulse acknowledging a received trigger.
    /// No-op if a single-shot pulse is already in flight.
    pub fn pulse_received(&self) {
        self.pulse_once(self.pulse_duration);
    }

    /// Single-shot pulse marking the start of playback.
    pub fn pulse_playing(&self) {
        self.pulse_once(self.pulse_duration / 2);
    }

    /// Queue a multi-blink pattern; patterns are executed sequentially,
    /// after any pulse already in flight.
    pub fn blink(&self, pattern: BlinkPattern) {
        if self.transient_tx.send(Transient::Pattern(pattern)).is_err() {
            warn!("indicator worker gone, dropping {:?}", pattern);
        }
    }

    /// Toggle the storage-activity channel.
    pub fn storage_activity(&self, on: bool) {
        apply_level(&self.drive, STORAGE_CHANNEL, if on { 100 } else { 0 });
    }

    /// Turn every channel off (shutdown path).
    pub fn all_off(&self) {
        self.base.lock().on = false;
        apply_level(&self.drive, STATUS_CHANNEL, 0);
        apply_level(&self.drive, STORAGE_CHANNEL, 0);
    }

    fn pulse_once(&self, duration: Duration) {
        if self.pulse_active.swap(true, Ordering::SeqCst) {
            // Already pulsing; single-shot indications coalesce.
            return;
        }

        if self.transient_tx.send(Transient::Pulse(duration)).is_err() {
            self.pulse_active.store(false, Ordering::SeqCst);
            warn!("indicator worker gone, dropping pulse");
        }
    }
}

/// Executes all transient status-channel activity, one at a time.
async fn transient_worker(
    drive: Arc<dyn LevelDrive>,
    base: Arc<Mutex<BaseState>>,
    pulse_active: Arc<AtomicBool>,
    mut rx: mpsc::UnboundedReceiver<Transient>,
) {
    while let Some(transient) = rx.recv().await {
        match transient {
            Transient::Pulse(duration) => {
                apply_level(&drive, STATUS_CHANNEL, 100);
                tokio::time::sleep(duration).await;
                restore_base(&drive, &base);
                pulse_active.store(false, Ordering::SeqCst);
            }
            Transient::Pattern(pattern) => {
                let (count, interval) = pattern.shape();
                for i in 0..count {
                    apply_level(&drive, STATUS_CHANNEL, 100);
                    tokio::time::sleep(interval).await;
                    apply_level(&drive, STATUS_CHANNEL, 0);
                    if i + 1 < count {
                        tokio::time::sleep(interval).await;
                    }
                }
                restore_base(&drive, &base);
            }
        }
    }
}

fn restore_base(drive: &Arc<dyn LevelDrive>, base: &Arc<Mutex<BaseState>>) {
    let snapshot = *base.lock();
    let level = if snapshot.on { snapshot.brightness } else { 0 };
    apply_level(drive, STATUS_CHANNEL, level);
}

/// Indicator failures must never abort playback or mounting.
fn apply_level(drive: &Arc<dyn LevelDrive>, channel: &str, percent: u8) {
    if let Err(e) = drive.set_level(channel, percent) {
        warn!("Failed to set indicator {} to {}%: {}", channel, percent, e);
    }
}
