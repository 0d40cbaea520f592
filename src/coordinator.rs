//! Coordinator - wires the serial link, storage manager, playback dispatcher
//! and indicator together and owns their lifecycles.
//!
//! All trigger events funnel through [`Coordinator::handle_trigger`], whether
//! they arrive from the HTTP boundary or from the serial reader. This is the
//! only component the HTTP boundary calls into.

use crate::config::AppConfig;
use crate::indicator::{LevelDrive, SignalIndicator};
use crate::playback::{AudioEngine, PlaybackDispatcher, PlayError};
use crate::serial::{LinkState, SerialLink};
use crate::storage::{DeviceEnumerator, Mounter, StorageManager, StorageStatus};
use crate::trigger::TriggerEvent;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Capacity of the serial-to-coordinator trigger channel.
const TRIGGER_CHANNEL_CAPACITY: usize = 64;

/// Result of an accepted trigger, returned to the boundary.
#[derive(Debug, Clone, Serialize)]
pub struct PlayOutcome {
    pub audio_file: String,
    pub source: String,
    pub event_type: String,
}

/// Aggregate status for the HTTP boundary.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub status: &'static str,
    pub current_audio: Option<String>,
    pub volume: f32,
    pub audio_keys: Vec<String>,
    pub serial_link: String,
    pub usb: StorageStatus,
}

pub struct Coordinator {
    config: AppConfig,
    dispatcher: Arc<PlaybackDispatcher>,
    storage: Arc<StorageManager>,
    indicator: Arc<SignalIndicator>,
    serial: Mutex<SerialLink>,
    serial_rx: Mutex<Option<mpsc::Receiver<TriggerEvent>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Build the component graph. Must be called from within a tokio
    /// runtime (the indicator spawns its blink worker).
    pub fn new(
        config: AppConfig,
        engine: Arc<dyn AudioEngine>,
        enumerator: Arc<dyn DeviceEnumerator>,
        mounter: Arc<dyn Mounter>,
        drive: Arc<dyn LevelDrive>,
    ) -> Arc<Self> {
        let indicator = Arc::new(SignalIndicator::new(&config.indicator, drive));
        let storage = Arc::new(StorageManager::new(
            config.usb.clone(),
            enumerator,
            mounter,
            indicator.clone(),
        ));
        let dispatcher = Arc::new(PlaybackDispatcher::new(
            &config.audio,
            engine,
            storage.clone(),
            indicator.clone(),
        ));

        let (event_tx, event_rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);
        let serial = SerialLink::new(config.serial.clone(), event_tx);

        Arc::new(Self {
            config,
            dispatcher,
            storage,
            indicator,
            serial: Mutex::new(serial),
            serial_rx: Mutex::new(Some(event_rx)),
            consumer: Mutex::new(None),
        })
    }

    /// Start all background workers and mark the system ready.
    pub async fn start(self: &Arc<Self>) {
        self.ensure_audio_directory();

        self.storage.start_monitoring().await;

        if let Err(e) = self.serial.lock().spawn() {
            warn!("Failed to start serial reader: {:#}", e);
        }

        // Consume serial-forwarded triggers through the same entry point
        // the HTTP boundary uses.
        if let Some(mut rx) = self.serial_rx.lock().take() {
            let coordinator = self.clone();
            let handle = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let Err(e) = coordinator.handle_trigger(event).await {
                        warn!("Serial trigger rejected: {}", e);
                    }
                }
            });
            *self.consumer.lock() = Some(handle);
        }

        self.indicator.set_ready(true);
        info!("Gateway ready");
    }

    /// Single entry point for trigger events from any source.
    pub async fn handle_trigger(&self, event: TriggerEvent) -> Result<PlayOutcome, PlayError> {
        let key = event.audio_key(self.dispatcher.hold_detection_enabled());
        let audio_file = self.dispatcher.play(&key).await?;

        info!(
            "Triggered audio: {} from Button{} {} (source: {})",
            audio_file,
            event.button_id,
            event.event_type(),
            event.source
        );

        Ok(PlayOutcome {
            audio_file,
            source: event.source.to_string(),
            event_type: event.event_type().to_string(),
        })
    }

    pub fn set_volume(&self, volume: f32) -> Result<(), PlayError> {
        self.dispatcher.set_volume(volume)
    }

    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            status: "running",
            current_audio: self.dispatcher.currently_playing(),
            volume: self.dispatcher.volume(),
            audio_keys: self.dispatcher.mapping_keys(),
            serial_link: self.link_state().to_string(),
            usb: self.storage.status(),
        }
    }

    pub fn link_state(&self) -> LinkState {
        self.serial.lock().state()
    }

    /// Stop workers, unmount tracked devices, and darken the indicator.
    pub async fn shutdown(&self) {
        info!("Shutting down...");

        // Join the reader thread off the executor, with the lock released.
        if let Some(reader) = self.serial.lock().request_stop() {
            let _ = tokio::task::spawn_blocking(move || reader.join()).await;
            info!("Serial reader stopped");
        }
        if let Some(handle) = self.consumer.lock().take() {
            handle.abort();
        }

        self.storage.stop_monitoring().await;
        self.indicator.all_off();

        info!("Shutdown complete");
    }

    /// Create the local audio directory if needed and warn about mapped
    /// files that have no local backing (they may still resolve via USB).
    fn ensure_audio_directory(&self) {
        let audio_dir = &self.config.audio.audio_dir;
        if !audio_dir.exists() {
            if let Err(e) = std::fs::create_dir_all(audio_dir) {
                warn!(
                    "Failed to create audio directory {}: {}",
                    audio_dir.display(),
                    e
                );
                return;
            }
            info!("Created audio directory: {}", audio_dir.display());
        }

        for filename in self.config.audio.mappings.values() {
            let path = audio_dir.join(filename);
            if !path.exists() {
                warn!("Audio file not found: {}", path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudioConfig, IndicatorConfig, SerialConfig, ServerConfig, UsbConfig};
    use crate::indicator::SoftLevelDrive;
    use crate::storage::RemovableDevice;
    use crate::trigger::TriggerSource;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeEngine {
        busy: AtomicBool,
        starts: Mutex<Vec<PathBuf>>,
    }

    impl FakeEngine {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                busy: AtomicBool::new(false),
                starts: Mutex::new(Vec::new()),
            })
        }
    }

    impl AudioEngine for FakeEngine {
        fn start(&self, path: &Path, _volume: f32) -> Result<()> {
            self.starts.lock().push(path.to_path_buf());
            self.busy.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn stop(&self) {
            self.busy.store(false, Ordering::SeqCst);
        }
        fn is_busy(&self) -> bool {
            self.busy.load(Ordering::SeqCst)
        }
        fn set_volume(&self, _volume: f32) {}
    }

    struct EmptyEnumerator;

    #[async_trait]
    impl DeviceEnumerator for EmptyEnumerator {
        async fn list_removable_devices(&self) -> Result<Vec<RemovableDevice>> {
            Ok(vec![])
        }
    }

    struct NoopMounter;

    #[async_trait]
    impl Mounter for NoopMounter {
        async fn mount(&self, _device: &str, _target: &Path) -> Result<()> {
            Ok(())
        }
        async fn unmount(&self, _target: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn test_config(audio_dir: &Path, hold_detection: bool) -> AppConfig {
        let mut mappings = BTreeMap::new();
        mappings.insert("button1".to_string(), "a.wav".to_string());
        mappings.insert("hold1".to_string(), "b.wav".to_string());
        AppConfig {
            audio: AudioConfig {
                audio_dir: audio_dir.to_path_buf(),
                mappings,
                hold_detection_enabled: hold_detection,
                default_volume: 0.7,
            },
            serial: SerialConfig {
                baud_rate: 115_200,
                candidate_ports: vec![], // No real ports in tests
            },
            usb: UsbConfig {
                enabled: false,
                ..UsbConfig::default()
            },
            indicator: IndicatorConfig::default(),
            server: ServerConfig::default(),
        }
    }

    fn coordinator(audio_dir: &Path, hold_detection: bool) -> (Arc<Coordinator>, Arc<FakeEngine>) {
        let engine = FakeEngine::new();
        let coordinator = Coordinator::new(
            test_config(audio_dir, hold_detection),
            engine.clone(),
            Arc::new(EmptyEnumerator),
            Arc::new(NoopMounter),
            Arc::new(SoftLevelDrive::new()),
        );
        (coordinator, engine)
    }

    fn event(button_id: u32, is_hold: bool) -> TriggerEvent {
        TriggerEvent {
            button_id,
            is_hold,
            source: TriggerSource::Direct,
        }
    }

    #[tokio::test]
    async fn press_and_hold_select_their_mappings() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.wav"), b"riff").unwrap();
        std::fs::write(dir.path().join("b.wav"), b"riff").unwrap();
        let (coordinator, _) = coordinator(dir.path(), true);

        let outcome = coordinator.handle_trigger(event(1, false)).await.unwrap();
        assert_eq!(outcome.audio_file, "a.wav");
        assert_eq!(outcome.event_type, "press");

        let outcome = coordinator.handle_trigger(event(1, true)).await.unwrap();
        assert_eq!(outcome.audio_file, "b.wav");
        assert_eq!(outcome.event_type, "hold");
    }

    #[tokio::test]
    async fn hold_detection_disabled_resolves_like_press() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.wav"), b"riff").unwrap();
        let (coordinator, _) = coordinator(dir.path(), false);

        let outcome = coordinator.handle_trigger(event(1, true)).await.unwrap();
        assert_eq!(outcome.audio_file, "a.wav");
    }

    #[tokio::test]
    async fn unmapped_button_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = coordinator(dir.path(), true);

        let err = coordinator.handle_trigger(event(7, false)).await.unwrap_err();
        assert!(matches!(err, PlayError::NoMapping(_)));
    }

    #[tokio::test]
    async fn status_reflects_playback_and_link() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.wav"), b"riff").unwrap();
        let (coordinator, engine) = coordinator(dir.path(), true);

        let status = coordinator.status();
        assert_eq!(status.status, "running");
        assert_eq!(status.current_audio, None);
        assert_eq!(status.audio_keys, vec!["button1", "hold1"]);
        assert_eq!(status.serial_link, "disconnected");
        assert!(!status.usb.enabled);

        coordinator.handle_trigger(event(1, false)).await.unwrap();
        assert_eq!(
            coordinator.status().current_audio,
            Some("a.wav".to_string())
        );
        assert_eq!(engine.starts.lock().len(), 1);
    }

    #[tokio::test]
    async fn start_and_shutdown_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = coordinator(dir.path(), true);

        coordinator.start().await;
        coordinator.shutdown().await;
        assert_eq!(coordinator.status().serial_link, "disconnected");
    }
}
