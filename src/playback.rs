//! Playback dispatch and the audio output engine
//!
//! The dispatcher resolves an audio key to a concrete file (local directory
//! first, then the USB storage index) and enforces single-active-stream
//! semantics: the output pipeline is monophonic, so starting a new playback
//! stops the active one. Concurrent `play` calls are serialized through an
//! internal critical section, and a generation counter lets the completion
//! observer of a superseded playback exit without touching newer state.

use crate::config::AudioConfig;
use crate::indicator::SignalIndicator;
use crate::storage::StorageManager;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// How often the completion observer checks the engine.
const COMPLETION_POLL: Duration = Duration::from_millis(100);

/// Request-facing playback errors.
#[derive(Debug, Error)]
pub enum PlayError {
    #[error("no audio file mapped for key '{0}'")]
    NoMapping(String),
    #[error("audio file not found: {0}")]
    SourceNotFound(String),
    #[error("volume must be within [0.0, 1.0], got {0}")]
    InvalidVolume(f32),
    #[error("playback failed: {0}")]
    Engine(#[from] anyhow::Error),
}

/// Monophonic audio output pipeline.
///
/// Implementations use interior mutability; all methods take `&self` to
/// support `Arc<dyn AudioEngine>` shared across tasks.
pub trait AudioEngine: Send + Sync {
    /// Stop whatever is loaded and start playing the given file.
    fn start(&self, path: &Path, volume: f32) -> Result<()>;
    /// Stop and unload the active stream, if any.
    fn stop(&self);
    /// Whether a stream is currently playing.
    fn is_busy(&self) -> bool;
    /// Apply a volume to the active stream.
    fn set_volume(&self, volume: f32);
}

/// rodio-backed engine.
///
/// `OutputStream` is not `Send`, so a dedicated thread owns it for the
/// engine's lifetime; sinks are created from the thread-safe stream handle.
pub struct RodioEngine {
    handle: rodio::OutputStreamHandle,
    sink: Mutex<Option<rodio::Sink>>,
    /// Dropping this releases the output thread and its stream.
    _shutdown_tx: std::sync::mpsc::Sender<()>,
}

impl RodioEngine {
    pub fn new() -> Result<Self> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || match rodio::OutputStream::try_default() {
                Ok((stream, handle)) => {
                    let _ = handle_tx.send(Ok(handle));
                    // Keep the stream alive until the engine is dropped
                    let _stream = stream;
                    let _ = shutdown_rx.recv();
                }
                Err(e) => {
                    let _ = handle_tx.send(Err(anyhow::anyhow!(e)));
                }
            })
            .context("Failed to spawn audio output thread")?;

        let handle = handle_rx
            .recv()
            .context("Audio output thread exited before reporting")?
            .context("Failed to open default audio output")?;

        Ok(Self {
            handle,
            sink: Mutex::new(None),
            _shutdown_tx: shutdown_tx,
        })
    }
}

impl AudioEngine for RodioEngine {
    fn start(&self, path: &Path, volume: f32) -> Result<()> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open audio file {}", path.display()))?;
        let source = rodio::Decoder::new(BufReader::new(file))
            .with_context(|| format!("Failed to decode audio file {}", path.display()))?;

        let sink = rodio::Sink::try_new(&self.handle).context("Failed to create audio sink")?;
        sink.set_volume(volume);
        sink.append(source);

        if let Some(old) = self.sink.lock().replace(sink) {
            old.stop();
        }
        Ok(())
    }

    fn stop(&self) {
        if let Some(sink) = self.sink.lock().take() {
            sink.stop();
        }
    }

    fn is_busy(&self) -> bool {
        self.sink
            .lock()
            .as_ref()
            .map(|sink| !sink.empty())
            .unwrap_or(false)
    }

    fn set_volume(&self, volume: f32) {
        if let Some(sink) = self.sink.lock().as_ref() {
            sink.set_volume(volume);
        }
    }
}

#[derive(Debug, Default)]
struct PlaybackState {
    active_file: Option<String>,
    generation: u64,
}

/// Resolves audio keys and owns the single playback slot.
pub struct PlaybackDispatcher {
    engine: Arc<dyn AudioEngine>,
    storage: Arc<StorageManager>,
    indicator: Arc<SignalIndicator>,
    mappings: BTreeMap<String, String>,
    audio_dir: PathBuf,
    hold_detection_enabled: bool,
    volume: Mutex<f32>,
    state: Arc<Mutex<PlaybackState>>,
    /// Serializes the stop-then-start sequence across concurrent callers.
    control: tokio::sync::Mutex<()>,
}

impl PlaybackDispatcher {
    pub fn new(
        cfg: &AudioConfig,
        engine: Arc<dyn AudioEngine>,
        storage: Arc<StorageManager>,
        indicator: Arc<SignalIndicator>,
    ) -> Self {
        Self {
            engine,
            storage,
            indicator,
            mappings: cfg.mappings.clone(),
            audio_dir: cfg.audio_dir.clone(),
            hold_detection_enabled: cfg.hold_detection_enabled,
            volume: Mutex::new(cfg.default_volume.clamp(0.0, 1.0)),
            state: Arc::new(Mutex::new(PlaybackState::default())),
            control: tokio::sync::Mutex::new(()),
        }
    }

    pub fn hold_detection_enabled(&self) -> bool {
        self.hold_detection_enabled
    }

    /// Audio keys present in the mapping table, in table order.
    pub fn mapping_keys(&self) -> Vec<String> {
        self.mappings.keys().cloned().collect()
    }

    /// Resolve and play the file mapped to `key`, superseding any active
    /// playback. Returns the mapped logical filename on acceptance.
    pub async fn play(&self, key: &str) -> Result<String, PlayError> {
        let filename = self
            .mappings
            .get(key)
            .ok_or_else(|| PlayError::NoMapping(key.to_string()))?
            .clone();

        // The trigger was acknowledged at the boundary, so the received
        // pulse fires even if the backing file turns out to be missing.
        self.indicator.pulse_received();

        let path = self.resolve_source(&filename).ok_or_else(|| {
            warn!("Audio file not found in any source: {}", filename);
            PlayError::SourceNotFound(filename.clone())
        })?;

        let _guard = self.control.lock().await;

        self.engine.stop();

        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.active_file = Some(filename.clone());
            state.generation
        };

        let volume = *self.volume.lock();
        if let Err(e) = self.engine.start(&path, volume) {
            {
                let mut state = self.state.lock();
                if state.generation == generation {
                    state.active_file = None;
                }
            }
            // A superseded playback's observer exits on the generation
            // check without touching the indicator, so the storage channel
            // must be turned off here or it stays lit with nothing playing.
            if self.storage.enabled() {
                self.indicator.storage_activity(false);
            }
            return Err(PlayError::Engine(e));
        }

        info!("Playing {} (from {})", filename, path.display());

        // Storage-activity indication is coarse: it toggles around every
        // playback while USB is enabled, regardless of the actual source.
        if self.storage.enabled() {
            self.indicator.storage_activity(true);
        }
        self.indicator.pulse_playing();

        self.spawn_completion_observer(generation, filename.clone());

        Ok(filename)
    }

    /// Set the playback volume, applied to the active stream and remembered
    /// for future playbacks. Out-of-range values are rejected.
    pub fn set_volume(&self, volume: f32) -> Result<(), PlayError> {
        if !(0.0..=1.0).contains(&volume) || !volume.is_finite() {
            return Err(PlayError::InvalidVolume(volume));
        }
        *self.volume.lock() = volume;
        self.engine.set_volume(volume);
        Ok(())
    }

    pub fn volume(&self) -> f32 {
        *self.volume.lock()
    }

    pub fn currently_playing(&self) -> Option<String> {
        self.state.lock().active_file.clone()
    }

    /// Local audio directory first, then the USB index.
    fn resolve_source(&self, filename: &str) -> Option<PathBuf> {
        let local = self.audio_dir.join(filename);
        if local.is_file() {
            return Some(local);
        }
        self.storage.resolve_audio_file(filename)
    }

    /// Watches the engine until the stream drains, then clears the active
    /// slot. If a newer playback has superseded this generation, the
    /// observer exits without mutating anything.
    fn spawn_completion_observer(&self, generation: u64, filename: String) {
        let engine = self.engine.clone();
        let state = self.state.clone();
        let indicator = self.indicator.clone();
        let storage_enabled = self.storage.enabled();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(COMPLETION_POLL).await;

                if state.lock().generation != generation {
                    return; // Superseded
                }
                if !engine.is_busy() {
                    break;
                }
            }

            {
                let mut state = state.lock();
                if state.generation != generation {
                    return;
                }
                state.active_file = None;
            }

            if storage_enabled {
                indicator.storage_activity(false);
            }
            info!("Finished playing {}", filename);
        });
    }
}
