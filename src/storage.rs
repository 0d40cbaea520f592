//! USB storage lifecycle management
//!
//! Detects removable block devices by polling, mounts them under the
//! configured mount root, tracks live mounts keyed by device path, and
//! exposes their audio files to the playback dispatcher. The mount-point
//! tree and the device table are mutated only here; other components go
//! through the read-only query methods.
//!
//! Device enumeration and the mount/umount operations are behind trait
//! seams so tests can drive the lifecycle without hardware.

use crate::config::UsbConfig;
use crate::indicator::{BlinkPattern, SignalIndicator};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Audio file extensions recognized on removable devices
const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "ogg", "flac"];

/// A removable block device as reported by the enumerator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovableDevice {
    /// Device node, e.g. "/dev/sda1" (unique key)
    pub device_path: String,
    /// Where the device is already mounted, if an out-of-band actor did so
    pub current_mount_point: Option<String>,
    /// Filesystem label, if any
    pub label: Option<String>,
}

/// Enumerates currently attached removable storage.
#[async_trait]
pub trait DeviceEnumerator: Send + Sync {
    async fn list_removable_devices(&self) -> Result<Vec<RemovableDevice>>;
}

/// Performs the actual mount/unmount operations.
#[async_trait]
pub trait Mounter: Send + Sync {
    async fn mount(&self, device: &str, target: &Path) -> Result<()>;
    async fn unmount(&self, target: &Path) -> Result<()>;
}

/// A device currently mounted and tracked by the manager.
#[derive(Debug, Clone)]
pub struct MountedDevice {
    pub device_path: String,
    pub mount_path: PathBuf,
    pub label: Option<String>,
    pub mounted_at: DateTime<Utc>,
}

/// Read-only status snapshot for the HTTP boundary.
#[derive(Debug, Clone, Serialize)]
pub struct StorageStatus {
    pub enabled: bool,
    pub mounted_count: usize,
    pub device_paths: Vec<String>,
    pub audio_file_count: usize,
}

/// Manages the mount lifecycle of removable audio sources.
pub struct StorageManager {
    cfg: UsbConfig,
    enumerator: Arc<dyn DeviceEnumerator>,
    mounter: Arc<dyn Mounter>,
    indicator: Arc<SignalIndicator>,
    mounted: RwLock<HashMap<String, MountedDevice>>,
    monitor: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl StorageManager {
    pub fn new(
        cfg: UsbConfig,
        enumerator: Arc<dyn DeviceEnumerator>,
        mounter: Arc<dyn Mounter>,
        indicator: Arc<SignalIndicator>,
    ) -> Self {
        Self {
            cfg,
            enumerator,
            mounter,
            indicator,
            mounted: RwLock::new(HashMap::new()),
            monitor: Mutex::new(None),
        }
    }

    /// Reconcile the tracked mount set against the current enumeration.
    ///
    /// Idempotent: polling twice with the same enumeration is a no-op.
    /// Mount failures are not retried within the same poll; the device stays
    /// untracked and is retried on the next natural poll.
    pub async fn poll_once(&self) -> Result<()> {
        if !self.cfg.enabled {
            return Ok(());
        }

        let devices = self
            .enumerator
            .list_removable_devices()
            .await
            .context("Device enumeration failed")?;

        let tracked: Vec<String> = self.mounted.read().keys().cloned().collect();

        // Mount new devices
        for device in &devices {
            if tracked.contains(&device.device_path) {
                continue;
            }
            if device.current_mount_point.is_some() {
                debug!(
                    "Skipping {}: already mounted out of band",
                    device.device_path
                );
                continue;
            }

            info!("New USB device detected: {}", device.device_path);
            match self.mount_device(device).await {
                Ok(record) => {
                    info!(
                        "Mounted {} at {}",
                        record.device_path,
                        record.mount_path.display()
                    );
                    self.mounted
                        .write()
                        .insert(record.device_path.clone(), record);
                    self.indicator.blink(BlinkPattern::MountSuccess);
                }
                Err(e) => {
                    warn!("Failed to mount {}: {:#}", device.device_path, e);
                    self.indicator.blink(BlinkPattern::MountError);
                }
            }
        }

        // Unmount removed devices
        let present: Vec<&str> = devices.iter().map(|d| d.device_path.as_str()).collect();
        let removed: Vec<String> = tracked
            .into_iter()
            .filter(|path| !present.contains(&path.as_str()))
            .collect();

        for device_path in removed {
            info!("USB device removed: {}", device_path);
            self.drop_device(&device_path).await;
        }

        Ok(())
    }

    /// Start the background poll loop.
    pub async fn start_monitoring(self: &Arc<Self>) {
        if !self.cfg.enabled {
            info!("USB monitoring disabled");
            return;
        }

        let mut guard = self.monitor.lock().await;
        if guard.is_some() {
            warn!("USB monitoring already running");
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let manager = self.clone();
        let interval = Duration::from_secs(self.cfg.poll_interval_secs.max(1));

        let handle = tokio::spawn(async move {
            info!("USB monitoring started");
            manager.indicator.blink(BlinkPattern::SystemReady);

            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = manager.poll_once().await {
                            warn!("USB poll failed: {:#}", e);
                            manager.indicator.blink(BlinkPattern::SystemError);
                        }
                    }
                    _ = stop_rx.changed() => {
                        break;
                    }
                }
            }
            info!("USB monitoring stopped");
        });

        *guard = Some((stop_tx, handle));
    }

    /// Stop the poll loop and force-unmount every tracked device.
    ///
    /// Each unmount is best-effort; a failure is logged and never aborts the
    /// rest of the cleanup.
    pub async fn stop_monitoring(&self) {
        if let Some((stop_tx, handle)) = self.monitor.lock().await.take() {
            let _ = stop_tx.send(true);
            let _ = handle.await;
        }

        let device_paths: Vec<String> = self.mounted.read().keys().cloned().collect();
        for device_path in device_paths {
            self.drop_device(&device_path).await;
        }
    }

    /// Resolve an audio key against the mounted devices.
    ///
    /// Scans the audio subdirectory of every live mount on each call so the
    /// result always reflects the current mount set. Keys are disambiguated
    /// as `label_filename` when the device has a label, else `filename`.
    pub fn resolve_audio_file(&self, key: &str) -> Option<PathBuf> {
        self.usb_audio_index()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, path)| path)
    }

    /// Current status snapshot.
    pub fn status(&self) -> StorageStatus {
        let mounted = self.mounted.read();
        StorageStatus {
            enabled: self.cfg.enabled,
            mounted_count: mounted.len(),
            device_paths: {
                let mut paths: Vec<String> = mounted.keys().cloned().collect();
                paths.sort();
                paths
            },
            audio_file_count: self.usb_audio_index().len(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    /// Union of all audio files across live mounts, keyed for lookup.
    fn usb_audio_index(&self) -> Vec<(String, PathBuf)> {
        let mounts: Vec<MountedDevice> = self.mounted.read().values().cloned().collect();
        let mut index = Vec::new();

        for mount in mounts {
            let audio_path = mount.mount_path.join(&self.cfg.audio_dir);
            let entries = match std::fs::read_dir(&audio_path) {
                Ok(entries) => entries,
                Err(_) => continue, // No audio dir on this device
            };

            for entry in entries.flatten() {
                let path = entry.path();
                let is_audio = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| AUDIO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                    .unwrap_or(false);
                if !is_audio {
                    continue;
                }

                if let Some(filename) = path.file_name().and_then(|n| n.to_str()) {
                    let key = match &mount.label {
                        Some(label) if !label.is_empty() => format!("{}_{}", label, filename),
                        _ => filename.to_string(),
                    };
                    index.push((key, path));
                }
            }
        }

        index
    }

    async fn mount_device(&self, device: &RemovableDevice) -> Result<MountedDevice> {
        let mount_path = self.allocate_mount_path(device);

        std::fs::create_dir_all(&mount_path).with_context(|| {
            format!("Failed to create mount directory {}", mount_path.display())
        })?;

        let timeout = Duration::from_secs(self.cfg.mount_timeout_secs);
        match tokio::time::timeout(timeout, self.mounter.mount(&device.device_path, &mount_path))
            .await
        {
            Ok(Ok(())) => Ok(MountedDevice {
                device_path: device.device_path.clone(),
                mount_path,
                label: device.label.clone(),
                mounted_at: Utc::now(),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => bail!("Mount timeout for {}", device.device_path),
        }
    }

    /// Allocate a unique mount path under the mount root.
    ///
    /// Label-derived path when a label is present; deterministic fallback to
    /// the raw device name when the label path is already held by another
    /// live record (duplicate labels).
    fn allocate_mount_path(&self, device: &RemovableDevice) -> PathBuf {
        let device_name = device
            .device_path
            .rsplit('/')
            .next()
            .unwrap_or(&device.device_path)
            .to_string();

        let candidate = match &device.label {
            Some(label) if !label.is_empty() => {
                let sanitized: String = label
                    .chars()
                    .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
                    .collect();
                self.cfg.mount_root.join(sanitized)
            }
            _ => self.cfg.mount_root.join(&device_name),
        };

        let taken = self
            .mounted
            .read()
            .values()
            .any(|m| m.mount_path == candidate);
        if taken {
            self.cfg.mount_root.join(device_name)
        } else {
            candidate
        }
    }

    /// Unmount and untrack a device.
    ///
    /// The record is dropped even when the unmount fails: the physical device
    /// is gone regardless, and keeping it tracked would wedge the lifecycle.
    async fn drop_device(&self, device_path: &str) {
        let record = self.mounted.write().remove(device_path);
        let Some(record) = record else {
            return;
        };

        let timeout = Duration::from_secs(self.cfg.mount_timeout_secs);
        match tokio::time::timeout(timeout, self.mounter.unmount(&record.mount_path)).await {
            Ok(Ok(())) => info!("Unmounted {}", device_path),
            Ok(Err(e)) => warn!("Failed to unmount {}: {:#}", device_path, e),
            Err(_) => warn!("Unmount timeout for {}", device_path),
        }

        // Best-effort removal of the now-empty mount directory
        if let Err(e) = std::fs::remove_dir(&record.mount_path) {
            debug!(
                "Leaving mount directory {}: {}",
                record.mount_path.display(),
                e
            );
        }
    }
}

/// Enumerator backed by `lsblk -J`; output parsing is deliberately thin.
pub struct LsblkEnumerator;

#[async_trait]
impl DeviceEnumerator for LsblkEnumerator {
    async fn list_removable_devices(&self) -> Result<Vec<RemovableDevice>> {
        let output = tokio::process::Command::new("lsblk")
            .args(["-J", "-o", "PATH,TYPE,RM,MOUNTPOINT,LABEL"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run lsblk")?;

        if !output.status.success() {
            bail!(
                "lsblk exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let parsed: serde_json::Value =
            serde_json::from_slice(&output.stdout).context("Failed to parse lsblk output")?;

        let mut devices = Vec::new();
        collect_removable(&parsed["blockdevices"], &mut devices);
        Ok(devices)
    }
}

fn collect_removable(nodes: &serde_json::Value, out: &mut Vec<RemovableDevice>) {
    let Some(nodes) = nodes.as_array() else {
        return;
    };
    for node in nodes {
        let removable = node["rm"].as_bool().unwrap_or(false)
            || node["rm"].as_str() == Some("1");
        let node_type = node["type"].as_str().unwrap_or("");
        if removable && node_type == "part" {
            if let Some(path) = node["path"].as_str() {
                out.push(RemovableDevice {
                    device_path: path.to_string(),
                    current_mount_point: node["mountpoint"].as_str().map(String::from),
                    label: node["label"].as_str().map(String::from),
                });
            }
        }
        // Partitions nest under their disk
        collect_removable(&node["children"], out);
    }
}

/// Mounter shelling out to mount(8)/umount(8).
pub struct SystemMounter;

#[async_trait]
impl Mounter for SystemMounter {
    async fn mount(&self, device: &str, target: &Path) -> Result<()> {
        run_checked("mount", &[device, &target.to_string_lossy()]).await
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        run_checked("umount", &[&target.to_string_lossy()]).await
    }
}

async fn run_checked(program: &str, args: &[&str]) -> Result<()> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("Failed to run {}", program))?;

    if !output.status.success() {
        bail!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndicatorConfig;
    use crate::indicator::SoftLevelDrive;

    /// Enumerator returning a fixed device list, swappable between polls.
    struct FakeEnumerator {
        devices: parking_lot::Mutex<Vec<RemovableDevice>>,
    }

    impl FakeEnumerator {
        fn new(devices: Vec<RemovableDevice>) -> Arc<Self> {
            Arc::new(Self {
                devices: parking_lot::Mutex::new(devices),
            })
        }

        fn set(&self, devices: Vec<RemovableDevice>) {
            *self.devices.lock() = devices;
        }
    }

    #[async_trait]
    impl DeviceEnumerator for FakeEnumerator {
        async fn list_removable_devices(&self) -> Result<Vec<RemovableDevice>> {
            Ok(self.devices.lock().clone())
        }
    }

    /// Mounter recording calls; mount failures configurable per device.
    #[derive(Default)]
    struct FakeMounter {
        mounts: parking_lot::Mutex<Vec<(String, PathBuf)>>,
        unmounts: parking_lot::Mutex<Vec<PathBuf>>,
        fail_devices: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Mounter for FakeMounter {
        async fn mount(&self, device: &str, target: &Path) -> Result<()> {
            if self.fail_devices.lock().iter().any(|d| d == device) {
                bail!("simulated mount failure");
            }
            self.mounts
                .lock()
                .push((device.to_string(), target.to_path_buf()));
            Ok(())
        }

        async fn unmount(&self, target: &Path) -> Result<()> {
            self.unmounts.lock().push(target.to_path_buf());
            Ok(())
        }
    }

    fn device(path: &str, label: Option<&str>) -> RemovableDevice {
        RemovableDevice {
            device_path: path.to_string(),
            current_mount_point: None,
            label: label.map(String::from),
        }
    }

    fn manager(
        root: &Path,
        enumerator: Arc<FakeEnumerator>,
        mounter: Arc<FakeMounter>,
    ) -> Arc<StorageManager> {
        let cfg = UsbConfig {
            enabled: true,
            mount_root: root.to_path_buf(),
            audio_dir: "audio_files".to_string(),
            poll_interval_secs: 1,
            mount_timeout_secs: 2,
        };
        let indicator = Arc::new(SignalIndicator::new(
            &IndicatorConfig::default(),
            Arc::new(SoftLevelDrive::new()),
        ));
        Arc::new(StorageManager::new(cfg, enumerator, mounter, indicator))
    }

    #[tokio::test]
    async fn mount_then_repoll_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let enumerator = FakeEnumerator::new(vec![device("/dev/sda1", Some("STICK"))]);
        let mounter = Arc::new(FakeMounter::default());
        let mgr = manager(root.path(), enumerator.clone(), mounter.clone());

        mgr.poll_once().await.unwrap();
        assert_eq!(mgr.status().mounted_count, 1);
        assert_eq!(mounter.mounts.lock().len(), 1);

        // Same enumeration again: no new mounts
        mgr.poll_once().await.unwrap();
        assert_eq!(mgr.status().mounted_count, 1);
        assert_eq!(mounter.mounts.lock().len(), 1);
    }

    #[tokio::test]
    async fn removed_device_is_untracked_exactly_once() {
        let root = tempfile::tempdir().unwrap();
        let enumerator = FakeEnumerator::new(vec![device("/dev/sda1", None)]);
        let mounter = Arc::new(FakeMounter::default());
        let mgr = manager(root.path(), enumerator.clone(), mounter.clone());

        mgr.poll_once().await.unwrap();
        assert_eq!(mgr.status().mounted_count, 1);

        enumerator.set(vec![]);
        mgr.poll_once().await.unwrap();
        assert_eq!(mgr.status().mounted_count, 0);
        assert_eq!(mounter.unmounts.lock().len(), 1);

        mgr.poll_once().await.unwrap();
        assert_eq!(mounter.unmounts.lock().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_labels_get_distinct_mount_paths() {
        let root = tempfile::tempdir().unwrap();
        let enumerator = FakeEnumerator::new(vec![
            device("/dev/sda1", Some("MUSIC")),
            device("/dev/sdb1", Some("MUSIC")),
        ]);
        let mounter = Arc::new(FakeMounter::default());
        let mgr = manager(root.path(), enumerator, mounter.clone());

        mgr.poll_once().await.unwrap();
        assert_eq!(mgr.status().mounted_count, 2);

        let mounts = mounter.mounts.lock();
        assert_eq!(mounts.len(), 2);
        assert_ne!(mounts[0].1, mounts[1].1);
        // Second device fell back to its raw device name
        assert!(mounts.iter().any(|(_, p)| p.ends_with("MUSIC")));
        assert!(mounts.iter().any(|(_, p)| p.ends_with("sdb1")));
    }

    #[tokio::test]
    async fn mount_failure_retried_on_next_poll() {
        let root = tempfile::tempdir().unwrap();
        let enumerator = FakeEnumerator::new(vec![device("/dev/sda1", None)]);
        let mounter = Arc::new(FakeMounter::default());
        mounter.fail_devices.lock().push("/dev/sda1".to_string());
        let mgr = manager(root.path(), enumerator, mounter.clone());

        mgr.poll_once().await.unwrap();
        assert_eq!(mgr.status().mounted_count, 0);

        // Fault clears; the device is still in the enumeration and untracked
        mounter.fail_devices.lock().clear();
        mgr.poll_once().await.unwrap();
        assert_eq!(mgr.status().mounted_count, 1);
    }

    #[tokio::test]
    async fn out_of_band_mounts_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let enumerator = FakeEnumerator::new(vec![RemovableDevice {
            device_path: "/dev/sda1".to_string(),
            current_mount_point: Some("/mnt/elsewhere".to_string()),
            label: None,
        }]);
        let mounter = Arc::new(FakeMounter::default());
        let mgr = manager(root.path(), enumerator, mounter.clone());

        mgr.poll_once().await.unwrap();
        assert_eq!(mgr.status().mounted_count, 0);
        assert!(mounter.mounts.lock().is_empty());
    }

    #[tokio::test]
    async fn resolves_audio_with_label_prefix() {
        let root = tempfile::tempdir().unwrap();
        let enumerator = FakeEnumerator::new(vec![device("/dev/sda1", Some("STICK"))]);
        let mounter = Arc::new(FakeMounter::default());
        let mgr = manager(root.path(), enumerator, mounter);

        mgr.poll_once().await.unwrap();

        // Populate the audio subdir of the (fake) mount
        let audio_dir = root.path().join("STICK").join("audio_files");
        std::fs::create_dir_all(&audio_dir).unwrap();
        std::fs::write(audio_dir.join("chime.wav"), b"riff").unwrap();
        std::fs::write(audio_dir.join("notes.txt"), b"not audio").unwrap();

        let resolved = mgr.resolve_audio_file("STICK_chime.wav").unwrap();
        assert!(resolved.ends_with("chime.wav"));
        assert!(mgr.resolve_audio_file("chime.wav").is_none());
        assert!(mgr.resolve_audio_file("STICK_notes.txt").is_none());
        assert_eq!(mgr.status().audio_file_count, 1);
    }

    #[tokio::test]
    async fn stop_monitoring_unmounts_everything() {
        let root = tempfile::tempdir().unwrap();
        let enumerator = FakeEnumerator::new(vec![
            device("/dev/sda1", None),
            device("/dev/sdb1", None),
        ]);
        let mounter = Arc::new(FakeMounter::default());
        let mgr = manager(root.path(), enumerator, mounter.clone());

        mgr.poll_once().await.unwrap();
        assert_eq!(mgr.status().mounted_count, 2);

        mgr.stop_monitoring().await;
        assert_eq!(mgr.status().mounted_count, 0);
        assert_eq!(mounter.unmounts.lock().len(), 2);
    }

    #[test]
    fn lsblk_json_parsing() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{
                "blockdevices": [
                    {"path": "/dev/mmcblk0", "type": "disk", "rm": false, "mountpoint": null, "label": null,
                     "children": [
                        {"path": "/dev/mmcblk0p1", "type": "part", "rm": false, "mountpoint": "/", "label": null}
                     ]},
                    {"path": "/dev/sda", "type": "disk", "rm": true, "mountpoint": null, "label": null,
                     "children": [
                        {"path": "/dev/sda1", "type": "part", "rm": true, "mountpoint": null, "label": "STICK"}
                     ]}
                ]
            }"#,
        )
        .unwrap();

        let mut devices = Vec::new();
        collect_removable(&json["blockdevices"], &mut devices);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_path, "/dev/sda1");
        assert_eq!(devices[0].label.as_deref(), Some("STICK"));
        assert!(devices[0].current_mount_point.is_none());
    }
}
