//! Serial link to the button receiver
//!
//! Owns the serial transport: scans a fixed candidate-port list, reads
//! newline-delimited trigger lines on a dedicated thread, and reconnects
//! when the physically unstable link drops. Parsed lines are forwarded to
//! the coordinator through a bounded channel with `try_send`, so a slow
//! downstream can never stall the reader; a full channel means the event is
//! logged and dropped.

use crate::config::SerialConfig;
use crate::trigger::{parse_trigger_line, TriggerEvent, TriggerSource};
use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use serialport::SerialPort;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Per-read timeout; keeps the reader responsive to stop requests.
const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// Delay after a reconnect attempt fails right after a drop.
const RECONNECT_SHORT: Duration = Duration::from_secs(1);
/// Delay between subsequent full reconnect attempts. Longer than the short
/// delay so a device mid-enumeration is not hammered.
const RECONNECT_LONG: Duration = Duration::from_secs(5);
/// Cap on buffered bytes while waiting for a newline.
const MAX_LINE_BUFFER: usize = 4096;

/// Connection state, readable for status reporting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
        }
    }
}

/// Serial transport owner with its reconnecting reader thread.
pub struct SerialLink {
    cfg: SerialConfig,
    state: Arc<RwLock<LinkState>>,
    /// Last port that worked, tried first on the next reconnect.
    preferred_port: Arc<Mutex<Option<String>>>,
    event_tx: mpsc::Sender<TriggerEvent>,
    running: Arc<AtomicBool>,
    reader: Option<std::thread::JoinHandle<()>>,
}

impl SerialLink {
    pub fn new(cfg: SerialConfig, event_tx: mpsc::Sender<TriggerEvent>) -> Self {
        Self {
            cfg,
            state: Arc::new(RwLock::new(LinkState::Disconnected)),
            preferred_port: Arc::new(Mutex::new(None)),
            event_tx,
            running: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.read()
    }

    /// Start the reader thread. Failure to open any candidate port is a
    /// non-fatal steady state: the loop keeps retrying and the service
    /// simply receives no serial events meanwhile.
    pub fn spawn(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Serial reader already running");
            return Ok(());
        }

        let cfg = self.cfg.clone();
        let state = self.state.clone();
        let preferred = self.preferred_port.clone();
        let event_tx = self.event_tx.clone();
        let running = self.running.clone();

        let handle = std::thread::Builder::new()
            .name("serial-reader".to_string())
            .spawn(move || {
                reader_loop(cfg, state, preferred, event_tx, running);
            })?;

        self.reader = Some(handle);
        info!("Serial reader started");
        Ok(())
    }

    /// Signal the reader thread to stop and hand back its join handle so
    /// the caller can wait for the exit outside any lock it holds.
    pub fn request_stop(&mut self) -> Option<std::thread::JoinHandle<()>> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return None;
        }
        *self.state.write() = LinkState::Disconnected;
        self.reader.take()
    }

    /// Stop the reader thread and wait for it to exit.
    pub fn stop(&mut self) {
        if let Some(handle) = self.request_stop() {
            let _ = handle.join();
            info!("Serial reader stopped");
        }
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reader_loop(
    cfg: SerialConfig,
    state: Arc<RwLock<LinkState>>,
    preferred: Arc<Mutex<Option<String>>>,
    event_tx: mpsc::Sender<TriggerEvent>,
    running: Arc<AtomicBool>,
) {
    let mut retry_delay = RECONNECT_SHORT;

    while running.load(Ordering::SeqCst) {
        *state.write() = LinkState::Connecting;

        let sticky = preferred.lock().clone();
        match try_connect(&cfg, sticky.as_deref()) {
            Some((port, name)) => {
                info!("Connected to serial port: {}", name);
                *preferred.lock() = Some(name);
                *state.write() = LinkState::Connected;
                retry_delay = RECONNECT_SHORT;

                read_until_failure(port, &event_tx, &running);

                *state.write() = LinkState::Disconnected;
                if running.load(Ordering::SeqCst) {
                    warn!("Serial connection lost, attempting to reconnect...");
                }
            }
            None => {
                *state.write() = LinkState::Disconnected;
                error!("Failed to connect to any serial port");
                sleep_responsive(retry_delay, &running);
                retry_delay = RECONNECT_LONG;
            }
        }
    }
}

/// Try each candidate port, preferred (last-working) port first.
fn try_connect(
    cfg: &SerialConfig,
    preferred: Option<&str>,
) -> Option<(Box<dyn SerialPort>, String)> {
    for candidate in candidate_order(preferred, &cfg.candidate_ports) {
        match serialport::new(&candidate, cfg.baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
        {
            Ok(port) => return Some((port, candidate)),
            Err(e) => debug!("Failed to open {}: {}", candidate, e),
        }
    }
    None
}

/// Candidate list with the sticky-preferred port moved to the front.
fn candidate_order(preferred: Option<&str>, candidates: &[String]) -> Vec<String> {
    let mut order = Vec::with_capacity(candidates.len() + 1);
    if let Some(p) = preferred {
        order.push(p.to_string());
    }
    for c in candidates {
        if !order.iter().any(|o| o == c) {
            order.push(c.clone());
        }
    }
    order
}

/// Read newline-delimited lines until the port fails or a stop is requested.
fn read_until_failure(
    mut port: Box<dyn SerialPort>,
    event_tx: &mpsc::Sender<TriggerEvent>,
    running: &Arc<AtomicBool>,
) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 256];

    while running.load(Ordering::SeqCst) {
        match port.read(&mut chunk) {
            Ok(0) => return, // Port closed
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                drain_lines(&mut buffer, |line| handle_line(line, event_tx));
                if buffer.len() > MAX_LINE_BUFFER {
                    warn!("Serial line buffer overflow, discarding {} bytes", buffer.len());
                    buffer.clear();
                }
            }
            Err(e) if matches!(e.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted) => {
                continue;
            }
            Err(e) => {
                warn!("Serial read error: {}", e);
                return;
            }
        }
    }
}

/// Split complete lines off the front of `buffer`, invoking `f` for each.
fn drain_lines(buffer: &mut Vec<u8>, mut f: impl FnMut(&str)) {
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&line);
        let text = text.trim();
        if !text.is_empty() {
            f(text);
        }
    }
}

/// Parse one line and forward the event; malformed lines and forwarding
/// failures are logged and dropped, never fatal and never retried.
fn handle_line(line: &str, event_tx: &mpsc::Sender<TriggerEvent>) {
    debug!("Received from receiver: {}", line);

    let Some((button_id, is_hold)) = parse_trigger_line(line) else {
        warn!("Unknown command format: {}", line);
        return;
    };

    let event = TriggerEvent {
        button_id,
        is_hold,
        source: TriggerSource::SerialForward,
    };
    if let Err(e) = event_tx.try_send(event) {
        warn!("Dropping serial trigger, downstream busy: {}", e);
    }
}

fn sleep_responsive(total: Duration, running: &Arc<AtomicBool>) {
    let step = Duration::from_millis(100);
    let mut remaining = total;
    while !remaining.is_zero() && running.load(Ordering::SeqCst) {
        let slice = remaining.min(step);
        std::thread::sleep(slice);
        remaining -= slice;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_splits_complete_lines_and_keeps_partial() {
        let mut buffer = b"BTN1:PRESS\nBTN2:HO".to_vec();
        let mut lines = Vec::new();
        drain_lines(&mut buffer, |l| lines.push(l.to_string()));

        assert_eq!(lines, vec!["BTN1:PRESS"]);
        assert_eq!(buffer, b"BTN2:HO");

        buffer.extend_from_slice(b"LD\n");
        drain_lines(&mut buffer, |l| lines.push(l.to_string()));
        assert_eq!(lines, vec!["BTN1:PRESS", "BTN2:HOLD"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn drain_skips_blank_lines() {
        let mut buffer = b"\n\r\n  \nBTN1:PRESS\n".to_vec();
        let mut lines = Vec::new();
        drain_lines(&mut buffer, |l| lines.push(l.to_string()));
        assert_eq!(lines, vec!["BTN1:PRESS"]);
    }

    #[test]
    fn preferred_port_is_tried_first() {
        let candidates = vec![
            "/dev/ttyACM0".to_string(),
            "/dev/ttyUSB0".to_string(),
            "/dev/ttyUSB1".to_string(),
        ];

        let order = candidate_order(Some("/dev/ttyUSB1"), &candidates);
        assert_eq!(
            order,
            vec!["/dev/ttyUSB1", "/dev/ttyACM0", "/dev/ttyUSB0"]
        );

        // No preference: config order preserved
        let order = candidate_order(None, &candidates);
        assert_eq!(order, candidates);
    }

    #[tokio::test]
    async fn parsed_lines_are_forwarded_and_malformed_dropped() {
        let (tx, mut rx) = mpsc::channel(8);

        handle_line("BTN3:HOLD", &tx);
        handle_line("garbage", &tx);
        handle_line("BTN1:PRESS", &tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.button_id, 3);
        assert!(first.is_hold);
        assert_eq!(first.source, TriggerSource::SerialForward);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.button_id, 1);
        assert!(!second.is_hold);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_channel_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);

        handle_line("BTN1:PRESS", &tx);
        handle_line("BTN2:PRESS", &tx); // Dropped, channel full

        assert_eq!(rx.recv().await.unwrap().button_id, 1);
        assert!(rx.try_recv().is_err());
    }
}
