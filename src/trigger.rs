//! Trigger events and the serial line protocol
//!
//! A trigger is a normalized (button, hold?) signal regardless of origin:
//! the HTTP boundary, the serial-forwarded path, or a relay hop. The serial
//! receiver emits newline-delimited `BTN<digits>:<ACTION>` lines which are
//! parsed here into events.

use std::fmt;

/// Where a trigger event entered the system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// Direct call on the HTTP boundary
    Direct,
    /// Forwarded from the serial receiver
    SerialForward,
    /// Relayed through another field device
    Relay,
}

impl TriggerSource {
    /// Parse the boundary's free-form source tag; unknown tags fall back to Direct
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "serial" | "serial_forward" | "receiver_serial" => TriggerSource::SerialForward,
            "relay" | "transmitter" => TriggerSource::Relay,
            _ => TriggerSource::Direct,
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSource::Direct => write!(f, "direct"),
            TriggerSource::SerialForward => write!(f, "serial_forward"),
            TriggerSource::Relay => write!(f, "relay"),
        }
    }
}

/// A normalized button trigger, created at the boundary and consumed once
/// by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEvent {
    pub button_id: u32,
    pub is_hold: bool,
    pub source: TriggerSource,
}

impl TriggerEvent {
    /// Derive the audio lookup key for this event.
    ///
    /// Hold events select `hold<N>` only when hold detection is enabled;
    /// otherwise they resolve like a plain press.
    pub fn audio_key(&self, hold_detection_enabled: bool) -> String {
        if self.is_hold && hold_detection_enabled {
            format!("hold{}", self.button_id)
        } else {
            format!("button{}", self.button_id)
        }
    }

    pub fn event_type(&self) -> &'static str {
        if self.is_hold {
            "hold"
        } else {
            "press"
        }
    }
}

/// Parse one serial line into `(button_id, is_hold)`.
///
/// Expected format: `BTN<digits>:<ACTION>` with ACTION one of PRESS / HOLD
/// (normalized to uppercase before matching). Anything else yields `None`;
/// malformed input is never an error.
pub fn parse_trigger_line(line: &str) -> Option<(u32, bool)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let rest = line.strip_prefix("BTN")?;
    let (digits, action) = rest.split_once(':')?;
    let button_id: u32 = digits.parse().ok()?;
    if button_id == 0 {
        return None;
    }

    match action.trim().to_uppercase().as_str() {
        "PRESS" => Some((button_id, false)),
        "HOLD" => Some((button_id, true)),
        _ => None,
    }
}
