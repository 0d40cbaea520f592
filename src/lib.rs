//! Button Audio GW - trigger-to-audio gateway for embedded hosts
//!
//! Turns button trigger events (HTTP boundary or serial-forwarded) into audio
//! playback, manages hot-pluggable USB storage as an audio source, and drives
//! LED indicator channels for operator feedback.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod indicator;
pub mod playback;
pub mod serial;
pub mod storage;
pub mod trigger;

pub use config::AppConfig;
pub use coordinator::Coordinator;
pub use playback::{PlaybackDispatcher, PlayError};
pub use trigger::{TriggerEvent, TriggerSource};
