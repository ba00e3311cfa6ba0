//! Real-time mixing and sequencing core for a browser music studio.
//!
//! [`AudioEngine`] is the single owner of all engine state. It schedules a
//! step sequencer with lookahead against the backend's audio clock, routes
//! every instrument and clip through its own mixer chain into a master bus
//! with a feedback delay, records microphone or camera takes after a
//! metronome count-in, runs two crossfaded DJ decks and renders clips offline
//! into a WAV mixdown.

pub mod audio;
pub mod backend;
pub mod config;
#[cfg(feature = "runtime")]
pub mod driver;
pub mod engine;
pub mod error;
pub mod events;
pub mod model;
pub mod pattern;
pub mod persistence;
pub mod wasm;

use wasm_bindgen::prelude::*;

pub use crate::backend::{AudioBackend, AudioBuffer, AudioGraph, BackendEvent, NodeId};
pub use crate::config::EngineConfig;
pub use crate::engine::{AudioEngine, FileSampleSource, SampleSource};
pub use crate::error::{EngineError, EngineResult};
pub use crate::events::EngineEvent;

/// The crate version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// WASM-exposed: return the studio-core version string.
#[wasm_bindgen]
pub fn core_version() -> String {
    VERSION.to_string()
}
