//! Error taxonomy for the engine.
//!
//! Each failure class maps to one user-visible signal. Per-voice and per-clip
//! failures never abort the scheduler; device and export failures end the
//! operation and put the owning component back into its idle state.

use thiserror::Error;

use crate::model::{ClipId, InstrumentId};

/// Errors raised by an [`AudioBackend`](crate::backend::AudioBackend) implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("could not decode audio: {0}")]
    Decode(String),

    #[error("input device unavailable: {0}")]
    Device(String),

    #[error("offline render failed: {0}")]
    Render(String),

    #[error("unknown node or stream: {0}")]
    UnknownHandle(u64),
}

/// A sample or clip source could not be fetched or decoded.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("failed to load '{source_url}': {reason}")]
pub struct SampleLoadError {
    pub source_url: String,
    pub reason: String,
}

/// Microphone or camera could not be acquired.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("could not access input device: {0}")]
pub struct DeviceAccessError(pub String);

/// Playback of an existing clip or deck track failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybackError {
    #[error("clip {0} has no decoded audio")]
    NotDecoded(ClipId),

    #[error("clip {0} is a video clip and cannot be played through the mixer")]
    NotAudio(ClipId),

    #[error("deck {0} has no track loaded")]
    DeckEmpty(usize),

    #[error("playback failed to start: {0}")]
    Start(String),
}

/// Mixdown was aborted before any output was produced.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExportError {
    #[error("nothing to export")]
    NothingToExport,

    #[error("render failed: {0}")]
    Render(String),
}

/// Umbrella error returned by engine intents.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    SampleLoad(#[from] SampleLoadError),

    #[error(transparent)]
    DeviceAccess(#[from] DeviceAccessError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("pattern length must be 8, 16 or 32 (got {0})")]
    InvalidPatternLength(usize),

    #[error("step {step} outside pattern of length {length}")]
    StepOutOfRange { step: usize, length: usize },

    #[error("unknown instrument {0}")]
    UnknownInstrument(InstrumentId),

    #[error("unknown clip {0}")]
    UnknownClip(ClipId),

    #[error("deck index {0} out of range")]
    UnknownDeck(usize),

    #[error("operation not valid while {0}")]
    InvalidState(&'static str),

    #[error("invalid document: {0}")]
    Persistence(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_error_message_is_user_facing() {
        assert_eq!(ExportError::NothingToExport.to_string(), "nothing to export");
    }

    #[test]
    fn umbrella_is_transparent_for_taxonomy() {
        let err: EngineError = SampleLoadError {
            source_url: "kits/kick.wav".into(),
            reason: "404".into(),
        }
        .into();
        assert_eq!(err.to_string(), "failed to load 'kits/kick.wav': 404");

        let err: EngineError = DeviceAccessError("permission denied".into()).into();
        assert!(err.to_string().contains("permission denied"));
    }
}
