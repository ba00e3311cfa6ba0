//! Entities owned by the track registry.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::AudioBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstrumentId(pub u32);

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instrument#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClipId(pub u32);

impl fmt::Display for ClipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "clip#{}", self.0)
    }
}

/// Decode state of a sample or clip. A buffer and an error never coexist.
#[derive(Debug, Clone, Default)]
pub enum LoadState {
    #[default]
    Unloaded,
    Loading,
    Loaded(Arc<AudioBuffer>),
    Failed(String),
}

impl LoadState {
    pub fn buffer(&self) -> Option<&Arc<AudioBuffer>> {
        match self {
            LoadState::Loaded(buffer) => Some(buffer),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            LoadState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn is_unloaded(&self) -> bool {
        matches!(self, LoadState::Unloaded)
    }
}

/// Low/mid/high EQ gains in dB.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EqSettings {
    pub low: f32,
    pub mid: f32,
    pub high: f32,
}

/// Lowpass cutoff that leaves the audible band untouched.
pub const DEFAULT_FILTER_CUTOFF: f32 = 20000.0;

/// Per-instrument mixer state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MixerSettings {
    /// Linear gain, 0 and up.
    pub volume: f32,
    /// -1 (left) to 1 (right).
    pub pan: f32,
    pub eq: EqSettings,
    /// Lowpass cutoff in Hz.
    pub filter_cutoff: f32,
}

impl Default for MixerSettings {
    fn default() -> Self {
        MixerSettings {
            volume: 1.0,
            pan: 0.0,
            eq: EqSettings::default(),
            filter_cutoff: DEFAULT_FILTER_CUTOFF,
        }
    }
}

impl MixerSettings {
    /// Clamp into the ranges the chain accepts.
    pub fn sanitized(mut self) -> Self {
        self.volume = self.volume.max(0.0);
        self.pan = self.pan.clamp(-1.0, 1.0);
        self.filter_cutoff = self.filter_cutoff.clamp(20.0, 22050.0);
        self
    }
}

/// A drum or pitched sample voice in the pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instrument {
    pub id: InstrumentId,
    pub name: String,
    pub source_url: String,
    #[serde(skip)]
    pub load: LoadState,
    /// MIDI note the sample was recorded at, for pitched instruments.
    pub base_pitch: Option<u8>,
    pub muted: bool,
    pub soloed: bool,
    pub mixer: MixerSettings,
}

impl Instrument {
    pub fn new(id: InstrumentId, name: impl Into<String>, source_url: impl Into<String>) -> Self {
        Instrument {
            id,
            name: name.into(),
            source_url: source_url.into(),
            load: LoadState::Unloaded,
            base_pitch: None,
            muted: false,
            soloed: false,
            mixer: MixerSettings::default(),
        }
    }

    pub fn pitched(mut self, base_pitch: u8) -> Self {
        self.base_pitch = Some(base_pitch);
        self
    }

    pub fn is_pitched(&self) -> bool {
        self.base_pitch.is_some()
    }

    /// Detune in cents to play `pitch` from this instrument's base pitch.
    pub fn detune_cents(&self, pitch: u8) -> f32 {
        match self.base_pitch {
            Some(base) => (pitch as f32 - base as f32) * 100.0,
            None => 0.0,
        }
    }
}

/// A note on a pitched instrument's lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub pitch: u8,
    pub step: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub genre: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompressorSettings {
    /// dB
    pub threshold: f32,
    pub ratio: f32,
    /// seconds
    pub attack: f32,
    /// seconds
    pub release: f32,
}

impl Default for CompressorSettings {
    fn default() -> Self {
        CompressorSettings {
            threshold: -24.0,
            ratio: 4.0,
            attack: 0.003,
            release: 0.25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoTuneSettings {
    pub enabled: bool,
    pub amount: f32,
}

impl Default for AutoTuneSettings {
    fn default() -> Self {
        AutoTuneSettings {
            enabled: false,
            amount: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseGateSettings {
    pub enabled: bool,
    /// dB
    pub threshold: f32,
}

impl Default for NoiseGateSettings {
    fn default() -> Self {
        NoiseGateSettings {
            enabled: false,
            threshold: -50.0,
        }
    }
}

/// Mixer state of an audio clip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClipMixer {
    pub volume: f32,
    pub pan: f32,
    pub eq: EqSettings,
    pub compressor: CompressorSettings,
    /// Reverb wet amount, 0 (dry) to 1 (wet).
    pub reverb_mix: f32,
    pub auto_tune: AutoTuneSettings,
    pub limiter: bool,
    pub noise_gate: NoiseGateSettings,
    /// Semitones.
    pub pitch_shift: f32,
    /// Playback rate multiplier.
    pub tempo_rate: f32,
}

impl Default for ClipMixer {
    fn default() -> Self {
        ClipMixer {
            volume: 1.0,
            pan: 0.0,
            eq: EqSettings::default(),
            compressor: CompressorSettings::default(),
            reverb_mix: 0.0,
            auto_tune: AutoTuneSettings::default(),
            limiter: false,
            noise_gate: NoiseGateSettings::default(),
            pitch_shift: 0.0,
            tempo_rate: 1.0,
        }
    }
}

impl ClipMixer {
    pub fn sanitized(mut self) -> Self {
        self.volume = self.volume.max(0.0);
        self.pan = self.pan.clamp(-1.0, 1.0);
        self.reverb_mix = self.reverb_mix.clamp(0.0, 1.0);
        self.compressor.ratio = self.compressor.ratio.clamp(1.0, 20.0);
        self.compressor.threshold = self.compressor.threshold.clamp(-100.0, 0.0);
        self.tempo_rate = self.tempo_rate.clamp(0.25, 4.0);
        self.auto_tune.amount = self.auto_tune.amount.clamp(0.0, 1.0);
        self
    }
}

/// Where a clip's raw media lives.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MediaRef {
    /// Fetchable location. Recordings have none until the host uploads them.
    pub url: Option<String>,
    pub mime: String,
    #[serde(skip)]
    pub bytes: Option<Arc<[u8]>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioClip {
    pub source: MediaRef,
    #[serde(skip)]
    pub load: LoadState,
    pub mixer: ClipMixer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoClip {
    pub source: MediaRef,
}

/// Clip payload, one case per kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ClipMedia {
    Audio(AudioClip),
    Video(VideoClip),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clip {
    pub id: ClipId,
    pub name: String,
    pub media: ClipMedia,
    /// Seconds.
    pub duration: f64,
    /// Playhead in seconds.
    pub position: f64,
    pub metadata: ClipMetadata,
    #[serde(skip)]
    pub playing: bool,
}

impl Clip {
    pub fn audio(id: ClipId, name: impl Into<String>, source: MediaRef) -> Self {
        Clip {
            id,
            name: name.into(),
            media: ClipMedia::Audio(AudioClip {
                source,
                load: LoadState::Unloaded,
                mixer: ClipMixer::default(),
            }),
            duration: 0.0,
            position: 0.0,
            metadata: ClipMetadata::default(),
            playing: false,
        }
    }

    pub fn video(id: ClipId, name: impl Into<String>, source: MediaRef) -> Self {
        Clip {
            id,
            name: name.into(),
            media: ClipMedia::Video(VideoClip { source }),
            duration: 0.0,
            position: 0.0,
            metadata: ClipMetadata::default(),
            playing: false,
        }
    }

    pub fn as_audio(&self) -> Option<&AudioClip> {
        match &self.media {
            ClipMedia::Audio(a) => Some(a),
            ClipMedia::Video(_) => None,
        }
    }

    pub fn as_audio_mut(&mut self) -> Option<&mut AudioClip> {
        match &mut self.media {
            ClipMedia::Audio(a) => Some(a),
            ClipMedia::Video(_) => None,
        }
    }

    pub fn source(&self) -> &MediaRef {
        match &self.media {
            ClipMedia::Audio(a) => &a.source,
            ClipMedia::Video(v) => &v.source,
        }
    }
}
