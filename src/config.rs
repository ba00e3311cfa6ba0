//! Engine configuration, loadable from JSON. Missing fields take defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// How far ahead of a step's time the re-arm timer fires, in seconds.
    pub lookahead: f64,
    /// Beats of metronome before a recording starts. 0 disables the count-in.
    pub count_in_beats: u32,
    pub metronome: MetronomeConfig,
    /// Master delay line time in seconds.
    pub master_delay_time: f32,
    /// Silence appended after the longest clip in a mixdown, in seconds.
    pub mixdown_tail: f64,
    pub mixdown_channels: u16,
    pub eq: EqBands,
    /// Samples per published waveform frame.
    pub waveform_size: usize,
    /// Seconds between waveform frames while recording.
    pub waveform_interval: f64,
    /// Route the recording input to the master bus while capturing.
    pub monitor_input: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            lookahead: 0.05,
            count_in_beats: 4,
            metronome: MetronomeConfig::default(),
            master_delay_time: 0.3,
            mixdown_tail: 1.0,
            mixdown_channels: 2,
            eq: EqBands::default(),
            waveform_size: 1024,
            waveform_interval: 1.0 / 30.0,
            monitor_input: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MetronomeConfig {
    /// Click pitch on the downbeat (step 0), Hz.
    pub accent_frequency: f32,
    /// Click pitch on other beats, Hz.
    pub frequency: f32,
    /// Seconds.
    pub click_length: f64,
    pub gain: f32,
}

impl Default for MetronomeConfig {
    fn default() -> Self {
        MetronomeConfig {
            accent_frequency: 1000.0,
            frequency: 800.0,
            click_length: 0.05,
            gain: 0.3,
        }
    }
}

/// Corner/centre frequencies of the 3-band EQ, Hz.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EqBands {
    pub low_shelf: f32,
    pub peaking: f32,
    pub high_shelf: f32,
}

impl Default for EqBands {
    fn default() -> Self {
        EqBands {
            low_shelf: 320.0,
            peaking: 1000.0,
            high_shelf: 3200.0,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> EngineResult<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let cfg = EngineConfig::from_json_str(r#"{"countInBeats": 2, "eq": {"peaking": 1500}}"#).unwrap();
        assert_eq!(cfg.count_in_beats, 2);
        assert_eq!(cfg.eq.peaking, 1500.0);
        assert_eq!(cfg.eq.low_shelf, 320.0);
        assert_eq!(cfg.lookahead, 0.05);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(EngineConfig::from_json_str("{lookahead:").is_err());
    }
}
