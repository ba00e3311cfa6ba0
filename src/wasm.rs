//! Browser-facing helpers. The engine itself is driven through a backend
//! implemented on the JS side; these are the pure pieces a page calls
//! directly.

use wasm_bindgen::prelude::*;

use crate::audio::deck::crossfader_gains;
use crate::audio::sequencer::step_interval;
use crate::audio::wav::{interleave_pcm16, write_wav};
use crate::backend::AudioBuffer;
use crate::config::EngineConfig;
use crate::persistence::{PatternFile, playlist_from_json};

fn js_err(e: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&format!("{e}"))
}

/// WASM-exposed: encode interleaved f32 samples as a 16-bit PCM WAV file.
#[wasm_bindgen]
pub fn encode_wav_samples(samples: &[f32], sample_rate: u32, channels: u16) -> Vec<u8> {
    let buffer = AudioBuffer::from_interleaved(samples, channels, sample_rate);
    let pcm = interleave_pcm16(&buffer);
    write_wav(&pcm, sample_rate, buffer.channel_count())
}

/// WASM-exposed: validate a saved pattern and return it clamped and fitted.
#[wasm_bindgen]
pub fn normalize_pattern_file(value: JsValue) -> Result<JsValue, JsValue> {
    let file: PatternFile = serde_wasm_bindgen::from_value(value).map_err(js_err)?;
    let file = file.normalized().map_err(js_err)?;
    serde_wasm_bindgen::to_value(&file).map_err(js_err)
}

/// WASM-exposed: parse a playlist document into `[{name, url}]`.
#[wasm_bindgen]
pub fn parse_playlist(json: &str) -> Result<JsValue, JsValue> {
    let entries = playlist_from_json(json).map_err(js_err)?;
    serde_wasm_bindgen::to_value(&entries).map_err(js_err)
}

/// WASM-exposed: engine defaults, for hosts that build their own config.
#[wasm_bindgen]
pub fn default_engine_config() -> Result<JsValue, JsValue> {
    serde_wasm_bindgen::to_value(&EngineConfig::default()).map_err(js_err)
}

/// WASM-exposed: `[left, right]` deck gains for a crossfader position.
#[wasm_bindgen]
pub fn deck_crossfader_gains(position: f32) -> Vec<f32> {
    let (left, right) = crossfader_gains(position);
    vec![left, right]
}

/// WASM-exposed: seconds per sixteenth note at `bpm`.
#[wasm_bindgen]
pub fn sixteenth_seconds(bpm: f32) -> f64 {
    step_interval(bpm)
}
