//! Pattern, playlist and session documents, plus writing mixdowns to disk.
//!
//! All documents are JSON. Runtime-only data (decoded buffers, raw media
//! bytes, play state) is never written; sessions are rehydrated by reloading
//! each clip from its URL.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::audio::mixdown::Mixdown;
use crate::error::{EngineError, EngineResult};
use crate::model::{Clip, Note};
use crate::pattern::{MAX_BPM, MIN_BPM, PATTERN_LENGTHS, Pattern};

/// Saved drum/pitched pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PatternFile {
    pub bpm: f32,
    pub selected_kit_index: usize,
    pub drum_grid: Vec<Vec<bool>>,
    pub note_grid: Vec<Vec<Note>>,
    pub song_title: String,
    pub pattern_length: usize,
    pub swing_amount: f32,
}

impl Default for PatternFile {
    fn default() -> Self {
        PatternFile {
            bpm: 120.0,
            selected_kit_index: 0,
            drum_grid: Vec::new(),
            note_grid: Vec::new(),
            song_title: String::new(),
            pattern_length: 16,
            swing_amount: 0.0,
        }
    }
}

impl PatternFile {
    pub fn from_pattern(pattern: &Pattern) -> Self {
        PatternFile {
            bpm: pattern.bpm(),
            selected_kit_index: pattern.kit_index,
            drum_grid: pattern.grid().to_vec(),
            note_grid: pattern.note_lanes().to_vec(),
            song_title: pattern.title.clone(),
            pattern_length: pattern.length(),
            swing_amount: pattern.swing(),
        }
    }

    /// Clamp tempo and swing and fit every row to the pattern length.
    pub fn normalized(mut self) -> EngineResult<Self> {
        if !PATTERN_LENGTHS.contains(&self.pattern_length) {
            return Err(EngineError::InvalidPatternLength(self.pattern_length));
        }
        let length = self.pattern_length;
        self.bpm = self.bpm.clamp(MIN_BPM, MAX_BPM);
        self.swing_amount = self.swing_amount.clamp(0.0, 100.0);
        for row in self.drum_grid.iter_mut() {
            row.resize(length, false);
        }
        for lane in self.note_grid.iter_mut() {
            lane.retain(|n| n.step < length);
        }
        Ok(self)
    }

    /// Load into `pattern`. Rows map onto the pattern's instruments in order.
    pub fn apply_to(&self, pattern: &mut Pattern) -> EngineResult<()> {
        let doc = self.clone().normalized()?;
        pattern.set_length(doc.pattern_length)?;
        pattern.set_bpm(doc.bpm);
        pattern.set_swing(doc.swing_amount);
        pattern.title = doc.song_title;
        pattern.kit_index = doc.selected_kit_index;
        pattern.replace_steps(doc.drum_grid, doc.note_grid);
        Ok(())
    }

    pub fn from_json(json: &str) -> EngineResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> EngineResult<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn save(&self, path: &Path) -> EngineResult<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    pub name: String,
    pub url: String,
}

pub fn playlist_from_json(json: &str) -> EngineResult<Vec<PlaylistEntry>> {
    Ok(serde_json::from_str(json)?)
}

pub fn playlist_to_json(entries: &[PlaylistEntry]) -> EngineResult<String> {
    Ok(serde_json::to_string_pretty(entries)?)
}

pub fn load_playlist(path: &Path) -> EngineResult<Vec<PlaylistEntry>> {
    playlist_from_json(&fs::read_to_string(path)?)
}

pub fn save_playlist(path: &Path, entries: &[PlaylistEntry]) -> EngineResult<()> {
    fs::write(path, playlist_to_json(entries)?)?;
    Ok(())
}

/// Clip list persisted between sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Session {
    pub clips: Vec<Clip>,
}

impl Session {
    pub fn from_json(json: &str) -> EngineResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn load(path: &Path) -> EngineResult<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn save(&self, path: &Path) -> EngineResult<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

/// Write an encoded mixdown to `path`.
pub fn write_mixdown(path: &Path, mix: &Mixdown) -> EngineResult<()> {
    fs::write(path, &mix.wav)?;
    log::info!("wrote {} byte mixdown to {}", mix.wav.len(), path.display());
    Ok(())
}
