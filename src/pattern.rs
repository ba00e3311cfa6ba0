//! Step pattern: instruments, trigger grid, note lanes and transport settings.
//!
//! Grid rows and note lanes are indexed in instrument order and always sized
//! to the pattern length. Every mutation keeps that alignment.

use crate::error::{EngineError, EngineResult};
use crate::model::{Instrument, InstrumentId, MixerSettings, Note};

pub const PATTERN_LENGTHS: [usize; 3] = [8, 16, 32];
pub const MIN_BPM: f32 = 60.0;
pub const MAX_BPM: f32 = 200.0;

/// A voice to fire at a step. `pitch` is set for pitched instruments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTrigger {
    pub instrument: InstrumentId,
    pub pitch: Option<u8>,
}

/// Mute/solo resolution shared by every voice group.
pub fn is_audible(muted: bool, soloed: bool, any_soloed: bool) -> bool {
    !muted && (!any_soloed || soloed)
}

#[derive(Debug, Clone)]
pub struct Pattern {
    instruments: Vec<Instrument>,
    grid: Vec<Vec<bool>>,
    notes: Vec<Vec<Note>>,
    length: usize,
    bpm: f32,
    swing: f32,
    metronome: bool,
    playhead: Option<usize>,
    pub title: String,
    pub kit_index: usize,
}

impl Default for Pattern {
    fn default() -> Self {
        Pattern {
            instruments: Vec::new(),
            grid: Vec::new(),
            notes: Vec::new(),
            length: 16,
            bpm: 120.0,
            swing: 0.0,
            metronome: false,
            playhead: None,
            title: String::new(),
            kit_index: 0,
        }
    }
}

impl Pattern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn bpm(&self) -> f32 {
        self.bpm
    }

    /// Swing in percent, 0 to 100.
    pub fn swing(&self) -> f32 {
        self.swing
    }

    pub fn metronome(&self) -> bool {
        self.metronome
    }

    /// Current step, `None` while stopped.
    pub fn playhead(&self) -> Option<usize> {
        self.playhead
    }

    pub(crate) fn set_playhead(&mut self, step: Option<usize>) {
        self.playhead = step;
    }

    /// Non-finite tempos are ignored.
    pub fn set_bpm(&mut self, bpm: f32) {
        if bpm.is_finite() {
            self.bpm = bpm.clamp(MIN_BPM, MAX_BPM);
        }
    }

    /// Non-finite amounts are ignored.
    pub fn set_swing(&mut self, swing: f32) {
        if swing.is_finite() {
            self.swing = swing.clamp(0.0, 100.0);
        }
    }

    pub fn set_metronome(&mut self, on: bool) {
        self.metronome = on;
    }

    pub fn instruments(&self) -> &[Instrument] {
        &self.instruments
    }

    pub fn instrument(&self, id: InstrumentId) -> Option<&Instrument> {
        self.instruments.iter().find(|i| i.id == id)
    }

    pub fn instrument_mut(&mut self, id: InstrumentId) -> Option<&mut Instrument> {
        self.instruments.iter_mut().find(|i| i.id == id)
    }

    fn index_of(&self, id: InstrumentId) -> EngineResult<usize> {
        self.instruments
            .iter()
            .position(|i| i.id == id)
            .ok_or(EngineError::UnknownInstrument(id))
    }

    pub fn grid_row(&self, id: InstrumentId) -> Option<&[bool]> {
        let idx = self.index_of(id).ok()?;
        Some(&self.grid[idx])
    }

    pub fn notes(&self, id: InstrumentId) -> Option<&[Note]> {
        let idx = self.index_of(id).ok()?;
        Some(&self.notes[idx])
    }

    pub fn add_instrument(&mut self, instrument: Instrument) {
        self.instruments.push(instrument);
        self.grid.push(vec![false; self.length]);
        self.notes.push(Vec::new());
    }

    pub fn remove_instrument(&mut self, id: InstrumentId) -> EngineResult<Instrument> {
        let idx = self.index_of(id)?;
        self.grid.remove(idx);
        self.notes.remove(idx);
        Ok(self.instruments.remove(idx))
    }

    /// Resize to 8, 16 or 32 steps. Rows are truncated or padded with `false`
    /// and notes past the end are dropped, so shrinking then growing does not
    /// bring old data back.
    pub fn set_length(&mut self, length: usize) -> EngineResult<()> {
        if !PATTERN_LENGTHS.contains(&length) {
            return Err(EngineError::InvalidPatternLength(length));
        }
        for row in self.grid.iter_mut() {
            row.resize(length, false);
        }
        for lane in self.notes.iter_mut() {
            lane.retain(|n| n.step < length);
        }
        self.length = length;
        if let Some(step) = self.playhead {
            self.playhead = Some(step % length);
        }
        Ok(())
    }

    fn check_step(&self, step: usize) -> EngineResult<()> {
        if step >= self.length {
            return Err(EngineError::StepOutOfRange {
                step,
                length: self.length,
            });
        }
        Ok(())
    }

    pub fn set_step(&mut self, id: InstrumentId, step: usize, on: bool) -> EngineResult<()> {
        self.check_step(step)?;
        let idx = self.index_of(id)?;
        self.grid[idx][step] = on;
        Ok(())
    }

    /// Flip a grid cell and return its new value.
    pub fn toggle_step(&mut self, id: InstrumentId, step: usize) -> EngineResult<bool> {
        self.check_step(step)?;
        let idx = self.index_of(id)?;
        let cell = &mut self.grid[idx][step];
        *cell = !*cell;
        Ok(*cell)
    }

    /// Add a note to a lane. Adding an existing note is a no-op.
    pub fn add_note(&mut self, id: InstrumentId, note: Note) -> EngineResult<()> {
        self.check_step(note.step)?;
        let idx = self.index_of(id)?;
        let lane = &mut self.notes[idx];
        if !lane.contains(&note) {
            lane.push(note);
            lane.sort_by_key(|n| (n.step, n.pitch));
        }
        Ok(())
    }

    pub fn remove_note(&mut self, id: InstrumentId, note: Note) -> EngineResult<bool> {
        let idx = self.index_of(id)?;
        let lane = &mut self.notes[idx];
        let before = lane.len();
        lane.retain(|n| *n != note);
        Ok(lane.len() != before)
    }

    pub fn clear_steps(&mut self) {
        for row in self.grid.iter_mut() {
            row.fill(false);
        }
        for lane in self.notes.iter_mut() {
            lane.clear();
        }
    }

    pub fn set_mute(&mut self, id: InstrumentId, muted: bool) -> EngineResult<()> {
        let idx = self.index_of(id)?;
        self.instruments[idx].muted = muted;
        Ok(())
    }

    /// Solo `id` (clearing every other solo) or un-solo it.
    pub fn set_solo(&mut self, id: InstrumentId, soloed: bool) -> EngineResult<()> {
        let idx = self.index_of(id)?;
        for (i, inst) in self.instruments.iter_mut().enumerate() {
            if i == idx {
                inst.soloed = soloed;
            } else if soloed {
                inst.soloed = false;
            }
        }
        Ok(())
    }

    pub fn any_soloed(&self) -> bool {
        self.instruments.iter().any(|i| i.soloed)
    }

    pub fn is_audible(&self, id: InstrumentId) -> bool {
        let any = self.any_soloed();
        self.instrument(id)
            .is_some_and(|i| is_audible(i.muted, i.soloed, any))
    }

    pub fn set_mixer(&mut self, id: InstrumentId, mixer: MixerSettings) -> EngineResult<MixerSettings> {
        let idx = self.index_of(id)?;
        let mixer = mixer.sanitized();
        self.instruments[idx].mixer = mixer;
        Ok(mixer)
    }

    /// Every voice active at `step`: grid cells for unpitched instruments,
    /// note lanes for pitched ones.
    pub fn triggers_at(&self, step: usize) -> Vec<StepTrigger> {
        let mut out = Vec::new();
        for (idx, inst) in self.instruments.iter().enumerate() {
            if inst.is_pitched() {
                out.extend(self.notes[idx].iter().filter(|n| n.step == step).map(|n| {
                    StepTrigger {
                        instrument: inst.id,
                        pitch: Some(n.pitch),
                    }
                }));
            } else if self.grid[idx].get(step).copied().unwrap_or(false) {
                out.push(StepTrigger {
                    instrument: inst.id,
                    pitch: None,
                });
            }
        }
        out
    }

    /// Grid rows in instrument order.
    pub fn grid(&self) -> &[Vec<bool>] {
        &self.grid
    }

    /// Note lanes in instrument order.
    pub fn note_lanes(&self) -> &[Vec<Note>] {
        &self.notes
    }

    /// Replace grid and notes wholesale, fitting them to the current
    /// instruments and length. Extra rows are ignored, missing rows empty.
    pub fn replace_steps(&mut self, grid: Vec<Vec<bool>>, notes: Vec<Vec<Note>>) {
        let n = self.instruments.len();
        let length = self.length;
        let mut grid = grid.into_iter();
        let mut notes = notes.into_iter();
        self.grid = (0..n)
            .map(|_| {
                let mut row = grid.next().unwrap_or_default();
                row.resize(length, false);
                row
            })
            .collect();
        self.notes = (0..n)
            .map(|_| {
                let mut lane = notes.next().unwrap_or_default();
                lane.retain(|note| note.step < length);
                lane
            })
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern_with(n: u32) -> Pattern {
        let mut p = Pattern::new();
        for i in 0..n {
            p.add_instrument(Instrument::new(InstrumentId(i), format!("v{i}"), format!("{i}.wav")));
        }
        p
    }

    #[test]
    fn shrinking_drops_out_of_range_data() {
        let mut p = pattern_with(2);
        p.add_instrument(Instrument::new(InstrumentId(9), "bass", "bass.wav").pitched(36));
        p.set_step(InstrumentId(0), 3, true).unwrap();
        p.set_step(InstrumentId(0), 12, true).unwrap();
        p.add_note(InstrumentId(9), Note { pitch: 40, step: 2 }).unwrap();
        p.add_note(InstrumentId(9), Note { pitch: 43, step: 10 }).unwrap();

        p.set_length(8).unwrap();
        assert!(p.grid().iter().all(|row| row.len() == 8));
        assert_eq!(p.notes(InstrumentId(9)).unwrap(), &[Note { pitch: 40, step: 2 }]);

        p.set_length(16).unwrap();
        let row = p.grid_row(InstrumentId(0)).unwrap();
        assert_eq!(row.len(), 16);
        assert!(row[3]);
        assert!(row[8..].iter().all(|&c| !c), "grown cells must be false");
        assert_eq!(p.notes(InstrumentId(9)).unwrap().len(), 1);
    }

    #[test]
    fn only_supported_lengths() {
        let mut p = pattern_with(1);
        assert!(matches!(p.set_length(12), Err(EngineError::InvalidPatternLength(12))));
        assert_eq!(p.length(), 16);
        p.set_length(32).unwrap();
        assert_eq!(p.grid_row(InstrumentId(0)).unwrap().len(), 32);
    }

    #[test]
    fn steps_outside_pattern_are_rejected() {
        let mut p = pattern_with(1);
        p.set_length(8).unwrap();
        assert!(p.toggle_step(InstrumentId(0), 8).is_err());
        assert!(p.add_note(InstrumentId(0), Note { pitch: 60, step: 9 }).is_err());
    }

    #[test]
    fn solo_is_exclusive_and_idempotent() {
        let mut p = pattern_with(4);
        p.set_solo(InstrumentId(1), true).unwrap();
        p.set_solo(InstrumentId(2), true).unwrap();
        for _ in 0..3 {
            p.set_solo(InstrumentId(3), true).unwrap();
            let soloed: Vec<_> = p.instruments().iter().filter(|i| i.soloed).map(|i| i.id).collect();
            assert_eq!(soloed, vec![InstrumentId(3)]);
        }
        p.set_solo(InstrumentId(3), false).unwrap();
        assert!(!p.any_soloed());
    }

    #[test]
    fn audibility_truth_table() {
        assert!(is_audible(false, false, false));
        assert!(!is_audible(true, false, false));
        assert!(is_audible(false, true, true));
        assert!(!is_audible(true, true, true));
        assert!(!is_audible(false, false, true));
        assert!(!is_audible(true, false, true));
    }

    #[test]
    fn audibility_over_all_mute_solo_combinations() {
        for mask in 0..16u32 {
            let mut p = pattern_with(2);
            let mute = [mask & 1 != 0, mask & 2 != 0];
            let solo_a = mask & 4 != 0;
            let solo_b = mask & 8 != 0 && !solo_a;
            for (i, &m) in mute.iter().enumerate() {
                p.set_mute(InstrumentId(i as u32), m).unwrap();
            }
            if solo_a {
                p.set_solo(InstrumentId(0), true).unwrap();
            }
            if solo_b {
                p.set_solo(InstrumentId(1), true).unwrap();
            }
            let solos = [solo_a, solo_b];
            let any = solo_a || solo_b;
            for i in 0..2 {
                let expected = !mute[i] && (!any || solos[i]);
                assert_eq!(p.is_audible(InstrumentId(i as u32)), expected, "mask={mask} i={i}");
            }
        }
    }

    #[test]
    fn triggers_follow_grid_and_notes() {
        let mut p = pattern_with(2);
        p.add_instrument(Instrument::new(InstrumentId(7), "lead", "lead.wav").pitched(60));
        p.set_step(InstrumentId(1), 4, true).unwrap();
        p.add_note(InstrumentId(7), Note { pitch: 64, step: 4 }).unwrap();
        p.add_note(InstrumentId(7), Note { pitch: 67, step: 4 }).unwrap();

        let at4 = p.triggers_at(4);
        assert_eq!(
            at4,
            vec![
                StepTrigger { instrument: InstrumentId(1), pitch: None },
                StepTrigger { instrument: InstrumentId(7), pitch: Some(64) },
                StepTrigger { instrument: InstrumentId(7), pitch: Some(67) },
            ]
        );
        assert!(p.triggers_at(5).is_empty());
    }

    #[test]
    fn removing_instrument_keeps_rows_aligned() {
        let mut p = pattern_with(3);
        p.set_step(InstrumentId(2), 0, true).unwrap();
        p.remove_instrument(InstrumentId(0)).unwrap();
        assert_eq!(p.grid().len(), 2);
        assert!(p.grid_row(InstrumentId(2)).unwrap()[0]);
    }

    #[test]
    fn tempo_and_swing_are_clamped() {
        let mut p = Pattern::new();
        p.set_bpm(20.0);
        assert_eq!(p.bpm(), MIN_BPM);
        p.set_bpm(400.0);
        assert_eq!(p.bpm(), MAX_BPM);
        p.set_swing(150.0);
        assert_eq!(p.swing(), 100.0);
    }

    #[test]
    fn non_finite_tempo_and_swing_are_ignored() {
        let mut p = Pattern::new();
        p.set_bpm(95.0);
        p.set_swing(30.0);
        for bad in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            p.set_bpm(bad);
            p.set_swing(bad);
        }
        assert_eq!(p.bpm(), 95.0);
        assert_eq!(p.swing(), 30.0);
    }
}
