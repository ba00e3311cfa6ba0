//! Two-deck player with per-deck tempo and an equal-power crossfader.

use std::f32::consts::FRAC_PI_2;

use crate::backend::{AudioGraph, NodeId, Param};
use crate::error::PlaybackError;
use crate::model::LoadState;

pub const DECK_COUNT: usize = 2;

/// (left, right) gains for crossfader position `x` in `[0, 1]`.
/// A non-finite position is treated as centered.
pub fn crossfader_gains(x: f32) -> (f32, f32) {
    let x = if x.is_finite() { x.clamp(0.0, 1.0) } else { 0.5 };
    ((x * FRAC_PI_2).cos(), ((1.0 - x) * FRAC_PI_2).cos())
}

/// A track loaded into a deck.
#[derive(Debug, Clone)]
pub struct DeckTrack {
    pub name: String,
    pub url: String,
    pub load: LoadState,
    pub playing: bool,
    /// Playhead in percent of the track.
    pub progress: f32,
    /// Playback-rate multiplier.
    pub tempo: f32,
    /// Playhead in seconds.
    pub position: f64,
}

impl DeckTrack {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        DeckTrack {
            name: name.into(),
            url: url.into(),
            load: LoadState::Unloaded,
            playing: false,
            progress: 0.0,
            tempo: 1.0,
            position: 0.0,
        }
    }

    pub fn duration(&self) -> Option<f64> {
        self.load.buffer().map(|b| b.duration())
    }

    fn set_position(&mut self, seconds: f64) {
        let duration = self.duration().unwrap_or(0.0);
        self.position = seconds.clamp(0.0, duration.max(0.0));
        self.progress = if duration > 0.0 {
            (self.position / duration * 100.0) as f32
        } else {
            0.0
        };
    }

    fn rewind(&mut self) {
        self.playing = false;
        self.position = 0.0;
        self.progress = 0.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeckMixer {
    pub gains: [f32; DECK_COUNT],
    /// 0 = full left deck, 1 = full right deck.
    pub crossfader: f32,
}

impl Default for DeckMixer {
    fn default() -> Self {
        DeckMixer {
            gains: [1.0; DECK_COUNT],
            crossfader: 0.5,
        }
    }
}

impl DeckMixer {
    /// Deck gain with the crossfader taper applied.
    pub fn effective_gain(&self, deck: usize) -> f32 {
        let (left, right) = crossfader_gains(self.crossfader);
        let taper = if deck == 0 { left } else { right };
        self.gains.get(deck).copied().unwrap_or(0.0) * taper
    }
}

#[derive(Debug, Clone, Copy)]
struct DeckVoice {
    node: NodeId,
    started_at: f64,
    offset: f64,
    rate: f32,
}

impl DeckVoice {
    fn position(&self, now: f64) -> f64 {
        self.offset + (now - self.started_at).max(0.0) * self.rate as f64
    }
}

/// Graph side of the decks: one gain node per deck into the master bus and
/// the voice currently playing on each.
#[derive(Debug, Clone, Default)]
pub struct DeckEngine {
    mixer: DeckMixer,
    outputs: [Option<NodeId>; DECK_COUNT],
    voices: [Option<DeckVoice>; DECK_COUNT],
}

impl DeckEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mixer(&self) -> DeckMixer {
        self.mixer
    }

    pub fn is_playing(&self, deck: usize) -> bool {
        self.voices.get(deck).is_some_and(Option::is_some)
    }

    fn output<G: AudioGraph>(&mut self, graph: &mut G, deck: usize, bus: NodeId) -> NodeId {
        if let Some(node) = self.outputs[deck] {
            return node;
        }
        let node = graph.create_gain();
        graph.set_param(node, Param::Gain, self.mixer.effective_gain(deck));
        graph.connect(node, bus);
        self.outputs[deck] = Some(node);
        node
    }

    fn apply_gains<G: AudioGraph>(&self, graph: &mut G) {
        for (deck, out) in self.outputs.iter().enumerate() {
            if let Some(node) = out {
                graph.set_param(*node, Param::Gain, self.mixer.effective_gain(deck));
            }
        }
    }

    pub fn set_gain<G: AudioGraph>(&mut self, graph: &mut G, deck: usize, gain: f32) {
        if !gain.is_finite() {
            return;
        }
        if let Some(g) = self.mixer.gains.get_mut(deck) {
            *g = gain.max(0.0);
        }
        self.apply_gains(graph);
    }

    pub fn set_crossfader<G: AudioGraph>(&mut self, graph: &mut G, x: f32) {
        if !x.is_finite() {
            return;
        }
        self.mixer.crossfader = x.clamp(0.0, 1.0);
        self.apply_gains(graph);
    }

    /// Start `track` from its stored position.
    pub fn play<G: AudioGraph>(
        &mut self,
        graph: &mut G,
        deck: usize,
        track: &mut DeckTrack,
        bus: NodeId,
        now: f64,
    ) -> Result<(), PlaybackError> {
        let buffer = track.load.buffer().cloned().ok_or(PlaybackError::DeckEmpty(deck))?;
        if track.position >= buffer.duration() {
            track.set_position(0.0);
        }
        let out = self.output(graph, deck, bus);
        let node = graph.create_buffer_voice(buffer);
        graph.set_param(node, Param::PlaybackRate, track.tempo);
        graph.connect(node, out);
        graph.start(node, now, track.position);
        self.voices[deck] = Some(DeckVoice {
            node,
            started_at: now,
            offset: track.position,
            rate: track.tempo,
        });
        track.playing = true;
        Ok(())
    }

    /// Stop the deck's voice, keeping the playhead where it stopped.
    pub fn pause<G: AudioGraph>(&mut self, graph: &mut G, deck: usize, track: &mut DeckTrack, now: f64) {
        if let Some(voice) = self.voices[deck].take() {
            track.set_position(voice.position(now));
            graph.stop(voice.node, now);
            graph.disconnect_all(voice.node);
        }
        track.playing = false;
    }

    /// Toggle transport. Returns whether the deck is now playing.
    pub fn toggle<G: AudioGraph>(
        &mut self,
        graph: &mut G,
        deck: usize,
        track: &mut DeckTrack,
        bus: NodeId,
        now: f64,
    ) -> Result<bool, PlaybackError> {
        if self.is_playing(deck) {
            self.pause(graph, deck, track, now);
            Ok(false)
        } else {
            self.play(graph, deck, track, bus, now)?;
            Ok(true)
        }
    }

    /// Playback rate, applied to the running voice without moving the playhead.
    pub fn set_tempo<G: AudioGraph>(&mut self, graph: &mut G, deck: usize, track: &mut DeckTrack, rate: f32, now: f64) {
        if !rate.is_finite() {
            return;
        }
        let rate = rate.clamp(0.25, 4.0);
        track.tempo = rate;
        if let Some(voice) = self.voices[deck].as_mut() {
            voice.offset = voice.position(now);
            voice.started_at = now;
            voice.rate = rate;
            graph.set_param(voice.node, Param::PlaybackRate, rate);
        }
    }

    /// Drop whatever the deck is playing and rewind, ready for a new track.
    pub fn reset<G: AudioGraph>(&mut self, graph: &mut G, deck: usize, now: f64) {
        if let Some(voice) = self.voices[deck].take() {
            graph.stop(voice.node, now);
            graph.disconnect_all(voice.node);
        }
    }

    fn deck_of(&self, node: NodeId) -> Option<usize> {
        self.voices
            .iter()
            .position(|v| v.is_some_and(|v| v.node == node))
    }

    /// Backend position report. Returns the deck it belongs to.
    pub fn on_position(&self, node: NodeId, seconds: f64, tracks: &mut [Option<DeckTrack>]) -> Option<usize> {
        let deck = self.deck_of(node)?;
        if let Some(track) = tracks.get_mut(deck).and_then(Option::as_mut) {
            track.set_position(seconds);
        }
        Some(deck)
    }

    /// Backend completion. The track returns to stopped at zero progress.
    pub fn on_ended<G: AudioGraph>(
        &mut self,
        graph: &mut G,
        node: NodeId,
        tracks: &mut [Option<DeckTrack>],
    ) -> Option<usize> {
        let deck = self.deck_of(node)?;
        self.voices[deck] = None;
        graph.disconnect_all(node);
        if let Some(track) = tracks.get_mut(deck).and_then(Option::as_mut) {
            track.rewind();
        }
        Some(deck)
    }
}
