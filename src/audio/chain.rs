//! Per-voice mixer chains and one-shot voice triggering.
//!
//! Each instrument or clip gets one chain, built lazily and kept for the
//! lifetime of its owner:
//!
//! ```text
//! drum:  gain -> pan -> lowshelf -> peaking -> highshelf -> lowpass -> bus
//! clip:  gain -> pan -> lowshelf -> peaking -> highshelf -> compressor -> limiter
//!             -> dry ----------> bus
//!             -> reverb -> wet -> bus
//! ```
//!
//! Parameter updates only write node parameters; the graph is never rewired
//! on the hot path. Voices started by [`MixerChains::trigger`] are tracked
//! until the backend reports them ended, then disconnected.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{AudioBuffer, AudioGraph, FilterKind, NodeId, Param};
use crate::config::EqBands;
use crate::model::{
    ClipId, ClipMixer, CompressorSettings, DEFAULT_FILTER_CUTOFF, EqSettings, InstrumentId, MixerSettings,
};

const PEAKING_Q: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChainKey {
    Instrument(InstrumentId),
    Clip(ClipId),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DynamicsParams {
    pub compressor: CompressorSettings,
    pub limiter: bool,
}

/// Values pushed onto a chain's nodes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainParams {
    pub volume: f32,
    pub pan: f32,
    pub eq: EqSettings,
    pub filter_cutoff: Option<f32>,
    pub dynamics: Option<DynamicsParams>,
    pub reverb_mix: Option<f32>,
}

impl From<&MixerSettings> for ChainParams {
    fn from(m: &MixerSettings) -> Self {
        ChainParams {
            volume: m.volume,
            pan: m.pan,
            eq: m.eq,
            filter_cutoff: Some(m.filter_cutoff),
            dynamics: None,
            reverb_mix: None,
        }
    }
}

impl From<&ClipMixer> for ChainParams {
    fn from(m: &ClipMixer) -> Self {
        ChainParams {
            volume: m.volume,
            pan: m.pan,
            eq: m.eq,
            filter_cutoff: None,
            dynamics: Some(DynamicsParams {
                compressor: m.compressor,
                limiter: m.limiter,
            }),
            reverb_mix: Some(m.reverb_mix),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainShape {
    Drum,
    Clip,
}

impl ChainKey {
    pub fn shape(self) -> ChainShape {
        match self {
            ChainKey::Instrument(_) => ChainShape::Drum,
            ChainKey::Clip(_) => ChainShape::Clip,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReverbSend {
    pub dry: NodeId,
    pub reverb: NodeId,
    pub wet: NodeId,
}

/// Stable node handles of one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainNodes {
    pub gain: NodeId,
    pub pan: NodeId,
    pub low: NodeId,
    pub mid: NodeId,
    pub high: NodeId,
    pub filter: Option<NodeId>,
    pub compressor: Option<NodeId>,
    pub limiter: Option<NodeId>,
    pub reverb: Option<ReverbSend>,
    pub bus: NodeId,
}

impl ChainNodes {
    pub fn build<G: AudioGraph>(graph: &mut G, shape: ChainShape, bands: &EqBands, bus: NodeId) -> Self {
        let gain = graph.create_gain();
        let pan = graph.create_panner();
        let low = graph.create_filter(FilterKind::LowShelf, bands.low_shelf);
        let mid = graph.create_filter(FilterKind::Peaking, bands.peaking);
        let high = graph.create_filter(FilterKind::HighShelf, bands.high_shelf);
        graph.set_param(mid, Param::Q, PEAKING_Q);
        graph.connect(gain, pan);
        graph.connect(pan, low);
        graph.connect(low, mid);
        graph.connect(mid, high);

        let mut nodes = ChainNodes {
            gain,
            pan,
            low,
            mid,
            high,
            filter: None,
            compressor: None,
            limiter: None,
            reverb: None,
            bus,
        };

        match shape {
            ChainShape::Drum => {
                let filter = graph.create_filter(FilterKind::Lowpass, DEFAULT_FILTER_CUTOFF);
                graph.connect(high, filter);
                graph.connect(filter, bus);
                nodes.filter = Some(filter);
            }
            ChainShape::Clip => {
                let compressor = graph.create_compressor();
                let limiter = graph.create_compressor();
                graph.connect(high, compressor);
                graph.connect(compressor, limiter);

                let dry = graph.create_gain();
                let reverb = graph.create_reverb();
                let wet = graph.create_gain();
                graph.connect(limiter, dry);
                graph.connect(limiter, reverb);
                graph.connect(reverb, wet);
                graph.connect(dry, bus);
                graph.connect(wet, bus);

                nodes.compressor = Some(compressor);
                nodes.limiter = Some(limiter);
                nodes.reverb = Some(ReverbSend { dry, reverb, wet });
            }
        }
        nodes
    }

    /// Where voices connect.
    pub fn input(&self) -> NodeId {
        self.gain
    }

    pub fn apply<G: AudioGraph>(&self, graph: &mut G, params: &ChainParams) {
        graph.set_param(self.gain, Param::Gain, params.volume.max(0.0));
        graph.set_param(self.pan, Param::Pan, params.pan.clamp(-1.0, 1.0));
        graph.set_param(self.low, Param::FilterGain, params.eq.low);
        graph.set_param(self.mid, Param::FilterGain, params.eq.mid);
        graph.set_param(self.high, Param::FilterGain, params.eq.high);

        if let (Some(filter), Some(cutoff)) = (self.filter, params.filter_cutoff) {
            graph.set_param(filter, Param::Frequency, cutoff);
        }

        if let (Some(comp), Some(dynamics)) = (self.compressor, params.dynamics) {
            let c = dynamics.compressor;
            graph.set_param(comp, Param::Threshold, c.threshold);
            graph.set_param(comp, Param::Ratio, c.ratio);
            graph.set_param(comp, Param::Attack, c.attack);
            graph.set_param(comp, Param::Release, c.release);
            if let Some(limiter) = self.limiter {
                let (threshold, ratio, attack, release) = if dynamics.limiter {
                    (-1.0, 20.0, 0.001, 0.05)
                } else {
                    (0.0, 1.0, 0.003, 0.25)
                };
                graph.set_param(limiter, Param::Threshold, threshold);
                graph.set_param(limiter, Param::Ratio, ratio);
                graph.set_param(limiter, Param::Attack, attack);
                graph.set_param(limiter, Param::Release, release);
            }
        }

        if let (Some(send), Some(mix)) = (self.reverb, params.reverb_mix) {
            let mix = mix.clamp(0.0, 1.0);
            graph.set_param(send.dry, Param::Gain, 1.0 - mix);
            graph.set_param(send.wet, Param::Gain, mix);
        }
    }

    fn all_nodes(&self) -> Vec<NodeId> {
        let mut out = vec![self.gain, self.pan, self.low, self.mid, self.high];
        out.extend(self.filter);
        out.extend(self.compressor);
        out.extend(self.limiter);
        if let Some(send) = self.reverb {
            out.extend([send.dry, send.reverb, send.wet]);
        }
        out
    }

    pub fn teardown<G: AudioGraph>(&self, graph: &mut G) {
        for node in self.all_nodes() {
            graph.disconnect_all(node);
        }
    }
}

/// How a one-shot voice plays its buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoicePlayback {
    pub rate: f32,
    pub detune_cents: f32,
    /// Seconds into the buffer.
    pub offset: f64,
}

impl Default for VoicePlayback {
    fn default() -> Self {
        VoicePlayback {
            rate: 1.0,
            detune_cents: 0.0,
            offset: 0.0,
        }
    }
}

/// Chain arena keyed by instrument/clip id, plus the voices in flight.
#[derive(Debug, Clone)]
pub struct MixerChains {
    bands: EqBands,
    chains: HashMap<ChainKey, ChainNodes>,
    voices: HashMap<NodeId, ChainKey>,
}

impl MixerChains {
    pub fn new(bands: EqBands) -> Self {
        MixerChains {
            bands,
            chains: HashMap::new(),
            voices: HashMap::new(),
        }
    }

    /// Build the chain for `key` once, applying `params` when it is new.
    pub fn ensure_chain<G: AudioGraph>(
        &mut self,
        graph: &mut G,
        key: ChainKey,
        bus: NodeId,
        params: &ChainParams,
    ) -> &ChainNodes {
        if !self.chains.contains_key(&key) {
            let nodes = ChainNodes::build(graph, key.shape(), &self.bands, bus);
            nodes.apply(graph, params);
            log::debug!("built {:?} chain for {:?}", key.shape(), key);
            self.chains.insert(key, nodes);
        }
        &self.chains[&key]
    }

    pub fn chain(&self, key: ChainKey) -> Option<&ChainNodes> {
        self.chains.get(&key)
    }

    /// Push parameters onto an existing chain. Returns false if none is built.
    pub fn apply_params<G: AudioGraph>(&self, graph: &mut G, key: ChainKey, params: &ChainParams) -> bool {
        match self.chains.get(&key) {
            Some(nodes) => {
                nodes.apply(graph, params);
                true
            }
            None => false,
        }
    }

    /// Start a one-shot voice through the chain of `key` at `time`.
    pub fn trigger<G: AudioGraph>(
        &mut self,
        graph: &mut G,
        key: ChainKey,
        buffer: Arc<AudioBuffer>,
        time: f64,
        playback: VoicePlayback,
    ) -> Option<NodeId> {
        let input = self.chains.get(&key)?.input();
        let voice = graph.create_buffer_voice(buffer);
        if playback.rate != 1.0 {
            graph.set_param(voice, Param::PlaybackRate, playback.rate);
        }
        if playback.detune_cents != 0.0 {
            graph.set_param(voice, Param::Detune, playback.detune_cents);
        }
        graph.connect(voice, input);
        graph.start(voice, time, playback.offset);
        self.voices.insert(voice, key);
        Some(voice)
    }

    /// Completion of a voice: disconnect it and forget it.
    pub fn voice_ended<G: AudioGraph>(&mut self, graph: &mut G, node: NodeId) -> Option<ChainKey> {
        let key = self.voices.remove(&node)?;
        graph.disconnect_all(node);
        Some(key)
    }

    pub fn key_of(&self, node: NodeId) -> Option<ChainKey> {
        self.voices.get(&node).copied()
    }

    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    pub fn voices_for(&self, key: ChainKey) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .voices
            .iter()
            .filter(|&(_, k)| *k == key)
            .map(|(&n, _)| n)
            .collect();
        nodes.sort();
        nodes
    }

    /// Stop and disconnect every voice whose key matches. Returns how many.
    pub fn silence_where<G: AudioGraph>(
        &mut self,
        graph: &mut G,
        now: f64,
        pred: impl Fn(ChainKey) -> bool,
    ) -> usize {
        let mut nodes: Vec<NodeId> = self
            .voices
            .iter()
            .filter(|&(_, k)| pred(*k))
            .map(|(&n, _)| n)
            .collect();
        nodes.sort();
        for node in &nodes {
            self.voices.remove(node);
            graph.stop(*node, now);
            graph.disconnect_all(*node);
        }
        nodes.len()
    }

    pub fn silence<G: AudioGraph>(&mut self, graph: &mut G, key: ChainKey, now: f64) -> usize {
        self.silence_where(graph, now, |k| k == key)
    }

    /// Silence and tear down the chain of `key`.
    pub fn remove_chain<G: AudioGraph>(&mut self, graph: &mut G, key: ChainKey, now: f64) {
        self.silence(graph, key, now);
        if let Some(nodes) = self.chains.remove(&key) {
            nodes.teardown(graph);
        }
    }

    /// Drop every chain and voice.
    pub fn clear<G: AudioGraph>(&mut self, graph: &mut G, now: f64) {
        self.silence_where(graph, now, |_| true);
        for (_, nodes) in self.chains.drain() {
            nodes.teardown(graph);
        }
    }
}
