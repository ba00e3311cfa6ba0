//! Master bus: volume, feedback delay send and the output analyser.
//!
//! ```text
//! input -> dry ----------------> analyser -> destination
//! input -> delay -> wet -------> analyser
//!          delay -> feedback -> delay
//! ```

use serde::{Deserialize, Serialize};

use crate::backend::{AudioGraph, NodeId, Param};

pub const DELAY_FEEDBACK: f32 = 0.4;
const MAX_DELAY_SECONDS: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MasterState {
    pub volume: f32,
    /// Delay wet amount, 0 to 1. Dry is always `1 - delay_mix`.
    pub delay_mix: f32,
}

impl Default for MasterState {
    fn default() -> Self {
        MasterState {
            volume: 1.0,
            delay_mix: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MasterBus {
    input: NodeId,
    dry: NodeId,
    delay: NodeId,
    feedback: NodeId,
    wet: NodeId,
    analyser: NodeId,
    state: MasterState,
}

impl MasterBus {
    pub fn build<G: AudioGraph>(graph: &mut G, delay_time: f32) -> Self {
        let input = graph.create_gain();
        let dry = graph.create_gain();
        let delay = graph.create_delay(MAX_DELAY_SECONDS);
        let feedback = graph.create_gain();
        let wet = graph.create_gain();
        let analyser = graph.create_analyser();
        let destination = graph.destination();

        graph.set_param(delay, Param::DelayTime, delay_time.clamp(0.0, MAX_DELAY_SECONDS));
        graph.set_param(feedback, Param::Gain, DELAY_FEEDBACK);

        graph.connect(input, dry);
        graph.connect(dry, analyser);
        graph.connect(input, delay);
        graph.connect(delay, feedback);
        graph.connect(feedback, delay);
        graph.connect(delay, wet);
        graph.connect(wet, analyser);
        graph.connect(analyser, destination);

        let bus = MasterBus {
            input,
            dry,
            delay,
            feedback,
            wet,
            analyser,
            state: MasterState::default(),
        };
        bus.write(graph);
        bus
    }

    /// Node every source mixes into.
    pub fn input(&self) -> NodeId {
        self.input
    }

    pub fn state(&self) -> MasterState {
        self.state
    }

    fn write<G: AudioGraph>(&self, graph: &mut G) {
        graph.set_param(self.input, Param::Gain, self.state.volume);
        graph.set_param(self.wet, Param::Gain, self.state.delay_mix);
        graph.set_param(self.dry, Param::Gain, 1.0 - self.state.delay_mix);
    }

    pub fn set_volume<G: AudioGraph>(&mut self, graph: &mut G, volume: f32) {
        if !volume.is_finite() {
            return;
        }
        self.state.volume = volume.max(0.0);
        graph.set_param(self.input, Param::Gain, self.state.volume);
    }

    /// Wet and dry are written together.
    pub fn set_delay_mix<G: AudioGraph>(&mut self, graph: &mut G, wet: f32) {
        if !wet.is_finite() {
            return;
        }
        self.state.delay_mix = wet.clamp(0.0, 1.0);
        graph.set_param(self.wet, Param::Gain, self.state.delay_mix);
        graph.set_param(self.dry, Param::Gain, 1.0 - self.state.delay_mix);
    }

    pub fn restore<G: AudioGraph>(&mut self, graph: &mut G, state: MasterState) {
        if state.volume.is_finite() {
            self.state.volume = state.volume.max(0.0);
        }
        if state.delay_mix.is_finite() {
            self.state.delay_mix = state.delay_mix.clamp(0.0, 1.0);
        }
        self.write(graph);
    }
}
