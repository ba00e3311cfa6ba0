//! In-process backend with a manual clock.
//!
//! Records every node, connection, parameter write and scheduled start so
//! tests can inspect the graph the engine built. Offline contexts render by
//! summing buffer voices along their gain/pan path to the destination; filters,
//! dynamics and analysers pass signal through unchanged and reverb/delay
//! contribute nothing. Good enough to check routing and levels, not a DSP
//! reference.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::{
    AudioBackend, AudioBuffer, AudioGraph, BackendEvent, CaptureConstraints, FilterKind,
    NodeId, OfflineContext, Param, RecordedMedia, StreamId,
};
use crate::audio::wav::{decode_wav, encode_wav};
use crate::error::BackendError;

const MAX_ROUTE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Destination,
    Gain,
    Panner,
    Filter(FilterKind),
    Compressor,
    Delay,
    Reverb,
    Analyser,
    Oscillator,
    BufferVoice,
    StreamSource(StreamId),
}

impl NodeKind {
    fn is_source(self) -> bool {
        matches!(
            self,
            NodeKind::Oscillator | NodeKind::BufferVoice | NodeKind::StreamSource(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct MemoryNode {
    pub kind: NodeKind,
    pub params: HashMap<Param, f32>,
    /// (when, offset) of the start call.
    pub started: Option<(f64, f64)>,
    pub stopped: Option<f64>,
    pub ended: bool,
    pub buffer: Option<Arc<AudioBuffer>>,
}

impl MemoryNode {
    fn new(kind: NodeKind) -> Self {
        MemoryNode {
            kind,
            params: HashMap::new(),
            started: None,
            stopped: None,
            ended: false,
            buffer: None,
        }
    }

    pub fn param(&self, param: Param) -> Option<f32> {
        self.params.get(&param).copied()
    }

    /// Clock time at which this source stops producing sound, if known.
    fn end_time(&self) -> Option<f64> {
        let (when, offset) = self.started?;
        let natural = match (&self.kind, &self.buffer) {
            (NodeKind::BufferVoice, Some(buffer)) => {
                let rate = self.effective_rate();
                Some(when + (buffer.duration() - offset).max(0.0) / rate)
            }
            _ => None,
        };
        match (natural, self.stopped) {
            (Some(n), Some(s)) => Some(n.min(s.max(when))),
            (Some(n), None) => Some(n),
            (None, Some(s)) => Some(s.max(when)),
            (None, None) => None,
        }
    }

    fn effective_rate(&self) -> f64 {
        let rate = self.param(Param::PlaybackRate).unwrap_or(1.0) as f64;
        let detune = self.param(Param::Detune).unwrap_or(0.0) as f64;
        (rate * 2.0_f64.powf(detune / 1200.0)).max(1e-6)
    }
}

/// Node storage shared by the real-time and offline memory contexts.
#[derive(Debug, Clone)]
pub struct MemoryGraph {
    sample_rate: u32,
    next_id: u64,
    destination: NodeId,
    nodes: HashMap<NodeId, MemoryNode>,
    edges: Vec<(NodeId, NodeId)>,
}

impl MemoryGraph {
    pub fn new(sample_rate: u32) -> Self {
        let destination = NodeId(0);
        let mut nodes = HashMap::new();
        nodes.insert(destination, MemoryNode::new(NodeKind::Destination));
        MemoryGraph {
            sample_rate,
            next_id: 1,
            destination,
            nodes,
            edges: Vec::new(),
        }
    }

    fn insert(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, MemoryNode::new(kind));
        id
    }

    pub fn node(&self, id: NodeId) -> Option<&MemoryNode> {
        self.nodes.get(&id)
    }

    pub fn param(&self, id: NodeId, param: Param) -> Option<f32> {
        self.nodes.get(&id).and_then(|n| n.param(param))
    }

    pub fn outputs(&self, id: NodeId) -> Vec<NodeId> {
        self.edges
            .iter()
            .filter(|(from, _)| *from == id)
            .map(|&(_, to)| to)
            .collect()
    }

    pub fn is_connected(&self, from: NodeId, to: NodeId) -> bool {
        self.edges.contains(&(from, to))
    }

    /// Live (not released) nodes of a kind.
    pub fn count(&self, kind: NodeKind) -> usize {
        self.nodes.values().filter(|n| n.kind == kind).count()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Ids of live nodes of a kind, in creation order.
    pub fn nodes_of(&self, kind: NodeKind) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.kind == kind)
            .map(|(&id, _)| id)
            .collect();
        ids.sort();
        ids
    }

    /// (left, right) gain from `id` to the destination, summed over every path.
    fn route_gains(&self, id: NodeId, depth: usize) -> (f32, f32) {
        if id == self.destination {
            return (1.0, 1.0);
        }
        if depth > MAX_ROUTE_DEPTH {
            return (0.0, 0.0);
        }
        let Some(node) = self.nodes.get(&id) else {
            return (0.0, 0.0);
        };
        let (fl, fr) = match node.kind {
            NodeKind::Gain => {
                let g = node.param(Param::Gain).unwrap_or(1.0);
                (g, g)
            }
            NodeKind::Panner => {
                let p = node.param(Param::Pan).unwrap_or(0.0).clamp(-1.0, 1.0);
                if p <= 0.0 { (1.0, 1.0 + p) } else { (1.0 - p, 1.0) }
            }
            NodeKind::Reverb | NodeKind::Delay => (0.0, 0.0),
            _ => (1.0, 1.0),
        };
        if fl == 0.0 && fr == 0.0 {
            return (0.0, 0.0);
        }
        let (mut l, mut r) = (0.0, 0.0);
        for child in self.outputs(id) {
            let (cl, cr) = self.route_gains(child, depth + 1);
            l += cl;
            r += cr;
        }
        (l * fl, r * fr)
    }
}

impl AudioGraph for MemoryGraph {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn destination(&self) -> NodeId {
        self.destination
    }

    fn create_gain(&mut self) -> NodeId {
        self.insert(NodeKind::Gain)
    }

    fn create_panner(&mut self) -> NodeId {
        self.insert(NodeKind::Panner)
    }

    fn create_filter(&mut self, kind: FilterKind, frequency: f32) -> NodeId {
        let id = self.insert(NodeKind::Filter(kind));
        self.set_param(id, Param::Frequency, frequency);
        id
    }

    fn create_compressor(&mut self) -> NodeId {
        self.insert(NodeKind::Compressor)
    }

    fn create_delay(&mut self, _max_seconds: f32) -> NodeId {
        self.insert(NodeKind::Delay)
    }

    fn create_reverb(&mut self) -> NodeId {
        self.insert(NodeKind::Reverb)
    }

    fn create_analyser(&mut self) -> NodeId {
        self.insert(NodeKind::Analyser)
    }

    fn create_oscillator(&mut self, frequency: f32) -> NodeId {
        let id = self.insert(NodeKind::Oscillator);
        self.set_param(id, Param::Frequency, frequency);
        id
    }

    fn create_buffer_voice(&mut self, buffer: Arc<AudioBuffer>) -> NodeId {
        let id = self.insert(NodeKind::BufferVoice);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.buffer = Some(buffer);
        }
        id
    }

    fn connect(&mut self, from: NodeId, to: NodeId) {
        if !self.edges.contains(&(from, to)) {
            self.edges.push((from, to));
        }
    }

    fn disconnect(&mut self, from: NodeId, to: NodeId) {
        self.edges.retain(|&e| e != (from, to));
    }

    fn disconnect_all(&mut self, node: NodeId) {
        self.edges.retain(|&(from, to)| from != node && to != node);
        if node != self.destination {
            self.nodes.remove(&node);
        }
    }

    fn set_param(&mut self, node: NodeId, param: Param, value: f32) {
        if let Some(n) = self.nodes.get_mut(&node) {
            n.params.insert(param, value);
        }
    }

    fn start(&mut self, node: NodeId, when: f64, offset: f64) {
        if let Some(n) = self.nodes.get_mut(&node) {
            n.started = Some((when, offset.max(0.0)));
        }
    }

    fn stop(&mut self, node: NodeId, when: f64) {
        if let Some(n) = self.nodes.get_mut(&node) {
            n.stopped = Some(when);
        }
    }
}

macro_rules! delegate_graph {
    ($ty:ty) => {
        impl AudioGraph for $ty {
            fn sample_rate(&self) -> u32 {
                self.graph.sample_rate()
            }
            fn destination(&self) -> NodeId {
                self.graph.destination()
            }
            fn create_gain(&mut self) -> NodeId {
                self.graph.create_gain()
            }
            fn create_panner(&mut self) -> NodeId {
                self.graph.create_panner()
            }
            fn create_filter(&mut self, kind: FilterKind, frequency: f32) -> NodeId {
                self.graph.create_filter(kind, frequency)
            }
            fn create_compressor(&mut self) -> NodeId {
                self.graph.create_compressor()
            }
            fn create_delay(&mut self, max_seconds: f32) -> NodeId {
                self.graph.create_delay(max_seconds)
            }
            fn create_reverb(&mut self) -> NodeId {
                self.graph.create_reverb()
            }
            fn create_analyser(&mut self) -> NodeId {
                self.graph.create_analyser()
            }
            fn create_oscillator(&mut self, frequency: f32) -> NodeId {
                self.graph.create_oscillator(frequency)
            }
            fn create_buffer_voice(&mut self, buffer: Arc<AudioBuffer>) -> NodeId {
                self.graph.create_buffer_voice(buffer)
            }
            fn connect(&mut self, from: NodeId, to: NodeId) {
                self.graph.connect(from, to)
            }
            fn disconnect(&mut self, from: NodeId, to: NodeId) {
                self.graph.disconnect(from, to)
            }
            fn disconnect_all(&mut self, node: NodeId) {
                self.graph.disconnect_all(node)
            }
            fn set_param(&mut self, node: NodeId, param: Param, value: f32) {
                self.graph.set_param(node, param, value)
            }
            fn start(&mut self, node: NodeId, when: f64, offset: f64) {
                self.graph.start(node, when, offset)
            }
            fn stop(&mut self, node: NodeId, when: f64) {
                self.graph.stop(node, when);
                self.after_stop(node);
            }
        }
    };
}

/// Offline render target of the memory backend.
#[derive(Debug, Clone)]
pub struct MemoryOffline {
    graph: MemoryGraph,
    channels: u16,
    duration: f64,
    fail: Option<String>,
}

impl MemoryOffline {
    pub fn graph(&self) -> &MemoryGraph {
        &self.graph
    }

    fn after_stop(&mut self, _node: NodeId) {}
}

delegate_graph!(MemoryOffline);

impl OfflineContext for MemoryOffline {
    fn render(self) -> Result<AudioBuffer, BackendError> {
        if let Some(reason) = self.fail {
            return Err(BackendError::Render(reason));
        }
        let sr = self.graph.sample_rate;
        let frames = (self.duration * sr as f64).ceil() as usize;
        let channels = self.channels.max(1);
        let mut out = AudioBuffer::silent(channels, frames, sr);

        for id in self.graph.nodes_of(NodeKind::BufferVoice) {
            let Some(node) = self.graph.node(id) else { continue };
            let (Some((when, offset)), Some(buffer)) = (node.started, node.buffer.as_ref()) else {
                continue;
            };
            let (gl, gr) = self.graph.route_gains(id, 0);
            if gl == 0.0 && gr == 0.0 {
                continue;
            }
            let step = node.effective_rate() * buffer.sample_rate() as f64 / sr as f64;
            let start_frame = (when * sr as f64).round().max(0.0) as usize;
            let src_channels = buffer.channel_count().max(1) as usize;
            for i in start_frame..frames {
                let pos = offset * buffer.sample_rate() as f64 + (i - start_frame) as f64 * step;
                if pos >= buffer.frames() as f64 {
                    break;
                }
                for ch in 0..channels as usize {
                    let src = ch.min(src_channels - 1);
                    let gain = match ch {
                        0 => gl,
                        1 => gr,
                        _ => (gl + gr) * 0.5,
                    };
                    out.channel_mut(ch)[i] += buffer.read_interpolated(src, pos) * gain;
                }
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryStream {
    pub constraints: CaptureConstraints,
    pub capturing: bool,
    pub capture_started: f64,
    pub released: bool,
}

/// Real-time memory backend. Time only moves when [`advance`](Self::advance) is called.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    graph: MemoryGraph,
    clock: f64,
    events: VecDeque<BackendEvent>,
    streams: HashMap<StreamId, MemoryStream>,
    next_stream: u64,
    capture_failure: Option<String>,
    capture_payload: Option<Vec<u8>>,
    render_failure: Option<String>,
    input_level: f32,
}

impl MemoryBackend {
    pub fn new(sample_rate: u32) -> Self {
        MemoryBackend {
            graph: MemoryGraph::new(sample_rate),
            clock: 0.0,
            events: VecDeque::new(),
            streams: HashMap::new(),
            next_stream: 1,
            capture_failure: None,
            capture_payload: None,
            render_failure: None,
            input_level: 0.0,
        }
    }

    pub fn graph(&self) -> &MemoryGraph {
        &self.graph
    }

    /// Move the clock forward, ending sources whose stop or natural end has
    /// passed and reporting positions of buffer voices still playing.
    pub fn advance(&mut self, seconds: f64) {
        self.clock += seconds.max(0.0);
        self.settle();
    }

    pub fn set_time(&mut self, seconds: f64) {
        self.clock = seconds;
        self.settle();
    }

    fn settle(&mut self) {
        let clock = self.clock;
        let mut ended = Vec::new();
        let mut positions = Vec::new();
        for (&id, node) in self.graph.nodes.iter_mut() {
            if node.ended || !node.kind.is_source() {
                continue;
            }
            let Some((when, offset)) = node.started else { continue };
            match node.end_time() {
                Some(end) if end <= clock => {
                    node.ended = true;
                    ended.push(id);
                }
                _ if node.kind == NodeKind::BufferVoice && clock >= when => {
                    let seconds = offset + (clock - when) * node.effective_rate();
                    positions.push((id, seconds));
                }
                _ => {}
            }
        }
        ended.sort();
        positions.sort_by(|a, b| a.0.cmp(&b.0));
        for (node, seconds) in positions {
            self.events.push_back(BackendEvent::Position { node, seconds });
        }
        for id in ended {
            self.events.push_back(BackendEvent::Ended(id));
        }
    }

    fn after_stop(&mut self, _node: NodeId) {
        self.settle();
    }

    /// Make the next `capture_input` call fail.
    pub fn fail_capture(&mut self, reason: impl Into<String>) {
        self.capture_failure = Some(reason.into());
    }

    /// Bytes returned by the next `end_media_capture`.
    pub fn set_capture_payload(&mut self, bytes: Vec<u8>) {
        self.capture_payload = Some(bytes);
    }

    /// Make offline contexts fail to render.
    pub fn fail_render(&mut self, reason: impl Into<String>) {
        self.render_failure = Some(reason.into());
    }

    pub fn set_input_level(&mut self, level: f32) {
        self.input_level = level;
    }

    /// Streams acquired and not yet released.
    pub fn open_streams(&self) -> usize {
        self.streams.values().filter(|s| !s.released).count()
    }

    pub fn stream(&self, id: StreamId) -> Option<&MemoryStream> {
        self.streams.get(&id)
    }
}

delegate_graph!(MemoryBackend);

impl AudioBackend for MemoryBackend {
    type Offline = MemoryOffline;

    fn now(&self) -> f64 {
        self.clock
    }

    fn decode(&mut self, bytes: &[u8]) -> Result<AudioBuffer, BackendError> {
        decode_wav(bytes)
    }

    fn offline_context(
        &mut self,
        channels: u16,
        duration: f64,
        sample_rate: u32,
    ) -> Result<MemoryOffline, BackendError> {
        if !(duration.is_finite() && duration > 0.0) {
            return Err(BackendError::Render(format!("invalid duration {duration}")));
        }
        Ok(MemoryOffline {
            graph: MemoryGraph::new(sample_rate),
            channels,
            duration,
            fail: self.render_failure.clone(),
        })
    }

    fn capture_input(&mut self, constraints: CaptureConstraints) -> Result<StreamId, BackendError> {
        if let Some(reason) = self.capture_failure.take() {
            return Err(BackendError::Device(reason));
        }
        let id = StreamId(self.next_stream);
        self.next_stream += 1;
        self.streams.insert(
            id,
            MemoryStream {
                constraints,
                capturing: false,
                capture_started: 0.0,
                released: false,
            },
        );
        Ok(id)
    }

    fn create_stream_source(&mut self, stream: StreamId) -> Result<NodeId, BackendError> {
        match self.streams.get(&stream) {
            Some(s) if !s.released => Ok(self.graph.insert(NodeKind::StreamSource(stream))),
            _ => Err(BackendError::UnknownHandle(stream.0)),
        }
    }

    fn begin_media_capture(&mut self, stream: StreamId) -> Result<(), BackendError> {
        let clock = self.clock;
        let s = self
            .streams
            .get_mut(&stream)
            .filter(|s| !s.released)
            .ok_or(BackendError::UnknownHandle(stream.0))?;
        s.capturing = true;
        s.capture_started = clock;
        Ok(())
    }

    fn end_media_capture(&mut self, stream: StreamId) -> Result<RecordedMedia, BackendError> {
        let clock = self.clock;
        let sample_rate = self.graph.sample_rate;
        let s = self
            .streams
            .get_mut(&stream)
            .ok_or(BackendError::UnknownHandle(stream.0))?;
        if !s.capturing {
            return Err(BackendError::Device("capture was not started".into()));
        }
        s.capturing = false;
        let duration = (clock - s.capture_started).max(0.0);
        let video = s.constraints.video;
        let bytes = match self.capture_payload.take() {
            Some(bytes) => bytes,
            None => {
                let frames = (duration * sample_rate as f64) as usize;
                encode_wav(&AudioBuffer::silent(1, frames, sample_rate))
            }
        };
        Ok(RecordedMedia {
            bytes,
            mime: if video { "video/webm" } else { "audio/wav" }.to_string(),
            duration,
        })
    }

    fn release_input(&mut self, stream: StreamId) {
        if let Some(s) = self.streams.get_mut(&stream) {
            s.capturing = false;
            s.released = true;
        }
    }

    fn analyser_frame(&self, _analyser: NodeId, size: usize) -> Vec<f32> {
        vec![self.input_level; size]
    }

    fn poll_event(&mut self) -> Option<BackendEvent> {
        self.events.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voices_end_when_clock_passes_buffer_end() {
        let mut be = MemoryBackend::new(1000);
        let buf = Arc::new(AudioBuffer::silent(1, 500, 1000));
        let v = be.create_buffer_voice(buf);
        be.connect(v, be.destination());
        be.start(v, 0.0, 0.0);

        be.advance(0.25);
        assert_eq!(
            be.poll_event(),
            Some(BackendEvent::Position { node: v, seconds: 0.25 })
        );
        be.advance(0.5);
        assert_eq!(be.poll_event(), Some(BackendEvent::Ended(v)));
        assert_eq!(be.poll_event(), None);
    }

    #[test]
    fn stop_in_the_past_ends_immediately() {
        let mut be = MemoryBackend::new(1000);
        let osc = be.create_oscillator(440.0);
        be.start(osc, 0.0, 0.0);
        be.stop(osc, 0.0);
        assert_eq!(be.poll_event(), Some(BackendEvent::Ended(osc)));
    }

    #[test]
    fn disconnect_all_releases_node() {
        let mut be = MemoryBackend::new(1000);
        let g = be.create_gain();
        be.connect(g, be.destination());
        be.disconnect_all(g);
        assert!(be.graph().node(g).is_none());
        assert!(!be.graph().is_connected(g, be.destination()));
    }

    #[test]
    fn offline_render_applies_route_gain() {
        let mut be = MemoryBackend::new(1000);
        let mut ctx = be.offline_context(2, 0.01, 1000).unwrap();
        let buf = Arc::new(AudioBuffer::new(1000, vec![vec![1.0; 10]]));
        let v = ctx.create_buffer_voice(buf);
        let g = ctx.create_gain();
        ctx.set_param(g, Param::Gain, 0.5);
        let p = ctx.create_panner();
        ctx.set_param(p, Param::Pan, 1.0);
        let dest = ctx.destination();
        ctx.connect(v, g);
        ctx.connect(g, p);
        ctx.connect(p, dest);
        ctx.start(v, 0.0, 0.0);

        let out = ctx.render().unwrap();
        assert_eq!(out.frames(), 10);
        assert!(out.channel(0).iter().all(|&s| s.abs() < 1e-6));
        assert!(out.channel(1).iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn capture_failure_leaves_no_stream() {
        let mut be = MemoryBackend::new(1000);
        be.fail_capture("no microphone");
        let err = be.capture_input(CaptureConstraints { audio: true, video: false });
        assert_eq!(err, Err(BackendError::Device("no microphone".into())));
        assert_eq!(be.open_streams(), 0);
    }
}
