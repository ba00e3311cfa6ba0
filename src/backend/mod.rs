//! Audio backend capability set.
//!
//! The engine never touches samples on the render thread. It builds node
//! graphs, writes parameters and schedules starts against the backend clock.
//! Everything the host platform provides (WebAudio in the browser, a native
//! graph elsewhere, [`MemoryBackend`](memory::MemoryBackend) in tests) sits
//! behind these traits.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use crate::error::BackendError;

/// Handle to a node inside a backend graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Handle to an open input (microphone/camera) stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

/// Biquad shapes the mixer chain uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKind {
    LowShelf,
    Peaking,
    HighShelf,
    Lowpass,
}

/// Automatable node parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Param {
    /// Linear gain.
    Gain,
    /// Stereo position, -1 (left) to 1 (right).
    Pan,
    /// Filter or oscillator frequency in Hz.
    Frequency,
    /// Shelf/peaking gain in dB.
    FilterGain,
    Q,
    /// Delay time in seconds.
    DelayTime,
    /// Compressor threshold in dB.
    Threshold,
    Ratio,
    /// Compressor attack in seconds.
    Attack,
    /// Compressor release in seconds.
    Release,
    /// Buffer voice playback rate (1.0 = original speed).
    PlaybackRate,
    /// Buffer voice detune in cents.
    Detune,
}

/// Planar float audio, shared between the registry and scheduled voices.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    /// Build from planar channel data. All channels are truncated to the
    /// shortest one.
    pub fn new(sample_rate: u32, mut channels: Vec<Vec<f32>>) -> Self {
        let frames = channels.iter().map(Vec::len).min().unwrap_or(0);
        for ch in channels.iter_mut() {
            ch.truncate(frames);
        }
        AudioBuffer {
            sample_rate,
            channels,
        }
    }

    pub fn silent(channel_count: u16, frames: usize, sample_rate: u32) -> Self {
        AudioBuffer {
            sample_rate,
            channels: vec![vec![0.0; frames]; channel_count as usize],
        }
    }

    /// Split interleaved samples into planar channels.
    pub fn from_interleaved(samples: &[f32], channel_count: u16, sample_rate: u32) -> Self {
        let n = channel_count.max(1) as usize;
        let mut channels = vec![Vec::with_capacity(samples.len() / n); n];
        for frame in samples.chunks_exact(n) {
            for (ch, &s) in channels.iter_mut().zip(frame) {
                ch.push(s);
            }
        }
        AudioBuffer {
            sample_rate,
            channels,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> u16 {
        self.channels.len() as u16
    }

    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        &mut self.channels[index]
    }

    /// Linear-interpolated read at a fractional frame position.
    pub fn read_interpolated(&self, channel: usize, position: f64) -> f32 {
        let data = &self.channels[channel];
        if data.is_empty() || position < 0.0 {
            return 0.0;
        }
        let idx = position as usize;
        if idx >= data.len() - 1 {
            return if idx < data.len() { data[idx] } else { 0.0 };
        }
        let frac = (position - idx as f64) as f32;
        data[idx] * (1.0 - frac) + data[idx + 1] * frac
    }
}

/// Asynchronous completions reported by the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// A started source node reached its end or was stopped.
    Ended(NodeId),
    /// Playback position of a buffer voice, in seconds into its buffer.
    Position { node: NodeId, seconds: f64 },
}

/// Which devices a capture request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureConstraints {
    pub audio: bool,
    pub video: bool,
}

/// Encoded output of a finished media capture.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedMedia {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub duration: f64,
}

/// Graph construction and scheduling. Implemented by real-time backends and
/// by offline render contexts alike, so chains are built the same way for
/// live playback and mixdown.
pub trait AudioGraph {
    fn sample_rate(&self) -> u32;

    /// Terminal node feeding the output device (or the render target).
    fn destination(&self) -> NodeId;

    fn create_gain(&mut self) -> NodeId;
    fn create_panner(&mut self) -> NodeId;
    fn create_filter(&mut self, kind: FilterKind, frequency: f32) -> NodeId;
    fn create_compressor(&mut self) -> NodeId;
    fn create_delay(&mut self, max_seconds: f32) -> NodeId;
    /// Wet-only reverb processor.
    fn create_reverb(&mut self) -> NodeId;
    fn create_analyser(&mut self) -> NodeId;
    fn create_oscillator(&mut self, frequency: f32) -> NodeId;
    /// One-shot source playing `buffer`. Reports [`BackendEvent::Ended`] when done.
    fn create_buffer_voice(&mut self, buffer: Arc<AudioBuffer>) -> NodeId;

    fn connect(&mut self, from: NodeId, to: NodeId);
    fn disconnect(&mut self, from: NodeId, to: NodeId);
    /// Remove every connection into or out of `node` and release it.
    fn disconnect_all(&mut self, node: NodeId);

    fn set_param(&mut self, node: NodeId, param: Param, value: f32);

    /// Start a source node at `when`, `offset` seconds into its material.
    fn start(&mut self, node: NodeId, when: f64, offset: f64);
    fn stop(&mut self, node: NodeId, when: f64);
}

/// An offline graph rendered faster than real time.
pub trait OfflineContext: AudioGraph {
    fn render(self) -> Result<AudioBuffer, BackendError>;
}

/// The real-time backend consumed by the engine.
pub trait AudioBackend: AudioGraph {
    type Offline: OfflineContext;

    /// Current time on the audio clock, in seconds.
    fn now(&self) -> f64;

    fn decode(&mut self, bytes: &[u8]) -> Result<AudioBuffer, BackendError>;

    fn offline_context(
        &mut self,
        channels: u16,
        duration: f64,
        sample_rate: u32,
    ) -> Result<Self::Offline, BackendError>;

    /// Acquire microphone and optionally camera.
    fn capture_input(&mut self, constraints: CaptureConstraints) -> Result<StreamId, BackendError>;
    /// Graph node reading from an open input stream.
    fn create_stream_source(&mut self, stream: StreamId) -> Result<NodeId, BackendError>;
    fn begin_media_capture(&mut self, stream: StreamId) -> Result<(), BackendError>;
    fn end_media_capture(&mut self, stream: StreamId) -> Result<RecordedMedia, BackendError>;
    /// Close the stream and release the hardware. Must be idempotent.
    fn release_input(&mut self, stream: StreamId);

    /// Latest time-domain frame from an analyser node.
    fn analyser_frame(&self, analyser: NodeId, size: usize) -> Vec<f32>;

    fn poll_event(&mut self) -> Option<BackendEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleaved_split() {
        let buf = AudioBuffer::from_interleaved(&[0.1, -0.1, 0.2, -0.2, 0.3, -0.3], 2, 48000);
        assert_eq!(buf.channel_count(), 2);
        assert_eq!(buf.frames(), 3);
        assert_eq!(buf.channel(0), &[0.1, 0.2, 0.3]);
        assert_eq!(buf.channel(1), &[-0.1, -0.2, -0.3]);
    }

    #[test]
    fn duration_from_frames() {
        let buf = AudioBuffer::silent(1, 22050, 44100);
        assert!((buf.duration() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn interpolated_read() {
        let buf = AudioBuffer::new(8000, vec![vec![0.0, 1.0, 0.0]]);
        assert!((buf.read_interpolated(0, 0.5) - 0.5).abs() < 1e-6);
        assert_eq!(buf.read_interpolated(0, 2.0), 0.0);
        assert_eq!(buf.read_interpolated(0, 10.0), 0.0);
        assert_eq!(buf.read_interpolated(0, -1.0), 0.0);
    }
}
