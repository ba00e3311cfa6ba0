//! Microphone/camera capture with an optional metronome count-in.
//!
//! `Ready -> CountingIn -> Recording -> Ready`. The input stream is held from
//! `start` until `stop` or a failure, and is always released on the way back
//! to `Ready`.

use crate::backend::{AudioBackend, CaptureConstraints, NodeId, Param, RecordedMedia, StreamId};
use crate::config::EngineConfig;
use crate::error::{DeviceAccessError, EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecorderState {
    #[default]
    Ready,
    CountingIn {
        remaining: u32,
    },
    Recording,
}

/// Output of a finished recording.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedTake {
    pub media: RecordedMedia,
    pub video: bool,
    /// Clock time capture began.
    pub started_at: f64,
}

/// Something the engine has to act on after a recorder tick.
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderCue {
    /// Play a count-in click at `time`; `remaining` beats are left including this one.
    Click { time: f64, remaining: u32 },
    /// Media capture began.
    Started,
    /// Latest input samples.
    Waveform(Vec<f32>),
}

#[derive(Debug, Clone, Copy)]
struct InputChain {
    stream: StreamId,
    source: NodeId,
    gain: NodeId,
    analyser: NodeId,
    monitor: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub struct RecordingEngine {
    state: RecorderState,
    input: Option<InputChain>,
    video: bool,
    input_gain: f32,
    monitoring: bool,
    next_beat: f64,
    beat_len: f64,
    started_at: f64,
    next_frame: f64,
    lookahead: f64,
    waveform_size: usize,
    waveform_interval: f64,
}

impl RecordingEngine {
    pub fn new(config: &EngineConfig) -> Self {
        RecordingEngine {
            state: RecorderState::Ready,
            input: None,
            video: false,
            input_gain: 1.0,
            monitoring: config.monitor_input,
            next_beat: 0.0,
            beat_len: 0.5,
            started_at: 0.0,
            next_frame: 0.0,
            lookahead: config.lookahead,
            waveform_size: config.waveform_size,
            waveform_interval: config.waveform_interval.max(1e-3),
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring
    }

    /// Open the input and either begin capturing or start counting in.
    pub fn start<B: AudioBackend>(
        &mut self,
        backend: &mut B,
        monitor_bus: NodeId,
        video: bool,
        count_in_beats: u32,
        bpm: f32,
    ) -> EngineResult<RecorderState> {
        if self.state != RecorderState::Ready {
            return Err(EngineError::InvalidState("already recording"));
        }
        let stream = backend
            .capture_input(CaptureConstraints { audio: true, video })
            .map_err(|e| DeviceAccessError(e.to_string()))?;
        let source = match backend.create_stream_source(stream) {
            Ok(node) => node,
            Err(e) => {
                backend.release_input(stream);
                return Err(DeviceAccessError(e.to_string()).into());
            }
        };
        let gain = backend.create_gain();
        let analyser = backend.create_analyser();
        backend.set_param(gain, Param::Gain, self.input_gain);
        backend.connect(source, gain);
        backend.connect(gain, analyser);

        let mut chain = InputChain {
            stream,
            source,
            gain,
            analyser,
            monitor: None,
        };
        if self.monitoring {
            chain.monitor = Some(connect_monitor(backend, gain, monitor_bus));
        }
        self.input = Some(chain);
        self.video = video;

        let now = backend.now();
        if count_in_beats == 0 {
            self.begin_capture(backend, now)?;
        } else {
            self.state = RecorderState::CountingIn {
                remaining: count_in_beats,
            };
            self.next_beat = now;
            self.beat_len = 60.0 / bpm.max(1.0) as f64;
        }
        log::info!("recorder {:?} (video: {video})", self.state);
        Ok(self.state)
    }

    fn begin_capture<B: AudioBackend>(&mut self, backend: &mut B, now: f64) -> EngineResult<()> {
        let Some(chain) = self.input else {
            return Err(EngineError::InvalidState("no input stream"));
        };
        if let Err(e) = backend.begin_media_capture(chain.stream) {
            self.release(backend);
            return Err(DeviceAccessError(e.to_string()).into());
        }
        self.state = RecorderState::Recording;
        self.started_at = now;
        self.next_frame = now;
        Ok(())
    }

    /// Count-in beats and waveform frames due by `now`.
    pub fn tick<B: AudioBackend>(&mut self, backend: &mut B, now: f64) -> EngineResult<Vec<RecorderCue>> {
        let mut cues = Vec::new();
        while let RecorderState::CountingIn { remaining } = self.state {
            if remaining == 0 {
                if self.next_beat > now {
                    break;
                }
                self.begin_capture(backend, now)?;
                cues.push(RecorderCue::Started);
                break;
            }
            if self.next_beat - self.lookahead > now {
                break;
            }
            cues.push(RecorderCue::Click {
                time: self.next_beat,
                remaining,
            });
            self.state = RecorderState::CountingIn {
                remaining: remaining - 1,
            };
            self.next_beat += self.beat_len;
        }

        if self.state == RecorderState::Recording && now >= self.next_frame {
            if let Some(chain) = self.input {
                cues.push(RecorderCue::Waveform(
                    backend.analyser_frame(chain.analyser, self.waveform_size),
                ));
            }
            self.next_frame = now + self.waveform_interval;
        }
        Ok(cues)
    }

    pub fn wake_at(&self) -> Option<f64> {
        match self.state {
            RecorderState::Ready => None,
            RecorderState::CountingIn { remaining: 0 } => Some(self.next_beat),
            RecorderState::CountingIn { .. } => Some(self.next_beat - self.lookahead),
            RecorderState::Recording => Some(self.next_frame),
        }
    }

    /// Finish. Returns the take when capture had begun; a count-in is simply
    /// abandoned.
    pub fn stop<B: AudioBackend>(&mut self, backend: &mut B) -> EngineResult<Option<RecordedTake>> {
        let state = self.state;
        let result: EngineResult<Option<RecordedTake>> = match (state, self.input) {
            (RecorderState::Recording, Some(chain)) => backend
                .end_media_capture(chain.stream)
                .map(|media| {
                    Some(RecordedTake {
                        media,
                        video: self.video,
                        started_at: self.started_at,
                    })
                })
                .map_err(|e| DeviceAccessError(e.to_string()).into()),
            _ => Ok(None),
        };
        self.release(backend);
        if state != RecorderState::Ready {
            log::info!("recorder stopped from {state:?}");
        }
        result
    }

    /// Tear down the input chain and release the stream.
    pub fn release<B: AudioBackend>(&mut self, backend: &mut B) {
        if let Some(chain) = self.input.take() {
            for node in [Some(chain.source), Some(chain.gain), Some(chain.analyser), chain.monitor]
                .into_iter()
                .flatten()
            {
                backend.disconnect_all(node);
            }
            backend.release_input(chain.stream);
        }
        self.state = RecorderState::Ready;
    }

    pub fn set_input_gain<B: AudioBackend>(&mut self, backend: &mut B, gain: f32) {
        self.input_gain = gain.max(0.0);
        if let Some(chain) = self.input {
            backend.set_param(chain.gain, Param::Gain, self.input_gain);
        }
    }

    /// Route the input to `monitor_bus`, applied to an open input immediately.
    pub fn set_monitoring<B: AudioBackend>(&mut self, backend: &mut B, on: bool, monitor_bus: NodeId) {
        self.monitoring = on;
        let Some(chain) = self.input.as_mut() else {
            return;
        };
        match (on, chain.monitor) {
            (true, None) => chain.monitor = Some(connect_monitor(backend, chain.gain, monitor_bus)),
            (false, Some(node)) => {
                backend.disconnect_all(node);
                chain.monitor = None;
            }
            _ => {}
        }
    }
}

fn connect_monitor<B: AudioBackend>(backend: &mut B, from: NodeId, bus: NodeId) -> NodeId {
    let monitor = backend.create_gain();
    backend.connect(from, monitor);
    backend.connect(monitor, bus);
    monitor
}
