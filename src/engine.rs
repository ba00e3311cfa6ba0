//! The engine service.
//!
//! [`AudioEngine`] owns the registry, the mixer chains, the sequencer, the
//! recorder, the decks and the master bus. Every intent takes `&mut self`, so
//! a scheduler tick never observes a half-applied mutation. The host drives
//! time by calling [`AudioEngine::tick`] and sleeping for the duration it
//! returns (see `driver` for a tokio loop that does exactly that).
//!
//! Sample loading is split into a request and a completion so fetching never
//! blocks the scheduler; [`SampleSource`] covers hosts that can fetch
//! synchronously.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::chain::{ChainKey, ChainParams, MixerChains, VoicePlayback};
use crate::audio::deck::{DECK_COUNT, DeckEngine, DeckMixer, DeckTrack};
use crate::audio::master::{MasterBus, MasterState};
use crate::audio::mixdown::{self, Mixdown};
use crate::audio::recorder::{RecordedTake, RecorderCue, RecorderState, RecordingEngine};
use crate::audio::registry::{LoadOutcome, LoadRequest, LoadTarget, TrackRegistry};
use crate::audio::sequencer::{ScheduledStep, StepScheduler, Timing};
use crate::backend::{AudioBackend, BackendEvent, NodeId, Param};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, PlaybackError, SampleLoadError};
use crate::events::{EngineEvent, EventBus, Observer, SubscriptionId};
use crate::model::{Clip, ClipId, ClipMetadata, ClipMixer, InstrumentId, LoadState, MediaRef, MixerSettings, Note};
use crate::pattern::Pattern;
use crate::persistence::{PatternFile, PlaylistEntry, Session, write_mixdown};

/// Fetches raw bytes for a URL.
pub trait SampleSource {
    fn fetch(&mut self, url: &str) -> Result<Vec<u8>, String>;
}

impl<F> SampleSource for F
where
    F: FnMut(&str) -> Result<Vec<u8>, String>,
{
    fn fetch(&mut self, url: &str) -> Result<Vec<u8>, String> {
        self(url)
    }
}

/// Resolves URLs as paths under a root directory.
#[derive(Debug, Clone)]
pub struct FileSampleSource {
    root: PathBuf,
}

impl FileSampleSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileSampleSource { root: root.into() }
    }
}

impl SampleSource for FileSampleSource {
    fn fetch(&mut self, url: &str) -> Result<Vec<u8>, String> {
        let path = self.root.join(url.trim_start_matches('/'));
        fs::read(&path).map_err(|e| format!("{}: {e}", path.display()))
    }
}

/// Who scheduled a click.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClickSource {
    Metronome,
    CountIn,
}

pub struct AudioEngine<B: AudioBackend> {
    backend: B,
    config: EngineConfig,
    registry: TrackRegistry,
    chains: MixerChains,
    sequencer: StepScheduler,
    recorder: RecordingEngine,
    decks: DeckEngine,
    master: MasterBus,
    /// Click oscillators in flight, with their gain nodes.
    clicks: HashMap<NodeId, (NodeId, ClickSource)>,
    events: EventBus,
    takes: u32,
}

impl<B: AudioBackend> AudioEngine<B> {
    pub fn new(mut backend: B, config: EngineConfig) -> Self {
        let master = MasterBus::build(&mut backend, config.master_delay_time);
        AudioEngine {
            chains: MixerChains::new(config.eq),
            sequencer: StepScheduler::new(config.lookahead),
            recorder: RecordingEngine::new(&config),
            decks: DeckEngine::new(),
            registry: TrackRegistry::new(),
            clicks: HashMap::new(),
            events: EventBus::new(),
            takes: 0,
            master,
            backend,
            config,
        }
    }

    pub fn with_defaults(backend: B) -> Self {
        Self::new(backend, EngineConfig::default())
    }

    // --- read side -----------------------------------------------------

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &TrackRegistry {
        &self.registry
    }

    pub fn pattern(&self) -> &Pattern {
        &self.registry.pattern
    }

    pub fn clips(&self) -> &[Clip] {
        self.registry.clips()
    }

    pub fn clip(&self, id: ClipId) -> EngineResult<&Clip> {
        self.registry.clip(id)
    }

    pub fn deck(&self, deck: usize) -> EngineResult<Option<&DeckTrack>> {
        self.registry.deck(deck)
    }

    pub fn deck_mixer(&self) -> DeckMixer {
        self.decks.mixer()
    }

    pub fn master(&self) -> &MasterBus {
        &self.master
    }

    pub fn master_state(&self) -> MasterState {
        self.master.state()
    }

    pub fn recorder_state(&self) -> RecorderState {
        self.recorder.state()
    }

    pub fn is_playing(&self) -> bool {
        self.sequencer.is_playing()
    }

    pub fn playhead(&self) -> Option<usize> {
        self.registry.pattern.playhead()
    }

    /// One-shot voices currently sounding through instrument and clip chains.
    pub fn active_voices(&self) -> usize {
        self.chains.active_voices()
    }

    pub fn subscribe(&mut self, observer: Observer) -> SubscriptionId {
        self.events.subscribe(observer)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    fn emit(&mut self, event: EngineEvent) {
        self.events.emit(event);
    }

    /// Surface an operation failure to subscribers.
    fn report(&mut self, err: &EngineError) {
        let event = match err {
            EngineError::DeviceAccess(e) => EngineEvent::DeviceAccessFailed(e.clone()),
            EngineError::Playback(e) => EngineEvent::PlaybackFailed(e.clone()),
            EngineError::Export(e) => EngineEvent::ExportFailed(e.clone()),
            _ => return,
        };
        self.emit(event);
    }

    // --- transport -----------------------------------------------------

    pub fn start(&mut self) {
        if self.sequencer.is_playing() {
            return;
        }
        let now = self.backend.now();
        self.sequencer.start(now);
        log::info!("transport started at {} bpm", self.registry.pattern.bpm());
        self.emit(EngineEvent::TransportChanged { playing: true });
        self.run_sequencer(now);
    }

    /// Stop the pattern and cut every instrument voice and metronome click
    /// in flight. A running count-in keeps its clicks.
    pub fn stop(&mut self) {
        if !self.sequencer.is_playing() {
            return;
        }
        self.sequencer.stop();
        let now = self.backend.now();
        let cut = self
            .chains
            .silence_where(&mut self.backend, now, |k| matches!(k, ChainKey::Instrument(_)));
        self.silence_clicks(now, Some(ClickSource::Metronome));
        self.registry.pattern.set_playhead(None);
        log::info!("transport stopped, {cut} voices cut");
        self.emit(EngineEvent::TransportChanged { playing: false });
        self.pump_backend();
    }

    pub fn set_tempo(&mut self, bpm: f32) {
        if !bpm.is_finite() {
            log::warn!("ignoring tempo {bpm}");
            return;
        }
        self.registry.pattern.set_bpm(bpm);
        let bpm = self.registry.pattern.bpm();
        if self.sequencer.is_playing() {
            let now = self.backend.now();
            self.sequencer.restart(now, bpm);
            self.run_sequencer(now);
        }
        self.emit(EngineEvent::TempoChanged(bpm));
    }

    pub fn set_pattern_length(&mut self, length: usize) -> EngineResult<()> {
        self.registry.pattern.set_length(length)?;
        self.sequencer.fit_length(length);
        self.emit(EngineEvent::PatternLengthChanged(length));
        Ok(())
    }

    pub fn set_swing(&mut self, swing: f32) {
        self.registry.pattern.set_swing(swing);
    }

    pub fn set_metronome(&mut self, on: bool) {
        self.registry.pattern.set_metronome(on);
    }

    // --- instruments ---------------------------------------------------

    pub fn add_instrument(
        &mut self,
        name: impl Into<String>,
        source_url: impl Into<String>,
        base_pitch: Option<u8>,
    ) -> InstrumentId {
        self.registry.add_instrument(name, source_url, base_pitch)
    }

    pub fn remove_instrument(&mut self, id: InstrumentId) -> EngineResult<()> {
        self.registry.remove_instrument(id)?;
        let now = self.backend.now();
        self.chains.remove_chain(&mut self.backend, ChainKey::Instrument(id), now);
        Ok(())
    }

    pub fn request_instrument_load(&mut self, id: InstrumentId) -> EngineResult<Option<LoadRequest>> {
        self.registry.request_instrument_load(id)
    }

    pub fn request_all_instrument_loads(&mut self) -> Vec<LoadRequest> {
        self.registry.request_all_instrument_loads()
    }

    /// Fetch and decode an instrument's sample. A no-op when it is already
    /// loaded, loading or failed.
    pub fn load_instrument(&mut self, id: InstrumentId, source: &mut impl SampleSource) -> EngineResult<()> {
        match self.request_instrument_load(id)? {
            Some(request) => {
                let fetched = source.fetch(&request.url);
                self.complete_load(&request, fetched)
            }
            None => Ok(()),
        }
    }

    /// Complete several requests. Returns the ones that failed.
    pub fn fulfill(
        &mut self,
        requests: impl IntoIterator<Item = LoadRequest>,
        source: &mut impl SampleSource,
    ) -> Vec<SampleLoadError> {
        let mut failures = Vec::new();
        for request in requests {
            let fetched = source.fetch(&request.url);
            if let Err(EngineError::SampleLoad(e)) = self.complete_load(&request, fetched) {
                failures.push(e);
            }
        }
        failures
    }

    /// Decode fetched bytes for a pending load and store the outcome.
    pub fn complete_load(&mut self, request: &LoadRequest, fetched: Result<Vec<u8>, String>) -> EngineResult<()> {
        let decoded = fetched.and_then(|bytes| {
            self.backend
                .decode(&bytes)
                .map(Arc::new)
                .map_err(|e| e.to_string())
        });
        let failure = decoded.as_ref().err().cloned();
        if self.registry.finish_load(request, decoded) == LoadOutcome::Stale {
            log::debug!("dropping stale load of {}", request.url);
            return Ok(());
        }
        match failure {
            None => {
                log::info!("loaded {} for {:?}", request.url, request.target);
                self.emit(EngineEvent::Loaded(request.target));
                Ok(())
            }
            Some(reason) => {
                let error = SampleLoadError {
                    source_url: request.url.clone(),
                    reason,
                };
                log::warn!("{error}");
                self.emit(EngineEvent::SampleLoadFailed {
                    target: request.target,
                    error: error.clone(),
                });
                Err(error.into())
            }
        }
    }

    pub fn set_step(&mut self, id: InstrumentId, step: usize, on: bool) -> EngineResult<()> {
        self.registry.pattern.set_step(id, step, on)
    }

    pub fn toggle_step(&mut self, id: InstrumentId, step: usize) -> EngineResult<bool> {
        self.registry.pattern.toggle_step(id, step)
    }

    pub fn add_note(&mut self, id: InstrumentId, note: Note) -> EngineResult<()> {
        self.registry.pattern.add_note(id, note)
    }

    pub fn remove_note(&mut self, id: InstrumentId, note: Note) -> EngineResult<bool> {
        self.registry.pattern.remove_note(id, note)
    }

    pub fn clear_pattern(&mut self) {
        self.registry.pattern.clear_steps();
    }

    pub fn set_mute(&mut self, id: InstrumentId, muted: bool) -> EngineResult<()> {
        self.registry.pattern.set_mute(id, muted)
    }

    pub fn set_solo(&mut self, id: InstrumentId, soloed: bool) -> EngineResult<()> {
        self.registry.pattern.set_solo(id, soloed)
    }

    pub fn update_instrument_mixer(&mut self, id: InstrumentId, mixer: MixerSettings) -> EngineResult<()> {
        let mixer = self.registry.pattern.set_mixer(id, mixer)?;
        self.chains
            .apply_params(&mut self.backend, ChainKey::Instrument(id), &ChainParams::from(&mixer));
        Ok(())
    }

    /// Audition an instrument now, ignoring mute and solo.
    pub fn preview_instrument(&mut self, id: InstrumentId, pitch: Option<u8>) -> EngineResult<Option<NodeId>> {
        self.registry.instrument(id)?;
        let now = self.backend.now();
        Ok(self.trigger_instrument(id, pitch, now))
    }

    fn trigger_instrument(&mut self, id: InstrumentId, pitch: Option<u8>, time: f64) -> Option<NodeId> {
        let inst = self.registry.pattern.instrument(id)?;
        let Some(buffer) = inst.load.buffer().cloned() else {
            log::debug!("{id} has no decoded sample, skipped");
            return None;
        };
        let params = ChainParams::from(&inst.mixer);
        let playback = VoicePlayback {
            detune_cents: pitch.map_or(0.0, |p| inst.detune_cents(p)),
            ..VoicePlayback::default()
        };
        let key = ChainKey::Instrument(id);
        self.chains
            .ensure_chain(&mut self.backend, key, self.master.input(), &params);
        self.chains.trigger(&mut self.backend, key, buffer, time, playback)
    }

    fn fire_step(&mut self, scheduled: ScheduledStep) {
        let ScheduledStep { step, time } = scheduled;
        self.registry.pattern.set_playhead(Some(step));
        log::debug!("step {step} at {time:.4}");
        for trigger in self.registry.pattern.triggers_at(step) {
            if self.registry.pattern.is_audible(trigger.instrument) {
                self.trigger_instrument(trigger.instrument, trigger.pitch, time);
            }
        }
        if self.registry.pattern.metronome() && step % 4 == 0 {
            self.click(time, step == 0, ClickSource::Metronome);
        }
        self.emit(EngineEvent::Step { step, time });
    }

    fn run_sequencer(&mut self, now: f64) {
        let pattern = &self.registry.pattern;
        let timing = Timing {
            length: pattern.length(),
            bpm: pattern.bpm(),
            swing: pattern.swing(),
        };
        for scheduled in self.sequencer.due(now, timing) {
            self.fire_step(scheduled);
        }
    }

    fn click(&mut self, time: f64, accent: bool, source: ClickSource) {
        let m = self.config.metronome;
        let osc = self
            .backend
            .create_oscillator(if accent { m.accent_frequency } else { m.frequency });
        let gain = self.backend.create_gain();
        self.backend.set_param(gain, Param::Gain, m.gain);
        self.backend.connect(osc, gain);
        self.backend.connect(gain, self.master.input());
        self.backend.start(osc, time, 0.0);
        self.backend.stop(osc, time + m.click_length);
        self.clicks.insert(osc, (gain, source));
    }

    /// Cut clicks from `source`, or every click for `None`.
    fn silence_clicks(&mut self, now: f64, source: Option<ClickSource>) {
        let cut: Vec<NodeId> = self
            .clicks
            .iter()
            .filter(|(_, (_, from))| source.is_none_or(|s| s == *from))
            .map(|(osc, _)| *osc)
            .collect();
        for osc in cut {
            if let Some((gain, _)) = self.clicks.remove(&osc) {
                self.backend.stop(osc, now);
                self.backend.disconnect_all(osc);
                self.backend.disconnect_all(gain);
            }
        }
    }

    // --- clips ---------------------------------------------------------

    /// Add a clip. Audio clips carrying raw bytes are decoded right away;
    /// URL-only clips wait for [`request_clip_load`](Self::request_clip_load).
    pub fn import_clip(&mut self, name: impl Into<String>, source: MediaRef) -> ClipId {
        let bytes = source.bytes.clone();
        let id = self.registry.import_clip(name, source);
        self.emit(EngineEvent::ClipAdded(id));
        let is_audio = self.registry.clip(id).is_ok_and(|c| c.as_audio().is_some());
        if let Some(bytes) = bytes.filter(|_| is_audio) {
            self.decode_clip_bytes(id, &bytes);
        }
        id
    }

    fn decode_clip_bytes(&mut self, id: ClipId, bytes: &[u8]) {
        let decoded = self.backend.decode(bytes);
        let Ok(clip) = self.registry.clip_mut(id) else {
            return;
        };
        let name = clip.name.clone();
        let duration = decoded.as_ref().map(|b| b.duration()).ok();
        let Some(audio) = clip.as_audio_mut() else {
            return;
        };
        match decoded {
            Ok(buffer) => {
                audio.load = LoadState::Loaded(Arc::new(buffer));
                if let Some(d) = duration {
                    clip.duration = d;
                }
                self.events.emit(EngineEvent::Loaded(LoadTarget::Clip(id)));
            }
            Err(e) => {
                audio.load = LoadState::Failed(e.to_string());
                let error = SampleLoadError {
                    source_url: name,
                    reason: e.to_string(),
                };
                log::warn!("{error}");
                self.events.emit(EngineEvent::SampleLoadFailed {
                    target: LoadTarget::Clip(id),
                    error,
                });
            }
        }
    }

    pub fn request_clip_load(&mut self, id: ClipId) -> EngineResult<Option<LoadRequest>> {
        self.registry.request_clip_load(id)
    }

    pub fn load_clip(&mut self, id: ClipId, source: &mut impl SampleSource) -> EngineResult<()> {
        match self.request_clip_load(id)? {
            Some(request) => {
                let fetched = source.fetch(&request.url);
                self.complete_load(&request, fetched)
            }
            None => Ok(()),
        }
    }

    /// Store new clip mixer settings and push them onto the live chain and
    /// any sounding voice.
    pub fn update_clip_mixer(&mut self, id: ClipId, mixer: ClipMixer) -> EngineResult<ClipMixer> {
        let mixer = mixer.sanitized();
        let clip = self.registry.clip_mut(id)?;
        let audio = clip.as_audio_mut().ok_or(PlaybackError::NotAudio(id))?;
        audio.mixer = mixer;

        let key = ChainKey::Clip(id);
        self.chains
            .apply_params(&mut self.backend, key, &ChainParams::from(&mixer));
        for voice in self.chains.voices_for(key) {
            self.backend.set_param(voice, Param::PlaybackRate, mixer.tempo_rate);
            self.backend.set_param(voice, Param::Detune, mixer.pitch_shift * 100.0);
        }
        Ok(mixer)
    }

    pub fn update_clip_metadata(&mut self, id: ClipId, metadata: ClipMetadata) -> EngineResult<()> {
        self.registry.clip_mut(id)?.metadata = metadata;
        Ok(())
    }

    pub fn rename_clip(&mut self, id: ClipId, name: impl Into<String>) -> EngineResult<()> {
        self.registry.clip_mut(id)?.name = name.into();
        Ok(())
    }

    /// Stop any playback, tear down the clip's chain and drop it.
    pub fn delete_clip(&mut self, id: ClipId) -> EngineResult<Clip> {
        self.registry.clip(id)?;
        let now = self.backend.now();
        self.chains.remove_chain(&mut self.backend, ChainKey::Clip(id), now);
        let clip = self.registry.remove_clip(id)?;
        self.emit(EngineEvent::ClipRemoved(id));
        Ok(clip)
    }

    /// Play a clip from its stored position through its chain.
    pub fn play_clip(&mut self, id: ClipId) -> EngineResult<()> {
        let clip = self.registry.clip(id)?;
        let ready = match clip.as_audio() {
            None => Err(PlaybackError::NotAudio(id)),
            Some(audio) => match audio.load.buffer() {
                Some(buffer) => Ok((Arc::clone(buffer), audio.mixer, clip.position)),
                None => Err(PlaybackError::NotDecoded(id)),
            },
        };
        let (buffer, mixer, position) = match ready {
            Ok(ready) => ready,
            Err(e) => return Err(self.clip_failed(id, e)),
        };

        let now = self.backend.now();
        let key = ChainKey::Clip(id);
        self.chains.silence(&mut self.backend, key, now);
        let offset = if position < buffer.duration() { position } else { 0.0 };
        self.chains
            .ensure_chain(&mut self.backend, key, self.master.input(), &ChainParams::from(&mixer));
        let playback = VoicePlayback {
            rate: mixer.tempo_rate,
            detune_cents: mixer.pitch_shift * 100.0,
            offset,
        };
        if self
            .chains
            .trigger(&mut self.backend, key, buffer, now, playback)
            .is_none()
        {
            return Err(self.clip_failed(id, PlaybackError::Start(format!("no chain for {id}"))));
        }

        let clip = self.registry.clip_mut(id)?;
        clip.playing = true;
        clip.position = offset;
        self.emit(EngineEvent::ClipPlayback { clip: id, playing: true });
        Ok(())
    }

    fn clip_failed(&mut self, id: ClipId, error: PlaybackError) -> EngineError {
        if let Ok(clip) = self.registry.clip_mut(id) {
            clip.playing = false;
        }
        log::warn!("{error}");
        self.emit(EngineEvent::PlaybackFailed(error.clone()));
        self.emit(EngineEvent::ClipPlayback { clip: id, playing: false });
        error.into()
    }

    /// Stop a clip, keeping its position.
    pub fn stop_clip(&mut self, id: ClipId) -> EngineResult<()> {
        self.registry.clip(id)?;
        let now = self.backend.now();
        self.chains.silence(&mut self.backend, ChainKey::Clip(id), now);
        let clip = self.registry.clip_mut(id)?;
        if std::mem::replace(&mut clip.playing, false) {
            self.emit(EngineEvent::ClipPlayback { clip: id, playing: false });
        }
        Ok(())
    }

    // --- recording -----------------------------------------------------

    /// Open the input and start recording, counting in first when configured.
    pub fn start_recording(&mut self, video: bool) -> EngineResult<RecorderState> {
        let bus = self.master.input();
        let bpm = self.registry.pattern.bpm();
        let beats = self.config.count_in_beats;
        match self.recorder.start(&mut self.backend, bus, video, beats, bpm) {
            Ok(state) => {
                self.emit(EngineEvent::RecorderChanged(state));
                let now = self.backend.now();
                self.run_recorder(now);
                Ok(state)
            }
            Err(e) => {
                log::error!("recording failed to start: {e}");
                self.report(&e);
                Err(e)
            }
        }
    }

    /// Stop recording. Returns the new clip when capture had begun.
    pub fn stop_recording(&mut self) -> EngineResult<Option<ClipId>> {
        let was = self.recorder.state();
        let take = self.recorder.stop(&mut self.backend);
        let now = self.backend.now();
        self.silence_clicks(now, Some(ClickSource::CountIn));
        if was != RecorderState::Ready {
            self.emit(EngineEvent::RecorderChanged(RecorderState::Ready));
        }
        match take {
            Ok(Some(take)) => Ok(Some(self.clip_from_take(take))),
            Ok(None) => Ok(None),
            Err(e) => {
                log::error!("recording failed: {e}");
                self.report(&e);
                Err(e)
            }
        }
    }

    /// Abandon a count-in or a recording without creating a clip.
    pub fn cancel_recording(&mut self) {
        let was = self.recorder.state();
        self.recorder.release(&mut self.backend);
        let now = self.backend.now();
        self.silence_clicks(now, Some(ClickSource::CountIn));
        if was != RecorderState::Ready {
            self.emit(EngineEvent::RecorderChanged(RecorderState::Ready));
        }
    }

    fn clip_from_take(&mut self, take: RecordedTake) -> ClipId {
        self.takes += 1;
        let name = format!("Take {}", self.takes);
        let duration = take.media.duration;
        let bytes: Arc<[u8]> = Arc::from(take.media.bytes);
        let source = MediaRef {
            url: None,
            mime: take.media.mime,
            bytes: Some(Arc::clone(&bytes)),
        };
        let id = if take.video {
            self.registry.insert_clip(|id| Clip {
                duration,
                ..Clip::video(id, name, source)
            })
        } else {
            self.registry.insert_clip(|id| Clip {
                duration,
                ..Clip::audio(id, name, source)
            })
        };
        log::info!("recorded {id} ({duration:.2}s)");
        self.emit(EngineEvent::ClipAdded(id));
        if !take.video {
            self.decode_clip_bytes(id, &bytes);
        }
        id
    }

    pub fn set_input_gain(&mut self, gain: f32) {
        self.recorder.set_input_gain(&mut self.backend, gain);
    }

    pub fn set_monitoring(&mut self, on: bool) {
        let bus = self.master.input();
        self.recorder.set_monitoring(&mut self.backend, on, bus);
    }

    fn run_recorder(&mut self, now: f64) {
        let cues = match self.recorder.tick(&mut self.backend, now) {
            Ok(cues) => cues,
            Err(e) => {
                log::error!("recording failed to begin capture: {e}");
                self.report(&e);
                self.emit(EngineEvent::RecorderChanged(RecorderState::Ready));
                return;
            }
        };
        for cue in cues {
            match cue {
                RecorderCue::Click { time, remaining } => {
                    self.click(time, remaining == self.config.count_in_beats, ClickSource::CountIn);
                    self.emit(EngineEvent::CountIn(remaining));
                }
                RecorderCue::Started => {
                    log::info!("recording");
                    self.emit(EngineEvent::RecorderChanged(RecorderState::Recording));
                }
                RecorderCue::Waveform(frame) => self.emit(EngineEvent::Waveform(frame)),
            }
        }
    }

    // --- decks ---------------------------------------------------------

    /// Put a track on a deck, rewound and stopped, and request its bytes.
    pub fn load_deck(
        &mut self,
        deck: usize,
        name: impl Into<String>,
        url: impl Into<String>,
    ) -> EngineResult<LoadRequest> {
        self.registry.deck(deck)?;
        let now = self.backend.now();
        self.decks.reset(&mut self.backend, deck, now);
        let request = self.registry.load_deck(deck, name, url)?;
        self.emit(EngineEvent::DeckTransport { deck, playing: false });
        self.emit(EngineEvent::DeckProgress { deck, progress: 0.0 });
        Ok(request)
    }

    pub fn load_playlist_entry(&mut self, deck: usize, entry: &PlaylistEntry) -> EngineResult<LoadRequest> {
        self.load_deck(deck, entry.name.clone(), entry.url.clone())
    }

    /// Play or pause a deck. Returns whether it is now playing.
    pub fn toggle_deck(&mut self, deck: usize) -> EngineResult<bool> {
        let now = self.backend.now();
        let bus = self.master.input();
        let result = match self.registry.deck_mut(deck)? {
            Some(track) => self.decks.toggle(&mut self.backend, deck, track, bus, now),
            None => Err(PlaybackError::DeckEmpty(deck)),
        };
        match result {
            Ok(playing) => {
                self.emit(EngineEvent::DeckTransport { deck, playing });
                Ok(playing)
            }
            Err(e) => {
                let err = EngineError::from(e);
                self.report(&err);
                Err(err)
            }
        }
    }

    pub fn set_deck_tempo(&mut self, deck: usize, rate: f32) -> EngineResult<()> {
        let now = self.backend.now();
        let track = self
            .registry
            .deck_mut(deck)?
            .ok_or(PlaybackError::DeckEmpty(deck))?;
        self.decks.set_tempo(&mut self.backend, deck, track, rate, now);
        Ok(())
    }

    pub fn set_deck_gain(&mut self, deck: usize, gain: f32) -> EngineResult<()> {
        if deck >= DECK_COUNT {
            return Err(EngineError::UnknownDeck(deck));
        }
        self.decks.set_gain(&mut self.backend, deck, gain);
        Ok(())
    }

    pub fn set_crossfader(&mut self, x: f32) {
        self.decks.set_crossfader(&mut self.backend, x);
    }

    // --- master --------------------------------------------------------

    pub fn set_master_volume(&mut self, volume: f32) {
        self.master.set_volume(&mut self.backend, volume);
        self.emit(EngineEvent::MasterChanged(self.master.state()));
    }

    pub fn set_delay_mix(&mut self, wet: f32) {
        self.master.set_delay_mix(&mut self.backend, wet);
        self.emit(EngineEvent::MasterChanged(self.master.state()));
    }

    /// Apply saved master settings.
    pub fn restore_master(&mut self, state: MasterState) {
        self.master.restore(&mut self.backend, state);
        self.emit(EngineEvent::MasterChanged(self.master.state()));
    }

    // --- mixdown -------------------------------------------------------

    pub fn export_mix(&mut self) -> EngineResult<Mixdown> {
        match mixdown::export_mix(&mut self.backend, self.registry.clips(), &self.config) {
            Ok(mix) => {
                self.emit(EngineEvent::MixdownReady {
                    bytes: mix.wav.len(),
                    duration: mix.duration,
                });
                Ok(mix)
            }
            Err(e) => {
                log::error!("export aborted: {e}");
                let err = EngineError::from(e);
                self.report(&err);
                Err(err)
            }
        }
    }

    /// Export and write the WAV to `path`. Nothing is written on failure.
    pub fn export_mix_to(&mut self, path: &Path) -> EngineResult<Mixdown> {
        let mix = self.export_mix()?;
        write_mixdown(path, &mix)?;
        Ok(mix)
    }

    // --- documents -----------------------------------------------------

    pub fn pattern_file(&self) -> PatternFile {
        PatternFile::from_pattern(&self.registry.pattern)
    }

    pub fn load_pattern_file(&mut self, file: &PatternFile) -> EngineResult<()> {
        file.apply_to(&mut self.registry.pattern)?;
        let length = self.registry.pattern.length();
        let bpm = self.registry.pattern.bpm();
        self.sequencer.fit_length(length);
        if self.sequencer.is_playing() {
            let now = self.backend.now();
            self.sequencer.restart(now, bpm);
        }
        self.emit(EngineEvent::PatternLengthChanged(length));
        self.emit(EngineEvent::TempoChanged(bpm));
        Ok(())
    }

    pub fn session(&self) -> Session {
        Session {
            clips: self.registry.clips().to_vec(),
        }
    }

    /// Replace every clip with a saved session. Returns the loads needed to
    /// rehydrate audio clips; clips without a URL are marked failed.
    pub fn restore_session(&mut self, session: Session) -> Vec<LoadRequest> {
        let now = self.backend.now();
        let old: Vec<ClipId> = self.registry.clips().iter().map(|c| c.id).collect();
        for id in old {
            self.chains.remove_chain(&mut self.backend, ChainKey::Clip(id), now);
            self.emit(EngineEvent::ClipRemoved(id));
        }
        let (requests, orphans) = self.registry.restore_clips(session.clips);
        let restored: Vec<ClipId> = self.registry.clips().iter().map(|c| c.id).collect();
        for id in restored {
            self.emit(EngineEvent::ClipAdded(id));
        }
        for id in orphans {
            let error = SampleLoadError {
                source_url: String::new(),
                reason: format!("{id} has no source url to rehydrate from"),
            };
            log::warn!("{error}");
            self.emit(EngineEvent::SampleLoadFailed {
                target: LoadTarget::Clip(id),
                error,
            });
        }
        requests
    }

    // --- time ----------------------------------------------------------

    /// Process backend completions, schedule due steps and count-in beats
    /// and publish waveform frames. Returns how long the host may sleep
    /// before calling again, or `None` when nothing is pending.
    pub fn tick(&mut self) -> Option<Duration> {
        self.pump_backend();
        let now = self.backend.now();
        self.run_sequencer(now);
        self.run_recorder(now);
        self.next_wake(now)
    }

    fn next_wake(&self, now: f64) -> Option<Duration> {
        let mut wake = [self.sequencer.wake_at(), self.recorder.wake_at()]
            .into_iter()
            .flatten()
            .reduce(f64::min);
        let live = self.chains.active_voices() > 0
            || !self.clicks.is_empty()
            || (0..DECK_COUNT).any(|d| self.decks.is_playing(d));
        if live {
            let poll = now + self.config.waveform_interval;
            wake = Some(wake.map_or(poll, |w| w.min(poll)));
        }
        wake.map(|at| Duration::try_from_secs_f64((at - now).max(0.0)).unwrap_or(Duration::ZERO))
    }

    /// Drain backend events: free ended voices and clicks, track clip and
    /// deck positions.
    pub fn pump_backend(&mut self) {
        while let Some(event) = self.backend.poll_event() {
            match event {
                BackendEvent::Ended(node) => self.on_ended(node),
                BackendEvent::Position { node, seconds } => self.on_position(node, seconds),
            }
        }
    }

    fn on_ended(&mut self, node: NodeId) {
        if let Some(key) = self.chains.voice_ended(&mut self.backend, node) {
            let ChainKey::Clip(id) = key else {
                return;
            };
            if !self.chains.voices_for(key).is_empty() {
                return;
            }
            // natural end rewinds the clip
            if let Ok(clip) = self.registry.clip_mut(id) {
                if clip.playing {
                    clip.playing = false;
                    clip.position = 0.0;
                    self.events.emit(EngineEvent::ClipPlayback { clip: id, playing: false });
                }
            }
            return;
        }
        if let Some((gain, _)) = self.clicks.remove(&node) {
            self.backend.disconnect_all(node);
            self.backend.disconnect_all(gain);
            return;
        }
        if let Some(deck) = self
            .decks
            .on_ended(&mut self.backend, node, self.registry.decks_mut())
        {
            log::info!("deck {deck} reached the end");
            self.emit(EngineEvent::DeckTransport { deck, playing: false });
            self.emit(EngineEvent::DeckProgress { deck, progress: 0.0 });
        }
    }

    fn on_position(&mut self, node: NodeId, seconds: f64) {
        if let Some(ChainKey::Clip(id)) = self.chains.key_of(node) {
            if let Ok(clip) = self.registry.clip_mut(id) {
                clip.position = seconds;
            }
            return;
        }
        if let Some(deck) = self
            .decks
            .on_position(node, seconds, self.registry.decks_mut())
        {
            let progress = self.registry.decks()[deck].as_ref().map_or(0.0, |t| t.progress);
            self.emit(EngineEvent::DeckProgress { deck, progress });
        }
    }

    /// Stop everything and release every hardware handle.
    pub fn shutdown(&mut self) {
        self.stop();
        self.cancel_recording();
        let now = self.backend.now();
        for deck in 0..DECK_COUNT {
            if let Ok(Some(track)) = self.registry.deck_mut(deck) {
                self.decks.pause(&mut self.backend, deck, track, now);
            }
        }
        self.silence_clicks(now, None);
        self.chains.clear(&mut self.backend, now);
        for clip in self.registry.clips().iter().map(|c| c.id).collect::<Vec<_>>() {
            if let Ok(clip) = self.registry.clip_mut(clip) {
                clip.playing = false;
            }
        }
        self.pump_backend();
        log::info!("engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::encode_wav;
    use crate::backend::AudioBuffer;
    use crate::backend::memory::{MemoryBackend, NodeKind};
    use crate::error::ExportError;
    use std::sync::Mutex;

    fn wav(seconds: f64, value: f32) -> Vec<u8> {
        let frames = (seconds * 1000.0) as usize;
        encode_wav(&AudioBuffer::new(1000, vec![vec![value; frames]]))
    }

    fn engine() -> AudioEngine<MemoryBackend> {
        AudioEngine::with_defaults(MemoryBackend::new(1000))
    }

    fn recorder_of(engine: &mut AudioEngine<MemoryBackend>) -> Arc<Mutex<Vec<EngineEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.subscribe(Box::new(move |e: &EngineEvent| sink.lock().unwrap().push(e.clone())));
        seen
    }

    fn run_for(engine: &mut AudioEngine<MemoryBackend>, seconds: f64) {
        let steps = (seconds / 0.01).round() as usize;
        for _ in 0..steps {
            engine.backend_mut().advance(0.01);
            engine.tick();
        }
    }

    fn voices(engine: &AudioEngine<MemoryBackend>) -> usize {
        engine.backend().graph().count(NodeKind::BufferVoice)
    }

    fn kit(engine: &mut AudioEngine<MemoryBackend>) -> (InstrumentId, InstrumentId) {
        let kick = engine.add_instrument("kick", "kick.wav", None);
        let snare = engine.add_instrument("snare", "snare.wav", None);
        let mut source = |url: &str| -> Result<Vec<u8>, String> {
            match url {
                "kick.wav" | "snare.wav" => Ok(wav(0.05, 0.5)),
                _ => Err("404".into()),
            }
        };
        let requests = engine.request_all_instrument_loads();
        assert!(engine.fulfill(requests, &mut source).is_empty());
        (kick, snare)
    }

    #[test]
    fn corrupt_sample_is_excluded_and_others_still_play() {
        let mut e = engine();
        let events = recorder_of(&mut e);
        let kick = e.add_instrument("kick", "kick.wav", None);
        let broken = e.add_instrument("broken", "broken.wav", None);
        let mut source = |url: &str| -> Result<Vec<u8>, String> {
            if url == "kick.wav" { Ok(wav(0.1, 0.5)) } else { Ok(b"not a wav".to_vec()) }
        };
        e.load_instrument(kick, &mut source).unwrap();
        let err = e.load_instrument(broken, &mut source).unwrap_err();
        assert!(matches!(err, EngineError::SampleLoad(_)));

        let inst = e.registry().instrument(broken).unwrap();
        assert!(inst.load.buffer().is_none());
        assert!(inst.load.error().is_some());
        // loading again is a no-op
        e.load_instrument(broken, &mut source).unwrap();

        e.set_step(kick, 0, true).unwrap();
        e.set_step(broken, 0, true).unwrap();
        e.start();
        assert_eq!(voices(&e), 1);
        assert!(events.lock().unwrap().iter().any(|ev| matches!(
            ev,
            EngineEvent::SampleLoadFailed { target: LoadTarget::Instrument(id), .. } if *id == broken
        )));
    }

    #[test]
    fn sixteen_steps_at_120_bpm() {
        let mut e = engine();
        let events = recorder_of(&mut e);
        e.set_tempo(120.0);
        e.start();
        run_for(&mut e, 2.1);
        let steps: Vec<(usize, f64)> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|ev| match ev {
                EngineEvent::Step { step, time } => Some((*step, *time)),
                _ => None,
            })
            .collect();
        assert!(steps.len() >= 16);
        for (i, &(step, time)) in steps.iter().take(16).enumerate() {
            assert_eq!(step, i);
            assert!((time - i as f64 * 0.125).abs() < 1e-9);
        }
        assert_eq!(steps[16].0, 0);
    }

    #[test]
    fn non_finite_tempo_keeps_the_transport_running() {
        let mut e = engine();
        e.set_tempo(120.0);
        e.start();
        run_for(&mut e, 0.4);
        let before = e.playhead();
        e.set_tempo(f32::NAN);
        e.set_swing(f32::INFINITY);
        assert_eq!(e.pattern().bpm(), 120.0);
        assert_eq!(e.pattern().swing(), 0.0);

        run_for(&mut e, 0.5);
        assert_ne!(e.playhead(), before);
        let wait = e.tick().unwrap();
        assert!(wait > Duration::ZERO && wait <= Duration::from_millis(125));
    }

    #[test]
    fn stop_cuts_voices_and_cancels_the_timer() {
        let mut e = engine();
        let kick = e.add_instrument("kick", "kick.wav", None);
        let mut source = |_: &str| -> Result<Vec<u8>, String> { Ok(wav(5.0, 0.5)) };
        e.load_instrument(kick, &mut source).unwrap();
        for step in 0..16 {
            e.set_step(kick, step, true).unwrap();
        }
        e.start();
        run_for(&mut e, 0.5);
        assert!(e.active_voices() > 1);

        e.stop();
        assert_eq!(e.active_voices(), 0);
        assert_eq!(voices(&e), 0);
        assert_eq!(e.playhead(), None);
        assert_eq!(e.tick(), None);
    }

    #[test]
    fn finished_voices_are_released() {
        let mut e = engine();
        let (kick, _) = kit(&mut e);
        e.set_step(kick, 0, true).unwrap();
        e.set_step(kick, 8, true).unwrap();
        e.start();
        run_for(&mut e, 1.2);
        e.stop();
        run_for(&mut e, 0.2);
        assert_eq!(voices(&e), 0);
        assert_eq!(e.active_voices(), 0);
    }

    #[test]
    fn solo_and_mute_decide_who_sounds() {
        let mut e = engine();
        let (kick, snare) = kit(&mut e);
        e.set_step(kick, 0, true).unwrap();
        e.set_step(snare, 0, true).unwrap();
        e.set_solo(snare, true).unwrap();
        e.start();
        assert_eq!(e.active_voices(), 1);
        assert_eq!(e.chains.voices_for(ChainKey::Instrument(snare)).len(), 1);
        e.stop();

        e.set_solo(snare, false).unwrap();
        e.set_mute(kick, true).unwrap();
        e.start();
        assert_eq!(e.chains.voices_for(ChainKey::Instrument(kick)).len(), 0);
        assert_eq!(e.chains.voices_for(ChainKey::Instrument(snare)).len(), 1);
    }

    #[test]
    fn pitched_notes_are_detuned_from_base_pitch() {
        let mut e = engine();
        let keys = e.add_instrument("keys", "keys.wav", Some(60));
        let mut source = |_: &str| -> Result<Vec<u8>, String> { Ok(wav(0.2, 0.5)) };
        e.load_instrument(keys, &mut source).unwrap();
        e.add_note(keys, Note { pitch: 67, step: 0 }).unwrap();
        e.start();
        let voice = e.backend().graph().nodes_of(NodeKind::BufferVoice)[0];
        assert_eq!(e.backend().graph().param(voice, Param::Detune), Some(700.0));
    }

    #[test]
    fn metronome_accents_the_downbeat() {
        let mut e = engine();
        e.set_metronome(true);
        e.start();
        let g = e.backend().graph();
        let osc = g.nodes_of(NodeKind::Oscillator);
        assert_eq!(osc.len(), 1);
        assert_eq!(g.param(osc[0], Param::Frequency), Some(1000.0));

        run_for(&mut e, 0.46);
        let g = e.backend().graph();
        let freqs: Vec<f32> = g
            .nodes_of(NodeKind::Oscillator)
            .into_iter()
            .filter_map(|n| g.param(n, Param::Frequency))
            .collect();
        assert_eq!(freqs, vec![800.0]);
    }

    #[test]
    fn mixer_updates_write_params_in_place() {
        let mut e = engine();
        let (kick, _) = kit(&mut e);
        e.preview_instrument(kick, None).unwrap();
        let nodes = e.backend().graph().node_count();
        e.update_instrument_mixer(
            kick,
            MixerSettings {
                volume: 0.3,
                filter_cutoff: 2000.0,
                ..MixerSettings::default()
            },
        )
        .unwrap();
        assert_eq!(e.backend().graph().node_count(), nodes);
        let chain = e.chains.chain(ChainKey::Instrument(kick)).unwrap();
        assert_eq!(e.backend().graph().param(chain.gain, Param::Gain), Some(0.3));
    }

    #[test]
    fn tempo_change_keeps_position() {
        let mut e = engine();
        e.start();
        run_for(&mut e, 0.3);
        let before = e.playhead().unwrap();
        e.set_tempo(60.0);
        assert_eq!(e.playhead(), Some(before));
        assert!(e.is_playing());
        run_for(&mut e, 0.3);
        assert_eq!(e.playhead(), Some(before + 1));
    }

    #[test]
    fn export_with_no_clips_fails_and_writes_nothing() {
        let mut e = engine();
        let events = recorder_of(&mut e);
        let path = std::env::temp_dir().join(format!("studio-core-empty-{}.wav", std::process::id()));
        let err = e.export_mix_to(&path).unwrap_err();
        assert!(matches!(err, EngineError::Export(ExportError::NothingToExport)));
        assert!(!path.exists());
        assert!(events
            .lock()
            .unwrap()
            .contains(&EngineEvent::ExportFailed(ExportError::NothingToExport)));
    }

    #[test]
    fn recording_with_count_in_becomes_an_audio_clip() {
        let config = EngineConfig {
            count_in_beats: 2,
            ..EngineConfig::default()
        };
        let mut e = AudioEngine::new(MemoryBackend::new(1000), config);
        let events = recorder_of(&mut e);
        assert_eq!(
            e.start_recording(false).unwrap(),
            RecorderState::CountingIn { remaining: 2 }
        );
        run_for(&mut e, 1.05);
        assert_eq!(e.recorder_state(), RecorderState::Recording);
        run_for(&mut e, 0.95);

        let id = e.stop_recording().unwrap().unwrap();
        let clip = e.clip(id).unwrap();
        assert!(clip.as_audio().unwrap().load.buffer().is_some());
        assert!((clip.duration - 1.0).abs() < 0.05);
        assert_eq!(e.backend().open_streams(), 0);

        let log = events.lock().unwrap();
        let counts: Vec<u32> = log
            .iter()
            .filter_map(|ev| match ev {
                EngineEvent::CountIn(n) => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![2, 1]);
        assert!(log.iter().any(|ev| matches!(ev, EngineEvent::Waveform(_))));
        assert!(log.contains(&EngineEvent::ClipAdded(id)));
    }

    #[test]
    fn stopping_the_transport_keeps_the_count_in() {
        let config = EngineConfig {
            count_in_beats: 4,
            ..EngineConfig::default()
        };
        let mut e = AudioEngine::new(MemoryBackend::new(1000), config);
        e.set_metronome(true);
        e.start();
        e.start_recording(false).unwrap();
        let oscillators = |e: &AudioEngine<MemoryBackend>| e.backend().graph().count(NodeKind::Oscillator);
        assert_eq!(oscillators(&e), 2);

        e.stop();
        assert_eq!(oscillators(&e), 1);
        assert_eq!(e.recorder_state(), RecorderState::CountingIn { remaining: 3 });

        e.cancel_recording();
        assert_eq!(oscillators(&e), 0);
    }

    #[test]
    fn captured_audio_is_decoded_into_the_take() {
        let config = EngineConfig {
            count_in_beats: 0,
            ..EngineConfig::default()
        };
        let mut e = AudioEngine::new(MemoryBackend::new(1000), config);
        e.backend_mut().set_capture_payload(wav(0.3, 0.25));
        e.start_recording(false).unwrap();
        run_for(&mut e, 0.3);
        let id = e.stop_recording().unwrap().unwrap();

        let clip = e.clip(id).unwrap();
        assert_eq!(clip.name, "Take 1");
        let buffer = clip.as_audio().unwrap().load.buffer().unwrap();
        assert_eq!(buffer.frames(), 300);
        assert!((buffer.channel(0)[0] - 0.25).abs() < 1e-3);
    }

    #[test]
    fn device_failure_is_reported_and_leaves_recorder_ready() {
        let mut e = engine();
        let events = recorder_of(&mut e);
        e.backend_mut().fail_capture("no camera");
        assert!(matches!(e.start_recording(true), Err(EngineError::DeviceAccess(_))));
        assert_eq!(e.recorder_state(), RecorderState::Ready);
        assert_eq!(e.backend().open_streams(), 0);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|ev| matches!(ev, EngineEvent::DeviceAccessFailed(_))));
    }

    #[test]
    fn video_take_becomes_a_video_clip() {
        let config = EngineConfig {
            count_in_beats: 0,
            ..EngineConfig::default()
        };
        let mut e = AudioEngine::new(MemoryBackend::new(1000), config);
        e.start_recording(true).unwrap();
        run_for(&mut e, 0.5);
        let id = e.stop_recording().unwrap().unwrap();
        let clip = e.clip(id).unwrap();
        assert!(clip.as_audio().is_none());
        assert!(clip.source().bytes.is_some());
    }

    #[test]
    fn deck_plays_to_the_end_and_rewinds() {
        let mut e = engine();
        let events = recorder_of(&mut e);
        let entry = PlaylistEntry {
            name: "Loop".into(),
            url: "loop.wav".into(),
        };
        let req = e.load_playlist_entry(1, &entry).unwrap();
        assert!(matches!(e.toggle_deck(1), Err(EngineError::Playback(PlaybackError::DeckEmpty(1)))));
        e.complete_load(&req, Ok(wav(1.0, 0.2))).unwrap();

        assert!(e.toggle_deck(1).unwrap());
        e.set_crossfader(1.0);
        run_for(&mut e, 0.5);
        let progress = e.deck(1).unwrap().unwrap().progress;
        assert!((progress - 50.0).abs() < 2.0);

        run_for(&mut e, 0.7);
        let track = e.deck(1).unwrap().unwrap();
        assert!(!track.playing);
        assert_eq!(track.progress, 0.0);
        assert!(events
            .lock()
            .unwrap()
            .contains(&EngineEvent::DeckTransport { deck: 1, playing: false }));
        assert!(e.load_deck(DECK_COUNT, "x", "x.wav").is_err());
    }

    #[test]
    fn clip_playback_errors_are_surfaced() {
        let mut e = engine();
        let events = recorder_of(&mut e);
        let id = e.import_clip(
            "vox",
            MediaRef {
                url: Some("vox.wav".into()),
                mime: "audio/wav".into(),
                bytes: None,
            },
        );
        let err = e.play_clip(id).unwrap_err();
        assert!(matches!(err, EngineError::Playback(PlaybackError::NotDecoded(_))));
        assert!(!e.clip(id).unwrap().playing);
        assert!(events
            .lock()
            .unwrap()
            .contains(&EngineEvent::PlaybackFailed(PlaybackError::NotDecoded(id))));
    }

    #[test]
    fn clip_plays_and_delete_releases_its_nodes() {
        let mut e = engine();
        let baseline = e.backend().graph().node_count();
        let id = e.import_clip(
            "vox",
            MediaRef {
                url: None,
                mime: "audio/wav".into(),
                bytes: Some(Arc::from(wav(2.0, 0.3))),
            },
        );
        e.update_clip_mixer(
            id,
            ClipMixer {
                tempo_rate: 2.0,
                ..ClipMixer::default()
            },
        )
        .unwrap();
        e.play_clip(id).unwrap();
        assert!(e.clip(id).unwrap().playing);
        run_for(&mut e, 0.5);
        assert!((e.clip(id).unwrap().position - 1.0).abs() < 0.05);

        e.delete_clip(id).unwrap();
        e.tick();
        assert_eq!(e.backend().graph().node_count(), baseline);
        assert!(e.clip(id).is_err());
    }

    #[test]
    fn clip_export_renders_audio() {
        let mut e = engine();
        e.import_clip(
            "a",
            MediaRef {
                url: None,
                mime: "audio/wav".into(),
                bytes: Some(Arc::from(wav(0.5, 0.25))),
            },
        );
        e.import_clip("cam", MediaRef { url: None, mime: "video/webm".into(), bytes: None });
        let mix = e.export_mix().unwrap();
        assert_eq!(mix.duration, 1.5);
        assert_eq!(&mix.wav[0..4], b"RIFF");
    }

    #[test]
    fn session_round_trip_requests_rehydration() {
        let mut e = engine();
        let a = e.import_clip(
            "a",
            MediaRef {
                url: Some("a.wav".into()),
                mime: "audio/wav".into(),
                bytes: None,
            },
        );
        let json = e.session().to_json().unwrap();

        let mut other = engine();
        let requests = other.restore_session(Session::from_json(&json).unwrap());
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].target, LoadTarget::Clip(a));
        let mut source = |_: &str| -> Result<Vec<u8>, String> { Ok(wav(0.3, 0.1)) };
        assert!(other.fulfill(requests, &mut source).is_empty());
        assert!(other.clip(a).unwrap().as_audio().unwrap().load.buffer().is_some());
    }

    #[test]
    fn pattern_file_round_trip_through_the_engine() {
        let mut e = engine();
        let (kick, _) = kit(&mut e);
        e.set_step(kick, 4, true).unwrap();
        e.set_tempo(95.0);
        let file = e.pattern_file();

        let mut other = engine();
        kit(&mut other);
        other.load_pattern_file(&file).unwrap();
        assert_eq!(other.pattern().bpm(), 95.0);
        assert!(other.pattern().grid_row(kick).unwrap()[4]);
    }

    #[test]
    fn master_controls_emit_state() {
        let mut e = engine();
        let events = recorder_of(&mut e);
        e.set_master_volume(0.5);
        e.set_delay_mix(0.3);
        assert_eq!(
            events.lock().unwrap().last(),
            Some(&EngineEvent::MasterChanged(MasterState { volume: 0.5, delay_mix: 0.3 }))
        );

        e.restore_master(MasterState { volume: 2.0, delay_mix: 4.0 });
        assert_eq!(e.master_state(), MasterState { volume: 2.0, delay_mix: 1.0 });
    }

    #[test]
    fn shutdown_releases_everything() {
        let mut e = engine();
        let (kick, _) = kit(&mut e);
        e.set_step(kick, 0, true).unwrap();
        e.set_metronome(true);
        e.start();
        e.start_recording(false).unwrap();
        e.shutdown();
        assert_eq!(e.backend().open_streams(), 0);
        assert_eq!(e.active_voices(), 0);
        assert!(!e.is_playing());
        assert_eq!(e.backend().graph().count(NodeKind::Oscillator), 0);
    }
}
