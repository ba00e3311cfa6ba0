//! Source of truth for instruments, clips and deck tracks.
//!
//! Loading is split in two so fetching and decoding never block the
//! scheduler: `request_*_load` marks an entity as loading and hands back a
//! [`LoadRequest`] (or nothing, if it is already loaded, loading or failed),
//! and [`TrackRegistry::finish_load`] stores the decoded buffer or the error
//! once the host has fetched the bytes.

use std::sync::Arc;

use crate::audio::deck::{DECK_COUNT, DeckTrack};
use crate::backend::AudioBuffer;
use crate::error::{EngineError, EngineResult};
use crate::model::{Clip, ClipId, Instrument, InstrumentId, LoadState, MediaRef};
use crate::pattern::Pattern;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadTarget {
    Instrument(InstrumentId),
    Clip(ClipId),
    Deck(usize),
}

/// Bytes the host must fetch for an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub target: LoadTarget,
    pub url: String,
}

/// Where a finished load ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Applied,
    /// The entity is gone or was reloaded from another URL meanwhile.
    Stale,
}

fn begin_load(state: &mut LoadState, target: LoadTarget, url: &str) -> Option<LoadRequest> {
    if !state.is_unloaded() {
        return None;
    }
    *state = LoadState::Loading;
    Some(LoadRequest {
        target,
        url: url.to_string(),
    })
}

fn store(state: &mut LoadState, result: Result<Arc<AudioBuffer>, String>) {
    *state = match result {
        Ok(buffer) => LoadState::Loaded(buffer),
        Err(reason) => LoadState::Failed(reason),
    };
}

#[derive(Debug, Clone, Default)]
pub struct TrackRegistry {
    pub pattern: Pattern,
    clips: Vec<Clip>,
    decks: [Option<DeckTrack>; DECK_COUNT],
    next_instrument: u32,
    next_clip: u32,
}

impl TrackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // --- instruments ---------------------------------------------------

    pub fn add_instrument(
        &mut self,
        name: impl Into<String>,
        source_url: impl Into<String>,
        base_pitch: Option<u8>,
    ) -> InstrumentId {
        let id = InstrumentId(self.next_instrument);
        self.next_instrument += 1;
        let mut instrument = Instrument::new(id, name, source_url);
        instrument.base_pitch = base_pitch;
        self.pattern.add_instrument(instrument);
        id
    }

    pub fn remove_instrument(&mut self, id: InstrumentId) -> EngineResult<Instrument> {
        self.pattern.remove_instrument(id)
    }

    pub fn instrument(&self, id: InstrumentId) -> EngineResult<&Instrument> {
        self.pattern.instrument(id).ok_or(EngineError::UnknownInstrument(id))
    }

    /// Idempotent: a second call while loading, loaded or failed yields `None`.
    pub fn request_instrument_load(&mut self, id: InstrumentId) -> EngineResult<Option<LoadRequest>> {
        let inst = self
            .pattern
            .instrument_mut(id)
            .ok_or(EngineError::UnknownInstrument(id))?;
        Ok(begin_load(&mut inst.load, LoadTarget::Instrument(id), &inst.source_url))
    }

    /// Every instrument not yet loaded.
    pub fn request_all_instrument_loads(&mut self) -> Vec<LoadRequest> {
        let ids: Vec<InstrumentId> = self.pattern.instruments().iter().map(|i| i.id).collect();
        ids.into_iter()
            .filter_map(|id| self.request_instrument_load(id).ok().flatten())
            .collect()
    }

    // --- clips ---------------------------------------------------------

    pub fn clips(&self) -> &[Clip] {
        &self.clips
    }

    pub fn clip(&self, id: ClipId) -> EngineResult<&Clip> {
        self.clips
            .iter()
            .find(|c| c.id == id)
            .ok_or(EngineError::UnknownClip(id))
    }

    pub fn clip_mut(&mut self, id: ClipId) -> EngineResult<&mut Clip> {
        self.clips
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(EngineError::UnknownClip(id))
    }

    /// Create a clip of the kind its mime type names.
    pub fn import_clip(&mut self, name: impl Into<String>, source: MediaRef) -> ClipId {
        let id = ClipId(self.next_clip);
        self.next_clip += 1;
        let clip = if source.mime.starts_with("video/") {
            Clip::video(id, name, source)
        } else {
            Clip::audio(id, name, source)
        };
        self.clips.push(clip);
        id
    }

    pub fn insert_clip(&mut self, build: impl FnOnce(ClipId) -> Clip) -> ClipId {
        let id = ClipId(self.next_clip);
        self.next_clip += 1;
        self.clips.push(build(id));
        id
    }

    pub fn remove_clip(&mut self, id: ClipId) -> EngineResult<Clip> {
        let idx = self
            .clips
            .iter()
            .position(|c| c.id == id)
            .ok_or(EngineError::UnknownClip(id))?;
        Ok(self.clips.remove(idx))
    }

    /// Audio clips with a URL that have not been loaded yet.
    pub fn request_clip_load(&mut self, id: ClipId) -> EngineResult<Option<LoadRequest>> {
        let clip = self.clip_mut(id)?;
        let Some(audio) = clip.as_audio_mut() else {
            return Ok(None);
        };
        let Some(url) = audio.source.url.clone() else {
            return Ok(None);
        };
        Ok(begin_load(&mut audio.load, LoadTarget::Clip(id), &url))
    }

    /// Replace every clip, continuing ids after the highest restored one.
    /// Returns load requests for audio clips that have a URL, plus the ids
    /// of audio clips that cannot be rehydrated.
    pub fn restore_clips(&mut self, clips: Vec<Clip>) -> (Vec<LoadRequest>, Vec<ClipId>) {
        self.next_clip = clips.iter().map(|c| c.id.0 + 1).max().unwrap_or(0);
        self.clips = clips;
        for audio in self.clips.iter_mut().filter_map(Clip::as_audio_mut) {
            audio.mixer = audio.mixer.sanitized();
        }
        let ids: Vec<ClipId> = self.clips.iter().map(|c| c.id).collect();
        let mut requests = Vec::new();
        let mut orphans = Vec::new();
        for id in ids {
            match self.request_clip_load(id) {
                Ok(Some(req)) => requests.push(req),
                Ok(None) => {
                    let audio = self.clip_mut(id).ok().and_then(Clip::as_audio_mut);
                    if let Some(audio) = audio.filter(|a| a.source.url.is_none()) {
                        audio.load = LoadState::Failed("no source url to rehydrate from".into());
                        orphans.push(id);
                    }
                }
                Err(_) => {}
            }
        }
        (requests, orphans)
    }

    // --- decks ---------------------------------------------------------

    pub fn decks(&self) -> &[Option<DeckTrack>; DECK_COUNT] {
        &self.decks
    }

    pub fn decks_mut(&mut self) -> &mut [Option<DeckTrack>; DECK_COUNT] {
        &mut self.decks
    }

    pub fn deck(&self, deck: usize) -> EngineResult<Option<&DeckTrack>> {
        self.decks
            .get(deck)
            .map(Option::as_ref)
            .ok_or(EngineError::UnknownDeck(deck))
    }

    pub fn deck_mut(&mut self, deck: usize) -> EngineResult<Option<&mut DeckTrack>> {
        self.decks
            .get_mut(deck)
            .map(Option::as_mut)
            .ok_or(EngineError::UnknownDeck(deck))
    }

    /// Put a new track on `deck` at position 0 and request its bytes.
    pub fn load_deck(
        &mut self,
        deck: usize,
        name: impl Into<String>,
        url: impl Into<String>,
    ) -> EngineResult<LoadRequest> {
        let slot = self.decks.get_mut(deck).ok_or(EngineError::UnknownDeck(deck))?;
        let mut track = DeckTrack::new(name, url);
        track.load = LoadState::Loading;
        let request = LoadRequest {
            target: LoadTarget::Deck(deck),
            url: track.url.clone(),
        };
        *slot = Some(track);
        Ok(request)
    }

    // --- completion ----------------------------------------------------

    /// Store the result of a fetch + decode.
    pub fn finish_load(
        &mut self,
        request: &LoadRequest,
        result: Result<Arc<AudioBuffer>, String>,
    ) -> LoadOutcome {
        let duration = result.as_ref().map(|b| b.duration()).ok();
        match request.target {
            LoadTarget::Instrument(id) => match self.pattern.instrument_mut(id) {
                Some(inst) if inst.source_url == request.url => store(&mut inst.load, result),
                _ => return LoadOutcome::Stale,
            },
            LoadTarget::Clip(id) => {
                let Ok(clip) = self.clip_mut(id) else {
                    return LoadOutcome::Stale;
                };
                let Some(audio) = clip.as_audio_mut() else {
                    return LoadOutcome::Stale;
                };
                if audio.source.url.as_deref() != Some(request.url.as_str()) {
                    return LoadOutcome::Stale;
                }
                store(&mut audio.load, result);
                if let Some(d) = duration {
                    clip.duration = d;
                }
            }
            LoadTarget::Deck(deck) => match self.decks.get_mut(deck).and_then(Option::as_mut) {
                Some(track) if track.url == request.url => store(&mut track.load, result),
                _ => return LoadOutcome::Stale,
            },
        }
        LoadOutcome::Applied
    }
}
