//! Notifications for UI subscribers.

use std::fmt;

use crate::audio::master::MasterState;
use crate::audio::recorder::RecorderState;
use crate::audio::registry::LoadTarget;
use crate::error::{DeviceAccessError, ExportError, PlaybackError, SampleLoadError};
use crate::model::ClipId;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    TransportChanged { playing: bool },
    /// A step was scheduled to sound at `time`.
    Step { step: usize, time: f64 },
    TempoChanged(f32),
    PatternLengthChanged(usize),

    Loaded(LoadTarget),
    SampleLoadFailed { target: LoadTarget, error: SampleLoadError },

    RecorderChanged(RecorderState),
    /// Count-in beats left, including the one sounding now.
    CountIn(u32),
    Waveform(Vec<f32>),
    DeviceAccessFailed(DeviceAccessError),

    ClipAdded(ClipId),
    ClipRemoved(ClipId),
    ClipPlayback { clip: ClipId, playing: bool },
    PlaybackFailed(PlaybackError),

    DeckTransport { deck: usize, playing: bool },
    DeckProgress { deck: usize, progress: f32 },

    MasterChanged(MasterState),
    MixdownReady { bytes: usize, duration: f64 },
    ExportFailed(ExportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type Observer = Box<dyn FnMut(&EngineEvent) + Send>;

/// Ordered observer list. Events go to subscribers in subscription order.
#[derive(Default)]
pub struct EventBus {
    next_id: u64,
    observers: Vec<(SubscriptionId, Observer)>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: Observer) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.observers.push((id, observer));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(sid, _)| *sid != id);
        self.observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn emit(&mut self, event: EngineEvent) {
        for (_, observer) in self.observers.iter_mut() {
            observer(&event);
        }
    }
}
