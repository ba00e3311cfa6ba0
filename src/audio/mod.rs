//! Engine components: chain builder, registry, sequencer, recorder, decks,
//! master bus and the offline mixdown.

pub mod chain;
pub mod deck;
pub mod master;
pub mod mixdown;
pub mod recorder;
pub mod registry;
pub mod sequencer;
pub mod wav;
