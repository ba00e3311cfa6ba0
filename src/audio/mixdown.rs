//! Offline mixdown of every decoded audio clip into one WAV file.

use std::sync::Arc;

use crate::audio::chain::{ChainNodes, ChainParams, ChainShape};
use crate::audio::wav::encode_wav;
use crate::backend::{AudioBackend, AudioBuffer, AudioGraph, OfflineContext, Param};
use crate::config::EngineConfig;
use crate::error::ExportError;
use crate::model::{Clip, ClipMixer};

/// Rendered and encoded mix.
#[derive(Debug, Clone, PartialEq)]
pub struct Mixdown {
    pub wav: Vec<u8>,
    /// Seconds, tail included.
    pub duration: f64,
    pub sample_rate: u32,
    pub channels: u16,
}

fn renderable(clips: &[Clip]) -> Vec<(&Clip, ClipMixer, Arc<AudioBuffer>)> {
    clips
        .iter()
        .filter_map(|clip| {
            let audio = clip.as_audio()?;
            match audio.load.buffer() {
                Some(buffer) => Some((clip, audio.mixer.sanitized(), Arc::clone(buffer))),
                None => {
                    log::warn!("mixdown skips clip {} ({}): not decoded", clip.id, clip.name);
                    None
                }
            }
        })
        .collect()
}

/// Length of the render: the longest clip at its tempo rate, plus `tail`.
pub fn mix_duration(clips: &[Clip], tail: f64) -> Option<f64> {
    longest(&renderable(clips), tail)
}

fn longest(sources: &[(&Clip, ClipMixer, Arc<AudioBuffer>)], tail: f64) -> Option<f64> {
    sources
        .iter()
        .map(|(_, mixer, buffer)| buffer.duration() / mixer.tempo_rate.max(0.01) as f64)
        .reduce(f64::max)
        .map(|longest| longest + tail.max(0.0))
}

/// Render every decoded audio clip through its mixer chain and encode the
/// result. Video clips are left out.
pub fn export_mix<B: AudioBackend>(
    backend: &mut B,
    clips: &[Clip],
    config: &EngineConfig,
) -> Result<Mixdown, ExportError> {
    let sources = renderable(clips);
    let duration = longest(&sources, config.mixdown_tail).ok_or(ExportError::NothingToExport)?;
    let sample_rate = backend.sample_rate();
    let channels = config.mixdown_channels.max(1);

    let mut ctx = backend
        .offline_context(channels, duration, sample_rate)
        .map_err(|e| ExportError::Render(e.to_string()))?;
    let destination = ctx.destination();

    for (clip, mixer, buffer) in &sources {
        let chain = ChainNodes::build(&mut ctx, ChainShape::Clip, &config.eq, destination);
        chain.apply(&mut ctx, &ChainParams::from(mixer));
        let voice = ctx.create_buffer_voice(Arc::clone(buffer));
        ctx.set_param(voice, Param::PlaybackRate, mixer.tempo_rate);
        if mixer.pitch_shift != 0.0 {
            ctx.set_param(voice, Param::Detune, mixer.pitch_shift * 100.0);
        }
        ctx.connect(voice, chain.input());
        ctx.start(voice, 0.0, 0.0);
        log::debug!("mixdown: scheduled clip {} at rate {}", clip.id, mixer.tempo_rate);
    }

    let rendered = ctx.render().map_err(|e| ExportError::Render(e.to_string()))?;
    log::info!(
        "mixdown rendered {} clips, {:.2}s at {} Hz",
        sources.len(),
        duration,
        sample_rate
    );
    Ok(Mixdown {
        wav: encode_wav(&rendered),
        duration,
        sample_rate,
        channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::WAV_HEADER_LEN;
    use crate::backend::memory::MemoryBackend;
    use crate::model::{ClipId, LoadState, MediaRef};

    fn decoded_clip(id: u32, frames: usize, value: f32) -> Clip {
        let mut clip = Clip::audio(ClipId(id), format!("clip {id}"), MediaRef::default());
        if let Some(audio) = clip.as_audio_mut() {
            audio.load = LoadState::Loaded(Arc::new(AudioBuffer::new(1000, vec![vec![value; frames]])));
        }
        clip
    }

    fn config() -> EngineConfig {
        EngineConfig {
            mixdown_tail: 0.5,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn no_clips_is_nothing_to_export() {
        let mut be = MemoryBackend::new(1000);
        assert_eq!(export_mix(&mut be, &[], &config()), Err(ExportError::NothingToExport));
    }

    #[test]
    fn video_and_undecoded_clips_do_not_count() {
        let mut be = MemoryBackend::new(1000);
        let clips = vec![
            Clip::video(ClipId(1), "cam", MediaRef::default()),
            Clip::audio(ClipId(2), "pending", MediaRef::default()),
        ];
        assert_eq!(export_mix(&mut be, &clips, &config()), Err(ExportError::NothingToExport));
    }

    #[test]
    fn duration_uses_longest_clip_at_its_rate() {
        let mut slow = decoded_clip(1, 1000, 0.1);
        if let Some(audio) = slow.as_audio_mut() {
            audio.mixer.tempo_rate = 0.5;
        }
        let clips = vec![slow, decoded_clip(2, 1500, 0.1)];
        assert_eq!(mix_duration(&clips, 1.0), Some(3.0));
    }

    #[test]
    fn renders_and_sums_clips() {
        let mut be = MemoryBackend::new(1000);
        let clips = vec![decoded_clip(1, 1000, 0.25), decoded_clip(2, 500, 0.25)];
        let mix = export_mix(&mut be, &clips, &config()).unwrap();
        assert_eq!(mix.duration, 1.5);
        assert_eq!(mix.channels, 2);

        let frames = 1500;
        assert_eq!(mix.wav.len(), WAV_HEADER_LEN + frames * 2 * 2);

        let decoded = crate::audio::wav::decode_wav(&mix.wav).unwrap();
        assert_eq!(decoded.frames(), frames);
        // both clips overlap for the first half second
        assert!((decoded.channel(0)[100] - 0.5).abs() < 1e-3);
        assert!((decoded.channel(1)[700] - 0.25).abs() < 1e-3);
        assert_eq!(decoded.channel(0)[1200], 0.0);
    }

    #[test]
    fn out_of_range_mixer_is_clamped_for_render() {
        let mut be = MemoryBackend::new(1000);
        let mut fast = decoded_clip(1, 1000, 0.1);
        if let Some(audio) = fast.as_audio_mut() {
            audio.mixer.tempo_rate = 100.0;
            audio.mixer.volume = -2.0;
        }
        let mix = export_mix(&mut be, &[fast], &config()).unwrap();
        assert_eq!(mix.duration, 0.25 + 0.5);
    }

    #[test]
    fn render_failure_is_an_export_error() {
        let mut be = MemoryBackend::new(1000);
        be.fail_render("out of memory");
        let clips = vec![decoded_clip(1, 100, 0.1)];
        assert!(matches!(
            export_mix(&mut be, &clips, &config()),
            Err(ExportError::Render(_))
        ));
    }
}
