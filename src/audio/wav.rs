//! WAV container encoding and decoding.
//!
//! Encoding writes the canonical 44-byte PCM16 RIFF header by hand so the
//! layout is fixed byte for byte. Decoding goes through `hound` and accepts
//! any integer or float WAV.

use std::io::Cursor;

use crate::backend::AudioBuffer;
use crate::error::BackendError;

pub const WAV_HEADER_LEN: usize = 44;

/// Encode a planar float buffer as interleaved 16-bit little-endian PCM.
pub fn encode_wav(buffer: &AudioBuffer) -> Vec<u8> {
    let pcm = interleave_pcm16(buffer);
    write_wav(&pcm, buffer.sample_rate(), buffer.channel_count())
}

/// Interleave channels and quantize to i16. Samples are clipped to [-1, 1]
/// first; negative values scale by 32768 and positive by 32767.
pub fn interleave_pcm16(buffer: &AudioBuffer) -> Vec<i16> {
    let channels = buffer.channel_count() as usize;
    let frames = buffer.frames();
    let mut out = Vec::with_capacity(frames * channels);
    for i in 0..frames {
        for ch in 0..channels {
            out.push(float_to_pcm16(buffer.channel(ch)[i]));
        }
    }
    out
}

#[inline]
fn float_to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

const PCM_FORMAT: u16 = 1;
const BYTES_PER_SAMPLE: u16 = 2;

/// RIFF and data chunk sizes for `sample_count` PCM16 samples. Both
/// saturate at `u32::MAX` once the data no longer fits a 32-bit header.
pub fn chunk_sizes(sample_count: usize) -> (u32, u32) {
    let data_len = sample_count
        .checked_mul(BYTES_PER_SAMPLE as usize)
        .and_then(|len| u32::try_from(len).ok())
        .unwrap_or(u32::MAX);
    let riff_len = data_len.saturating_add(WAV_HEADER_LEN as u32 - 8);
    (riff_len, data_len)
}

/// Write interleaved i16 samples behind a RIFF/WAVE header.
pub fn write_wav(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
    let block_align = channels.saturating_mul(BYTES_PER_SAMPLE);
    let byte_rate = sample_rate.saturating_mul(block_align as u32);
    let (riff_len, data_len) = chunk_sizes(samples.len());
    if data_len == u32::MAX {
        log::warn!("{} samples overflow the WAV header, sizes saturated", samples.len());
    }

    let mut out = Vec::with_capacity(WAV_HEADER_LEN + samples.len() * BYTES_PER_SAMPLE as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&riff_len.to_le_bytes());
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    for field in [PCM_FORMAT, channels] {
        out.extend_from_slice(&field.to_le_bytes());
    }
    for field in [sample_rate, byte_rate] {
        out.extend_from_slice(&field.to_le_bytes());
    }
    for field in [block_align, BYTES_PER_SAMPLE * 8] {
        out.extend_from_slice(&field.to_le_bytes());
    }

    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend(samples.iter().flat_map(|s| s.to_le_bytes()));
    out
}

/// Decode a WAV byte stream into planar floats.
pub fn decode_wav(bytes: &[u8]) -> Result<AudioBuffer, BackendError> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| BackendError::Decode(e.to_string()))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| BackendError::Decode(e.to_string()))?,
        hound::SampleFormat::Int => {
            let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|x| x as f32 / max))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| BackendError::Decode(e.to_string()))?
        }
    };

    Ok(AudioBuffer::from_interleaved(
        &samples,
        spec.channels,
        spec.sample_rate,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_u32(b: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
    }

    fn read_u16(b: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([b[at], b[at + 1]])
    }

    #[test]
    fn header_layout() {
        let buf = AudioBuffer::silent(2, 100, 44100);
        let wav = encode_wav(&buf);

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(read_u32(&wav, 4), 36 + 400);
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(read_u32(&wav, 16), 16);
        assert_eq!(read_u16(&wav, 20), 1);
        assert_eq!(read_u16(&wav, 22), 2);
        assert_eq!(read_u32(&wav, 24), 44100);
        assert_eq!(read_u32(&wav, 28), 44100 * 2 * 2);
        assert_eq!(read_u16(&wav, 32), 4);
        assert_eq!(read_u16(&wav, 34), 16);
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(read_u32(&wav, 40), 400);
        assert_eq!(wav.len(), WAV_HEADER_LEN + 400);
    }

    #[test]
    fn byte_rate_and_data_len_follow_shape() {
        for &(frames, rate, channels) in &[(1usize, 8000u32, 1u16), (480, 48000, 2), (33, 22050, 3)] {
            let wav = encode_wav(&AudioBuffer::silent(channels, frames, rate));
            assert_eq!(read_u32(&wav, 28), rate * channels as u32 * 2);
            assert_eq!(read_u32(&wav, 40), (frames * channels as usize * 2) as u32);
        }
    }

    #[test]
    fn oversized_data_saturates_the_header() {
        assert_eq!(chunk_sizes(200), (236, 400));
        let limit = (u32::MAX / 2) as usize;
        assert_eq!(chunk_sizes(limit - 20), (u32::MAX - 5, u32::MAX - 41));
        assert_eq!(chunk_sizes(limit + 1), (u32::MAX, u32::MAX));
        assert_eq!(chunk_sizes(usize::MAX), (u32::MAX, u32::MAX));
    }

    #[test]
    fn samples_are_clipped_before_scaling() {
        let buf = AudioBuffer::new(8000, vec![vec![2.0, -3.0, 1.0, -1.0, 0.0]]);
        assert_eq!(interleave_pcm16(&buf), vec![32767, -32768, 32767, -32768, 0]);
    }

    #[test]
    fn interleaves_channels() {
        let buf = AudioBuffer::new(8000, vec![vec![1.0, 0.0], vec![-1.0, 0.5]]);
        assert_eq!(interleave_pcm16(&buf), vec![32767, -32768, 0, 16383]);
    }

    #[test]
    fn decode_reproduces_within_quantization() {
        let left: Vec<f32> = (0..256).map(|i| ((i as f32) * 0.05).sin() * 0.8).collect();
        let right: Vec<f32> = left.iter().map(|s| -s * 0.5).collect();
        let original = AudioBuffer::new(22050, vec![left, right]);

        let decoded = decode_wav(&encode_wav(&original)).expect("decode");
        assert_eq!(decoded.sample_rate(), 22050);
        assert_eq!(decoded.channel_count(), 2);
        assert_eq!(decoded.frames(), 256);
        for ch in 0..2 {
            for (a, b) in original.channel(ch).iter().zip(decoded.channel(ch)) {
                assert!((a - b).abs() <= 2.0 / 32768.0, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode_wav(b"definitely not a wav"),
            Err(BackendError::Decode(_))
        ));
    }
}
