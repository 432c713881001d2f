//! PCM16LE conversions shared by the capture and playback paths.
//!
//! Encoding scales by 32767 after clamping to [-1, 1] and rounds away from
//! zero; decoding divides by 32768 so the negative extremum maps to exactly
//! -1.0. Together they keep a float round trip within one step (1/32768).

/// Convert one float sample to PCM16 with clamped linear scaling
#[inline]
pub fn f32_to_pcm16(sample: f32) -> i16 {
    let clamped = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    // Exact in f64; rounding away from zero offsets the 32767/32768 scale gap
    let scaled = f64::from(clamped) * 32767.0;
    let code = if scaled >= 0.0 { scaled.ceil() } else { scaled.floor() };
    code as i16
}

/// Convert one PCM16 sample to a normalized float
#[inline]
pub fn pcm16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

pub fn encode_samples(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| f32_to_pcm16(s)).collect()
}

pub fn decode_samples(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| pcm16_to_f32(s)).collect()
}

/// Pack samples as little-endian bytes
pub fn to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Unpack little-endian bytes; a trailing odd byte is ignored
pub fn from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Root-mean-square level of a block, in 0.0..=1.0
pub fn rms_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt().min(1.0)
}
