//! PCM16 little-endian conversions.

/// Decodes raw PCM16 LE bytes into normalized f32 samples (`int16 / 32768`).
/// A trailing odd byte is ignored.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

/// Encodes normalized f32 samples as PCM16 LE bytes, clamping to [-1, 1].
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_half_scale_values() {
        // 16384 and -16384 little-endian
        let samples = decode_pcm16(&[0x00, 0x40, 0x00, 0xC0]);
        assert_eq!(samples, vec![0.5, -0.5]);
    }

    #[test]
    fn decode_ignores_trailing_odd_byte() {
        let samples = decode_pcm16(&[0x00, 0x40, 0xFF]);
        assert_eq!(samples, vec![0.5]);
    }

    #[test]
    fn encode_clamps_out_of_range_samples() {
        let bytes = encode_pcm16(&[2.0, -2.0]);
        assert_eq!(bytes, vec![0xFF, 0x7F, 0x01, 0x80]);
    }

    #[test]
    fn silence_encodes_to_zeros() {
        assert_eq!(encode_pcm16(&[0.0, 0.0]), vec![0, 0, 0, 0]);
    }
}
