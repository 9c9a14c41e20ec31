//! Signed-linear (16-bit LE) sample helpers used by the mixer.

use bytes::Bytes;

/// Decode a slin payload into samples. Odd trailing bytes are dropped.
pub fn decode(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Encode samples into a slin payload.
pub fn encode(samples: &[i16]) -> Bytes {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    Bytes::from(out)
}

/// Add `src` into `dst` with saturation, sample by sample. Shorter `src`
/// leaves the tail of `dst` untouched.
pub fn saturating_mix(dst: &mut [i16], src: &[i16]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = d.saturating_add(*s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let samples = vec![0i16, 1, -1, i16::MAX, i16::MIN, 1234];
        assert_eq!(decode(&encode(&samples)), samples);
    }

    #[test]
    fn mix_saturates_at_rails() {
        let mut dst = vec![i16::MAX - 1, i16::MIN + 1, 100];
        saturating_mix(&mut dst, &[10, -10, 23]);
        assert_eq!(dst, vec![i16::MAX, i16::MIN, 123]);
    }

    #[test]
    fn short_source_leaves_tail() {
        let mut dst = vec![1, 2, 3];
        saturating_mix(&mut dst, &[10]);
        assert_eq!(dst, vec![11, 2, 3]);
    }
}
