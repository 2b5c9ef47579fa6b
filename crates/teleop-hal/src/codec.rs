//! [`ChannelCodec`] – compact binary encoding of analog control channels.
//!
//! Each channel value `v ∈ [-1.0, 1.0]` is mapped onto an unsigned 10-bit
//! integer
//!
//! ```text
//! q = round((v + 1.0) * 511.5)    clamped to [0, 1023]
//! ```
//!
//! and the 10-bit words are packed least-significant-bit first with no
//! padding between channels.  A trailing partial byte is zero-padded at the
//! high end, so a 12-channel frame is `ceil(12 * 10 / 8) = 15` bytes.
//!
//! Decoding reverses both steps (`v = q / 511.5 - 1.0`).  The quantisation
//! step is `1 / 511.5 ≈ 0.00196`; round trips are exact only to within one
//! step.
//!
//! # Example
//!
//! ```
//! use teleop_hal::codec::ChannelCodec;
//!
//! let codec = ChannelCodec::new(12);
//! let frame = codec.encode(&[0.0; 12]).unwrap();
//! assert_eq!(frame.len(), 15);
//!
//! let back = codec.decode(&frame).unwrap();
//! assert!(back.iter().all(|v| v.abs() < 0.002));
//! ```

use teleop_types::CHANNEL_COUNT;
use thiserror::Error;

/// Bits used per channel on the wire.
pub const BITS_PER_CHANNEL: usize = 10;

const MAX_QUANT: u16 = (1 << BITS_PER_CHANNEL) - 1;
const SCALE: f64 = 511.5;

/// Errors raised by [`ChannelCodec`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("expected {expected} channels, got {actual}")]
    ChannelCountMismatch { expected: usize, actual: usize },
    #[error("frame too short: need {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },
}

impl CodecError {
    pub fn code(&self) -> &'static str {
        match self {
            CodecError::ChannelCountMismatch { .. } => "CHANNEL_COUNT_MISMATCH",
            CodecError::FrameTooShort { .. } => "FRAME_TOO_SHORT",
        }
    }
}

/// Deterministic encoder/decoder for a fixed number of channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelCodec {
    channel_count: usize,
}

impl Default for ChannelCodec {
    fn default() -> Self {
        Self::new(CHANNEL_COUNT)
    }
}

impl ChannelCodec {
    pub fn new(channel_count: usize) -> Self {
        Self { channel_count }
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Packed length in bytes for the configured channel count.
    pub fn frame_len(&self) -> usize {
        (self.channel_count * BITS_PER_CHANNEL).div_ceil(8)
    }

    /// Encode `channels` into a packed frame.
    ///
    /// # Errors
    ///
    /// [`CodecError::ChannelCountMismatch`] when `channels.len()` differs from
    /// the configured channel count.
    pub fn encode(&self, channels: &[f64]) -> Result<Vec<u8>, CodecError> {
        if channels.len() != self.channel_count {
            return Err(CodecError::ChannelCountMismatch {
                expected: self.channel_count,
                actual: channels.len(),
            });
        }

        let mut out = Vec::with_capacity(self.frame_len());
        let mut acc: u32 = 0;
        let mut acc_bits = 0usize;

        for &v in channels {
            acc |= u32::from(quantize(v)) << acc_bits;
            acc_bits += BITS_PER_CHANNEL;
            while acc_bits >= 8 {
                out.push((acc & 0xFF) as u8);
                acc >>= 8;
                acc_bits -= 8;
            }
        }
        if acc_bits > 0 {
            out.push((acc & 0xFF) as u8);
        }
        Ok(out)
    }

    /// Decode a packed frame back into channel values.
    ///
    /// Bytes beyond [`frame_len`](Self::frame_len) are ignored.
    ///
    /// # Errors
    ///
    /// [`CodecError::FrameTooShort`] when `bytes` holds fewer than
    /// `frame_len()` bytes.
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<f64>, CodecError> {
        let expected = self.frame_len();
        if bytes.len() < expected {
            return Err(CodecError::FrameTooShort {
                expected,
                actual: bytes.len(),
            });
        }

        let mut channels = Vec::with_capacity(self.channel_count);
        let mut acc: u32 = 0;
        let mut acc_bits = 0usize;
        let mut bytes = bytes[..expected].iter();

        while channels.len() < self.channel_count {
            while acc_bits < BITS_PER_CHANNEL {
                // Length was checked above, so the iterator cannot run dry
                // before the last channel is complete.
                let Some(&b) = bytes.next() else { break };
                acc |= u32::from(b) << acc_bits;
                acc_bits += 8;
            }
            let q = (acc & u32::from(MAX_QUANT)) as u16;
            acc >>= BITS_PER_CHANNEL;
            acc_bits = acc_bits.saturating_sub(BITS_PER_CHANNEL);
            channels.push(dequantize(q));
        }
        Ok(channels)
    }
}

/// Map `v` onto the 10-bit wire range. Non-finite input is treated as the
/// neutral value.
fn quantize(v: f64) -> u16 {
    let v = if v.is_finite() { v.clamp(-1.0, 1.0) } else { 0.0 };
    let q = ((v + 1.0) * SCALE).round();
    q.clamp(0.0, f64::from(MAX_QUANT)) as u16
}

fn dequantize(q: u16) -> f64 {
    f64::from(q) / SCALE - 1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP: f64 = 0.002;

    #[test]
    fn twelve_channel_frame_is_fifteen_bytes() {
        let codec = ChannelCodec::default();
        assert_eq!(codec.frame_len(), 15);
        assert_eq!(codec.encode(&[0.3; 12]).unwrap().len(), 15);
    }

    #[test]
    fn all_zero_frame_matches_fixture() {
        // 0.0 quantises to 512 (0b10_0000_0000); four words fill five bytes.
        let frame = ChannelCodec::default().encode(&[0.0; 12]).unwrap();
        let pattern = [0x00, 0x02, 0x08, 0x20, 0x80];
        let expected: Vec<u8> = pattern.iter().cycle().take(15).copied().collect();
        assert_eq!(frame, expected);
    }

    #[test]
    fn extremes_map_to_all_ones_and_all_zeros() {
        let codec = ChannelCodec::default();
        assert_eq!(codec.encode(&[1.0; 12]).unwrap(), vec![0xFF; 15]);
        assert_eq!(codec.encode(&[-1.0; 12]).unwrap(), vec![0x00; 15]);
    }

    #[test]
    fn roundtrip_stays_within_one_step() {
        let codec = ChannelCodec::default();
        // Deterministic sweep across the full range, offset per channel so
        // every bit position sees varied values.
        for i in 0..=200 {
            let channels: Vec<f64> = (0..12)
                .map(|c| {
                    let t = ((i * 7 + c * 13) % 201) as f64 / 100.0;
                    t - 1.0
                })
                .collect();
            let decoded = codec.decode(&codec.encode(&channels).unwrap()).unwrap();
            for (orig, back) in channels.iter().zip(&decoded) {
                assert!(
                    (orig - back).abs() <= STEP,
                    "channel drifted: {orig} -> {back}"
                );
            }
        }
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let codec = ChannelCodec::new(2);
        let decoded = codec.decode(&codec.encode(&[3.0, -7.5]).unwrap()).unwrap();
        assert!((decoded[0] - 1.0).abs() < 1e-9);
        assert!((decoded[1] + 1.0).abs() < 1e-9);
    }

    #[test]
    fn non_finite_values_encode_as_neutral() {
        let codec = ChannelCodec::new(2);
        let frame = codec.encode(&[f64::NAN, f64::INFINITY]).unwrap();
        let decoded = codec.decode(&frame).unwrap();
        assert!(decoded.iter().all(|v| v.abs() < STEP));
    }

    #[test]
    fn encode_rejects_wrong_channel_count() {
        let err = ChannelCodec::default().encode(&[0.0; 7]).unwrap_err();
        assert_eq!(
            err,
            CodecError::ChannelCountMismatch {
                expected: 12,
                actual: 7
            }
        );
        assert_eq!(err.code(), "CHANNEL_COUNT_MISMATCH");
    }

    #[test]
    fn decode_rejects_short_frame() {
        let err = ChannelCodec::default().decode(&[0u8; 14]).unwrap_err();
        assert_eq!(
            err,
            CodecError::FrameTooShort {
                expected: 15,
                actual: 14
            }
        );
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let codec = ChannelCodec::default();
        let mut frame = codec.encode(&[0.5; 12]).unwrap();
        frame.extend_from_slice(&[0xAA, 0xBB]);
        let decoded = codec.decode(&frame).unwrap();
        assert_eq!(decoded.len(), 12);
        assert!(decoded.iter().all(|v| (v - 0.5).abs() <= STEP));
    }

    #[test]
    fn odd_channel_count_pads_high_bits_with_zero() {
        // 7 channels = 70 bits -> 9 bytes, top 2 bits of the last byte unused.
        let codec = ChannelCodec::new(7);
        let frame = codec.encode(&[1.0; 7]).unwrap();
        assert_eq!(frame.len(), 9);
        assert_eq!(frame[8], 0b0011_1111);
    }
}
