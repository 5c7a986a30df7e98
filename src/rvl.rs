//! Run-length / variable-length depth coder (RVL).
//!
//! Zero runs and non-zero runs alternate; non-zero pixels are stored as
//! zigzagged deltas from the previous non-zero pixel. Every count and delta
//! is written as 3-bit groups with a continuation bit, packed as nibbles
//! most-significant first into 32-bit little-endian words.

use crate::{Result, ServerError};

struct NibbleWriter {
    out: Vec<u8>,
    word: u32,
    nibbles: u32,
}

impl NibbleWriter {
    fn with_capacity(bytes: usize) -> Self {
        Self {
            out: Vec::with_capacity(bytes),
            word: 0,
            nibbles: 0,
        }
    }

    fn encode(&mut self, mut value: u32) {
        loop {
            let mut nibble = value & 0x7;
            value >>= 3;
            if value != 0 {
                nibble |= 0x8;
            }
            self.word = (self.word << 4) | nibble;
            self.nibbles += 1;
            if self.nibbles == 8 {
                self.out.extend_from_slice(&self.word.to_le_bytes());
                self.word = 0;
                self.nibbles = 0;
            }
            if value == 0 {
                break;
            }
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.nibbles > 0 {
            let word = self.word << (4 * (8 - self.nibbles));
            self.out.extend_from_slice(&word.to_le_bytes());
        }
        self.out
    }
}

struct NibbleReader<'a> {
    input: &'a [u8],
    word: u32,
    nibbles: u32,
}

impl<'a> NibbleReader<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            word: 0,
            nibbles: 0,
        }
    }

    fn decode(&mut self) -> Result<u32> {
        let mut value = 0u32;
        let mut shift = 0u32;
        loop {
            if self.nibbles == 0 {
                let (head, rest) = self
                    .input
                    .split_first_chunk::<4>()
                    .ok_or_else(|| ServerError::MalformedFrame("RVL stream truncated".into()))?;
                self.word = u32::from_le_bytes(*head);
                self.input = rest;
                self.nibbles = 8;
            }
            let nibble = self.word >> 28;
            self.word <<= 4;
            self.nibbles -= 1;
            if shift > 30 {
                return Err(ServerError::MalformedFrame("RVL value overflow".into()));
            }
            value |= (nibble & 0x7) << shift;
            shift += 3;
            if nibble & 0x8 == 0 {
                return Ok(value);
            }
        }
    }
}

/// Compress depth pixels. Worst case output is slightly above the input size.
pub fn compress(pixels: &[u16]) -> Vec<u8> {
    let mut writer = NibbleWriter::with_capacity(pixels.len());
    let mut previous = 0i32;
    let mut rest = pixels;

    while !rest.is_empty() {
        let zeros = rest.iter().take_while(|&&p| p == 0).count();
        writer.encode(zeros as u32);
        rest = &rest[zeros..];

        let nonzeros = rest.iter().take_while(|&&p| p != 0).count();
        writer.encode(nonzeros as u32);
        for &pixel in &rest[..nonzeros] {
            let current = pixel as i32;
            let delta = current - previous;
            writer.encode(((delta << 1) ^ (delta >> 31)) as u32);
            previous = current;
        }
        rest = &rest[nonzeros..];
    }

    writer.finish()
}

/// Decompress exactly `pixel_count` pixels.
pub fn decompress(data: &[u8], pixel_count: usize) -> Result<Vec<u16>> {
    let mut reader = NibbleReader::new(data);
    let mut pixels = Vec::with_capacity(pixel_count);
    let mut previous = 0i32;

    let overrun = || ServerError::MalformedFrame("RVL run exceeds frame size".into());

    while pixels.len() < pixel_count {
        let zeros = reader.decode()? as usize;
        if zeros > pixel_count - pixels.len() {
            return Err(overrun());
        }
        pixels.resize(pixels.len() + zeros, 0);

        let nonzeros = reader.decode()? as usize;
        if nonzeros > pixel_count - pixels.len() {
            return Err(overrun());
        }
        for _ in 0..nonzeros {
            let zigzag = reader.decode()?;
            let delta = (zigzag >> 1) as i32 ^ -((zigzag & 1) as i32);
            let current = previous.wrapping_add(delta);
            pixels.push(current as u16);
            previous = current;
        }
    }

    Ok(pixels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_mixed_runs() {
        let pixels = [0, 0, 0, 1200, 1201, 1199, 0, 65535, 1, 0, 0, 7];
        let encoded = compress(&pixels);
        assert_eq!(decompress(&encoded, pixels.len()).unwrap(), pixels);
    }

    #[test]
    fn test_all_zero_frame_is_tiny() {
        let pixels = vec![0u16; 64 * 64];
        let encoded = compress(&pixels);
        assert!(encoded.len() <= 8);
        assert_eq!(decompress(&encoded, pixels.len()).unwrap(), pixels);
    }

    #[test]
    fn test_smooth_depth_compresses() {
        let pixels: Vec<u16> = (0..4096).map(|i| 1000 + (i % 8) as u16).collect();
        let encoded = compress(&pixels);
        assert!(encoded.len() < pixels.len() * 2);
        assert_eq!(decompress(&encoded, pixels.len()).unwrap(), pixels);
    }

    #[test]
    fn test_truncated_stream_is_rejected() {
        let pixels: Vec<u16> = (1..500).collect();
        let encoded = compress(&pixels);
        assert!(decompress(&encoded[..encoded.len() / 2], pixels.len()).is_err());
    }

    #[test]
    fn test_empty_input() {
        assert!(compress(&[]).is_empty());
        assert!(decompress(&[], 0).unwrap().is_empty());
    }
}
