use crate::transport::framing::MAX_STREAM_FRAME;
use crate::{rvl, Result, ServerError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of the compressed-frame header: 3-byte tag + u32 uncompressed size.
pub const HEADER_LEN: usize = 7;

/// Frame payload codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Raw little-endian 16-bit pixels, no header.
    #[default]
    None,
    Lz4,
    Rvl,
}

impl Codec {
    pub fn tag(self) -> Option<&'static [u8; 3]> {
        match self {
            Codec::None => None,
            Codec::Lz4 => Some(b"LZ4"),
            Codec::Rvl => Some(b"RVL"),
        }
    }

    pub fn from_tag(tag: [u8; 3]) -> Result<Codec> {
        match &tag {
            b"LZ4" => Ok(Codec::Lz4),
            b"RVL" => Ok(Codec::Rvl),
            _ => Err(ServerError::UnknownCodec(tag)),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Codec::None => "none",
            Codec::Lz4 => "lz4",
            Codec::Rvl => "rvl",
        })
    }
}

impl FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" | "raw" => Ok(Codec::None),
            "lz4" => Ok(Codec::Lz4),
            "rvl" => Ok(Codec::Rvl),
            other => Err(format!("unknown codec '{}' (expected none, lz4 or rvl)", other)),
        }
    }
}

/// Encodes frames for the frame channel, reusing its scratch buffer.
pub struct FrameEncoder {
    codec: Codec,
    scratch: Vec<u8>,
}

impl FrameEncoder {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            scratch: Vec::new(),
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Produce the wire payload for one frame.
    pub fn encode(&mut self, pixels: &[u16]) -> Result<Vec<u8>> {
        self.scratch.clear();
        self.scratch.reserve(pixels.len() * 2);
        for pixel in pixels {
            self.scratch.extend_from_slice(&pixel.to_le_bytes());
        }

        let tag = match self.codec.tag() {
            None => return Ok(self.scratch.clone()),
            Some(tag) => tag,
        };
        let uncompressed = u32::try_from(self.scratch.len())
            .map_err(|_| ServerError::MalformedFrame("frame exceeds 4 GiB".into()))?;

        let mut payload = Vec::with_capacity(HEADER_LEN + self.scratch.len() / 2);
        payload.extend_from_slice(tag);
        payload.extend_from_slice(&uncompressed.to_le_bytes());

        match self.codec {
            Codec::Lz4 => {
                let bound = lz4_flex::block::get_maximum_output_size(self.scratch.len());
                payload.resize(HEADER_LEN + bound, 0);
                let written = lz4_flex::block::compress_into(&self.scratch, &mut payload[HEADER_LEN..])
                    .map_err(|e| ServerError::MalformedFrame(format!("LZ4 compression failed: {}", e)))?;
                payload.truncate(HEADER_LEN + written);
            }
            Codec::Rvl => payload.extend_from_slice(&rvl::compress(pixels)),
            Codec::None => {}
        }
        Ok(payload)
    }
}

fn pixels_from_le(bytes: &[u8]) -> Result<Vec<u16>> {
    if bytes.len() % 2 != 0 {
        return Err(ServerError::MalformedFrame(format!(
            "odd frame length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect())
}

/// Decode a compressed payload, selecting the codec from its header tag.
pub fn decode_compressed(payload: &[u8]) -> Result<Vec<u16>> {
    if payload.len() < HEADER_LEN {
        return Err(ServerError::MalformedFrame(format!(
            "compressed frame shorter than header: {} bytes",
            payload.len()
        )));
    }
    let tag = [payload[0], payload[1], payload[2]];
    let uncompressed =
        u32::from_le_bytes([payload[3], payload[4], payload[5], payload[6]]) as usize;
    let body = &payload[HEADER_LEN..];
    if uncompressed > MAX_STREAM_FRAME {
        return Err(ServerError::MalformedFrame(format!(
            "declared size {} exceeds {} bytes",
            uncompressed, MAX_STREAM_FRAME
        )));
    }

    match Codec::from_tag(tag)? {
        Codec::Lz4 => {
            let mut bytes = vec![0u8; uncompressed];
            let n = lz4_flex::block::decompress_into(body, &mut bytes)
                .map_err(|e| ServerError::MalformedFrame(format!("LZ4 decompression failed: {}", e)))?;
            if n != uncompressed {
                return Err(ServerError::MalformedFrame(format!(
                    "LZ4 size mismatch: header {} vs {}",
                    uncompressed, n
                )));
            }
            pixels_from_le(&bytes)
        }
        Codec::Rvl => {
            if uncompressed % 2 != 0 {
                return Err(ServerError::MalformedFrame(format!(
                    "odd RVL frame size {}",
                    uncompressed
                )));
            }
            rvl::decompress(body, uncompressed / 2)
        }
        Codec::None => pixels_from_le(body),
    }
}

/// Decode a frame-channel payload produced with `codec`.
pub fn decode_frame(payload: &[u8], codec: Codec) -> Result<Vec<u16>> {
    match codec {
        Codec::None => pixels_from_le(payload),
        Codec::Lz4 | Codec::Rvl => decode_compressed(payload),
    }
}
