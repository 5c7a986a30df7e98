//! Length-prefixed framing shared by both channels.
//!
//! ```text
//! ┌──────────────────┬──────────────────┐
//! │ Length (4 bytes) │ Payload          │
//! │ Big-endian u32   │ (Length bytes)   │
//! └──────────────────┴──────────────────┘
//! ```
//!
//! On the control channel the payload starts with a one-byte kind
//! (see [`ControlFrame`]).

use std::io::{self, Read, Write};

/// Largest accepted control-channel frame.
pub const MAX_CONTROL_FRAME: usize = 1024 * 1024;
/// Largest accepted frame-channel payload.
pub const MAX_STREAM_FRAME: usize = 64 * 1024 * 1024;

const READ_CHUNK: usize = 16 * 1024;

const KIND_MESSAGE: u8 = 0x00;
const KIND_PING: u8 = 0x01;
const KIND_PONG: u8 = 0x02;

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds u32 length"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Blocking read of one frame.
pub fn read_frame<R: Read>(reader: &mut R, max_len: usize) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(too_large(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

fn too_large(len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("Message too large: {} bytes", len),
    )
}

/// Incremental frame reader for sockets with a short read timeout.
///
/// Partial frames survive across timeouts, so a slow peer never desyncs the
/// stream.
pub struct FrameReader {
    buffer: Vec<u8>,
    max_len: usize,
}

impl FrameReader {
    pub fn new(max_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_len,
        }
    }

    /// Return the next complete frame, `Ok(None)` if none arrived before the
    /// socket's read timeout. End of stream is reported as `UnexpectedEof`.
    pub fn poll<R: Read>(&mut self, reader: &mut R) -> io::Result<Option<Vec<u8>>> {
        if let Some(frame) = self.take_frame()? {
            return Ok(Some(frame));
        }
        let mut chunk = [0u8; READ_CHUNK];
        match reader.read(&mut chunk) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection",
            )),
            Ok(n) => {
                self.buffer.extend_from_slice(&chunk[..n]);
                self.take_frame()
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn take_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
            as usize;
        if len > self.max_len {
            return Err(too_large(len));
        }
        if self.buffer.len() < 4 + len {
            return Ok(None);
        }
        let frame = self.buffer[4..4 + len].to_vec();
        self.buffer.drain(..4 + len);
        Ok(Some(frame))
    }
}

/// Control-channel frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// Serialized request or response.
    Message(Vec<u8>),
    /// Heartbeat request carrying the sender's TTL in deciseconds.
    Ping { ttl_ds: u16 },
    Pong,
}

impl ControlFrame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ControlFrame::Message(payload) => {
                let mut body = Vec::with_capacity(payload.len() + 1);
                body.push(KIND_MESSAGE);
                body.extend_from_slice(payload);
                body
            }
            ControlFrame::Ping { ttl_ds } => {
                let ttl = ttl_ds.to_be_bytes();
                vec![KIND_PING, ttl[0], ttl[1]]
            }
            ControlFrame::Pong => vec![KIND_PONG],
        }
    }

    pub fn decode(mut body: Vec<u8>) -> io::Result<ControlFrame> {
        let Some(&kind) = body.first() else {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "empty control frame"));
        };
        match kind {
            KIND_MESSAGE => {
                body.remove(0);
                Ok(ControlFrame::Message(body))
            }
            KIND_PING if body.len() == 3 => Ok(ControlFrame::Ping {
                ttl_ds: u16::from_be_bytes([body[1], body[2]]),
            }),
            KIND_PONG => Ok(ControlFrame::Pong),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown control frame kind 0x{:02x}", other),
            )),
        }
    }

    /// Frame and write to `writer`.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write_frame(writer, &self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that hands out at most `step` bytes per call, then times out once.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
        starve: bool,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.starve = !self.starve;
            if self.starve {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_partial_reads_reassemble() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"hello").unwrap();
        write_frame(&mut wire, b"").unwrap();
        write_frame(&mut wire, b"world!").unwrap();
        let total = wire.len();
        let mut source = Trickle {
            data: wire,
            pos: 0,
            step: 3,
            starve: false,
        };

        let mut reader = FrameReader::new(64);
        let mut frames = Vec::new();
        for _ in 0..total * 4 {
            match reader.poll(&mut source) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
            if frames.len() == 3 {
                break;
            }
        }
        assert_eq!(frames, vec![b"hello".to_vec(), Vec::new(), b"world!".to_vec()]);
    }

    #[test]
    fn test_oversize_frame_is_rejected() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &[0u8; 100]).unwrap();
        let mut reader = FrameReader::new(10);
        let err = reader.poll(&mut Cursor::new(wire)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_eof_is_reported() {
        let mut reader = FrameReader::new(10);
        let err = reader.poll(&mut Cursor::new(Vec::new())).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_control_frame_kinds() {
        let ping = ControlFrame::Ping { ttl_ds: 50 };
        assert_eq!(ControlFrame::decode(ping.encode()).unwrap(), ping);
        assert_eq!(ControlFrame::decode(vec![KIND_PONG]).unwrap(), ControlFrame::Pong);
        assert_eq!(
            ControlFrame::decode(vec![KIND_MESSAGE, 1, 2]).unwrap(),
            ControlFrame::Message(vec![1, 2])
        );
        assert!(ControlFrame::decode(vec![0x7f]).is_err());
        assert!(ControlFrame::decode(Vec::new()).is_err());
    }
}
