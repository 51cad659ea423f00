//! Length-prefixed framing for worker communication
//!
//! Frame = 4-byte big-endian length followed by the body. Used over the
//! worker's stdin (requests) and stdout (frames back to the supervisor).

use crate::{Result, SandpitError};
use std::io::{ErrorKind, Read, Write};

/// Frames larger than this are rejected in both directions
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Reading half of a framed channel
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub const fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read one frame; `Ok(None)` on a clean end of stream
    pub fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        let mut len_bytes = [0u8; 4];
        match self.inner.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(SandpitError::Protocol(format!("frame too large: {len} bytes")));
        }

        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body)?;
        Ok(Some(body))
    }
}

/// Writing half of a framed channel
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub const fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn send(&mut self, body: &[u8]) -> Result<()> {
        if body.len() > MAX_FRAME_LEN {
            return Err(SandpitError::Protocol(format!(
                "frame too large: {} bytes",
                body.len()
            )));
        }

        #[allow(clippy::cast_possible_truncation)]
        let len_bytes = (body.len() as u32).to_be_bytes();
        self.inner.write_all(&len_bytes)?;
        self.inner.write_all(body)?;
        self.inner.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_survive_a_round_trip() {
        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.send(b"hello").unwrap();
        writer.send(b"").unwrap();

        let mut reader = FrameReader::new(Cursor::new(buf));
        assert_eq!(reader.recv().unwrap().as_deref(), Some(&b"hello"[..]));
        assert_eq!(reader.recv().unwrap().as_deref(), Some(&b""[..]));
        assert!(reader.recv().unwrap().is_none());
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        #[allow(clippy::cast_possible_truncation)]
        let prefix = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        let mut reader = FrameReader::new(Cursor::new(prefix.to_vec()));
        assert!(matches!(reader.recv(), Err(SandpitError::Protocol(_))));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let mut data = 10u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"abc");
        let mut reader = FrameReader::new(Cursor::new(data));
        assert!(matches!(reader.recv(), Err(SandpitError::Io(_))));
    }
}
