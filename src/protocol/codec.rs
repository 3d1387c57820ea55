//! Message framing.
//!
//! Binary mode: every message is a 4-byte length (native byte order) followed by exactly
//! `length` bytes of UTF-8 JSON. Line mode (interactive use): one document per input line,
//! output lines are prefixed with `OUTPUT: `.

use std::io::{self, BufRead, ErrorKind, Read};

const LINE_PREFIX: &[u8] = b"OUTPUT: ";
const HEADER_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame length {0} exceeds limit {1}")]
    TooLarge(usize, usize),
    #[error("payload of {0} bytes can't be framed")]
    PayloadTooLarge(usize),
    #[error(transparent)]
    IO(#[from] io::Error),
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

/// Framing mode, selected once at startup.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Framing {
    Binary,
    Line,
}

impl Framing {
    /// Wrap payload into a frame.
    pub fn encode(self, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        match self {
            Framing::Binary => {
                let len = u32::try_from(payload.len())
                    .map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;
                let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
                frame.extend_from_slice(&len.to_ne_bytes());
                frame.extend_from_slice(payload);
                Ok(frame)
            }
            Framing::Line => {
                let mut frame = Vec::with_capacity(LINE_PREFIX.len() + payload.len() + 1);
                frame.extend_from_slice(LINE_PREFIX);
                frame.extend_from_slice(payload);
                frame.push(b'\n');
                Ok(frame)
            }
        }
    }
}

/// Read side of the transport. Single consumer, owned by the dispatch loop.
pub struct FrameReader<R: BufRead> {
    inner: R,
    framing: Framing,
    max_len: usize,
}

impl<R: BufRead> FrameReader<R> {
    pub fn new(inner: R, framing: Framing, max_len: usize) -> Self {
        Self {
            inner,
            framing,
            max_len,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Read next complete payload. Return `None` on end of stream, a short read
    /// at header or at payload stage is the end of stream too.
    pub fn read_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        match self.framing {
            Framing::Binary => self.read_binary(),
            Framing::Line => self.read_line(),
        }
    }

    fn read_binary(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut header = [0u8; HEADER_LEN];
        if !read_full(&mut self.inner, &mut header)? {
            return Ok(None);
        }

        let len = u32::from_ne_bytes(header) as usize;
        if len > self.max_len {
            return Err(FrameError::TooLarge(len, self.max_len));
        }

        let mut payload = vec![0u8; len];
        if !read_full(&mut self.inner, &mut payload)? {
            return Ok(None);
        }
        Ok(Some(payload))
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        loop {
            let mut line = Vec::new();
            let read_n = self.inner.read_until(b'\n', &mut line)?;
            if read_n == 0 {
                return Ok(None);
            }
            if line.len() > self.max_len {
                return Err(FrameError::TooLarge(line.len(), self.max_len));
            }
            while matches!(line.last(), Some(b'\n' | b'\r')) {
                line.pop();
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(line));
        }
    }
}

/// Fill `buf` entirely. Return `false` if stream ends before that.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(data: Vec<u8>, framing: Framing) -> FrameReader<Cursor<Vec<u8>>> {
        FrameReader::new(Cursor::new(data), framing, 1024)
    }

    #[test]
    fn test_binary_header_layout() {
        let frame = Framing::Binary.encode(br#"{"command":"ping"}"#).unwrap();
        assert_eq!(&frame[..4], &18u32.to_ne_bytes());
        assert_eq!(&frame[4..], br#"{"command":"ping"}"#);
    }

    #[test]
    fn test_binary_sequence() {
        let mut data = Framing::Binary.encode(b"first").unwrap();
        data.extend(Framing::Binary.encode(b"").unwrap());
        data.extend(Framing::Binary.encode(b"third").unwrap());

        let mut r = reader(data, Framing::Binary);
        assert_eq!(r.read_frame().unwrap(), Some(b"first".to_vec()));
        assert_eq!(r.read_frame().unwrap(), Some(vec![]));
        assert_eq!(r.read_frame().unwrap(), Some(b"third".to_vec()));
        assert_eq!(r.read_frame().unwrap(), None);
    }

    #[test]
    fn test_truncated_payload_is_end_of_stream() {
        let mut data = 10u32.to_ne_bytes().to_vec();
        data.extend_from_slice(b"{\"co");
        let mut r = reader(data, Framing::Binary);
        assert_eq!(r.read_frame().unwrap(), None);
    }

    #[test]
    fn test_truncated_header_is_end_of_stream() {
        let mut r = reader(vec![1, 0], Framing::Binary);
        assert_eq!(r.read_frame().unwrap(), None);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let data = 4096u32.to_ne_bytes().to_vec();
        let mut r = reader(data, Framing::Binary);
        assert!(matches!(
            r.read_frame(),
            Err(FrameError::TooLarge(4096, 1024))
        ));
    }

    #[test]
    fn test_line_mode() {
        let data = b"{\"command\":\"ping\"}\r\n\n   \n{\"command\":\"hasProcess\"}".to_vec();
        let mut r = reader(data, Framing::Line);
        assert_eq!(
            r.read_frame().unwrap(),
            Some(br#"{"command":"ping"}"#.to_vec())
        );
        assert_eq!(
            r.read_frame().unwrap(),
            Some(br#"{"command":"hasProcess"}"#.to_vec())
        );
        assert_eq!(r.read_frame().unwrap(), None);
    }

    #[test]
    fn test_line_encode() {
        let frame = Framing::Line.encode(br#"{"status":"ok"}"#).unwrap();
        assert_eq!(frame, b"OUTPUT: {\"status\":\"ok\"}\n".to_vec());
    }
}
