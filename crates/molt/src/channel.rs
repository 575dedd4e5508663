//! Length-prefixed framing shared by every control server.
//!
//! Each field on the wire is a 4-byte big-endian length followed by exactly
//! that many raw bytes. Commands and status tokens are just frames holding
//! ASCII tokens; payloads may be arbitrary binary.
//!
//! ```text
//! client                          server
//!   [len]["REQ_FD"]  ───────────▶
//!   [len]["0.0.0.0:8080"] ──────▶
//!                    ◀─────────── [len]["OK"]   (+ SCM_RIGHTS)
//!                    ◀─────────── [len]["ERROR"][len][message]
//! ```

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

/// Largest frame a peer may announce. Control payloads are tiny; anything
/// bigger is a corrupt or hostile length prefix.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

pub const STATUS_OK: &[u8] = b"OK";
pub const STATUS_ERROR: &[u8] = b"ERROR";

/// Errors raised while reading or writing control frames.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Transport failure (includes timeouts and truncated frames).
    #[error("control channel I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer announced a frame larger than [`MAX_FRAME_LEN`].
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: u32, max: u32 },

    /// The command token does not name an operation of this server.
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    /// The peer answered with something other than `OK` / `ERROR`.
    #[error("unexpected response {0:?}")]
    UnexpectedResponse(String),

    /// The peer answered `ERROR` with this message.
    #[error("remote error: {0}")]
    Remote(String),

    /// A frame that should hold text was not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}

impl ChannelError {
    /// True when the failure came from the connection itself rather than
    /// from the peer's answer.
    pub fn is_transport(&self) -> bool {
        matches!(self, ChannelError::Io(_))
    }
}

/// A framed request/response exchange over a connected stream.
#[derive(Debug)]
pub struct Channel<S = UnixStream> {
    stream: S,
}

impl Channel<UnixStream> {
    /// Connect to a control server, applying `timeout` to the connection's
    /// reads and writes.
    pub fn connect(path: &Path, timeout: Duration) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(Self { stream })
    }
}

impl<S> Channel<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Read + Write> Channel<S> {
    pub fn send_u32(&mut self, value: u32) -> Result<(), ChannelError> {
        self.stream.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    pub fn recv_u32(&mut self) -> Result<u32, ChannelError> {
        let mut buf = [0u8; 4];
        self.stream.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    pub fn send_frame(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        if payload.len() > MAX_FRAME_LEN as usize {
            return Err(ChannelError::FrameTooLarge {
                len: u32::try_from(payload.len()).unwrap_or(u32::MAX),
                max: MAX_FRAME_LEN,
            });
        }
        let len = payload.len() as u32;
        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(payload);
        self.stream.write_all(&buf)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn recv_frame(&mut self) -> Result<Vec<u8>, ChannelError> {
        let len = self.recv_u32()?;
        self.read_body(len)
    }

    /// Read the next frame, or `None` if the peer closed the connection
    /// cleanly on a frame boundary.
    pub fn recv_frame_opt(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.read_body(u32::from_be_bytes(buf)).map(Some)
    }

    fn read_body(&mut self, len: u32) -> Result<Vec<u8>, ChannelError> {
        if len > MAX_FRAME_LEN {
            return Err(ChannelError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        let mut body = vec![0u8; len as usize];
        self.stream.read_exact(&mut body)?;
        Ok(body)
    }

    pub fn send_str(&mut self, s: &str) -> Result<(), ChannelError> {
        self.send_frame(s.as_bytes())
    }

    pub fn recv_string(&mut self) -> Result<String, ChannelError> {
        String::from_utf8(self.recv_frame()?).map_err(|_| ChannelError::InvalidUtf8)
    }

    pub fn send_ok(&mut self) -> Result<(), ChannelError> {
        self.send_frame(STATUS_OK)
    }

    pub fn send_error(&mut self, message: &str) -> Result<(), ChannelError> {
        self.send_frame(STATUS_ERROR)?;
        self.send_str(message)
    }

    /// Read a status token. `OK` yields `Ok(())`; `ERROR` reads the message
    /// frame and yields [`ChannelError::Remote`].
    pub fn recv_status(&mut self) -> Result<(), ChannelError> {
        let status = self.recv_frame()?;
        match status.as_slice() {
            STATUS_OK => Ok(()),
            STATUS_ERROR => Err(ChannelError::Remote(self.recv_string()?)),
            other => Err(ChannelError::UnexpectedResponse(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn channel_with(bytes: Vec<u8>) -> Channel<Cursor<Vec<u8>>> {
        Channel::new(Cursor::new(bytes))
    }

    fn encoded(frames: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for frame in frames {
            out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
            out.extend_from_slice(frame);
        }
        out
    }

    #[test]
    fn test_frame_layout_is_big_endian_length_then_payload() {
        let mut channel = Channel::new(Cursor::new(Vec::new()));
        channel.send_str("REQ_PID").unwrap();
        let bytes = channel.into_inner().into_inner();
        assert_eq!(&bytes[..4], &[0, 0, 0, 7]);
        assert_eq!(&bytes[4..], b"REQ_PID");
    }

    #[test]
    fn test_binary_payload_is_preserved() {
        let payload = [0u8, 255, 10, 13, 0];
        let mut channel = channel_with(encoded(&[&payload]));
        assert_eq!(channel.recv_frame().unwrap(), payload);
    }

    #[test]
    fn test_truncated_frame_is_an_error() {
        let mut bytes = encoded(&[b"graceful_shutdown"]);
        bytes.truncate(10);
        let mut channel = channel_with(bytes);
        let err = channel.recv_frame().unwrap_err();
        assert!(err.is_transport(), "unexpected error: {err}");
    }

    #[test]
    fn test_truncated_length_prefix_is_an_error() {
        let mut channel = channel_with(vec![0, 0]);
        assert!(channel.recv_frame_opt().is_err());
    }

    #[test]
    fn test_clean_eof_on_boundary_is_none() {
        let mut channel = channel_with(encoded(&[b"REQ_ADDRS"]));
        assert_eq!(channel.recv_frame_opt().unwrap().unwrap(), b"REQ_ADDRS");
        assert!(channel.recv_frame_opt().unwrap().is_none());
    }

    #[test]
    fn test_oversized_length_is_rejected_before_allocation() {
        let mut channel = channel_with(u32::MAX.to_be_bytes().to_vec());
        match channel.recv_frame() {
            Err(ChannelError::FrameTooLarge { len, .. }) => assert_eq!(len, u32::MAX),
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_status_error_carries_message() {
        let mut channel = channel_with(encoded(&[b"ERROR", b"No fd matching 'x'"]));
        match channel.recv_status() {
            Err(ChannelError::Remote(msg)) => assert_eq!(msg, "No fd matching 'x'"),
            other => panic!("expected Remote error, got {other:?}"),
        }
    }

    #[test]
    fn test_status_garbage_is_unexpected() {
        let mut channel = channel_with(encoded(&[b"MAYBE"]));
        assert!(matches!(
            channel.recv_status(),
            Err(ChannelError::UnexpectedResponse(_))
        ));
    }
}
