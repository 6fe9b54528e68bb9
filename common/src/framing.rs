use std::io::{self, Read, Write};

use bincode::Options;
use thiserror::Error;

use crate::protocol::WireMessage;

/// Hard cap on the total encoded size of one message. Frames declaring more
/// are rejected before the body is read or decoded.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Codec shared by the framer and the payload helpers: length-limited so
/// untrusted input cannot declare an allocation larger than one legal frame,
/// and trailing bytes are rejected.
pub(crate) fn wire_options() -> impl Options {
    bincode::options().with_limit(MAX_MESSAGE_SIZE as u64)
}

/// Errors raised by the framing layer. Any of these ends the connection;
/// partially received input is never acted on.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("declared frame length {0} is outside the accepted bounds")]
    BadLength(usize),
    #[error("encoded message exceeds the {MAX_MESSAGE_SIZE}-byte frame cap")]
    Oversized,
    #[error("stream ended after {got} of {expected} frame bytes")]
    Truncated { expected: usize, got: usize },
    #[error("failed to encode message")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode frame body")]
    Decode(#[source] bincode::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FrameError {
    pub(crate) fn from_encode(e: bincode::Error) -> Self {
        match *e {
            bincode::ErrorKind::SizeLimit => FrameError::Oversized,
            _ => FrameError::Encode(e),
        }
    }
}

/// Outcome of one receive attempt. `Closed` and `TimedOut` are ordinary
/// results rather than errors: the caller decides whether a timeout means a
/// stalled peer or its own shutdown in progress.
#[derive(Debug)]
pub enum Received {
    Message(WireMessage),
    /// The peer closed the stream cleanly before a new frame started.
    Closed,
    /// No frame started within the stream's configured read timeout.
    TimedOut,
}

/// Writes one message as a 4-byte big-endian length prefix followed by the
/// encoded body.
pub fn send_message<S: Write>(stream: &mut S, message: &WireMessage) -> Result<(), FrameError> {
    let body = wire_options()
        .serialize(message)
        .map_err(FrameError::from_encode)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::Oversized);
    }

    let len = body.len() as u32;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(&body)?;
    stream.flush()?;
    Ok(())
}

/// Reads exactly one message. Returns `Closed` on clean end-of-stream before
/// a frame starts and `TimedOut` when the read timeout elapses first; a
/// stream that dies mid-frame is a `Truncated` error.
pub fn receive_message<S: Read>(stream: &mut S) -> Result<Received, FrameError> {
    let mut len_buf = [0u8; 4];
    match read_full(stream, &mut len_buf)? {
        ReadOutcome::CleanClose => return Ok(Received::Closed),
        ReadOutcome::TimedOut => return Ok(Received::TimedOut),
        ReadOutcome::Filled => {}
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_MESSAGE_SIZE {
        return Err(FrameError::BadLength(len));
    }

    let mut body = vec![0u8; len];
    match read_full(stream, &mut body)? {
        ReadOutcome::Filled => {}
        ReadOutcome::CleanClose | ReadOutcome::TimedOut => {
            return Err(FrameError::Truncated {
                expected: len,
                got:      0,
            });
        }
    }

    let message = wire_options().deserialize(&body).map_err(FrameError::Decode)?;
    Ok(Received::Message(message))
}

enum ReadOutcome {
    Filled,
    /// EOF before the first byte of this read.
    CleanClose,
    /// Timeout before the first byte of this read.
    TimedOut,
}

fn read_full<S: Read>(stream: &mut S, buf: &mut [u8]) -> Result<ReadOutcome, FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(ReadOutcome::CleanClose);
                }
                return Err(FrameError::Truncated {
                    expected: buf.len(),
                    got:      filled,
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                if filled == 0 {
                    return Ok(ReadOutcome::TimedOut);
                }
                // Stalled mid-frame: the peer started a frame and stopped.
                return Err(FrameError::Truncated {
                    expected: buf.len(),
                    got:      filled,
                });
            }
            Err(e) => return Err(FrameError::Io(e)),
        }
    }
    Ok(ReadOutcome::Filled)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::protocol::MessageKind;

    fn sample() -> WireMessage {
        WireMessage {
            kind:       MessageKind::Heartbeat,
            request_id: "hb-1".into(),
            payload:    vec![1, 2, 3],
        }
    }

    #[test]
    fn frame_round_trip() {
        let mut wire = Vec::new();
        send_message(&mut wire, &sample()).unwrap();

        // 4-byte big-endian prefix matches the body length.
        let declared = u32::from_be_bytes(wire[..4].try_into().unwrap()) as usize;
        assert_eq!(declared, wire.len() - 4);

        let mut cursor = Cursor::new(wire);
        match receive_message(&mut cursor).unwrap() {
            Received::Message(m) => assert_eq!(m, sample()),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn clean_close_is_not_an_error() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(matches!(
            receive_message(&mut cursor).unwrap(),
            Received::Closed
        ));
    }

    #[test]
    fn oversized_declared_length_rejected_before_decode() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&((MAX_MESSAGE_SIZE as u32) + 1).to_be_bytes());
        // No body bytes at all: the length check must fire first.
        let mut cursor = Cursor::new(wire);
        match receive_message(&mut cursor) {
            Err(FrameError::BadLength(n)) => assert_eq!(n, MAX_MESSAGE_SIZE + 1),
            other => panic!("expected BadLength, got {other:?}"),
        }
    }

    #[test]
    fn zero_length_rejected() {
        let mut cursor = Cursor::new(0u32.to_be_bytes().to_vec());
        assert!(matches!(
            receive_message(&mut cursor),
            Err(FrameError::BadLength(0))
        ));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let mut wire = Vec::new();
        send_message(&mut wire, &sample()).unwrap();
        wire.truncate(wire.len() - 1);
        let mut cursor = Cursor::new(wire);
        assert!(matches!(
            receive_message(&mut cursor),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn oversized_message_rejected_on_send() {
        let huge = WireMessage {
            kind:       MessageKind::ConnectionStats,
            request_id: "big".into(),
            payload:    vec![0u8; MAX_MESSAGE_SIZE + 1],
        };
        let mut wire = Vec::new();
        assert!(matches!(
            send_message(&mut wire, &huge),
            Err(FrameError::Oversized)
        ));
        assert!(wire.is_empty());
    }

    #[test]
    fn garbage_body_is_a_decode_error() {
        let body = vec![0xFFu8; 16];
        let mut wire = Vec::new();
        wire.extend_from_slice(&(body.len() as u32).to_be_bytes());
        wire.extend_from_slice(&body);
        let mut cursor = Cursor::new(wire);
        assert!(matches!(
            receive_message(&mut cursor),
            Err(FrameError::Decode(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn read_timeout_is_reported_as_timed_out() {
        use std::os::unix::net::UnixStream;
        use std::time::Duration;

        let (mut a, _b) = UnixStream::pair().unwrap();
        a.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        assert!(matches!(
            receive_message(&mut a).unwrap(),
            Received::TimedOut
        ));
    }
}
