//! Length-prefixed frame codec for non-blocking sockets.
//!
//! Wire format: an 8-byte header (payload length then sequence index, both
//! u32 little-endian) followed by exactly `length` payload bytes. No
//! delimiter, no terminator.
//!
//! Both directions tolerate partial I/O. [`send_frame`] retries short writes
//! within the call and, when the socket blocks mid-frame, reports the byte
//! offset reached so the caller can resume the same frame later.
//! [`recv_frame`] advances a caller-owned [`RecvCursor`] through the header
//! and payload phases; the cursor survives a would-block outcome, so a frame
//! split across any number of reads reassembles exactly. The declared length
//! is untrusted input: payload bytes beyond `capacity` are consumed but not
//! stored, which keeps the stream aligned on the next header.

use bytes::Bytes;
use std::io::{self, IoSlice, Read, Write};

/// Size of the on-wire frame header.
pub const HEADER_LEN: usize = 8;

/// Outcome of a send attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum SendStatus {
    /// The whole frame is on the wire.
    Complete,
    /// The socket blocked; `written` is the frame offset reached so far and
    /// must be passed back in to resume this frame.
    Blocked { written: usize },
}

/// Outcome of a receive attempt.
#[derive(Debug)]
pub enum RecvStatus {
    /// A full frame was decoded.
    Complete(Frame),
    /// The socket blocked; the cursor holds everything accumulated so far.
    Blocked,
    /// Orderly close by the peer.
    Terminated,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u32,
    pub payload: Bytes,
    /// Length the header claimed, before any clamping.
    pub declared: usize,
}

impl Frame {
    /// True when the declared length exceeded the receive capacity and the
    /// payload was truncated.
    pub fn clamped(&self) -> bool {
        self.payload.len() < self.declared
    }
}

pub fn encode_header(len: u32, seq: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&len.to_le_bytes());
    header[4..].copy_from_slice(&seq.to_le_bytes());
    header
}

/// Write one frame, resuming from `offset` bytes into the frame.
///
/// Header and payload go out as a single vectored write where possible.
/// Short writes are retried immediately; a would-block after partial
/// progress returns [`SendStatus::Blocked`] with the new offset rather than
/// abandoning the frame mid-stream.
pub fn send_frame<W: Write>(
    writer: &mut W,
    payload: &[u8],
    seq: u32,
    offset: usize,
) -> io::Result<SendStatus> {
    let header = encode_header(payload.len() as u32, seq);
    let total = HEADER_LEN + payload.len();
    let mut written = offset;

    while written < total {
        let result = if written < HEADER_LEN {
            writer.write_vectored(&[IoSlice::new(&header[written..]), IoSlice::new(payload)])
        } else {
            writer.write(&payload[written - HEADER_LEN..])
        };

        match result {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket write returned 0",
                ))
            }
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(SendStatus::Blocked { written })
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(SendStatus::Complete)
}

/// Decode progress for one in-flight frame.
///
/// Connection-scoped: the cursor must live as long as the connection and is
/// only reset internally when a frame completes.
#[derive(Debug, Default)]
pub struct RecvCursor {
    header: [u8; HEADER_LEN],
    header_filled: usize,
    body: Option<Body>,
}

#[derive(Debug)]
struct Body {
    seq: u32,
    /// Payload length the header declared.
    declared: usize,
    /// Stored payload, at most `capacity` bytes.
    payload: Vec<u8>,
    /// Payload bytes consumed from the stream, up to `declared`.
    filled: usize,
}

impl RecvCursor {
    /// Reset for the next header and hand back the completed frame.
    fn finish(&mut self, body: Body) -> Frame {
        self.header_filled = 0;
        Frame {
            seq: body.seq,
            payload: Bytes::from(body.payload),
            declared: body.declared,
        }
    }
}

/// Advance the cursor with non-blocking reads until a frame completes, the
/// socket blocks, the peer closes, or an error occurs.
pub fn recv_frame<R: Read>(
    reader: &mut R,
    capacity: usize,
    cursor: &mut RecvCursor,
) -> io::Result<RecvStatus> {
    loop {
        // completion check up front: covers zero-length payloads and fills
        // finished on a previous call
        if let Some(body) = cursor.body.take_if(|b| b.filled == b.declared) {
            return Ok(RecvStatus::Complete(cursor.finish(body)));
        }

        match &mut cursor.body {
            None => {
                match reader.read(&mut cursor.header[cursor.header_filled..]) {
                    Ok(0) => return Ok(RecvStatus::Terminated),
                    Ok(n) => cursor.header_filled += n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(RecvStatus::Blocked)
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }

                if cursor.header_filled == HEADER_LEN {
                    let h = &cursor.header;
                    let declared = u32::from_le_bytes([h[0], h[1], h[2], h[3]]) as usize;
                    let seq = u32::from_le_bytes([h[4], h[5], h[6], h[7]]);
                    cursor.body = Some(Body {
                        seq,
                        declared,
                        payload: vec![0u8; declared.min(capacity)],
                        filled: 0,
                    });
                }
            }
            Some(body) => {
                let result = if body.filled < body.payload.len() {
                    reader.read(&mut body.payload[body.filled..])
                } else {
                    // past the clamp point: drain the excess without storing it
                    let mut scratch = [0u8; 256];
                    let want = (body.declared - body.filled).min(scratch.len());
                    reader.read(&mut scratch[..want])
                };

                match result {
                    Ok(0) => return Ok(RecvStatus::Terminated),
                    Ok(n) => body.filled += n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(RecvStatus::Blocked)
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        }
    }
}
