//! Demultiplexer for the daemon's non-TTY log wire format.
//!
//! Each frame is an 8-byte header (stream type, three padding bytes, a
//! big-endian u32 payload length) followed by the payload. Daemon writes do
//! not align with frame boundaries, so bytes are accumulated and frames are
//! peeled off as they complete.

use crate::events::LogStream;

const HEADER_LEN: usize = 8;
const STDERR_STREAM: u8 = 2;

enum FrameParse {
    /// The buffer does not yet hold a complete header or payload.
    NeedMore,
    /// The header bytes cannot be a frame header (non-zero padding); the
    /// stream is not framed where we expected it to be.
    Malformed,
    Frame {
        stream: LogStream,
        text: String,
        consumed: usize,
    },
}

fn parse_frame(buffer: &[u8]) -> FrameParse {
    if buffer.len() < HEADER_LEN {
        return FrameParse::NeedMore;
    }
    if buffer[1..4] != [0, 0, 0] {
        return FrameParse::Malformed;
    }
    let length = u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize;
    if buffer.len() < HEADER_LEN + length {
        return FrameParse::NeedMore;
    }
    let stream = if buffer[0] == STDERR_STREAM {
        LogStream::Stderr
    } else {
        LogStream::Stdout
    };
    let text = String::from_utf8_lossy(&buffer[HEADER_LEN..HEADER_LEN + length]).into_owned();
    FrameParse::Frame {
        stream,
        text,
        consumed: HEADER_LEN + length,
    }
}

/// Incremental frame decoder. Feed it raw chunks as they arrive and it
/// yields every complete `(stream, text)` frame.
#[derive(Debug, Default)]
pub struct StreamDemuxer {
    buffer: Vec<u8>,
}

impl StreamDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorbs one chunk and returns all frames completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<(LogStream, String)> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            match parse_frame(&self.buffer) {
                FrameParse::NeedMore => break,
                FrameParse::Malformed => {
                    // Unframed data: surface everything buffered as stdout
                    // and start over with the next chunk.
                    frames.push((
                        LogStream::Stdout,
                        String::from_utf8_lossy(&self.buffer).into_owned(),
                    ));
                    self.buffer.clear();
                }
                FrameParse::Frame {
                    stream,
                    text,
                    consumed,
                } => {
                    frames.push((stream, text));
                    self.buffer.drain(..consumed);
                }
            }
        }
        frames
    }

    /// Flushes whatever is left once the underlying stream has ended. A
    /// trailing partial frame is surfaced as a final stdout message.
    pub fn finish(self) -> Option<(LogStream, String)> {
        if self.buffer.is_empty() {
            None
        } else {
            Some((
                LogStream::Stdout,
                String::from_utf8_lossy(&self.buffer).into_owned(),
            ))
        }
    }
}
