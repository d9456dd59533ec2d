// ABOUTME: Parser for the container engine's multiplexed stdout/stderr log channel
// ABOUTME: Splits 8-byte-header frames out of arbitrarily chunked bytes into timestamped entries

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::providers::ProviderError;

/// Size of the frame header: stream byte, three reserved bytes, big-endian length
pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    /// Stream type byte as it appears on the wire
    pub fn wire_byte(&self) -> u8 {
        match self {
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }

    fn from_wire_byte(byte: u8) -> Self {
        // Anything that is not stdout is attributed to stderr
        if byte == 1 {
            Self::Stdout
        } else {
            Self::Stderr
        }
    }
}

impl FromStr for LogStream {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            other => Err(format!("unknown log stream: {}", other)),
        }
    }
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded line of container output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub message: String,
}

/// Encode a payload as one wire frame
pub fn encode_frame(stream: LogStream, payload: &[u8]) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_u8(stream.wire_byte());
    frame.put_bytes(0, 3);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(payload);
    frame.to_vec()
}

/// Incremental demultiplexer for a single log stream.
///
/// Frames may be split across any number of chunks; bytes are held until the
/// whole frame has arrived.
#[derive(Debug)]
pub struct LogDemuxer {
    buffer: BytesMut,
    timestamps: bool,
}

impl LogDemuxer {
    pub fn new(timestamps: bool) -> Self {
        Self {
            buffer: BytesMut::new(),
            timestamps,
        }
    }

    /// Append a chunk and return every entry completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<LogEntry> {
        self.buffer.extend_from_slice(chunk);

        let mut entries = Vec::new();
        while self.buffer.len() >= FRAME_HEADER_LEN {
            let stream = LogStream::from_wire_byte(self.buffer[0]);
            let payload_len = u32::from_be_bytes([
                self.buffer[4],
                self.buffer[5],
                self.buffer[6],
                self.buffer[7],
            ]) as usize;
            let frame_len = FRAME_HEADER_LEN + payload_len;

            if self.buffer.len() < frame_len {
                break;
            }

            self.buffer.advance(FRAME_HEADER_LEN);
            let payload = self.buffer.split_to(payload_len);

            if let Some(entry) = self.decode_payload(stream, &payload) {
                entries.push(entry);
            }
        }

        entries
    }

    /// Number of bytes still waiting for the rest of their frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// End of stream. Returns the size of any incomplete trailing frame.
    pub fn finish(self) -> usize {
        let leftover = self.buffer.len();
        if leftover > 0 {
            warn!(
                "Log stream ended with {} bytes of an incomplete frame",
                leftover
            );
        }
        leftover
    }

    fn decode_payload(&self, stream: LogStream, payload: &[u8]) -> Option<LogEntry> {
        let text = String::from_utf8_lossy(payload);

        let (timestamp, message) = if self.timestamps {
            split_timestamp(&text)
        } else {
            (Utc::now(), text.as_ref())
        };

        let message = message.trim_end();
        if message.is_empty() {
            return None;
        }

        Some(LogEntry {
            timestamp,
            stream,
            message: message.to_string(),
        })
    }
}

/// Split `<rfc3339> <line>`; falls back to wall-clock time and the whole payload
fn split_timestamp(text: &str) -> (DateTime<Utc>, &str) {
    if let Some((token, rest)) = text.split_once(' ') {
        if let Ok(ts) = DateTime::parse_from_rfc3339(token) {
            return (ts.with_timezone(&Utc), rest);
        }
    }
    (Utc::now(), text)
}

/// Adapt a raw chunk stream into a stream of decoded entries
pub fn demux_stream(
    raw: BoxStream<'static, Result<Bytes, ProviderError>>,
    timestamps: bool,
) -> BoxStream<'static, Result<LogEntry, ProviderError>> {
    let stream = async_stream::stream! {
        let mut demuxer = LogDemuxer::new(timestamps);
        let mut raw = raw;

        while let Some(chunk) = raw.next().await {
            match chunk {
                Ok(bytes) => {
                    for entry in demuxer.push(&bytes) {
                        yield Ok(entry);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }

        demuxer.finish();
    };

    stream.boxed()
}
