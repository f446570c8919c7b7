//! Framed JSON message channels.
//!
//! Two framings are supported:
//!
//! - [`Framing::LengthPrefixed`]: `[4-byte length (little-endian)][json bytes]`,
//!   used on the client socket.
//! - [`Framing::Lines`]: one compact JSON document per line, used on plugin
//!   host stdio so hosts can be written in anything that prints a line.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::trace;

/// Largest frame either side will accept.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    LengthPrefixed,
    Lines,
}

/// Reading half of a framed channel.
pub struct FramedReader<R> {
    reader: BufReader<R>,
    framing: Framing,
    max_frame_len: usize,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(reader: R, framing: Framing) -> Self {
        Self {
            reader: BufReader::new(reader),
            framing,
            max_frame_len: MAX_FRAME_LEN,
            line: Vec::new(),
        }
    }

    /// Lower the frame size limit for this reader.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len.min(MAX_FRAME_LEN);
        self
    }

    pub fn length_prefixed(reader: R) -> Self {
        Self::new(reader, Framing::LengthPrefixed)
    }

    pub fn lines(reader: R) -> Self {
        Self::new(reader, Framing::Lines)
    }

    /// Read the next message. `Ok(None)` means the peer closed the channel
    /// cleanly between frames.
    ///
    /// A frame that is not valid JSON for `T`, or that is larger than the
    /// limit, yields an [`io::ErrorKind::InvalidData`] error. The frame has
    /// been consumed either way, so the caller may keep reading. Oversized
    /// frames are discarded without being buffered.
    pub async fn next<T: DeserializeOwned>(&mut self) -> io::Result<Option<T>> {
        match self.framing {
            Framing::LengthPrefixed => {
                let mut len_buf = [0u8; 4];
                match self.reader.read_exact(&mut len_buf).await {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                    Err(e) => return Err(e),
                }
                let len = read_length(&len_buf);
                if len > self.max_frame_len {
                    let skipped = tokio::io::copy(
                        &mut (&mut self.reader).take(len as u64),
                        &mut tokio::io::sink(),
                    )
                    .await?;
                    if skipped < len as u64 {
                        return Err(io::ErrorKind::UnexpectedEof.into());
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("frame of {len} bytes exceeds limit"),
                    ));
                }
                trace!("Reading frame of {} bytes", len);
                let mut buf = vec![0u8; len];
                self.reader.read_exact(&mut buf).await?;
                serde_json::from_slice(&buf)
                    .map(Some)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            }
            Framing::Lines => loop {
                let Some(oversized) = self.read_line_bounded().await? else {
                    return Ok(None);
                };
                if oversized {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "line exceeds frame limit",
                    ));
                }
                let line = std::str::from_utf8(&self.line)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
                    .trim();
                if line.is_empty() {
                    continue;
                }
                trace!(line = %line, "Read line frame");
                return serde_json::from_str(line)
                    .map(Some)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
            },
        }
    }

    /// Read up to and including the next newline into `self.line`, keeping
    /// at most `max_frame_len` bytes. Returns `None` at end of input and
    /// `Some(true)` when the line was too long and has been dropped.
    async fn read_line_bounded(&mut self) -> io::Result<Option<bool>> {
        self.line.clear();
        let mut read_any = false;
        let mut oversized = false;
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                break;
            }
            read_any = true;
            let (used, done) = match available.iter().position(|b| *b == b'\n') {
                Some(i) => (i + 1, true),
                None => (available.len(), false),
            };
            if !oversized && self.line.len() + used <= self.max_frame_len {
                self.line.extend_from_slice(&available[..used]);
            } else {
                oversized = true;
                self.line.clear();
            }
            self.reader.consume(used);
            if done {
                break;
            }
        }
        Ok(read_any.then_some(oversized))
    }
}

/// Writing half of a framed channel.
pub struct FramedWriter<W> {
    writer: W,
    framing: Framing,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    pub fn new(writer: W, framing: Framing) -> Self {
        Self { writer, framing }
    }

    pub fn length_prefixed(writer: W) -> Self {
        Self::new(writer, Framing::LengthPrefixed)
    }

    pub fn lines(writer: W) -> Self {
        Self::new(writer, Framing::Lines)
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> io::Result<()> {
        let bytes = encode(message, self.framing)?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await
    }

    /// Release the underlying writer, e.g. to close a child's stdin.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Encode one message with the given framing.
pub fn encode<T: Serialize>(message: &T, framing: Framing) -> io::Result<Vec<u8>> {
    let json = serde_json::to_vec(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if json.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", json.len()),
        ));
    }
    Ok(match framing {
        Framing::LengthPrefixed => {
            let len = json.len() as u32;
            let mut result = Vec::with_capacity(4 + json.len());
            result.extend_from_slice(&len.to_le_bytes());
            result.extend_from_slice(&json);
            result
        }
        Framing::Lines => {
            let mut result = json;
            result.push(b'\n');
            result
        }
    })
}

/// Read length prefix from buffer
pub fn read_length(buf: &[u8; 4]) -> usize {
    u32::from_le_bytes(*buf) as usize
}
