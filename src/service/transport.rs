//! Chunk-count framed bulk transfer.
//!
//! A message is a text header holding the number of chunks, terminated by
//! `\n`, followed by the payload cut into `chunk_size`-byte pieces. Both ends
//! must agree on `chunk_size` up front; it is a per-channel constant and is
//! never negotiated.
//!
//! The header counts chunks, not bytes, so a short final chunk has no length
//! on the wire. Every payload is a single JSON object, and the receiver reads
//! the final chunk until that object is complete, the chunk is full, or the
//! stream ends.

use crate::common::{AttendanceError, Result};
use serde::de::IgnoredAny;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};

/// Longest accepted header line, terminator included.
const MAX_HEADER_LEN: usize = 32;

/// Largest message a receiver will accept (declared chunks x chunk size).
pub const MAX_MESSAGE_BYTES: usize = 256 * 1024 * 1024;

pub fn chunk_count(payload_len: usize, chunk_size: usize) -> usize {
    payload_len.div_ceil(chunk_size)
}

pub fn send_chunked<W: Write>(writer: &mut W, payload: &[u8], chunk_size: usize) -> Result<()> {
    check_chunk_size(chunk_size)?;

    let num_chunks = chunk_count(payload.len(), chunk_size);
    writer
        .write_all(format!("{}\n", num_chunks).as_bytes())
        .map_err(|e| AttendanceError::Transport(format!("Failed to send chunk header: {}", e)))?;

    for (index, chunk) in payload.chunks(chunk_size).enumerate() {
        writer.write_all(chunk).map_err(|e| {
            AttendanceError::Transport(format!("Failed to send chunk {}/{}: {}", index + 1, num_chunks, e))
        })?;
    }

    writer
        .flush()
        .map_err(|e| AttendanceError::Transport(format!("Failed to flush message: {}", e)))
}

/// Receives one message; the peer closing before a header is an error.
pub fn receive_chunked<R: BufRead>(reader: &mut R, chunk_size: usize) -> Result<Vec<u8>> {
    receive_next_chunked(reader, chunk_size)?.ok_or_else(|| {
        AttendanceError::Transport("Connection closed before a message arrived".into())
    })
}

/// Receives one message, or `None` if the peer closed cleanly between messages.
pub fn receive_next_chunked<R: BufRead>(reader: &mut R, chunk_size: usize) -> Result<Option<Vec<u8>>> {
    check_chunk_size(chunk_size)?;

    let num_chunks = match read_header(reader)? {
        Some(n) => n,
        None => return Ok(None),
    };

    if num_chunks.saturating_mul(chunk_size) > MAX_MESSAGE_BYTES {
        return Err(AttendanceError::Protocol(format!(
            "Message of {} chunks x {} bytes exceeds the {} byte limit",
            num_chunks, chunk_size, MAX_MESSAGE_BYTES
        )));
    }

    let mut payload = Vec::new();
    for index in 0..num_chunks {
        let is_last = index + 1 == num_chunks;
        let received = if is_last {
            read_final_chunk(reader, &mut payload, chunk_size)?
        } else {
            read_chunk(reader, &mut payload, chunk_size)?
        };

        // Every chunk but the last is full-sized on the wire
        if received == 0 || (!is_last && received < chunk_size) {
            return Err(AttendanceError::Protocol(format!(
                "Message truncated: stream ended in chunk {} of {} ({} bytes received)",
                index + 1, num_chunks, payload.len()
            )));
        }
    }

    Ok(Some(payload))
}

fn check_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(AttendanceError::Protocol("Chunk size must be at least 1 byte".into()));
    }
    Ok(())
}

fn read_header<R: BufRead>(reader: &mut R) -> Result<Option<usize>> {
    let mut line = Vec::with_capacity(MAX_HEADER_LEN);
    let read = reader
        .by_ref()
        .take(MAX_HEADER_LEN as u64)
        .read_until(b'\n', &mut line)
        .map_err(|e| AttendanceError::Transport(format!("Failed to read chunk header: {}", e)))?;

    if read == 0 {
        return Ok(None);
    }
    if read == MAX_HEADER_LEN && line.last() != Some(&b'\n') {
        return Err(AttendanceError::Protocol(format!(
            "Chunk header longer than {} bytes", MAX_HEADER_LEN
        )));
    }

    let text = std::str::from_utf8(&line)
        .map_err(|_| AttendanceError::Protocol("Chunk header is not valid text".into()))?
        .trim();

    text.parse::<usize>()
        .map(Some)
        .map_err(|_| AttendanceError::Protocol(format!("Malformed chunk header: {:?}", text)))
}

/// Appends up to `chunk_size` bytes to `buf`, stopping early only at end of stream.
fn read_chunk<R: Read>(reader: &mut R, buf: &mut Vec<u8>, chunk_size: usize) -> Result<usize> {
    let start = buf.len();
    buf.resize(start + chunk_size, 0);

    let mut filled = 0;
    while filled < chunk_size {
        match reader.read(&mut buf[start + filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                buf.truncate(start + filled);
                return Err(AttendanceError::Transport(format!("Failed to read chunk: {}", e)));
            }
        }
    }

    buf.truncate(start + filled);
    Ok(filled)
}

/// Appends the last chunk of a message to `payload`.
///
/// Keeps reading while `payload` is an unfinished JSON object and consumes
/// nothing past its closing brace, so a following message stays in the
/// reader. A payload that is not JSON ends the chunk after one read.
fn read_final_chunk<R: BufRead>(reader: &mut R, payload: &mut Vec<u8>, chunk_size: usize) -> Result<usize> {
    let start = payload.len();
    let mut unfinished = false;

    while payload.len() - start < chunk_size {
        let available = match reader.fill_buf() {
            Ok(available) => available,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(AttendanceError::Transport(format!("Failed to read chunk: {}", e)));
            }
        };
        if available.is_empty() {
            if unfinished {
                return Err(AttendanceError::Protocol(format!(
                    "Message truncated: stream ended inside the final chunk ({} bytes received)",
                    payload.len()
                )));
            }
            break;
        }

        let taken = available.len().min(chunk_size - (payload.len() - start));
        payload.extend_from_slice(&available[..taken]);

        match json_progress(&payload[..]) {
            JsonProgress::Partial => {
                unfinished = true;
                reader.consume(taken);
            }
            JsonProgress::Complete(end) if end > start => {
                // Bytes past the object belong to the next message
                reader.consume(taken - (payload.len() - end));
                payload.truncate(end);
                break;
            }
            JsonProgress::Complete(_) | JsonProgress::NotJson => {
                reader.consume(taken);
                break;
            }
        }
    }

    Ok(payload.len() - start)
}

enum JsonProgress {
    Partial,
    /// Byte offset just past the closing brace.
    Complete(usize),
    NotJson,
}

fn json_progress(bytes: &[u8]) -> JsonProgress {
    match bytes.iter().find(|b| !b.is_ascii_whitespace()) {
        None => return JsonProgress::Partial,
        Some(b'{') => {}
        Some(_) => return JsonProgress::NotJson,
    }

    let mut values = serde_json::Deserializer::from_slice(bytes).into_iter::<IgnoredAny>();
    match values.next() {
        Some(Ok(_)) => JsonProgress::Complete(values.byte_offset()),
        Some(Err(e)) if e.is_eof() => JsonProgress::Partial,
        Some(Err(_)) => JsonProgress::NotJson,
        None => JsonProgress::Partial,
    }
}

/// Outbound half of a channel, one framed message per call.
pub trait MessageSink {
    fn send_message(&mut self, payload: &[u8]) -> Result<()>;
}

/// One TCP connection carrying chunked messages with a fixed chunk size.
pub struct ChunkedChannel {
    name: &'static str,
    stream: BufReader<TcpStream>,
    chunk_size: usize,
}

impl ChunkedChannel {
    pub fn connect(name: &'static str, host: &str, port: u16, chunk_size: usize) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).map_err(|e| {
            AttendanceError::Transport(format!(
                "Failed to connect {} channel to {}:{}: {}", name, host, port, e
            ))
        })?;
        tracing::debug!("Connected {} channel to {}:{}", name, host, port);
        Ok(Self::from_stream(name, stream, chunk_size))
    }

    pub fn from_stream(name: &'static str, stream: TcpStream, chunk_size: usize) -> Self {
        Self {
            name,
            stream: BufReader::new(stream),
            chunk_size,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.get_ref().peer_addr().ok()
    }

    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        send_chunked(self.stream.get_mut(), payload, self.chunk_size)
            .map_err(|e| self.on_channel(e))
    }

    pub fn receive(&mut self) -> Result<Vec<u8>> {
        receive_chunked(&mut self.stream, self.chunk_size)
            .map_err(|e| self.on_channel(e))
    }

    pub fn receive_next(&mut self) -> Result<Option<Vec<u8>>> {
        receive_next_chunked(&mut self.stream, self.chunk_size)
            .map_err(|e| self.on_channel(e))
    }

    pub fn close(self) {
        match self.stream.get_ref().shutdown(Shutdown::Both) {
            Ok(()) => tracing::debug!("Closed {} channel", self.name),
            // Already gone on the peer side
            Err(e) if e.kind() == ErrorKind::NotConnected => {}
            Err(e) => tracing::warn!("Failed to shut down {} channel: {}", self.name, e),
        }
    }

    fn on_channel(&self, error: AttendanceError) -> AttendanceError {
        match error {
            AttendanceError::Transport(msg) => {
                AttendanceError::Transport(format!("{} channel: {}", self.name, msg))
            }
            AttendanceError::Protocol(msg) => {
                AttendanceError::Protocol(format!("{} channel: {}", self.name, msg))
            }
            other => other,
        }
    }
}

impl MessageSink for ChunkedChannel {
    fn send_message(&mut self, payload: &[u8]) -> Result<()> {
        self.send(payload)
    }
}
