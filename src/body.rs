//! Reading response bodies off the proxy connection.
//!
//! Bodies of challenge responses are discarded so the connection can carry
//! the next attempt; bodies of final refusals are collected so they survive
//! the connection being closed.

use bytes::{Bytes, BytesMut};
use tokio::io::{self, AsyncRead};
use tracing::trace;

use crate::{parse::BodyFraming, util::Prebuffered};

/// Destination for body bytes.
#[derive(Debug)]
pub(crate) struct BodySink {
    collected: Option<BytesMut>,
    limit: usize,
    total: u64,
    truncated: bool,
}

impl BodySink {
    pub(crate) fn discard() -> Self {
        Self {
            collected: None,
            limit: 0,
            total: 0,
            truncated: false,
        }
    }

    /// Keeps at most `limit` bytes, counting and dropping the rest.
    pub(crate) fn collect(limit: usize) -> Self {
        Self {
            collected: Some(BytesMut::new()),
            limit,
            total: 0,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        if let Some(buf) = self.collected.as_mut() {
            let room = self.limit.saturating_sub(buf.len());
            if chunk.len() > room {
                self.truncated = true;
            }
            buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
    }

    /// Whether reading further cannot add anything to the result.
    fn saturated(&self) -> bool {
        self.collected.is_some() && self.truncated
    }

    pub(crate) fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub(crate) fn total(&self) -> u64 {
        self.total
    }

    pub(crate) fn into_bytes(self) -> Bytes {
        self.collected.map(BytesMut::freeze).unwrap_or_default()
    }
}

/// Reads a response body framed as `framing` from `reader` into `sink`.
///
/// For [`BodyFraming::UntilClose`] and [`BodyFraming::Invalid`] this reads
/// until end of stream. Reading stops early once a collecting sink is full,
/// leaving the connection unusable for further requests.
pub(crate) async fn read_body<S: AsyncRead + Unpin>(
    reader: &mut Prebuffered<S>,
    framing: BodyFraming,
    sink: &mut BodySink,
) -> io::Result<()> {
    match framing {
        BodyFraming::Empty => {}
        BodyFraming::ContentLength(len) => copy_exact(reader, len, sink).await?,
        BodyFraming::Chunked => read_chunked(reader, sink).await?,
        BodyFraming::UntilClose | BodyFraming::Invalid => read_to_close(reader, sink).await?,
    }
    trace!(?framing, bytes = sink.total(), "read response body");
    Ok(())
}

async fn fill<S: AsyncRead + Unpin>(reader: &mut Prebuffered<S>) -> io::Result<()> {
    if reader.buffer_more().await? == 0 {
        return Err(if reader.is_full() {
            io::Error::new(io::ErrorKind::InvalidData, "line exceeds buffer size")
        } else {
            io::ErrorKind::UnexpectedEof.into()
        });
    }
    Ok(())
}

async fn copy_exact<S: AsyncRead + Unpin>(
    reader: &mut Prebuffered<S>,
    len: u64,
    sink: &mut BodySink,
) -> io::Result<()> {
    let mut remaining = len;
    while remaining > 0 && !sink.saturated() {
        if reader.buffer().is_empty() {
            fill(reader).await?;
        }
        let n = reader.buffer().len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        sink.push(&reader.split_to(n));
        remaining -= n as u64;
    }
    Ok(())
}

/// Reads one CRLF (or bare LF) terminated line, without the terminator.
async fn read_line<S: AsyncRead + Unpin>(reader: &mut Prebuffered<S>) -> io::Result<Bytes> {
    loop {
        if let Some(pos) = reader.buffer().iter().position(|&b| b == b'\n') {
            let line = reader.split_to(pos + 1);
            let end = if line.ends_with(b"\r\n") { pos - 1 } else { pos };
            return Ok(line.slice(..end));
        }
        fill(reader).await?;
    }
}

/// Parses a chunk size line given without its terminator.
fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let mut terminated = Vec::with_capacity(line.len() + 2);
    terminated.extend_from_slice(line);
    terminated.extend_from_slice(b"\r\n");
    match httparse::parse_chunk_size(&terminated) {
        Ok(httparse::Status::Complete((len, size))) if len == terminated.len() => Ok(size),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid chunk size line",
        )),
    }
}

async fn read_chunked<S: AsyncRead + Unpin>(
    reader: &mut Prebuffered<S>,
    sink: &mut BodySink,
) -> io::Result<()> {
    loop {
        let size = parse_chunk_size(&read_line(reader).await?)?;
        if size == 0 {
            break;
        }
        copy_exact(reader, size, sink).await?;
        if sink.saturated() {
            return Ok(());
        }
        if !read_line(reader).await?.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "missing CRLF after chunk data",
            ));
        }
    }
    // trailer section
    while !read_line(reader).await?.is_empty() {}
    Ok(())
}

async fn read_to_close<S: AsyncRead + Unpin>(
    reader: &mut Prebuffered<S>,
    sink: &mut BodySink,
) -> io::Result<()> {
    loop {
        if !reader.buffer().is_empty() {
            let n = reader.buffer().len();
            sink.push(&reader.split_to(n));
        }
        if sink.saturated() || reader.buffer_more().await? == 0 {
            return Ok(());
        }
    }
}
