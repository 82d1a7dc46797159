//! Line framing over the session's byte stream.
//!
//! [`TextStream`] wraps the connection in a buffered reader and hands out
//! CRLF-terminated command lines (bare LF tolerated), enforcing the
//! configured line-length bound incrementally and arming an idle deadline
//! around every read and write. In DATA mode a [`BodyReader`] reads the
//! dot-stuffed payload as a bounded, one-shot stream of lines.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;

use super::reply::Reply;

/// Byte stream a session runs over. Blanket-implemented for anything the
/// engine can read and write asynchronously, so plain TCP streams, TLS
/// streams and in-memory duplex pipes all qualify.
pub trait SessionStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SessionStream for T {}

/// Owned, type-erased session stream, as handed to the STARTTLS upgrade
/// callback and back.
pub type SessionIo = Box<dyn SessionStream>;

fn idle_expired() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "session idle deadline expired")
}

fn line_too_long() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "maximum line length exceeded")
}

/// Request/response sequencer over the session stream.
///
/// Each read request is assigned a monotonically increasing id; the reply
/// for a request must be sent under the same id. Within one session only a
/// single request is ever outstanding, so the ids are a sequencing
/// discipline rather than a queue — kept because the STARTTLS re-wrap
/// tears this framer down and builds a fresh one mid-session.
pub struct TextStream {
    reader: BufReader<SessionIo>,
    next_id: u64,
    outstanding: Option<u64>,
    max_line_length: Option<usize>,
    max_idle: Option<Duration>,
}

impl TextStream {
    /// Wraps `io` with the given framing limits.
    pub fn new(io: SessionIo, max_line_length: Option<usize>, max_idle: Option<Duration>) -> Self {
        TextStream {
            reader: BufReader::new(io),
            next_id: 0,
            outstanding: None,
            max_line_length,
            max_idle,
        }
    }

    /// Placeholder stream held while the embedder owns the raw connection
    /// during a STARTTLS handshake. Reads EOF, writes go nowhere.
    pub(crate) fn detached() -> Self {
        let io: SessionIo = Box::new(tokio::io::join(tokio::io::empty(), tokio::io::sink()));
        TextStream::new(io, None, None)
    }

    /// Tears the buffers off and returns the raw stream.
    ///
    /// Any unconsumed read buffer is discarded, which is what RFC 3207
    /// requires of a server entering the TLS handshake.
    pub fn into_inner(self) -> SessionIo {
        self.reader.into_inner()
    }

    /// Allocates the id for the next read request.
    pub fn begin_request(&mut self) -> u64 {
        self.next_id += 1;
        self.outstanding = Some(self.next_id);
        self.next_id
    }

    /// Reads one command line, returning it with its request id. The line
    /// terminator is stripped.
    pub async fn read_line(&mut self) -> io::Result<(u64, String)> {
        let id = self.begin_request();
        let line = self.read_line_guarded().await?;
        Ok((id, line))
    }

    /// Reads one raw line inside an already-open request (the DATA body
    /// path, where many lines belong to a single request id).
    pub(crate) async fn read_data_line(&mut self) -> io::Result<String> {
        self.read_line_guarded().await
    }

    async fn read_line_guarded(&mut self) -> io::Result<String> {
        match self.max_idle {
            Some(deadline) => timeout(deadline, self.read_line_raw())
                .await
                .map_err(|_| idle_expired())?,
            None => self.read_line_raw().await,
        }
    }

    async fn read_line_raw(&mut self) -> io::Result<String> {
        let mut line: Vec<u8> = Vec::new();
        loop {
            let (consumed, complete) = {
                let chunk = self.reader.fill_buf().await?;
                if chunk.is_empty() {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                match chunk.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        line.extend_from_slice(&chunk[..pos]);
                        (pos + 1, true)
                    }
                    None => {
                        line.extend_from_slice(chunk);
                        (chunk.len(), false)
                    }
                }
            };
            self.reader.consume(consumed);
            if complete {
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.check_length(line.len())?;
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            // Partial line: enforce the bound before buffering more, so a
            // peer cannot grow the line without limit.
            self.check_length(line.len())?;
        }
    }

    fn check_length(&self, len: usize) -> io::Result<()> {
        match self.max_line_length {
            Some(max) if len > max => Err(line_too_long()),
            _ => Ok(()),
        }
    }

    /// Writes a reply and flushes it, without an associated request id
    /// (used for the greeting).
    pub async fn send(&mut self, reply: &Reply) -> io::Result<()> {
        let deadline = self.max_idle;
        let io = self.reader.get_mut();
        let write = async move {
            reply.write_to(io).await?;
            io.flush().await
        };
        match deadline {
            Some(d) => timeout(d, write).await.map_err(|_| idle_expired())?,
            None => write.await,
        }
    }

    /// Writes and flushes the reply for request `id`, closing the request.
    pub async fn send_reply(&mut self, id: u64, reply: &Reply) -> io::Result<()> {
        debug_assert_eq!(
            self.outstanding,
            Some(id),
            "reply sequenced against a request that is not outstanding"
        );
        let result = self.send(reply).await;
        self.outstanding = None;
        result
    }
}

/// One-shot reader over a dot-stuffed DATA payload.
///
/// Yields the payload line by line with the stuffing dot removed, until the
/// lone `.` sentinel. Once `limit` bytes have been yielded the reader
/// truncates: remaining payload is consumed off the wire but no longer
/// returned. The engine calls [`drain`](BodyReader::drain) after the
/// handler returns so the sentinel is always consumed.
pub struct BodyReader<'a> {
    stream: &'a mut TextStream,
    limit: Option<u64>,
    taken: u64,
    finished: bool,
}

impl<'a> BodyReader<'a> {
    pub(crate) fn new(stream: &'a mut TextStream, limit: Option<u64>) -> Self {
        BodyReader {
            stream,
            limit,
            taken: 0,
            finished: false,
        }
    }

    /// Returns the next body line, or `None` once the terminating `.` has
    /// been read (or the size bound has been reached).
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        while !self.finished {
            let line = self.stream.read_data_line().await?;
            if line == "." {
                self.finished = true;
                break;
            }
            let line = match line.strip_prefix('.') {
                Some(unstuffed) => unstuffed.to_string(),
                None => line,
            };
            if let Some(limit) = self.limit {
                if self.taken >= limit {
                    // Over budget: keep consuming up to the sentinel, but
                    // hand nothing more to the caller.
                    continue;
                }
            }
            self.taken += line.len() as u64 + 2;
            return Ok(Some(line));
        }
        Ok(None)
    }

    /// Reads the remainder of the body into one string, lines joined with
    /// `\n`.
    pub async fn read_to_string(&mut self) -> io::Result<String> {
        let mut lines = Vec::new();
        while let Some(line) = self.next_line().await? {
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }

    /// Consumes whatever the handler left unread, up to and including the
    /// sentinel.
    pub(crate) async fn drain(&mut self) -> io::Result<()> {
        while !self.finished {
            if self.stream.read_data_line().await? == "." {
                self.finished = true;
            }
        }
        Ok(())
    }
}
