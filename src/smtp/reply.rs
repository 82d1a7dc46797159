//! SMTP reply formatting.
//!
//! A [`Reply`] is a status code plus one or more text lines, written to the
//! peer using the RFC 5321 §4.2 continuation grammar: every line but the
//! last is joined to the code with `-`, the last with a space.

use std::fmt;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::handler::TlsUpgrader;

/// A multi-line SMTP response.
pub struct Reply {
    /// Status code in 100..599.
    pub status: u16,
    /// Response text, one entry per wire line.
    pub lines: Vec<String>,
    /// Post-flush hook carrying the STARTTLS upgrade. The session driver
    /// runs it after the reply has been written and flushed, handing it the
    /// raw byte stream. `None` for every reply except `220 Ready to start
    /// TLS`.
    pub upgrade: Option<TlsUpgrader>,
}

impl Reply {
    /// Creates a multi-line reply.
    pub fn new(status: u16, lines: Vec<String>) -> Self {
        Reply {
            status,
            lines,
            upgrade: None,
        }
    }

    /// Creates a single-line reply.
    pub fn single(status: u16, line: impl Into<String>) -> Self {
        Reply::new(status, vec![line.into()])
    }

    /// Writes the reply to `writer` and returns the number of bytes written.
    ///
    /// Writes are not buffered here; the caller flushes after this returns
    /// and only then runs the [`upgrade`](Reply::upgrade) hook.
    pub async fn write_to<W>(&self, writer: &mut W) -> std::io::Result<usize>
    where
        W: AsyncWrite + Unpin,
    {
        if self.lines.is_empty() {
            // Degenerate fallback; never produced by the engine itself.
            let text = format!("{}\n", self.status);
            writer.write_all(text.as_bytes()).await?;
            return Ok(text.len());
        }

        let mut wrote = 0;
        let mut lines = self.lines.iter().peekable();
        while let Some(line) = lines.next() {
            let sep = if lines.peek().is_none() { ' ' } else { '-' };
            let text = format!("{}{}{}\r\n", self.status, sep, line);
            writer.write_all(text.as_bytes()).await?;
            wrote += text.len();
        }
        Ok(wrote)
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("status", &self.status)
            .field("lines", &self.lines)
            .field("upgrade", &self.upgrade.is_some())
            .finish()
    }
}
