//! Session states for an ESMTP conversation.
//!
//! The protocol engine transitions between these states based on the
//! commands received; see the dispatch logic in [`super::protocol`].

use std::fmt;

/// Represents the possible states during an ESMTP session.
///
/// The AUTH variants carry no payload; they only distinguish what the next
/// line from the client means (a PLAIN blob, a LOGIN username, a LOGIN
/// password, or a CRAM-MD5 response).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum State {
    /// Connection accepted, greeting not yet sent.
    Invalid,
    /// Greeting sent. Client should send HELO/EHLO (or STARTTLS).
    Establish,
    /// `AUTH PLAIN` received without an initial response; the next line is
    /// the base64 credentials blob.
    AuthPlain,
    /// `AUTH LOGIN` received; the next line is the base64 username.
    AuthLogin,
    /// Username consumed; the next line is the base64 password.
    AuthLogin2,
    /// CRAM-MD5 challenge sent; the next line is the client digest.
    AuthCramMd5,
    /// Ready for a mail transaction. Client should send MAIL FROM.
    Mail,
    /// Envelope sender accepted. Client sends RCPT TO, more RCPT TO, or DATA.
    Rcpt,
    /// `354` sent; the line framer switches to the dot-stuffed body stream.
    Data,
    /// Session over; the driver closes the connection after flushing.
    Done,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Invalid => "INVALID",
            State::Establish => "ESTABLISH",
            State::AuthPlain => "AUTHPLAIN",
            State::AuthLogin => "AUTHLOGIN",
            State::AuthLogin2 => "AUTHLOGIN2",
            State::AuthCramMd5 => "AUTHCRAMMD5",
            State::Mail => "MAIL",
            State::Rcpt => "RCPT",
            State::Data => "DATA",
            State::Done => "DONE",
        };
        f.write_str(name)
    }
}
