//! Suratan — an embeddable server-side ESMTP protocol engine.
//!
//! The heart of the crate is [`smtp::Protocol`]: a per-connection state
//! machine that consumes a line-oriented byte stream from a mail client
//! and produces SMTP replies, delivering each completed envelope and body
//! to a pluggable [`smtp::Handler`]. It implements the subset of RFC 5321
//! and RFC 4954 needed to accept mail — HELO/EHLO, STARTTLS negotiation
//! (the cryptographic upgrade is delegated to the embedder), AUTH
//! PLAIN/LOGIN/CRAM-MD5/EXTERNAL, MAIL FROM / RCPT TO, and dot-stuffed
//! DATA.
//!
//! Embedding is two calls:
//!
//! ```ignore
//! let protocol = Protocol::new(stream, handler, ProtocolConfig::default());
//! protocol.start_session().await?;
//! ```
//!
//! [`run`] is the demo entry point: it loads configuration from the
//! environment and serves sessions against the logging
//! [`smtp::DumpHandler`].

pub mod config;
pub mod smtp;

pub use smtp::{
    AuthOutcome, BodyReader, Command, Handler, ParseError, Protocol, ProtocolConfig, Reply,
    SmtpMessage, State, TlsOutcome,
};

use anyhow::Result;
use log::{error, info};

/// Runs the demo server until a fatal error occurs.
///
/// Loads [`config::Config`] from the environment, binds the listener, and
/// serves one engine session per connection. Server tasks run
/// indefinitely; an error return means the listener could not be set up or
/// the accept loop died.
pub async fn run() -> Result<()> {
    info!(
        "Starting {} v{} ESMTP server",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration; exit early if configuration is invalid.
    let config = match config::Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    let server = smtp::Server::new(config)?;
    server.run().await
}
