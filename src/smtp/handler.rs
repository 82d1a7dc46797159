//! The embedder-facing contract the protocol engine calls for policy
//! decisions.
//!
//! Every operation has a permissive default, so a minimal handler only
//! implements [`Handler::message_received`]:
//!
//! ```ignore
//! struct Sink;
//!
//! #[async_trait]
//! impl Handler for Sink {
//!     async fn message_received(
//!         &mut self,
//!         message: &SmtpMessage,
//!         body: &mut BodyReader<'_>,
//!     ) -> anyhow::Result<String> {
//!         let _ = body.read_to_string().await?;
//!         Ok(format!("msg-{}", message.to.len()))
//!     }
//! }
//! ```

use std::future::Future;
use std::io;
use std::pin::Pin;

use async_trait::async_trait;

use super::protocol::SmtpMessage;
use super::reply::Reply;
use super::stream::{BodyReader, SessionIo};

/// Future returned by a [`TlsUpgrader`]: resolves to the (possibly
/// replaced) session stream and whether the upgrade actually happened.
pub type TlsUpgradeFuture = Pin<Box<dyn Future<Output = io::Result<(SessionIo, bool)>> + Send>>;

/// The STARTTLS upgrade callback. Invoked by the session driver after the
/// `220 Ready to start TLS` reply has been flushed, with the raw byte
/// stream torn out of the engine's buffers. It performs the cryptographic
/// handshake (or declines) and returns the stream the session continues
/// on, plus the done flag: `true` re-enters ESTABLISH over the upgraded
/// stream, `false` carries on un-upgraded.
pub type TlsUpgrader = Box<dyn FnOnce(SessionIo) -> TlsUpgradeFuture + Send + Sync>;

/// Outcome of asking the embedder to coordinate a STARTTLS handshake.
pub enum TlsOutcome {
    /// Do not upgrade; send this reply instead of `220`.
    Refuse(Reply),
    /// Send `220 Ready to start TLS` and run the callback post-flush.
    Upgrade(TlsUpgrader),
}

/// Outcome of a credential check.
pub enum AuthOutcome {
    /// Credentials accepted; the engine replies `235`.
    Accept,
    /// Credentials rejected; the engine sends the supplied reply, or `535`
    /// when none is given.
    Reject(Option<Reply>),
}

/// Application hooks consumed by the protocol engine.
///
/// All operations run on the session's task; a slow handler stalls only
/// its own connection.
#[async_trait]
pub trait Handler: Send {
    /// The sole sink for a completed transaction, called once per
    /// successful DATA. The handler is expected to drain `body` (the
    /// engine consumes any remainder after this returns). The returned
    /// queue id is echoed in `250 Ok: queued as <id>`; an error becomes
    /// `452 Unable to store message`.
    async fn message_received(
        &mut self,
        message: &SmtpMessage,
        body: &mut BodyReader<'_>,
    ) -> anyhow::Result<String>;

    /// Gate for MAIL FROM. Rejection yields `550 Invalid sender <from>`.
    fn validate_sender(&mut self, _from: &str) -> bool {
        true
    }

    /// Gate for each RCPT TO. Rejection yields `550 Invalid recipient <to>`.
    fn validate_recipient(&mut self, _to: &str) -> bool {
        true
    }

    /// Credential check for the given mechanism. The argument layout
    /// depends on the mechanism: `PLAIN` gets the decoded user and
    /// password, `LOGIN` the two base64 lines verbatim, `CRAM-MD5` the
    /// client digest line, `EXTERNAL` the inline token.
    fn authenticate(&mut self, _mechanism: &str, _args: &[&str]) -> AuthOutcome {
        AuthOutcome::Accept
    }

    /// Mechanism tokens advertised in the EHLO `AUTH` capability line.
    fn authentication_mechanisms(&self) -> Vec<String> {
        Vec::new()
    }

    /// Pre-dispatch veto hook. Returning a reply sends it and suppresses
    /// any state transition for this command.
    fn verb_filter(&mut self, _verb: &str, _args: &str) -> Option<Reply> {
        None
    }

    /// STARTTLS coordinator. The default refuses the handshake.
    fn tls_handler(&mut self) -> TlsOutcome {
        TlsOutcome::Refuse(Reply::single(454, "TLS not available"))
    }
}
