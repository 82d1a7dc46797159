//! The per-connection ESMTP state machine and its session driver.
//!
//! One [`Protocol`] value owns one connection: it dispatches commands
//! against the current [`State`], runs the AUTH sub-dialogues, coordinates
//! the STARTTLS hand-off with the embedder, and funnels each completed
//! transaction to the [`Handler`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, warn};

use super::command::{self, Command};
use super::handler::{AuthOutcome, Handler, TlsOutcome, TlsUpgrader};
use super::reply::Reply;
use super::state::State;
use super::stream::{BodyReader, SessionStream, TextStream};

/// Envelope of one in-progress mail transaction.
///
/// A fresh message is constructed when the session enters ESTABLISH, on
/// RSET, after a successful DATA delivery, and after a successful STARTTLS
/// upgrade. The DATA body is not stored here; it is streamed to the
/// handler through a [`BodyReader`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmtpMessage {
    /// Argument of the most recent HELO/EHLO.
    pub helo: String,
    /// Forward-path from MAIL FROM.
    pub from: String,
    /// Recipient paths in acceptance order. Duplicates are not collapsed.
    pub to: Vec<String>,
}

/// Per-session settings, fixed for the life of a session.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Hostname announced in the greeting and used in the CRAM-MD5 nonce.
    pub hostname: String,
    /// Server identity string appended to the greeting.
    pub ident: String,
    /// Longest accepted line in bytes; `None` is unbounded. Overrun drops
    /// the connection without a reply.
    pub maximum_line_length: Option<usize>,
    /// Cap on accepted RCPT TO paths per transaction; `None` is unbounded.
    pub maximum_recipients: Option<usize>,
    /// Idle deadline armed before every read and write; `None` is
    /// unbounded.
    pub max_idle: Option<Duration>,
    /// Size bound on the DATA body handed to the handler; `None` is
    /// unbounded. The stream is truncated, not rejected.
    pub max_message_bytes: Option<u64>,
    /// Require RFC-shaped `MAIL FROM:<addr>` with no whitespace after the
    /// colon.
    pub reject_broken_mail_syntax: bool,
    /// Same strictness for `RCPT TO:<addr>`.
    pub reject_broken_rcpt_syntax: bool,
    /// Refuse everything but session-management verbs until STARTTLS has
    /// completed.
    pub require_tls: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            hostname: "suratan.example".to_string(),
            ident: "ESMTP Suratan".to_string(),
            maximum_line_length: None,
            maximum_recipients: None,
            max_idle: None,
            max_message_bytes: None,
            reject_broken_mail_syntax: false,
            reject_broken_rcpt_syntax: false,
            require_tls: false,
        }
    }
}

/// The protocol engine for a single connection.
pub struct Protocol<H: Handler> {
    config: ProtocolConfig,
    handler: H,
    stream: TextStream,
    state: State,
    message: SmtpMessage,
    last_command: Option<Command>,
    tls_pending: bool,
    tls_upgraded: bool,
    cram_challenge: Option<String>,
}

impl<H: Handler> Protocol<H> {
    /// Creates an engine over `io`. Nothing is written until
    /// [`start`](Protocol::start) or [`start_session`](Protocol::start_session).
    pub fn new(io: impl SessionStream + 'static, handler: H, config: ProtocolConfig) -> Self {
        let stream = TextStream::new(Box::new(io), config.maximum_line_length, config.max_idle);
        Protocol {
            config,
            handler,
            stream,
            state: State::Invalid,
            message: SmtpMessage::default(),
            last_command: None,
            tls_pending: false,
            tls_upgraded: false,
            cram_challenge: None,
        }
    }

    /// Current session state.
    pub fn state(&self) -> State {
        self.state
    }

    /// The envelope being collected for the current transaction.
    pub fn message(&self) -> &SmtpMessage {
        &self.message
    }

    /// Runs the session to completion: greeting, then the
    /// read/dispatch/reply loop, until the peer disconnects, an I/O error
    /// or timeout occurs, or the state machine reaches DONE.
    pub async fn start_session(mut self) -> anyhow::Result<()> {
        self.start().await?;
        loop {
            if self.state == State::Data {
                let id = self.stream.begin_request();
                let reply = self.process_data().await?;
                self.stream.send_reply(id, &reply).await?;
            } else {
                let (id, line) = match self.stream.read_line().await {
                    Ok(read) => read,
                    // Read failures (disconnect, idle timeout, oversized
                    // line) terminate the session without a reply.
                    Err(err) => {
                        debug!("SMTP({}): session ended: {}", self.state, err);
                        return Ok(());
                    }
                };
                let mut reply = self.command(Command::parse(&line));
                let upgrade = reply.upgrade.take();
                self.stream.send_reply(id, &reply).await?;
                if let Some(upgrade) = upgrade {
                    self.run_upgrade(upgrade).await?;
                }
            }
            if self.state == State::Done {
                return Ok(());
            }
        }
    }

    /// Sends the greeting and switches to ESTABLISH.
    pub async fn start(&mut self) -> std::io::Result<()> {
        debug!("SMTP({}): started session, switching to ESTABLISH state", self.state);
        self.state = State::Establish;
        let greeting = format!("{} {}", self.config.hostname, self.config.ident);
        self.stream.send(&Reply::single(220, greeting)).await
    }

    /// Dispatches one command and returns the reply to send.
    ///
    /// The evaluation order is load-bearing: later arms rely on earlier
    /// ones having filtered their cases.
    pub fn command(&mut self, cmd: Command) -> Reply {
        let reply = self.dispatch(&cmd);
        self.last_command = Some(cmd);
        reply
    }

    fn dispatch(&mut self, cmd: &Command) -> Reply {
        if let Some(reply) = self.handler.verb_filter(&cmd.verb, &cmd.args) {
            debug!("SMTP({}): verb filter vetoed {}", self.state, cmd.verb);
            return reply;
        }

        if self.tls_pending && !self.tls_upgraded {
            // A half-finished TLS negotiation accepts nothing; hang up.
            self.state = State::Done;
            return Reply::single(221, "Bye");
        }

        match cmd.verb.as_str() {
            "RSET" => {
                debug!("SMTP({}): got RSET command, switching to MAIL state", self.state);
                self.state = State::Mail;
                self.message = SmtpMessage::default();
                return Reply::single(250, "Ok");
            }
            "NOOP" => {
                debug!("SMTP({}): got NOOP command", self.state);
                return Reply::single(250, "Ok");
            }
            "QUIT" => {
                debug!("SMTP({}): got QUIT command, switching to DONE state", self.state);
                self.state = State::Done;
                return Reply::single(221, "Bye");
            }
            _ => {}
        }

        if self.state == State::Establish {
            return match cmd.verb.as_str() {
                "HELO" => self.helo(&cmd.args),
                "EHLO" => self.ehlo(&cmd.args),
                "STARTTLS" => self.start_tls(&cmd.args),
                _ => Reply::single(500, "Unrecognised command"),
            };
        }

        if cmd.verb == "STARTTLS" {
            debug!("SMTP({}): got STARTTLS command outside ESTABLISH state", self.state);
            return self.start_tls(&cmd.args);
        }

        if self.config.require_tls && !self.tls_upgraded {
            debug!("SMTP({}): rejecting command, TLS required but not upgraded", self.state);
            return Reply::single(530, "Must issue a STARTTLS command first");
        }

        match self.state {
            State::AuthPlain => self.auth_plain_response(cmd),
            State::AuthLogin => {
                debug!("SMTP({}): got LOGIN username, switching to AUTHLOGIN2 state", self.state);
                self.state = State::AuthLogin2;
                Reply::single(334, "UGFzc3dvcmQ6")
            }
            State::AuthLogin2 => self.auth_login_response(cmd),
            State::AuthCramMd5 => self.auth_cram_response(cmd),
            State::Mail => match cmd.verb.as_str() {
                "AUTH" => self.auth(cmd),
                "MAIL" => self.mail(&cmd.args),
                "HELO" => self.helo(&cmd.args),
                "EHLO" => self.ehlo(&cmd.args),
                _ => {
                    debug!("SMTP({}): unknown command '{}'", self.state, cmd.verb);
                    Reply::single(500, "Unrecognised command")
                }
            },
            State::Rcpt => match cmd.verb.as_str() {
                "RCPT" => self.rcpt(&cmd.args),
                "DATA" => {
                    debug!("SMTP({}): got DATA command, switching to DATA state", self.state);
                    self.state = State::Data;
                    Reply::single(354, "End data with <CR><LF>.<CR><LF>")
                }
                "HELO" => self.helo(&cmd.args),
                "EHLO" => self.ehlo(&cmd.args),
                _ => {
                    debug!("SMTP({}): unknown command '{}'", self.state, cmd.verb);
                    Reply::single(500, "Unrecognised command")
                }
            },
            _ => {
                debug!("SMTP({}): unknown command '{}'", self.state, cmd.verb);
                Reply::single(500, "Unrecognised command")
            }
        }
    }

    fn helo(&mut self, args: &str) -> Reply {
        debug!("SMTP({}): got HELO command, switching to MAIL state", self.state);
        self.state = State::Mail;
        self.message.helo = args.to_string();
        Reply::single(250, format!("Hello {args}"))
    }

    fn ehlo(&mut self, args: &str) -> Reply {
        debug!("SMTP({}): got EHLO command, switching to MAIL state", self.state);
        self.state = State::Mail;
        self.message.helo = args.to_string();

        let mut lines = vec![format!("Hello {args}"), "PIPELINING".to_string()];
        if !self.tls_pending && !self.tls_upgraded {
            lines.push("STARTTLS".to_string());
        }
        if !self.config.require_tls || self.tls_upgraded {
            let mechanisms = self.handler.authentication_mechanisms();
            if !mechanisms.is_empty() {
                lines.push(format!("AUTH {}", mechanisms.join(" ")));
            }
        }
        Reply::new(250, lines)
    }

    fn mail(&mut self, args: &str) -> Reply {
        let from = match command::parse_mail_args(args, self.config.reject_broken_mail_syntax) {
            Ok(from) => from,
            Err(err) => return Reply::single(550, err.to_string()),
        };
        if !self.handler.validate_sender(&from) {
            return Reply::single(550, format!("Invalid sender {from}"));
        }
        debug!("SMTP({}): got MAIL command, switching to RCPT state", self.state);
        self.message.from = from.clone();
        self.state = State::Rcpt;
        Reply::single(250, format!("Sender {from} ok"))
    }

    fn rcpt(&mut self, args: &str) -> Reply {
        if let Some(max) = self.config.maximum_recipients {
            if self.message.to.len() >= max {
                return Reply::single(552, "Too many recipients");
            }
        }
        let to = match command::parse_rcpt_args(args, self.config.reject_broken_rcpt_syntax) {
            Ok(to) => to,
            Err(err) => return Reply::single(550, err.to_string()),
        };
        if !self.handler.validate_recipient(&to) {
            return Reply::single(550, format!("Invalid recipient {to}"));
        }
        self.message.to.push(to.clone());
        Reply::single(250, format!("Recipient {to} ok"))
    }

    fn auth(&mut self, cmd: &Command) -> Reply {
        debug!("SMTP({}): got AUTH command", self.state);
        if let Some(token) = cmd.args.strip_prefix("PLAIN ") {
            return self.auth_plain_token(token);
        }
        if let Some(token) = cmd.args.strip_prefix("EXTERNAL ") {
            let outcome = self.handler.authenticate("EXTERNAL", &[token]);
            return self.finish_auth(outcome);
        }
        match cmd.args.as_str() {
            "PLAIN" => {
                debug!("SMTP({}): PLAIN without initial response, switching to AUTHPLAIN state", self.state);
                self.state = State::AuthPlain;
                Reply::single(334, "")
            }
            "LOGIN" => {
                debug!("SMTP({}): starting LOGIN exchange, switching to AUTHLOGIN state", self.state);
                self.state = State::AuthLogin;
                Reply::single(334, "VXNlcm5hbWU6")
            }
            "CRAM-MD5" => {
                debug!("SMTP({}): starting CRAM-MD5 exchange, switching to AUTHCRAMMD5 state", self.state);
                self.state = State::AuthCramMd5;
                let challenge = self.cram_challenge();
                Reply::single(334, challenge)
            }
            _ => Reply::single(504, "Unsupported authentication mechanism"),
        }
    }

    /// Decodes a PLAIN credentials blob and runs the credential check.
    /// Used for both the inline form (`AUTH PLAIN <b64>`) and the
    /// follow-up line after `334` — only ever the base64 payload, never
    /// the `PLAIN ` prefix.
    fn auth_plain_token(&mut self, token: &str) -> Reply {
        let decoded = match STANDARD.decode(token) {
            Ok(decoded) => decoded,
            Err(_) => return Reply::single(550, "Badly formed parameter"),
        };
        let text = String::from_utf8_lossy(&decoded).into_owned();
        let fields: Vec<&str> = text.split('\0').collect();
        if fields.len() < 3 {
            return Reply::single(550, "Badly formed parameter");
        }
        let outcome = self
            .handler
            .authenticate("PLAIN", &[fields[1], fields[2]]);
        self.finish_auth(outcome)
    }

    fn auth_plain_response(&mut self, cmd: &Command) -> Reply {
        debug!("SMTP({}): got PLAIN response, switching to MAIL state", self.state);
        self.state = State::Mail;
        self.auth_plain_token(&cmd.orig)
    }

    fn auth_login_response(&mut self, cmd: &Command) -> Reply {
        debug!("SMTP({}): got LOGIN password, switching to MAIL state", self.state);
        self.state = State::Mail;
        // The username is the previous line, retained verbatim; LOGIN
        // tokens are opaque to the engine.
        let username = self
            .last_command
            .as_ref()
            .map(|previous| previous.orig.clone())
            .unwrap_or_default();
        let outcome = self.handler.authenticate("LOGIN", &[&username, &cmd.orig]);
        self.finish_auth(outcome)
    }

    fn auth_cram_response(&mut self, cmd: &Command) -> Reply {
        debug!("SMTP({}): got CRAM-MD5 response, switching to MAIL state", self.state);
        self.state = State::Mail;
        let outcome = self.handler.authenticate("CRAM-MD5", &[&cmd.orig]);
        self.finish_auth(outcome)
    }

    fn finish_auth(&mut self, outcome: AuthOutcome) -> Reply {
        match outcome {
            AuthOutcome::Accept => Reply::single(235, "Authentication successful"),
            AuthOutcome::Reject(Some(reply)) => reply,
            AuthOutcome::Reject(None) => Reply::single(535, "Authentication credentials invalid"),
        }
    }

    /// The session's CRAM-MD5 challenge, generated on first use as an RFC
    /// 2195 nonce and then reused so the handler verifies against the same
    /// string the client saw.
    fn cram_challenge(&mut self) -> String {
        let hostname = &self.config.hostname;
        self.cram_challenge
            .get_or_insert_with(|| {
                let nonce: u32 = rand::random();
                let stamp = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|elapsed| elapsed.as_secs())
                    .unwrap_or(0);
                STANDARD.encode(format!("<{nonce}.{stamp}@{hostname}>"))
            })
            .clone()
    }

    fn start_tls(&mut self, args: &str) -> Reply {
        if self.tls_upgraded {
            return Reply::single(500, "Unrecognised command");
        }
        if !args.is_empty() {
            return Reply::single(501, "Syntax error: no parameters allowed");
        }
        match self.handler.tls_handler() {
            TlsOutcome::Refuse(reply) => reply,
            TlsOutcome::Upgrade(upgrader) => {
                self.tls_pending = true;
                Reply {
                    status: 220,
                    lines: vec!["Ready to start TLS".to_string()],
                    upgrade: Some(upgrader),
                }
            }
        }
    }

    /// Post-flush half of the STARTTLS flow: tears the framer down, hands
    /// the raw stream to the embedder's upgrade callback, and re-wraps
    /// whatever comes back.
    async fn run_upgrade(&mut self, upgrade: TlsUpgrader) -> anyhow::Result<()> {
        let framer = std::mem::replace(&mut self.stream, TextStream::detached());
        match upgrade(framer.into_inner()).await {
            Ok((io, ok)) => {
                self.stream =
                    TextStream::new(io, self.config.maximum_line_length, self.config.max_idle);
                self.tls_done(ok);
                Ok(())
            }
            Err(err) => {
                self.tls_done(false);
                Err(err.into())
            }
        }
    }

    /// Completion callback for the TLS handshake (RFC 3207): success
    /// re-enters ESTABLISH with a fresh message over the secured stream.
    fn tls_done(&mut self, ok: bool) {
        self.tls_upgraded = ok;
        self.tls_pending = ok;
        if ok {
            debug!("SMTP({}): TLS upgrade complete, switching to ESTABLISH state", self.state);
            self.message = SmtpMessage::default();
            self.state = State::Establish;
        } else {
            debug!("SMTP({}): TLS upgrade declined", self.state);
        }
    }

    /// DATA side-channel: streams the dot-stuffed body to the handler and
    /// resets the transaction.
    async fn process_data(&mut self) -> anyhow::Result<Reply> {
        let message = std::mem::take(&mut self.message);
        let mut body = BodyReader::new(&mut self.stream, self.config.max_message_bytes);
        let delivery = self.handler.message_received(&message, &mut body).await;
        body.drain().await?;
        drop(body);

        debug!("SMTP({}): message processed, switching to MAIL state", self.state);
        self.state = State::Mail;
        self.message = SmtpMessage::default();

        Ok(match delivery {
            Ok(queue_id) => Reply::single(250, format!("Ok: queued as {queue_id}")),
            Err(err) => {
                warn!("handler failed to store message from <{}>: {err:#}", message.from);
                Reply::single(452, "Unable to store message")
            }
        })
    }
}
