//! Engine test support: a scriptable handler and an in-process SMTP
//! client speaking over a duplex pipe.


use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

use super::{
    AuthOutcome, BodyReader, Handler, Protocol, ProtocolConfig, Reply, SmtpMessage, TlsOutcome,
    TlsUpgradeFuture, TlsUpgrader,
};

/// How the test handler responds to STARTTLS.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum TestTls {
    /// Refuse the handshake with 454.
    #[default]
    Refuse,
    /// Pretend the handshake succeeded, keeping the plain stream.
    Accept,
    /// Send 220 but then decline the upgrade.
    Decline,
}

fn upgrade_callback(ok: bool) -> TlsUpgrader {
    Box::new(move |io| -> TlsUpgradeFuture { Box::pin(async move { Ok((io, ok)) }) })
}

/// Scriptable handler recording every hook invocation.
#[derive(Clone, Default)]
pub(crate) struct TestHandler {
    pub queue_id: String,
    pub fail_store: bool,
    pub reject_sender: bool,
    pub reject_recipient: bool,
    pub reject_auth: bool,
    pub auth_reply: Option<(u16, String)>,
    pub mechanisms: Vec<String>,
    pub vetoed_verb: Option<String>,
    pub tls: TestTls,
    pub auth_calls: Arc<Mutex<Vec<(String, Vec<String>)>>>,
    pub messages: Arc<Mutex<Vec<(SmtpMessage, String)>>>,
}

impl TestHandler {
    pub fn new() -> Self {
        TestHandler {
            queue_id: "abc".to_string(),
            ..TestHandler::default()
        }
    }
}

#[async_trait]
impl Handler for TestHandler {
    async fn message_received(
        &mut self,
        message: &SmtpMessage,
        body: &mut BodyReader<'_>,
    ) -> anyhow::Result<String> {
        let data = body.read_to_string().await?;
        self.messages.lock().unwrap().push((message.clone(), data));
        if self.fail_store {
            anyhow::bail!("storage offline");
        }
        Ok(self.queue_id.clone())
    }

    fn validate_sender(&mut self, _from: &str) -> bool {
        !self.reject_sender
    }

    fn validate_recipient(&mut self, _to: &str) -> bool {
        !self.reject_recipient
    }

    fn authenticate(&mut self, mechanism: &str, args: &[&str]) -> AuthOutcome {
        self.auth_calls.lock().unwrap().push((
            mechanism.to_string(),
            args.iter().map(|arg| arg.to_string()).collect(),
        ));
        if self.reject_auth {
            let reply = self
                .auth_reply
                .clone()
                .map(|(status, line)| Reply::single(status, line));
            AuthOutcome::Reject(reply)
        } else {
            AuthOutcome::Accept
        }
    }

    fn authentication_mechanisms(&self) -> Vec<String> {
        self.mechanisms.clone()
    }

    fn verb_filter(&mut self, verb: &str, _args: &str) -> Option<Reply> {
        match &self.vetoed_verb {
            Some(vetoed) if vetoed == verb => Some(Reply::single(502, "Verb disabled")),
            _ => None,
        }
    }

    fn tls_handler(&mut self) -> TlsOutcome {
        match self.tls {
            TestTls::Refuse => TlsOutcome::Refuse(Reply::single(454, "TLS not available")),
            TestTls::Accept => TlsOutcome::Upgrade(upgrade_callback(true)),
            TestTls::Decline => TlsOutcome::Upgrade(upgrade_callback(false)),
        }
    }
}

/// Client side of an in-process session.
pub(crate) struct TestClient {
    io: BufReader<DuplexStream>,
}

impl TestClient {
    pub async fn send(&mut self, line: &str) {
        self.io
            .get_mut()
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("client write failed");
    }

    /// Reads one raw line including its terminator; empty on EOF.
    pub async fn read_raw_line(&mut self) -> String {
        let mut line = String::new();
        self.io
            .read_line(&mut line)
            .await
            .expect("client read failed");
        line
    }

    /// Reads a full (possibly multi-line) reply.
    pub async fn read_reply(&mut self) -> (u16, Vec<String>) {
        let mut lines = Vec::new();
        loop {
            let raw = self.read_raw_line().await;
            assert!(!raw.is_empty(), "connection closed mid-reply");
            let trimmed = raw.trim_end_matches(['\r', '\n']);
            let status: u16 = trimmed[..3].parse().expect("malformed status code");
            let rest = &trimmed[3..];
            match rest.strip_prefix('-') {
                Some(text) => lines.push(text.to_string()),
                None => {
                    lines.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
                    return (status, lines);
                }
            }
        }
    }

    /// Sends a command and returns its reply.
    pub async fn command(&mut self, line: &str) -> (u16, Vec<String>) {
        self.send(line).await;
        self.read_reply().await
    }
}

/// Spawns a full session over a duplex pipe and consumes the greeting.
pub(crate) async fn start_session(
    handler: TestHandler,
    config: ProtocolConfig,
) -> (TestClient, JoinHandle<anyhow::Result<()>>) {
    let (mut client, session) = connect_session(handler, config);
    let (status, lines) = client.read_reply().await;
    assert_eq!(status, 220, "expected greeting, got {lines:?}");
    (client, session)
}

/// Spawns a session without reading the greeting.
pub(crate) fn connect_session(
    handler: TestHandler,
    config: ProtocolConfig,
) -> (TestClient, JoinHandle<anyhow::Result<()>>) {
    let (client, server) = tokio::io::duplex(16 * 1024);
    let protocol = Protocol::new(server, handler, config);
    let session = tokio::spawn(protocol.start_session());
    (
        TestClient {
            io: BufReader::new(client),
        },
        session,
    )
}
