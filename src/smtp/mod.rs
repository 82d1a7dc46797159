//! The ESMTP protocol engine and the thin server glue around it.
//!
//! The engine itself lives in [`protocol`]: one [`Protocol`] per
//! connection, driven by [`Protocol::start_session`]. [`Server`] is the
//! accept loop for the demo binary, and [`DumpHandler`] an example
//! [`Handler`] that accepts everything and logs delivered messages.

mod command;
mod handler;
mod protocol;
mod reply;
mod state;
mod stream;

#[cfg(test)]
mod tests;

pub use command::{parse_mail_args, parse_rcpt_args, Command, ParseError};
pub use handler::{AuthOutcome, Handler, TlsOutcome, TlsUpgradeFuture, TlsUpgrader};
pub use protocol::{Protocol, ProtocolConfig, SmtpMessage};
pub use reply::Reply;
pub use state::State;
pub use stream::{BodyReader, SessionIo, SessionStream, TextStream};

use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use log::{error, info};
use rand::RngCore;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::config::Config;

/// The SMTP server for the demo binary: binds a listener and runs one
/// engine session per connection against a [`DumpHandler`].
pub struct Server {
    config: Config,
    handler: DumpHandler,
}

impl Server {
    /// Creates a server from the environment configuration. Fails if TLS
    /// cert/key paths are configured but unreadable.
    pub fn new(config: Config) -> Result<Self> {
        let acceptor = match (&config.tls_cert_path, &config.tls_key_path) {
            (Some(cert), Some(key)) => Some(Arc::new(build_tls_acceptor(cert, key)?)),
            _ => None,
        };
        let handler = DumpHandler::new(acceptor);
        Ok(Server { config, handler })
    }

    /// Runs the accept loop forever. Each connection gets its own task and
    /// its own engine; a semaphore caps the number of live sessions.
    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("ESMTP server listening on {}", addr);

        let sessions = Arc::new(Semaphore::new(self.config.max_connections));
        loop {
            let permit = Arc::clone(&sessions)
                .acquire_owned()
                .await
                .context("session semaphore closed")?;
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!("New connection from {}", peer);
                    let protocol = Protocol::new(
                        stream,
                        self.handler.clone(),
                        self.config.protocol_config(),
                    );
                    tokio::spawn(async move {
                        if let Err(e) = protocol.start_session().await {
                            error!("Error handling SMTP connection from {}: {:#}", peer, e);
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {:?}", e);
                }
            }
        }
    }
}

/// Example handler: validates nothing, accepts any credentials, advertises
/// `PLAIN`, logs each delivered message, and answers with a random queue
/// id. STARTTLS is offered only when the server was configured with a
/// certificate.
#[derive(Clone, Default)]
pub struct DumpHandler {
    tls: Option<Arc<TlsAcceptor>>,
}

impl DumpHandler {
    pub fn new(tls: Option<Arc<TlsAcceptor>>) -> Self {
        DumpHandler { tls }
    }

    fn queue_id() -> String {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        URL_SAFE.encode(raw)
    }
}

#[async_trait]
impl Handler for DumpHandler {
    async fn message_received(
        &mut self,
        message: &SmtpMessage,
        body: &mut BodyReader<'_>,
    ) -> Result<String> {
        let data = body.read_to_string().await?;

        let mut dump = String::new();
        dump.push_str(&format!("HELO:<{}>\r\n", message.helo));
        dump.push_str(&format!("FROM:<{}>\r\n", message.from));
        for to in &message.to {
            dump.push_str(&format!("TO:<{}>\r\n", to));
        }
        dump.push_str("\r\n");
        dump.push_str(&data);
        info!("Received message:\n{}", dump);

        Ok(Self::queue_id())
    }

    fn authentication_mechanisms(&self) -> Vec<String> {
        vec!["PLAIN".to_string()]
    }

    fn tls_handler(&mut self) -> TlsOutcome {
        match self.tls.clone() {
            Some(acceptor) => TlsOutcome::Upgrade(Box::new(move |io| -> TlsUpgradeFuture {
                Box::pin(async move {
                    let secured = acceptor.accept(io).await?;
                    Ok((Box::new(secured) as SessionIo, true))
                })
            })),
            None => TlsOutcome::Refuse(Reply::single(454, "TLS not available")),
        }
    }
}

/// Builds a rustls acceptor from PEM cert and key files.
fn build_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let cert_file = File::open(cert_path)
        .with_context(|| format!("Failed to open certificate: {cert_path}"))?;
    let certs = rustls_pemfile::certs(&mut StdBufReader::new(cert_file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to parse certificate")?;

    let key_file =
        File::open(key_path).with_context(|| format!("Failed to open private key: {key_path}"))?;
    let key = rustls_pemfile::private_key(&mut StdBufReader::new(key_file))
        .context("Failed to parse private key")?
        .context("No private key found")?;

    let tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to build TLS config")?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}
