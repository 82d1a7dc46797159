//! Environment-driven configuration for the demo server.
//!
//! The engine itself is configured per session through
//! [`ProtocolConfig`](crate::smtp::ProtocolConfig); this module loads the
//! `SURATAN_*` environment variables for the binary and maps them onto it.
//! Limit variables use the wire-documented sentinels: `-1` means
//! unbounded, and `0` means unbounded for `SURATAN_MAX_MESSAGE_BYTES`.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::smtp::ProtocolConfig;


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The address to bind the SMTP listener to
    pub bind_address: String,

    /// The port to bind the SMTP listener to
    pub port: u16,

    /// Hostname announced in the greeting
    pub hostname: String,

    /// Server identity string appended to the greeting
    pub ident: String,

    /// Longest accepted command line in bytes (-1 = unbounded)
    pub maximum_line_length: i64,

    /// Recipients accepted per transaction (-1 = unbounded)
    pub maximum_recipients: i64,

    /// Idle deadline in seconds (-1 = unbounded)
    pub max_idle_seconds: i64,

    /// DATA body bytes handed to the handler (0 = unbounded)
    pub max_message_bytes: u64,

    /// Reject MAIL FROM lines with whitespace after the colon
    pub reject_broken_mail_syntax: bool,

    /// Reject RCPT TO lines with whitespace after the colon
    pub reject_broken_rcpt_syntax: bool,

    /// Refuse mail commands until STARTTLS has completed
    pub require_tls: bool,

    /// PEM certificate path enabling STARTTLS in the demo handler
    pub tls_cert_path: Option<String>,

    /// PEM private key path enabling STARTTLS in the demo handler
    pub tls_key_path: Option<String>,

    /// Concurrent session cap for the accept loop
    pub max_connections: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (optional)
        let _ = dotenv::dotenv();

        let bind_address =
            env::var("SURATAN_BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("SURATAN_PORT")
            .unwrap_or_else(|_| "1025".to_string()) // Use a non-privileged port by default
            .parse::<u16>()
            .context("SURATAN_PORT must be a valid port number")?;

        let hostname =
            env::var("SURATAN_HOSTNAME").unwrap_or_else(|_| "suratan.example".to_string());

        let ident = env::var("SURATAN_IDENT").unwrap_or_else(|_| "ESMTP Suratan".to_string());

        let maximum_line_length = parse_limit("SURATAN_MAX_LINE_LENGTH")?;
        let maximum_recipients = parse_limit("SURATAN_MAX_RECIPIENTS")?;
        let max_idle_seconds = parse_limit("SURATAN_MAX_IDLE_SECONDS")?;

        let max_message_bytes = env::var("SURATAN_MAX_MESSAGE_BYTES")
            .unwrap_or_else(|_| "0".to_string())
            .parse::<u64>()
            .context("SURATAN_MAX_MESSAGE_BYTES must be a non-negative byte count")?;

        let reject_broken_mail_syntax = parse_flag("SURATAN_STRICT_MAIL")?;
        let reject_broken_rcpt_syntax = parse_flag("SURATAN_STRICT_RCPT")?;
        let require_tls = parse_flag("SURATAN_REQUIRE_TLS")?;

        let tls_cert_path = env::var("SURATAN_TLS_CERT").ok();
        let tls_key_path = env::var("SURATAN_TLS_KEY").ok();

        let max_connections = env::var("SURATAN_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "100".to_string())
            .parse::<usize>()
            .context("SURATAN_MAX_CONNECTIONS must be a positive number")?;

        Ok(Config {
            bind_address,
            port,
            hostname,
            ident,
            maximum_line_length,
            maximum_recipients,
            max_idle_seconds,
            max_message_bytes,
            reject_broken_mail_syntax,
            reject_broken_rcpt_syntax,
            require_tls,
            tls_cert_path,
            tls_key_path,
            max_connections,
        })
    }

    /// The per-session engine settings this configuration describes.
    pub fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            hostname: self.hostname.clone(),
            ident: self.ident.clone(),
            maximum_line_length: unbounded_below_zero(self.maximum_line_length),
            maximum_recipients: unbounded_below_zero(self.maximum_recipients),
            max_idle: unbounded_below_zero(self.max_idle_seconds).map(Duration::from_secs),
            max_message_bytes: match self.max_message_bytes {
                0 => None,
                bytes => Some(bytes),
            },
            reject_broken_mail_syntax: self.reject_broken_mail_syntax,
            reject_broken_rcpt_syntax: self.reject_broken_rcpt_syntax,
            require_tls: self.require_tls,
        }
    }
}

fn parse_limit(var: &str) -> Result<i64> {
    env::var(var)
        .unwrap_or_else(|_| "-1".to_string())
        .parse::<i64>()
        .with_context(|| format!("{var} must be an integer (-1 = unbounded)"))
}

fn parse_flag(var: &str) -> Result<bool> {
    match env::var(var) {
        Ok(value) => value
            .parse::<bool>()
            .with_context(|| format!("{var} must be true or false")),
        Err(_) => Ok(false),
    }
}

fn unbounded_below_zero<T: TryFrom<i64>>(value: i64) -> Option<T> {
    if value < 0 {
        None
    } else {
        T::try_from(value).ok()
    }
}
