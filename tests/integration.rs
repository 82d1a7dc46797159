//! Integration tests running the real listener and speaking SMTP over a
//! TCP connection, the way a mail client would.

use std::net::TcpListener as StdTcpListener;
use std::time::Duration;

use suratan::config::Config;
use suratan::smtp::Server;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

// --- Helpers ---

fn get_free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("Failed to bind to port 0");
    listener.local_addr().unwrap().port()
}

fn test_config(port: u16) -> Config {
    Config {
        bind_address: "127.0.0.1".to_string(),
        port,
        hostname: "mx.test.example".to_string(),
        ident: "ESMTP Suratan".to_string(),
        maximum_line_length: -1,
        maximum_recipients: -1,
        max_idle_seconds: -1,
        max_message_bytes: 0,
        reject_broken_mail_syntax: false,
        reject_broken_rcpt_syntax: false,
        require_tls: false,
        tls_cert_path: None,
        tls_key_path: None,
        max_connections: 10,
    }
}

async fn start_server(config: Config) -> String {
    let addr = format!("{}:{}", config.bind_address, config.port);
    let server = Server::new(config).expect("Failed to build server");
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    wait_for_smtp(&addr, Duration::from_secs(5)).await;
    addr
}

async fn wait_for_smtp(addr: &str, timeout: Duration) {
    let start = std::time::Instant::now();
    loop {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        if start.elapsed() > timeout {
            panic!(
                "SMTP server at {} did not become ready within {:?}",
                addr, timeout
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

struct SmtpClient {
    reader: BufReader<ReadHalf<TcpStream>>,
    writer: WriteHalf<TcpStream>,
}

impl SmtpClient {
    async fn connect(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect failed");
        let (read_half, write_half) = tokio::io::split(stream);
        SmtpClient {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("write failed");
        self.writer.flush().await.expect("flush failed");
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.expect("read failed");
        line
    }

    /// Reads a reply, returning all of its lines; panics unless the final
    /// line carries `expect_status`.
    async fn expect_reply(&mut self, expect_status: &str) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            assert!(!line.is_empty(), "connection closed, expected {expect_status}");
            let done = !line[3..].starts_with('-');
            lines.push(line.trim_end().to_string());
            if done {
                assert!(
                    lines.last().unwrap().starts_with(expect_status),
                    "expected {expect_status}, got: {lines:?}"
                );
                return lines;
            }
        }
    }

    async fn roundtrip(&mut self, line: &str, expect_status: &str) -> Vec<String> {
        self.send(line).await;
        self.expect_reply(expect_status).await
    }
}

async fn send_message(client: &mut SmtpClient, sender: &str, recipient: &str, body: &str) -> String {
    client
        .roundtrip(&format!("MAIL FROM:<{sender}>"), "250")
        .await;
    client
        .roundtrip(&format!("RCPT TO:<{recipient}>"), "250")
        .await;
    client.roundtrip("DATA", "354").await;
    for line in body.lines() {
        client.send(line).await;
    }
    let reply = client.roundtrip(".", "250").await;
    reply.last().unwrap().clone()
}

// --- Tests ---

#[tokio::test]
async fn test_end_to_end_message_delivery() {
    let addr = start_server(test_config(get_free_port())).await;
    let mut client = SmtpClient::connect(&addr).await;

    let greeting = client.expect_reply("220").await;
    assert_eq!(greeting, vec!["220 mx.test.example ESMTP Suratan"]);

    let capabilities = client.roundtrip("EHLO client.test", "250").await;
    assert_eq!(capabilities[0], "250-Hello client.test");
    assert!(capabilities.contains(&"250-PIPELINING".to_string()));
    // The DumpHandler advertises PLAIN as the final capability line.
    assert_eq!(capabilities.last().unwrap(), "250 AUTH PLAIN");

    let queued = send_message(
        &mut client,
        "sender@test.example",
        "recipient@test.example",
        "Subject: integration\r\n\r\nHello from the integration test!",
    )
    .await;
    assert!(
        queued.starts_with("250 Ok: queued as "),
        "unexpected DATA reply: {queued}"
    );

    client.roundtrip("QUIT", "221").await;
    assert!(client.read_line().await.is_empty(), "expected EOF after QUIT");
}

#[tokio::test]
async fn test_session_reuse_across_transactions() {
    let addr = start_server(test_config(get_free_port())).await;
    let mut client = SmtpClient::connect(&addr).await;

    client.expect_reply("220").await;
    client.roundtrip("HELO client.test", "250").await;

    let first = send_message(&mut client, "a@test.example", "b@test.example", "one").await;
    let second = send_message(&mut client, "c@test.example", "d@test.example", "two").await;
    assert_ne!(first, second, "queue ids should be unique per delivery");

    client.roundtrip("QUIT", "221").await;
}

#[tokio::test]
async fn test_strict_mail_syntax_rejection() {
    let mut config = test_config(get_free_port());
    config.reject_broken_mail_syntax = true;
    let addr = start_server(config).await;
    let mut client = SmtpClient::connect(&addr).await;

    client.expect_reply("220").await;
    client.roundtrip("HELO client.test", "250").await;

    let reply = client.roundtrip("MAIL FROM: <a@x>", "550").await;
    assert_eq!(reply, vec!["550 Invalid syntax in MAIL command"]);

    // The RFC-shaped form is still accepted afterwards.
    client.roundtrip("MAIL FROM:<a@x>", "250").await;
    client.roundtrip("QUIT", "221").await;
}

#[tokio::test]
async fn test_recipient_cap() {
    let mut config = test_config(get_free_port());
    config.maximum_recipients = 1;
    let addr = start_server(config).await;
    let mut client = SmtpClient::connect(&addr).await;

    client.expect_reply("220").await;
    client.roundtrip("HELO client.test", "250").await;
    client.roundtrip("MAIL FROM:<a@x>", "250").await;
    client.roundtrip("RCPT TO:<b@y>", "250").await;
    client.roundtrip("RCPT TO:<c@y>", "552").await;
    client.roundtrip("QUIT", "221").await;
}
