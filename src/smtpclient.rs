use crate::config::{MailConfig, SmtpSecurity};
use base64::prelude::*;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::{rustls, TlsConnector};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum SMTPClientError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("tls setup failed: {0}")]
    Tls(#[from] rustls::Error),
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),
    #[error("server closed the connection")]
    ConnectionClosed,
    #[error("malformed reply {0:?}")]
    MalformedReply(String),
    #[error("server rejected greeting: {0}")]
    GreetingFailed(Reply),
    #[error("EHLO failed: {0}")]
    HELOFailed(Reply),
    #[error("STARTTLS failed: {0}")]
    StartTlsFailed(Reply),
    #[error("AUTH failed: {0}")]
    AUTHFailed(Reply),
    #[error("sending email failed: {0}")]
    SendEmailFailed(Reply),
    #[error("delivery timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Final line of an SMTP reply together with its code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    /// Parses one reply line, returning the reply and whether more lines follow.
    pub fn parse_line(line: &str) -> Result<(Reply, bool), SMTPClientError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let malformed = || SMTPClientError::MalformedReply(line.to_string());
        let code = line
            .get(..3)
            .filter(|c| c.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(malformed)?;
        let (more, text) = match line.as_bytes().get(3) {
            None => (false, ""),
            Some(b' ') => (false, &line[4..]),
            Some(b'-') => (true, &line[4..]),
            Some(_) => return Err(malformed()),
        };
        Ok((
            Reply {
                code,
                text: text.to_string(),
            },
            more,
        ))
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

/// One SMTP conversation over any byte stream, plain or TLS.
struct Session<S> {
    stream: BufReader<S>,
    buffer: String,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            buffer: String::new(),
        }
    }

    fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    async fn recv(&mut self) -> Result<Reply, SMTPClientError> {
        loop {
            self.buffer.clear();
            if self.stream.read_line(&mut self.buffer).await? == 0 {
                return Err(SMTPClientError::ConnectionClosed);
            }
            debug!("smtp <= {}", self.buffer.trim_end());
            let (reply, more) = Reply::parse_line(&self.buffer)?;
            if !more {
                return Ok(reply);
            }
        }
    }

    async fn send_cmd(&mut self, data: &[u8]) -> Result<Reply, SMTPClientError> {
        self.stream.write_all(data).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        self.recv().await
    }

    async fn send_data(&mut self, content: &str) -> Result<Reply, SMTPClientError> {
        for line in content.split("\r\n") {
            if line.starts_with('.') {
                self.stream.write_all(b".").await?;
            }
            self.stream.write_all(line.as_bytes()).await?;
            self.stream.write_all(b"\r\n").await?;
        }
        self.stream.write_all(b".\r\n").await?;
        self.stream.flush().await?;
        self.recv().await
    }

    async fn expect(
        &mut self,
        cmd: &str,
        code: u16,
        fail: fn(Reply) -> SMTPClientError,
    ) -> Result<Reply, SMTPClientError> {
        debug!("smtp => {}", cmd.split_whitespace().next().unwrap_or_default());
        let reply = self.send_cmd(cmd.as_bytes()).await?;
        check_success(reply, code, fail)
    }

    async fn greeting(&mut self) -> Result<(), SMTPClientError> {
        let reply = self.recv().await?;
        check_success(reply, 220, SMTPClientError::GreetingFailed).map(|_| ())
    }

    async fn ehlo(&mut self, domain: &str) -> Result<(), SMTPClientError> {
        self.expect(&format!("EHLO {domain}"), 250, SMTPClientError::HELOFailed)
            .await
            .map(|_| ())
    }

    async fn login(&mut self, user: &str, pass: &str) -> Result<(), SMTPClientError> {
        self.expect("AUTH LOGIN", 334, SMTPClientError::AUTHFailed)
            .await?;
        // Credentials bypass `expect` so they never reach the debug log.
        let reply = self.send_cmd(BASE64_STANDARD.encode(user).as_bytes()).await?;
        check_success(reply, 334, SMTPClientError::AUTHFailed)?;
        let reply = self.send_cmd(BASE64_STANDARD.encode(pass).as_bytes()).await?;
        check_success(reply, 235, SMTPClientError::AUTHFailed)?;
        Ok(())
    }

    async fn quit(&mut self) {
        // The message is already accepted; a failing QUIT changes nothing.
        if let Err(e) = self.send_cmd(b"QUIT").await {
            debug!("QUIT failed: {e}");
        }
    }
}

fn check_success(
    reply: Reply,
    code: u16,
    fail: fn(Reply) -> SMTPClientError,
) -> Result<Reply, SMTPClientError> {
    // 250 stands for any completion reply (251 "will forward" included).
    if reply.code == code || (code == 250 && reply.code / 100 == 2) {
        Ok(reply)
    } else {
        Err(fail(reply))
    }
}

#[derive(Debug)]
pub struct SMTPClient {
    config: Arc<MailConfig>,
}

impl SMTPClient {
    pub fn new(config: Arc<MailConfig>) -> SMTPClient {
        Self { config }
    }

    /// Delivers `html` to the configured recipient in a fresh connection.
    pub async fn send(&self, html: &str) -> Result<(), SMTPClientError> {
        let addr = (self.config.server.as_str(), self.config.port);
        let stream = TcpStream::connect(addr).await?;
        match self.config.security {
            SmtpSecurity::Plain => {
                let mut session = Session::new(stream);
                session.greeting().await?;
                self.deliver(session, html).await
            }
            SmtpSecurity::Tls => {
                let mut session = Session::new(self.tls(stream).await?);
                session.greeting().await?;
                self.deliver(session, html).await
            }
            SmtpSecurity::StartTls => {
                let mut session = Session::new(stream);
                session.greeting().await?;
                session.ehlo(self.helo_domain()).await?;
                session
                    .expect("STARTTLS", 220, SMTPClientError::StartTlsFailed)
                    .await?;
                let session = Session::new(self.tls(session.into_inner()).await?);
                self.deliver(session, html).await
            }
        }
    }

    async fn tls(
        &self,
        stream: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, SMTPClientError> {
        let mut root_cert_store = rustls::RootCertStore::empty();
        root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let domain = rustls_pki_types::ServerName::try_from(self.config.server.as_str())
            .map_err(|_| SMTPClientError::InvalidServerName(self.config.server.clone()))?
            .to_owned();
        Ok(connector.connect(domain, stream).await?)
    }

    async fn deliver<S>(&self, mut session: Session<S>, html: &str) -> Result<(), SMTPClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        session.ehlo(self.helo_domain()).await?;
        if !self.config.password.is_empty() {
            session
                .login(&self.config.username, &self.config.password)
                .await?;
        }

        let mail_from = format!("MAIL FROM:<{}>", self.config.sender);
        session
            .expect(&mail_from, 250, SMTPClientError::SendEmailFailed)
            .await?;
        let rcpt_to = format!("RCPT TO:<{}>", self.config.rcpt);
        session
            .expect(&rcpt_to, 250, SMTPClientError::SendEmailFailed)
            .await?;
        session
            .expect("DATA", 354, SMTPClientError::SendEmailFailed)
            .await?;

        let reply = session.send_data(&self.message(html)).await?;
        check_success(reply, 250, SMTPClientError::SendEmailFailed)?;
        session.quit().await;
        Ok(())
    }

    fn helo_domain(&self) -> &str {
        self.config.sender.domain()
    }

    /// Builds the RFC 5322 message: fixed headers and a base64 HTML body.
    pub fn message(&self, html: &str) -> String {
        let mut content = String::new();
        content.push_str(&format!(
            "From: {} <{}>\r\n",
            encode_header(&self.config.from_name, true),
            self.config.sender
        ));
        content.push_str(&format!("To: <{}>\r\n", self.config.rcpt));
        content.push_str(&format!(
            "Subject: {}\r\n",
            encode_header(&self.config.subject, false)
        ));
        content.push_str(&format!("Date: {}\r\n", chrono::Utc::now().to_rfc2822()));
        content.push_str("MIME-Version: 1.0\r\n");
        content.push_str("Content-Type: text/html; charset=utf-8\r\n");
        content.push_str("Content-Transfer-Encoding: base64\r\n\r\n");

        let encoded = BASE64_STANDARD.encode(html);
        let lines: Vec<&str> = encoded
            .as_bytes()
            .chunks(76)
            .filter_map(|chunk| std::str::from_utf8(chunk).ok())
            .collect();
        content.push_str(&lines.join("\r\n"));
        content
    }
}

/// RFC 2047 encodes non-ASCII header text; display names are quoted otherwise.
fn encode_header(value: &str, display_name: bool) -> String {
    if !value.is_ascii() {
        return format!("=?utf-8?b?{}?=", BASE64_STANDARD.encode(value));
    }
    if display_name {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_string()
    }
}
