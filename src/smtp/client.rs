//! Connection-per-message SMTP client over TCP with optional TLS.

use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use secrecy::ExposeSecret;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use super::auth::{AuthMethod, Credentials};
use super::protocol::{codes, EsmtpCapabilities, SmtpCommand, SmtpResponse};
use super::{SmtpClient, SmtpEnvelope};
use crate::config::{SmtpConfig, TlsMode};
use crate::errors::{MailerError, MailerErrorKind, MailerResult};
use crate::mime::prepare_data_content;

/// SMTP client opening one connection per message.
pub struct SmtpConnector {
    config: SmtpConfig,
    tls: TlsConnector,
}

impl std::fmt::Debug for SmtpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConnector")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("tls_mode", &self.config.tls_mode)
            .finish()
    }
}

impl SmtpConnector {
    /// Creates a client, loading the client certificate if one is configured.
    pub fn new(config: SmtpConfig) -> MailerResult<Self> {
        config.validate()?;
        let tls = TlsConnector::from(Arc::new(tls_config(&config)?));
        Ok(Self { config, tls })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    fn credentials(&self) -> Option<Credentials> {
        match (&self.config.username, &self.config.password) {
            (Some(username), Some(password)) => Some(Credentials::new(
                username.clone(),
                password.expose_secret().clone(),
            )),
            _ => None,
        }
    }

    async fn connect(&self) -> MailerResult<TcpStream> {
        let address = self.config.address();
        let stream = timeout(self.config.timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| MailerError::smtp(format!("Connect to {} timed out", address)))?
            .map_err(|e| {
                MailerError::new(
                    MailerErrorKind::Smtp,
                    format!("Connection to {} failed: {}", address, e),
                )
                .with_cause(e)
            })?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    async fn handshake(
        &self,
        stream: TcpStream,
    ) -> MailerResult<tokio_rustls::client::TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(self.config.host.clone())
            .map_err(|_| MailerError::smtp(format!("Invalid server name: {}", self.config.host)))?;

        timeout(self.config.timeout, self.tls.connect(server_name, stream))
            .await
            .map_err(|_| MailerError::smtp("TLS handshake timed out"))?
            .map_err(|e| {
                MailerError::new(MailerErrorKind::Smtp, format!("TLS handshake failed: {}", e))
                    .with_cause(e)
            })
    }

    async fn finish<S>(
        &self,
        mut channel: Channel<S>,
        capabilities: EsmtpCapabilities,
        tls_active: bool,
        envelope: &SmtpEnvelope,
        data: &[u8],
    ) -> MailerResult<SmtpResponse>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        if let Some(credentials) = self.credentials() {
            let allow_clear_text = tls_active || self.config.tls_mode == TlsMode::None;
            channel
                .authenticate(
                    &capabilities,
                    &credentials,
                    self.config.auth_method,
                    allow_clear_text,
                )
                .await?;
        }

        let reply = channel.transaction(&capabilities, envelope, data).await;
        channel.quit().await;
        reply
    }
}

#[async_trait]
impl SmtpClient for SmtpConnector {
    async fn send(&self, envelope: &SmtpEnvelope, data: &[u8]) -> MailerResult<SmtpResponse> {
        let client_id = self.config.client_id();
        let stream = self.connect().await?;

        if self.config.tls_mode == TlsMode::Implicit {
            let tls = self.handshake(stream).await?;
            let mut channel = Channel::new(BufReader::new(tls), self.config.timeout);
            channel.greeting().await?;
            let capabilities = channel.hello(client_id).await?;
            return self.finish(channel, capabilities, true, envelope, data).await;
        }

        let mut channel = Channel::new(BufReader::new(stream), self.config.timeout);
        channel.greeting().await?;
        let capabilities = channel.hello(client_id).await?;

        if self.config.tls_mode == TlsMode::StartTls && capabilities.starttls {
            let tls = self.handshake(channel.start_tls().await?).await?;
            tracing::debug!(host = %self.config.host, "Upgraded SMTP connection with STARTTLS");

            let mut channel = Channel::new(BufReader::new(tls), self.config.timeout);
            let capabilities = channel.hello(client_id).await?;
            return self.finish(channel, capabilities, true, envelope, data).await;
        }

        self.finish(channel, capabilities, false, envelope, data).await
    }
}

/// Builds the rustls client configuration, with a client certificate when configured.
fn tls_config(config: &SmtpConfig) -> MailerResult<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let builder = ClientConfig::builder().with_root_certificates(root_store);

    match (&config.cert_file, &config.key_file) {
        (Some(cert_file), Some(key_file)) => {
            let certs = load_certs(cert_file)?;
            let key = load_key(key_file)?;
            builder.with_client_auth_cert(certs, key).map_err(|e| {
                MailerError::configuration(format!("Invalid client certificate: {}", e))
            })
        }
        _ => Ok(builder.with_no_client_auth()),
    }
}

fn load_certs(path: &std::path::Path) -> MailerResult<Vec<CertificateDer<'static>>> {
    let mut reader = StdBufReader::new(File::open(path).map_err(|e| {
        MailerError::configuration(format!("Cannot read {}: {}", path.display(), e))
    })?);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| MailerError::configuration(format!("Invalid certificate {}: {}", path.display(), e)))
}

fn load_key(path: &std::path::Path) -> MailerResult<PrivateKeyDer<'static>> {
    let mut reader = StdBufReader::new(File::open(path).map_err(|e| {
        MailerError::configuration(format!("Cannot read {}: {}", path.display(), e))
    })?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| MailerError::configuration(format!("Invalid key {}: {}", path.display(), e)))?
        .ok_or_else(|| MailerError::configuration(format!("No private key in {}", path.display())))
}

impl<T> Channel<BufReader<T>>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Sends STARTTLS and hands back the raw stream for the TLS handshake.
    ///
    /// Bytes the server sent after its reply would be read as if they came
    /// over TLS, so any left in the read buffer abort the upgrade.
    pub(crate) async fn start_tls(mut self) -> MailerResult<T> {
        self.command(&SmtpCommand::StartTls).await?.expect_success()?;
        let reader = self.into_inner();
        if !reader.buffer().is_empty() {
            return Err(MailerError::smtp(
                "Server sent data after the STARTTLS reply",
            ));
        }
        Ok(reader.into_inner())
    }
}

/// Command/reply exchange over one established stream.
pub(crate) struct Channel<S> {
    io: S,
    timeout: Duration,
}

impl<S> Channel<S>
where
    S: AsyncBufRead + AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(io: S, timeout: Duration) -> Self {
        Self { io, timeout }
    }

    pub(crate) fn into_inner(self) -> S {
        self.io
    }

    /// Reads lines until a complete (possibly multiline) reply has arrived.
    pub(crate) async fn read_response(&mut self) -> MailerResult<SmtpResponse> {
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();
            let read = timeout(self.timeout, self.io.read_line(&mut line))
                .await
                .map_err(|_| MailerError::smtp("Read timed out"))??;

            if read == 0 {
                return Err(MailerError::smtp("Server closed connection"));
            }

            let line = line.trim_end().to_string();
            let is_continuation = line.as_bytes().get(3) == Some(&b'-');
            lines.push(line);

            if !is_continuation {
                break;
            }
        }

        let response = SmtpResponse::parse(&lines)?;
        tracing::debug!(code = response.code, message = %response.first_message(), "Received SMTP response");
        Ok(response)
    }

    async fn write(&mut self, data: &[u8]) -> MailerResult<()> {
        timeout(self.timeout, async {
            self.io.write_all(data).await?;
            self.io.flush().await
        })
        .await
        .map_err(|_| MailerError::smtp("Write timed out"))??;
        Ok(())
    }

    pub(crate) async fn command(&mut self, command: &SmtpCommand) -> MailerResult<SmtpResponse> {
        tracing::debug!(command = %command, "Sending SMTP command");
        self.write(format!("{}\r\n", command.line()).as_bytes())
            .await?;
        self.read_response().await
    }

    async fn line(&mut self, line: &str) -> MailerResult<SmtpResponse> {
        self.write(format!("{}\r\n", line).as_bytes()).await?;
        self.read_response().await
    }

    pub(crate) async fn greeting(&mut self) -> MailerResult<()> {
        self.read_response().await?.expect_code(codes::SERVICE_READY)?;
        Ok(())
    }

    /// Sends EHLO, falling back to HELO for servers without ESMTP.
    pub(crate) async fn hello(&mut self, client_id: &str) -> MailerResult<EsmtpCapabilities> {
        let response = self.command(&SmtpCommand::Ehlo(client_id.to_string())).await?;
        if response.is_success() {
            return Ok(EsmtpCapabilities::from_ehlo_response(&response));
        }

        self.command(&SmtpCommand::Helo(client_id.to_string()))
            .await?
            .expect_success()?;
        Ok(EsmtpCapabilities::default())
    }

    pub(crate) async fn authenticate(
        &mut self,
        capabilities: &EsmtpCapabilities,
        credentials: &Credentials,
        preferred: Option<AuthMethod>,
        allow_clear_text: bool,
    ) -> MailerResult<()> {
        let available: Vec<AuthMethod> = capabilities.auth_mechanisms.iter().copied().collect();
        let method = match preferred {
            Some(method) if method.is_clear_text() && !allow_clear_text => {
                return Err(MailerError::smtp(format!(
                    "Preferred auth method {} sends the password in clear text without TLS",
                    method
                )))
            }
            Some(method) if available.contains(&method) => method,
            Some(method) => {
                return Err(MailerError::smtp(format!(
                    "Preferred auth method {} not supported by server",
                    method
                )))
            }
            None => AuthMethod::select(&available, allow_clear_text)?,
        };
        tracing::debug!(method = %method, username = %credentials.username, "Authenticating");

        let mechanism = method.mechanism_name().to_string();
        let response = match method {
            AuthMethod::Plain => {
                self.command(&SmtpCommand::Auth {
                    mechanism,
                    initial_response: Some(credentials.plain_response()),
                })
                .await?
            }
            AuthMethod::Login => {
                self.command(&SmtpCommand::Auth {
                    mechanism,
                    initial_response: None,
                })
                .await?
                .expect_code(codes::AUTH_CONTINUE)?;
                self.line(&credentials.login_username())
                    .await?
                    .expect_code(codes::AUTH_CONTINUE)?;
                self.line(&credentials.login_password()).await?
            }
            AuthMethod::CramMd5 => {
                let challenge = self
                    .command(&SmtpCommand::Auth {
                        mechanism,
                        initial_response: None,
                    })
                    .await?
                    .expect_code(codes::AUTH_CONTINUE)?;
                let answer = credentials.cram_md5_response(challenge.first_message())?;
                self.line(&answer).await?
            }
        };

        response.expect_code(codes::AUTH_SUCCESS)?;
        Ok(())
    }

    /// Runs MAIL FROM, RCPT TO and DATA. Any rejected recipient aborts the transaction.
    pub(crate) async fn transaction(
        &mut self,
        capabilities: &EsmtpCapabilities,
        envelope: &SmtpEnvelope,
        data: &[u8],
    ) -> MailerResult<SmtpResponse> {
        let mail_from = SmtpCommand::MailFrom {
            address: envelope.from.clone(),
            size: capabilities.size.map(|_| data.len()),
            body_8bit: capabilities.eight_bit_mime && !data.is_ascii(),
        };
        if let Err(e) = self.command(&mail_from).await?.expect_success() {
            self.reset().await;
            return Err(e);
        }

        for recipient in &envelope.recipients {
            let response = self
                .command(&SmtpCommand::RcptTo {
                    address: recipient.clone(),
                })
                .await?;
            if !response.is_success() {
                self.reset().await;
                return Err(MailerError::from_smtp_response(
                    response.code,
                    format!("Recipient <{}> refused: {}", recipient, response.full_message()),
                ));
            }
        }

        self.command(&SmtpCommand::Data)
            .await?
            .expect_code(codes::START_MAIL_INPUT)?;
        self.write(&prepare_data_content(data)).await?;
        self.read_response().await?.expect_success()
    }

    async fn reset(&mut self) {
        if let Err(e) = self.command(&SmtpCommand::Rset).await {
            tracing::debug!(error = %e, "RSET failed");
        }
    }

    pub(crate) async fn quit(&mut self) {
        if let Err(e) = self.command(&SmtpCommand::Quit).await {
            tracing::debug!(error = %e, "QUIT failed");
        }
    }
}
