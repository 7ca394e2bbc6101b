//! Downstream SMTP delivery for fetched messages.
//!
//! Each delivery is one full SMTP conversation; failures carry the stage
//! they occurred in and whether the observer should retry. A reply in the
//! permanent-negative class (5xx) is final, everything else is considered
//! transient. The connection is closed on every exit path.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use mail_send::SmtpClient;
use mail_send::smtp::message::Parameters;
use smtp_proto::Severity;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, SignatureScheme};
use tracing::trace;

use crate::config::DownstreamConfig;
use crate::cram;
use crate::observer::notification::Notification;

const CONVERSATION_TIMEOUT: Duration = Duration::from_secs(60);

/// The point in the conversation a failure occurred at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Dial,
    Hello,
    StartTls,
    Auth,
    Mail,
    Rcpt,
    Data,
    Copy,
    Close,
    Quit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Dial => "Dial",
            Stage::Hello => "Hello",
            Stage::StartTls => "StartTLS",
            Stage::Auth => "Auth",
            Stage::Mail => "Mail",
            Stage::Rcpt => "Rcpt",
            Stage::Data => "Data",
            Stage::Copy => "Copy",
            Stage::Close => "Close",
            Stage::Quit => "Quit",
        })
    }
}

#[derive(Debug)]
pub struct DeliveryError {
    pub stage: Stage,
    pub retryable: bool,
    pub message: String,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// The result of one delivery attempt: the recipients the downstream host
/// accepted, and the failure that ended the conversation, if any.
#[derive(Debug, Default)]
pub struct Outcome {
    pub recipients: Vec<String>,
    pub error: Option<DeliveryError>,
}

impl Outcome {
    pub fn retryable(&self) -> bool {
        self.error.as_ref().is_some_and(|err| err.retryable)
    }
}

pub struct DownstreamClient {
    config: DownstreamConfig,
}

impl DownstreamClient {
    pub fn new(config: DownstreamConfig) -> Self {
        Self { config }
    }

    pub async fn deliver(&self, notification: &Notification, body: &[u8]) -> Outcome {
        let mut builder =
            mail_send::SmtpClientBuilder::new(self.config.host.as_str(), self.config.port)
                .say_ehlo(false)
                .timeout(CONVERSATION_TIMEOUT);
        if self.config.insecure_tls {
            builder = builder.allow_invalid_certs();
        }

        if self.config.connection_tls {
            match builder.connect().await {
                Ok(client) => self.converse(client, notification, body).await,
                Err(err) => fail(Vec::new(), Stage::Dial, err.to_string(), true),
            }
        } else {
            let mut client = match builder.connect_plain().await {
                Ok(client) => client,
                Err(err) => return fail(Vec::new(), Stage::Dial, err.to_string(), true),
            };

            if !self.config.force_starttls {
                return self.converse(client, notification, body).await;
            }

            // STARTTLS needs a first EHLO on the clear-text stream
            if let Err(err) = client.ehlo(&self.config.my_name).await {
                let _ = client.quit().await;
                return fail(Vec::new(), Stage::Hello, err.to_string(), true);
            }
            let connector = tls_connector(self.config.insecure_tls);
            match client.start_tls(&connector, &self.config.host).await {
                Ok(client) => self.converse(client, notification, body).await,
                Err(err) => fail(Vec::new(), Stage::StartTls, err.to_string(), true),
            }
        }
    }

    /// Runs the conversation from EHLO to QUIT on an established stream.
    async fn converse<T>(
        &self,
        mut client: SmtpClient<T>,
        notification: &Notification,
        body: &[u8],
    ) -> Outcome
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if let Err(err) = client.ehlo(&self.config.my_name).await {
            let _ = client.quit().await;
            return fail(Vec::new(), Stage::Hello, err.to_string(), true);
        }

        if !self.config.user.is_empty() && !self.config.pass.is_empty() {
            if let Err(message) = self.authenticate(&mut client).await {
                let _ = client.quit().await;
                return fail(Vec::new(), Stage::Auth, message, true);
            }
        }

        let Some(from) = notification.from_address() else {
            let _ = client.quit().await;
            return fail(
                Vec::new(),
                Stage::Mail,
                "no from address found".to_string(),
                false,
            );
        };
        if let Err(err) = client.mail_from(from, &Parameters::default()).await {
            let retryable = classify(&err);
            let _ = client.quit().await;
            return fail(Vec::new(), Stage::Mail, err.to_string(), retryable);
        }

        let mut accepted = Vec::new();
        for recipient in &notification.receipt.recipients {
            match client.rcpt_to(recipient, &Parameters::default()).await {
                Ok(()) => accepted.push(recipient.clone()),
                Err(err) => trace!("recipient {recipient} refused: {err}"),
            }
        }
        if accepted.is_empty() {
            let _ = client.quit().await;
            return fail(
                accepted,
                Stage::Rcpt,
                "no valid recipients".to_string(),
                false,
            );
        }

        match client.cmd(b"DATA\r\n").await {
            Ok(reply) if reply.code() == 354 => {}
            Ok(reply) => {
                let retryable = reply.severity() != Severity::PermanentNegativeCompletion;
                let message = format!("{} {}", reply.code(), reply.message());
                let _ = client.quit().await;
                return fail(accepted, Stage::Data, message, retryable);
            }
            Err(err) => {
                let retryable = classify(&err);
                let _ = client.quit().await;
                return fail(accepted, Stage::Data, err.to_string(), retryable);
            }
        }

        if let Err(err) = write_body(&mut client, body).await {
            let _ = client.quit().await;
            return fail(accepted, Stage::Copy, err.to_string(), true);
        }

        match client.cmd(b"\r\n.\r\n").await {
            Ok(reply) if reply.severity() == Severity::PositiveCompletion => {}
            Ok(reply) => {
                let retryable = reply.severity() != Severity::PermanentNegativeCompletion;
                let message = format!("{} {}", reply.code(), reply.message());
                let _ = client.quit().await;
                return fail(accepted, Stage::Close, message, retryable);
            }
            Err(err) => {
                let retryable = classify(&err);
                let _ = client.quit().await;
                return fail(accepted, Stage::Close, err.to_string(), retryable);
            }
        }

        let error = client
            .quit()
            .await
            .err()
            .map(|err| DeliveryError {
                stage: Stage::Quit,
                retryable: false,
                message: err.to_string(),
            });

        Outcome {
            recipients: accepted,
            error,
        }
    }

    async fn authenticate<T>(&self, client: &mut SmtpClient<T>) -> Result<(), String>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let reply = client
            .cmd(b"AUTH CRAM-MD5\r\n")
            .await
            .map_err(|err| err.to_string())?;
        if reply.code() != 334 {
            return Err(format!("{} {}", reply.code(), reply.message()));
        }

        let response = cram::client_respond(&self.config.user, &self.config.pass, reply.message())
            .map_err(|err| err.to_string())?;
        let reply = client
            .cmd(format!("{response}\r\n").as_bytes())
            .await
            .map_err(|err| err.to_string())?;
        if reply.code() != 235 {
            return Err(format!("{} {}", reply.code(), reply.message()));
        }

        Ok(())
    }
}

fn fail(recipients: Vec<String>, stage: Stage, message: String, retryable: bool) -> Outcome {
    Outcome {
        recipients,
        error: Some(DeliveryError {
            stage,
            retryable,
            message,
        }),
    }
}

fn classify(err: &mail_send::Error) -> bool {
    match err {
        mail_send::Error::UnexpectedReply(reply)
        | mail_send::Error::AuthenticationFailed(reply) => {
            reply.severity() != Severity::PermanentNegativeCompletion
        }
        _ => true,
    }
}

/// Writes the message body with the RFC 5321 transparency procedure, without
/// the trailing terminator.
async fn write_body<T>(client: &mut SmtpClient<T>, body: &[u8]) -> std::io::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    tokio::time::timeout(CONVERSATION_TIMEOUT, async {
        let mut last = 0;
        let mut state = 0u8; // 1 after CR, 2 after CRLF

        for (pos, &byte) in body.iter().enumerate() {
            if byte == b'.' && state == 2 {
                client.stream.write_all(&body[last..pos]).await?;
                client.stream.write_all(b".").await?;
                last = pos;
            }
            state = match byte {
                b'\r' => 1,
                b'\n' if state == 1 => 2,
                _ => 0,
            };
        }
        client.stream.write_all(&body[last..]).await?;
        client.stream.flush().await
    })
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out writing message"))?
}

fn tls_connector(allow_invalid_certs: bool) -> TlsConnector {
    let config = if allow_invalid_certs {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    TlsConnector::from(Arc::new(config))
}

#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
