use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::{self, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::config::Config;
use crate::relay::RelayClient;
use crate::smtp::connection::{self, ConnectionError, DebugMirror, Limits, Next};
use crate::smtp::session::Session;

#[derive(Debug, Error)]
pub enum SmtpServerError {
    #[error("failed to load private key: {0}")]
    PrivateKey(io::Error),
    #[error("no private key found in the key file")]
    PrivateKeyNotFound,
    #[error("failed to decrypt private key: {0}")]
    PrivateKeyDecrypt(String),
    #[error("failed to load certificate: {0}")]
    Certificate(io::Error),
    #[error("failed to listen on address: {0}")]
    Listen(io::Error),
    #[error("failed to configure TLS: {0}")]
    Tls(rustls::Error),
    #[error("failed to open debug sink: {0}")]
    Debug(io::Error),
}

pub struct SmtpServer {
    config: Arc<Config>,
    relay: Arc<dyn RelayClient>,
    shutdown: CancellationToken,
}

impl SmtpServer {
    pub fn new(
        config: Arc<Config>,
        relay: Arc<dyn RelayClient>,
        shutdown: CancellationToken,
    ) -> SmtpServer {
        SmtpServer {
            config,
            relay,
            shutdown,
        }
    }

    fn load_tls_config(
        &self,
    ) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>, SmtpServerError>
    {
        let (Some(cert_file), Some(key_file)) = (&self.config.cert_file, &self.config.key_file)
        else {
            return Ok(None);
        };

        let mut cert_reader =
            io::BufReader::new(File::open(cert_file).map_err(SmtpServerError::Certificate)?);
        let certs = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, io::Error>>()
            .map_err(SmtpServerError::Certificate)?;

        Ok(Some((certs, load_private_key(key_file)?)))
    }

    fn build_tls_acceptor(&self) -> Result<Option<TlsAcceptor>, SmtpServerError> {
        let Some((certs, key)) = self.load_tls_config()? else {
            return Ok(None);
        };

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(SmtpServerError::Tls)?;

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }

    pub async fn serve(self) -> Result<(), SmtpServerError> {
        if CryptoProvider::get_default().is_none() {
            CryptoProvider::install_default(crypto::aws_lc_rs::default_provider())
                .expect("failed to install crypto provider");
        }

        let listener = TcpListener::bind(&self.config.addr)
            .await
            .map_err(SmtpServerError::Listen)?;

        let acceptor = self.build_tls_acceptor()?;
        let mirror = DebugMirror::from_config(&self.config.debug)
            .map_err(SmtpServerError::Debug)?
            .map(Arc::new);

        let greeting = if self.config.host.is_empty() {
            format!("{} ESMTP Service ready", self.config.name)
        } else {
            format!("{} {} ESMTP Service ready", self.config.host, self.config.name)
        };

        info!("smtp server on {}", self.config.addr);

        loop {
            select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutting down smtp server");

                    return Ok(());
                }
                result = listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        trace!(
                            source_ip = peer_addr.ip().to_string(),
                            source_port = peer_addr.port(),
                            "new TCP connection"
                        );

                        let config = self.config.clone();
                        let relay = self.relay.clone();
                        let acceptor = acceptor.clone();
                        let mirror = mirror.clone();
                        let greeting = greeting.clone();

                        let task = async move || {
                            handle_connection(stream, peer_addr.ip(), config, relay, acceptor, mirror, greeting)
                                .await
                        };

                        tokio::spawn(async {
                            if let Err(err) = task().await {
                                if matches!(err, ConnectionError::Dropped) {
                                    trace!("failed to handle connection: {err}");
                                    return;
                                }
                                error!("failed to handle connection: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        error!("failed to accept connection: {}", err);
                    }
                },
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async {
            if let Err(e) = self.serve().await {
                error!("smtp server error: {:?}", e);
            }
        })
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer_ip: std::net::IpAddr,
    config: Arc<Config>,
    relay: Arc<dyn RelayClient>,
    acceptor: Option<TlsAcceptor>,
    mirror: Option<Arc<DebugMirror>>,
    greeting: String,
) -> Result<(), ConnectionError> {
    if !config.authenticator.ip_allowed(peer_ip) {
        debug!("rejecting connection from {peer_ip}: not in the allowlist");
        stream
            .write_all(b"554 5.7.1 Access denied\r\n")
            .await
            .map_err(ConnectionError::Write)?;
        return Ok(());
    }

    let limits = Limits {
        read_timeout: config.read_timeout,
        write_timeout: config.write_timeout,
    };
    let mirror = mirror.as_deref();

    let mut session = Session::new(
        peer_ip,
        relay,
        config.authenticator.clone(),
        config.max_message_bytes,
        config.start_tls,
        acceptor.is_some(),
    );

    if config.only_tls {
        let Some(acceptor) = acceptor else {
            return Ok(());
        };
        let tls_stream = acceptor
            .accept(stream)
            .await
            .map_err(ConnectionError::Accept)?;
        session.tls_established();

        connection::run(tls_stream, &mut session, &limits, Some(&greeting), mirror).await?;
        return Ok(());
    }

    match connection::run(stream, &mut session, &limits, Some(&greeting), mirror).await? {
        Next::Done => Ok(()),
        Next::UpgradeTls(stream) => {
            // the session only accepts STARTTLS when an acceptor exists
            let Some(acceptor) = acceptor else {
                return Ok(());
            };
            let tls_stream = acceptor
                .accept(stream)
                .await
                .map_err(ConnectionError::Accept)?;
            session.tls_established();

            connection::run(tls_stream, &mut session, &limits, None, mirror).await?;
            Ok(())
        }
    }
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, SmtpServerError> {
    match std::env::var("TLS_KEY_PASS") {
        Ok(pass) if !pass.is_empty() => {
            let pem = std::fs::read(path).map_err(SmtpServerError::PrivateKey)?;
            let (label, der) = pem_rfc7468::decode_vec(&pem)
                .map_err(|err| SmtpServerError::PrivateKeyDecrypt(err.to_string()))?;
            if label != "ENCRYPTED PRIVATE KEY" {
                return Err(SmtpServerError::PrivateKeyDecrypt(format!(
                    "unexpected PEM label: {label}"
                )));
            }

            let decrypted = pkcs8::EncryptedPrivateKeyInfo::try_from(der.as_slice())
                .map_err(|err| SmtpServerError::PrivateKeyDecrypt(err.to_string()))?
                .decrypt(pass.as_bytes())
                .map_err(|err| SmtpServerError::PrivateKeyDecrypt(err.to_string()))?;

            Ok(PrivateKeyDer::from(PrivatePkcs8KeyDer::from(
                decrypted.as_bytes().to_vec(),
            )))
        }
        _ => {
            let mut key_reader =
                io::BufReader::new(File::open(path).map_err(SmtpServerError::PrivateKey)?);
            rustls_pemfile::private_key(&mut key_reader)
                .map_err(SmtpServerError::PrivateKey)?
                .ok_or(SmtpServerError::PrivateKeyNotFound)
        }
    }
}
