//! Client IP and credential validation for the ingress server.

use std::collections::HashSet;
use std::net::IpAddr;

use thiserror::Error;

use crate::cram::ServerExchange;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid client IP: {0}")]
    InvalidIp(IpAddr),
    #[error("invalid username: {0}")]
    InvalidUsername(String),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("authentication mechanism not available")]
    MechanismUnavailable,
    #[error("failed to derive password hash: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}

/// Configured account for ingress authentication.
///
/// LOGIN and PLAIN verify against the bcrypt hash; CRAM-MD5 needs the plain
/// shared secret. When only the plain secret is configured the hash is
/// derived from it once at startup.
#[derive(Debug, Clone)]
pub struct Credentials {
    username: String,
    password_hash: Option<String>,
    plain_secret: Option<String>,
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        password_hash: Option<String>,
        plain_secret: Option<String>,
    ) -> Result<Self, AuthError> {
        let password_hash = match (&password_hash, &plain_secret) {
            (None, Some(secret)) => Some(bcrypt::hash(secret, bcrypt::DEFAULT_COST)?),
            _ => password_hash,
        };

        Ok(Self {
            username: username.into(),
            password_hash,
            plain_secret,
        })
    }

    /// Reads `BCRYPT_HASH` and `PASSWORD` for the given username. An empty
    /// username means authentication is not configured.
    pub fn from_env(username: &str) -> Result<Option<Self>, AuthError> {
        if username.is_empty() {
            return Ok(None);
        }

        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        Self::new(username, non_empty("BCRYPT_HASH"), non_empty("PASSWORD")).map(Some)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn supports_cram(&self) -> bool {
        self.plain_secret.is_some()
    }

    pub fn supports_password(&self) -> bool {
        self.password_hash.is_some()
    }
}

/// Validates connections and AUTH attempts against the IP allowlist and the
/// configured credentials. With neither configured, everything is accepted.
#[derive(Debug, Clone, Default)]
pub struct Authenticator {
    allowlist: HashSet<IpAddr>,
    credentials: Option<Credentials>,
}

impl Authenticator {
    pub fn new(allowlist: HashSet<IpAddr>, credentials: Option<Credentials>) -> Self {
        Self {
            allowlist,
            credentials,
        }
    }

    pub fn ip_allowed(&self, ip: IpAddr) -> bool {
        self.allowlist.is_empty() || self.allowlist.contains(&ip)
    }

    /// Whether sessions must authenticate before MAIL.
    pub fn requires_auth(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn offers_password_auth(&self) -> bool {
        self.credentials
            .as_ref()
            .is_some_and(Credentials::supports_password)
    }

    pub fn offers_cram(&self) -> bool {
        self.credentials
            .as_ref()
            .is_some_and(Credentials::supports_cram)
    }

    /// Verifies a LOGIN or PLAIN attempt.
    pub fn verify_password(
        &self,
        ip: IpAddr,
        username: &str,
        password: &str,
    ) -> Result<(), AuthError> {
        if !self.ip_allowed(ip) {
            return Err(AuthError::InvalidIp(ip));
        }

        let Some(credentials) = &self.credentials else {
            return Ok(());
        };

        if username != credentials.username {
            return Err(AuthError::InvalidUsername(username.to_string()));
        }

        let hash = credentials
            .password_hash
            .as_deref()
            .ok_or(AuthError::MechanismUnavailable)?;

        match bcrypt::verify(password, hash) {
            Ok(true) => Ok(()),
            _ => Err(AuthError::InvalidCredentials),
        }
    }

    /// Starts a CRAM-MD5 exchange for one AUTH attempt.
    pub fn start_cram(&self, ip: IpAddr) -> Result<ServerExchange, AuthError> {
        if !self.ip_allowed(ip) {
            return Err(AuthError::InvalidIp(ip));
        }

        let Some(credentials) = &self.credentials else {
            return Err(AuthError::MechanismUnavailable);
        };
        let secret = credentials
            .plain_secret
            .as_deref()
            .ok_or(AuthError::MechanismUnavailable)?;

        Ok(ServerExchange::new(credentials.username.clone(), secret))
    }
}
