//! Relay clients that forward accepted messages to a cloud mail API.
//!
//! Two variants exist behind [`RelayClient`]: the raw-email API
//! ([`ses::SesRelay`]) and the structured email API
//! ([`pinpoint::PinpointRelay`]). Both wrap the same admission filter and
//! bounded body read; the API client behind each variant is injected at
//! construction, which is the seam tests use to swap in mocks.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::ApiError;
use crate::config::{Config, RelayApi};
use crate::filter::{FilterError, Filtered};

pub mod pinpoint;
pub mod ses;

pub use pinpoint::PinpointRelay;
pub use ses::SesRelay;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Denied(#[from] FilterError),
    #[error("message size exceeds limit of {0} bytes")]
    MessageTooLarge(usize),
    #[error("failed to read message data: {0}")]
    Read(std::io::Error),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// A sender for accepted ingress messages.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Checks the envelope sender alone, before any recipient is known.
    fn filter_from(&self, from: &str) -> Result<(), FilterError>;

    /// Partitions recipients into allowed and denied for the given sender.
    fn filter_to(&self, from: &str, to: &[String]) -> Filtered;

    /// Filters the envelope, reads the body up to the size limit and
    /// dispatches it to the external API. Every attempt leaves a mail log
    /// line. A "denied recipients" error still delivers to the allowed
    /// list; a denied sender delivers nothing.
    async fn send(
        &self,
        origin: IpAddr,
        from: &str,
        to: &[String],
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), RelayError>;
}

/// Builds the production relay client for the configured API variant.
pub async fn from_config(config: &Config) -> Arc<dyn RelayClient> {
    let aws = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

    match config.relay_api {
        RelayApi::Ses => Arc::new(SesRelay::new(
            config.filter.clone(),
            config.max_message_bytes,
            config.set_name.clone(),
            Arc::new(ses::AwsRawEmail::new(&aws)),
        )),
        RelayApi::Pinpoint => Arc::new(PinpointRelay::new(
            config.filter.clone(),
            config.max_message_bytes,
            config.set_name.clone(),
            Arc::new(pinpoint::AwsEmail::new(&aws)),
        )),
    }
}

/// Reads the whole body, failing as soon as more than `max` bytes arrive.
pub(crate) async fn read_bounded(
    data: &mut (dyn AsyncRead + Send + Unpin),
    max: usize,
) -> Result<Vec<u8>, RelayError> {
    let mut body = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        let n = data.read(&mut chunk).await.map_err(RelayError::Read)?;
        if n == 0 {
            return Ok(body);
        }
        if body.len() + n > max {
            return Err(RelayError::MessageTooLarge(max));
        }
        body.extend_from_slice(&chunk[..n]);
    }
}
