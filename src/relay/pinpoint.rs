//! Structured-email relay variant.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_pinpointemail::error::DisplayErrorContext;
use aws_sdk_pinpointemail::primitives::Blob;
use aws_sdk_pinpointemail::types::{Destination, EmailContent, RawMessage};
use tokio::io::AsyncRead;

use crate::ApiError;
use crate::filter::{FilterError, FilterPolicy, Filtered};
use crate::logging;
use crate::relay::{RelayClient, RelayError, read_bounded};

/// The structured send operation of the newer email API.
#[async_trait]
pub trait EmailApi: Send + Sync {
    async fn send_email(
        &self,
        from_address: &str,
        to_addresses: &[String],
        data: &[u8],
        configuration_set: Option<&str>,
    ) -> Result<(), ApiError>;
}

pub struct AwsEmail {
    client: aws_sdk_pinpointemail::Client,
}

impl AwsEmail {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_pinpointemail::Client::new(config),
        }
    }
}

#[async_trait]
impl EmailApi for AwsEmail {
    async fn send_email(
        &self,
        from_address: &str,
        to_addresses: &[String],
        data: &[u8],
        configuration_set: Option<&str>,
    ) -> Result<(), ApiError> {
        let raw = RawMessage::builder()
            .data(Blob::new(data))
            .build()
            .map_err(|err| ApiError(err.to_string()))?;

        self.client
            .send_email()
            .from_email_address(from_address)
            .destination(
                Destination::builder()
                    .set_to_addresses(Some(to_addresses.to_vec()))
                    .build(),
            )
            .content(EmailContent::builder().raw(raw).build())
            .set_configuration_set_name(configuration_set.map(str::to_string))
            .send()
            .await
            .map(|_| ())
            .map_err(|err| ApiError(DisplayErrorContext(&err).to_string()))
    }
}

pub struct PinpointRelay {
    policy: FilterPolicy,
    max_message_bytes: usize,
    set_name: Option<String>,
    api: Arc<dyn EmailApi>,
}

impl PinpointRelay {
    pub fn new(
        policy: FilterPolicy,
        max_message_bytes: usize,
        set_name: Option<String>,
        api: Arc<dyn EmailApi>,
    ) -> Self {
        Self {
            policy,
            max_message_bytes,
            set_name,
            api,
        }
    }
}

#[async_trait]
impl RelayClient for PinpointRelay {
    fn filter_from(&self, from: &str) -> Result<(), FilterError> {
        self.policy.check_from(from)
    }

    fn filter_to(&self, from: &str, to: &[String]) -> Filtered {
        self.policy.filter(from, to)
    }

    async fn send(
        &self,
        origin: IpAddr,
        from: &str,
        to: &[String],
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), RelayError> {
        let Filtered {
            allowed,
            denied,
            error,
        } = self.policy.filter(from, to);

        if error == Some(FilterError::DeniedSender) {
            logging::mail(origin, from, &denied, Some(&FilterError::DeniedSender));
            return Err(FilterError::DeniedSender.into());
        }
        if let Some(denial) = error {
            logging::mail(origin, from, &denied, Some(&denial));
        }

        if !allowed.is_empty() {
            let body = match read_bounded(data, self.max_message_bytes).await {
                Ok(body) => body,
                Err(err) => {
                    logging::mail(origin, from, &allowed, Some(&err));
                    return Err(err);
                }
            };

            let result = self
                .api
                .send_email(from, &allowed, &body, self.set_name.as_deref())
                .await;
            logging::mail(
                origin,
                from,
                &allowed,
                result
                    .as_ref()
                    .err()
                    .map(|err| err as &dyn std::fmt::Display),
            );
            result?;
        }

        match error {
            Some(denial) => Err(denial.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct EmailSend {
        from_address: String,
        to_addresses: Vec<String>,
        data: Vec<u8>,
        configuration_set: Option<String>,
    }

    #[derive(Default)]
    struct MockEmailApi {
        sent: Mutex<Vec<EmailSend>>,
        fail_with: Mutex<Option<String>>,
    }

    #[async_trait]
    impl EmailApi for MockEmailApi {
        async fn send_email(
            &self,
            from_address: &str,
            to_addresses: &[String],
            data: &[u8],
            configuration_set: Option<&str>,
        ) -> Result<(), ApiError> {
            self.sent.lock().unwrap().push(EmailSend {
                from_address: from_address.to_string(),
                to_addresses: to_addresses.to_vec(),
                data: data.to_vec(),
                configuration_set: configuration_set.map(str::to_string),
            });
            match self.fail_with.lock().unwrap().clone() {
                Some(message) => Err(ApiError(message)),
                None => Ok(()),
            }
        }
    }

    fn origin() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn delivers_through_the_email_api() {
        let api = Arc::new(MockEmailApi::default());
        let relay = PinpointRelay::new(
            FilterPolicy::default(),
            1024,
            Some("events".to_string()),
            api.clone(),
        );

        relay
            .send(
                origin(),
                "alice@example.org",
                &["bob@example.org".to_string()],
                &mut b"TEST".as_slice(),
            )
            .await
            .unwrap();

        let sent = api.sent.lock().unwrap();
        assert_eq!(
            *sent,
            vec![EmailSend {
                from_address: "alice@example.org".to_string(),
                to_addresses: vec!["bob@example.org".to_string()],
                data: b"TEST".to_vec(),
                configuration_set: Some("events".to_string()),
            }]
        );
    }

    #[tokio::test]
    async fn api_error_is_propagated() {
        let api = Arc::new(MockEmailApi::default());
        *api.fail_with.lock().unwrap() = Some("quota exceeded".to_string());
        let relay = PinpointRelay::new(FilterPolicy::default(), 1024, None, api.clone());

        let result = relay
            .send(
                origin(),
                "alice@example.org",
                &["bob@example.org".to_string()],
                &mut b"TEST".as_slice(),
            )
            .await;

        assert!(matches!(result, Err(RelayError::Api(ApiError(m))) if m == "quota exceeded"));
    }
}
