//! Raw-email relay variant.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_ses::error::DisplayErrorContext;
use aws_sdk_ses::primitives::Blob;
use aws_sdk_ses::types::RawMessage;
use tokio::io::AsyncRead;

use crate::ApiError;
use crate::filter::{FilterError, FilterPolicy, Filtered};
use crate::logging;
use crate::relay::{RelayClient, RelayError, read_bounded};

/// The raw-email send operation of the external mail service.
#[async_trait]
pub trait RawEmailApi: Send + Sync {
    async fn send_raw(
        &self,
        source: &str,
        destinations: &[String],
        data: &[u8],
        configuration_set: Option<&str>,
    ) -> Result<(), ApiError>;
}

pub struct AwsRawEmail {
    client: aws_sdk_ses::Client,
}

impl AwsRawEmail {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_ses::Client::new(config),
        }
    }
}

#[async_trait]
impl RawEmailApi for AwsRawEmail {
    async fn send_raw(
        &self,
        source: &str,
        destinations: &[String],
        data: &[u8],
        configuration_set: Option<&str>,
    ) -> Result<(), ApiError> {
        let raw = RawMessage::builder()
            .data(Blob::new(data))
            .build()
            .map_err(|err| ApiError(err.to_string()))?;

        self.client
            .send_raw_email()
            .source(source)
            .set_destinations(Some(destinations.to_vec()))
            .raw_message(raw)
            .set_configuration_set_name(configuration_set.map(str::to_string))
            .send()
            .await
            .map(|_| ())
            .map_err(|err| ApiError(DisplayErrorContext(&err).to_string()))
    }
}

pub struct SesRelay {
    policy: FilterPolicy,
    max_message_bytes: usize,
    set_name: Option<String>,
    api: Arc<dyn RawEmailApi>,
}

impl SesRelay {
    pub fn new(
        policy: FilterPolicy,
        max_message_bytes: usize,
        set_name: Option<String>,
        api: Arc<dyn RawEmailApi>,
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
impl RelayClient for SesRelay {
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
                .send_raw(from, &allowed, &body, self.set_name.as_deref())
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
pub(crate) mod test {
    use super::*;
    use regex::Regex;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct RawSend {
        pub source: String,
        pub destinations: Vec<String>,
        pub data: Vec<u8>,
        pub configuration_set: Option<String>,
    }

    #[derive(Default)]
    pub(crate) struct MockRawEmailApi {
        pub sent: Mutex<Vec<RawSend>>,
        pub fail_with: Mutex<Option<String>>,
    }

    #[async_trait]
    impl RawEmailApi for MockRawEmailApi {
        async fn send_raw(
            &self,
            source: &str,
            destinations: &[String],
            data: &[u8],
            configuration_set: Option<&str>,
        ) -> Result<(), ApiError> {
            self.sent.lock().unwrap().push(RawSend {
                source: source.to_string(),
                destinations: destinations.to_vec(),
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

    fn to_list(addrs: &[&str]) -> Vec<String> {
        addrs.iter().map(|a| a.to_string()).collect()
    }

    fn relay(policy: FilterPolicy, api: Arc<MockRawEmailApi>) -> SesRelay {
        SesRelay::new(policy, 1024, None, api)
    }

    #[tokio::test]
    async fn delivers_raw_message() {
        let api = Arc::new(MockRawEmailApi::default());
        let relay = relay(FilterPolicy::default(), api.clone());

        relay
            .send(
                origin(),
                "alice@example.org",
                &to_list(&["bob@example.org"]),
                &mut b"TEST".as_slice(),
            )
            .await
            .unwrap();

        let sent = api.sent.lock().unwrap();
        assert_eq!(
            *sent,
            vec![RawSend {
                source: "alice@example.org".to_string(),
                destinations: to_list(&["bob@example.org"]),
                data: b"TEST".to_vec(),
                configuration_set: None,
            }]
        );
    }

    #[tokio::test]
    async fn denied_sender_makes_no_api_call() {
        let api = Arc::new(MockRawEmailApi::default());
        let policy = FilterPolicy::new(
            Some(Regex::new(r"^admin@example\.org$").unwrap()),
            None,
        );
        let relay = relay(policy, api.clone());

        let result = relay
            .send(
                origin(),
                "alice@example.org",
                &to_list(&["bob@example.org"]),
                &mut b"TEST".as_slice(),
            )
            .await;

        assert!(matches!(
            result,
            Err(RelayError::Denied(FilterError::DeniedSender))
        ));
        assert!(api.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn denied_recipients_still_deliver_to_allowed() {
        let api = Arc::new(MockRawEmailApi::default());
        let policy = FilterPolicy::new(None, Some(Regex::new(r"^bob@example\.org$").unwrap()));
        let relay = relay(policy, api.clone());

        let result = relay
            .send(
                origin(),
                "alice@example.org",
                &to_list(&["bob@example.org", "charlie@example.org"]),
                &mut b"TEST".as_slice(),
            )
            .await;

        assert!(matches!(
            result,
            Err(RelayError::Denied(FilterError::DeniedRecipients))
        ));
        let sent = api.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destinations, to_list(&["charlie@example.org"]));
    }

    #[tokio::test]
    async fn oversized_message_is_rejected_before_the_api() {
        let api = Arc::new(MockRawEmailApi::default());
        let relay = SesRelay::new(FilterPolicy::default(), 16, None, api.clone());
        let body = vec![b'x'; 17];

        let result = relay
            .send(
                origin(),
                "alice@example.org",
                &to_list(&["bob@example.org"]),
                &mut body.as_slice(),
            )
            .await;

        assert!(matches!(result, Err(RelayError::MessageTooLarge(16))));
        assert!(api.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn api_error_is_propagated() {
        let api = Arc::new(MockRawEmailApi::default());
        *api.fail_with.lock().unwrap() = Some("throttled".to_string());
        let relay = relay(FilterPolicy::default(), api.clone());

        let result = relay
            .send(
                origin(),
                "alice@example.org",
                &to_list(&["bob@example.org"]),
                &mut b"TEST".as_slice(),
            )
            .await;

        assert!(matches!(result, Err(RelayError::Api(ApiError(m))) if m == "throttled"));
    }

    #[tokio::test]
    async fn configuration_set_is_forwarded() {
        let api = Arc::new(MockRawEmailApi::default());
        let relay = SesRelay::new(
            FilterPolicy::default(),
            1024,
            Some("bounces".to_string()),
            api.clone(),
        );

        relay
            .send(
                origin(),
                "alice@example.org",
                &to_list(&["bob@example.org"]),
                &mut b"TEST".as_slice(),
            )
            .await
            .unwrap();

        assert_eq!(
            api.sent.lock().unwrap()[0].configuration_set.as_deref(),
            Some("bounces")
        );
    }
}
