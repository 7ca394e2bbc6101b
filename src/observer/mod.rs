//! Bounce-receipt observer: polls the queue for notifications about inbound
//! mail, fetches the raw message from the bucket and replays it over SMTP
//! to the downstream host, retrying transient failures with a delay.

use std::sync::Arc;
use std::time::Duration;

use chrono::SecondsFormat;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::ApiError;
use crate::config::ObserverConfig;
use crate::logging;
use crate::observer::notification::{Envelope, RetryNotification};
use crate::observer::smtp::DownstreamClient;
use crate::observer::store::{ClientFactory, ObjectStoreApi, QueueApi, QueueItem};

pub mod notification;
pub mod smtp;
pub mod store;

pub use store::AwsClientFactory;

const CLIENT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct Observer {
    config: ObserverConfig,
    factory: Arc<dyn ClientFactory>,
    downstream: DownstreamClient,
    shutdown: CancellationToken,

    // lazily built and cached; dropped to force a rebuild after an error
    queue: Option<Arc<dyn QueueApi>>,
    store: Option<Arc<dyn ObjectStoreApi>>,
    queue_url: Option<String>,
}

impl Observer {
    pub fn new(
        config: ObserverConfig,
        factory: Arc<dyn ClientFactory>,
        shutdown: CancellationToken,
    ) -> Self {
        let downstream = DownstreamClient::new(config.smtp.clone());

        Self {
            config,
            factory,
            downstream,
            shutdown,
            queue: None,
            store: None,
            queue_url: None,
        }
    }

    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.observe(None).await;
            info!("observer stopped");
        })
    }

    /// Runs the poll loop; `count` bounds the number of receive iterations
    /// and is unbounded in production.
    pub async fn observe(&mut self, count: Option<usize>) {
        logging::event(
            "queue/observe",
            format!(
                "start observing {} messages",
                count.map(|c| c as i64).unwrap_or(-1)
            ),
        );

        let mut iterations = 0;
        while count.is_none_or(|c| iterations < c) && !self.shutdown.is_cancelled() {
            iterations += 1;

            let queue = match self.queue_client(false).await {
                Ok(queue) => queue,
                Err(err) => {
                    logging::event_error("queue/client", err.to_string());
                    self.backoff_and_reset().await;
                    continue;
                }
            };

            let queue_url = match self.resolve_queue_url(&queue).await {
                Ok(url) => url,
                Err(err) => {
                    logging::event_error("queue/url", err.to_string());
                    self.backoff_and_reset().await;
                    continue;
                }
            };

            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = queue.receive(
                    &queue_url,
                    self.config.max_messages,
                    self.config.visibility_timeout,
                    self.config.wait_time,
                ) => received,
            };

            let items = match received {
                Ok(items) => items,
                Err(err) => {
                    logging::event_error(
                        "queue/receive",
                        format!("error receiving messages, {err}"),
                    );
                    self.backoff_and_reset().await;
                    continue;
                }
            };

            for item in items {
                self.process_item(&queue_url, &item).await;
            }
        }
    }

    async fn process_item(&mut self, queue_url: &str, item: &QueueItem) {
        let envelope: Envelope = match serde_json::from_str(&item.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                // malformed items are removed so they cannot poison the queue
                logging::event_error("queue/envelope", err.to_string());
                self.delete_message(queue_url, item, None).await;
                return;
            }
        };

        if envelope.kind != Envelope::NOTIFICATION {
            logging::event_error(
                "queue/envelope",
                format!("unknown message type, {}", envelope.kind),
            );
            return;
        }

        let mut retry: RetryNotification = match serde_json::from_str(&envelope.message) {
            Ok(retry) => retry,
            Err(err) => {
                logging::event_error("queue/notification", err.to_string());
                self.delete_message(queue_url, item, None).await;
                return;
            }
        };

        let message_id = retry.notification.mail.message_id.clone();
        let key = format!("{}{}", self.config.key_prefix, message_id);

        let body = match self.fetch_message(&key).await {
            Ok(body) => body,
            Err(err) => {
                logging::event_error("observer/fetch", format!("msg={message_id} err={err}"));
                self.delete_message(queue_url, item, Some(&key)).await;
                return;
            }
        };

        let outcome = self.downstream.deliver(&retry.notification, &body).await;

        let from = &retry.notification.mail.common_headers.from;
        match &outcome.error {
            Some(err) if !err.retryable => logging::event_error(
                &format!("observer/send/{}", err.stage),
                format!(
                    "msg={message_id} abort={err} from={from:?} to={:?}",
                    retry.notification.mail.common_headers.to
                ),
            ),
            Some(err) => logging::event_error(
                &format!("observer/send/{}", err.stage),
                format!(
                    "msg={message_id} err={err} from={from:?} to={:?}",
                    outcome.recipients
                ),
            ),
            None => logging::event(
                "observer/send",
                format!(
                    "sent msg={message_id} from={from:?} to={:?}",
                    outcome.recipients
                ),
            ),
        }

        if outcome.retryable() {
            if let Err(err) = self.schedule_retry(queue_url, &envelope, &mut retry).await {
                logging::event_error("queue/retry", format!("err={err} msg={message_id}"));
            }
        }

        // the in-flight item is removed once a retry is enqueued or the
        // outcome is terminal
        self.delete_message(queue_url, item, Some(&key)).await;
    }

    /// Re-publishes the notification with an incremented retry counter, a
    /// fresh message id and the configured delivery delay. Does nothing once
    /// the retry budget is spent.
    async fn schedule_retry(
        &mut self,
        queue_url: &str,
        envelope: &Envelope,
        retry: &mut RetryNotification,
    ) -> Result<(), ApiError> {
        if self.config.retry_count == 0 {
            return Ok(());
        }
        if retry.retry_count + 1 >= self.config.retry_count {
            logging::event_error(
                "queue/retry",
                format!(
                    "retry budget exhausted msg={}",
                    retry.notification.mail.message_id
                ),
            );
            return Ok(());
        }

        retry.retry_count += 1;
        let message = serde_json::to_string(retry).map_err(|err| ApiError(err.to_string()))?;

        let mut next = envelope.clone();
        next.message = message;
        next.message_id = Uuid::new_v4().to_string();
        next.timestamp = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

        let body = serde_json::to_string(&next).map_err(|err| ApiError(err.to_string()))?;

        let queue = self.queue_client(false).await?;
        queue
            .publish(queue_url, &body, self.config.retry_delay_seconds)
            .await
    }

    /// Fetches the raw message, rebuilding the object-store client once on
    /// error before giving up.
    async fn fetch_message(&mut self, key: &str) -> Result<Vec<u8>, ApiError> {
        let mut last_err = None;

        for attempt in 0..2 {
            let store = self.store_client(attempt > 0).await?;
            match store.get(&self.config.bucket, key).await {
                Ok(body) => return Ok(body),
                Err(err) => last_err = Some(err),
            }
        }

        Err(last_err.unwrap_or_else(|| ApiError("object fetch failed".to_string())))
    }

    /// Removes the queue item and, when known, the stored object. Both are
    /// best-effort with one forced client rebuild; persistent failures only
    /// leave a log line, the item then reappears on a later poll.
    async fn delete_message(&mut self, queue_url: &str, item: &QueueItem, object_key: Option<&str>) {
        for attempt in 0..2 {
            match self.queue_client(attempt > 0).await {
                Ok(queue) => match queue.delete(queue_url, &item.receipt_handle).await {
                    Ok(()) => break,
                    Err(err) if attempt > 0 => {
                        logging::event_error("queue/delete", format!("err={err}"))
                    }
                    Err(_) => {}
                },
                Err(err) => {
                    logging::event_error("queue/delete", format!("err={err}"));
                    break;
                }
            }
        }

        let Some(key) = object_key else {
            return;
        };
        for attempt in 0..2 {
            match self.store_client(attempt > 0).await {
                Ok(store) => match store.delete(&self.config.bucket, key).await {
                    Ok(()) => break,
                    Err(err) if attempt > 0 => {
                        logging::event_error("bucket/delete", format!("err={err}"))
                    }
                    Err(_) => {}
                },
                Err(err) => {
                    logging::event_error("bucket/delete", format!("err={err}"));
                    break;
                }
            }
        }
    }

    async fn resolve_queue_url(&mut self, queue: &Arc<dyn QueueApi>) -> Result<String, ApiError> {
        if let Some(url) = &self.queue_url {
            return Ok(url.clone());
        }

        let url = queue.queue_url(&self.config.queue_name).await?;
        self.queue_url = Some(url.clone());
        Ok(url)
    }

    async fn queue_client(&mut self, reset: bool) -> Result<Arc<dyn QueueApi>, ApiError> {
        if !reset && let Some(queue) = &self.queue {
            return Ok(queue.clone());
        }

        let queue = self.factory.queue().await?;
        self.queue = Some(queue.clone());
        Ok(queue)
    }

    async fn store_client(&mut self, reset: bool) -> Result<Arc<dyn ObjectStoreApi>, ApiError> {
        if !reset && let Some(store) = &self.store {
            return Ok(store.clone());
        }

        let store = self.factory.object_store().await?;
        self.store = Some(store.clone());
        Ok(store)
    }

    async fn backoff_and_reset(&mut self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(CLIENT_ERROR_BACKOFF) => {}
        }
        self.queue = None;
    }
}
