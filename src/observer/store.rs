//! External queue and object-store interfaces used by the observer.
//!
//! The observer only ever talks to these traits; production wires in the
//! AWS-backed implementations below, tests inject mocks through
//! [`ClientFactory`]. The factory is also the reset seam: rebuilding a
//! client after a transport error means asking the factory again.

use std::sync::Arc;

use async_trait::async_trait;

use crate::ApiError;

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub body: String,
    pub receipt_handle: String,
    pub message_id: String,
}

#[async_trait]
pub trait QueueApi: Send + Sync {
    async fn queue_url(&self, name: &str) -> Result<String, ApiError>;

    async fn receive(
        &self,
        queue_url: &str,
        max_messages: i32,
        visibility_timeout: i32,
        wait_time: i32,
    ) -> Result<Vec<QueueItem>, ApiError>;

    async fn publish(&self, queue_url: &str, body: &str, delay_seconds: i32)
    -> Result<(), ApiError>;

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), ApiError>;
}

#[async_trait]
pub trait ObjectStoreApi: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ApiError>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), ApiError>;
}

#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn queue(&self) -> Result<Arc<dyn QueueApi>, ApiError>;

    async fn object_store(&self) -> Result<Arc<dyn ObjectStoreApi>, ApiError>;
}

/// Builds AWS-backed clients from the ambient credential chain.
pub struct AwsClientFactory;

#[async_trait]
impl ClientFactory for AwsClientFactory {
    async fn queue(&self) -> Result<Arc<dyn QueueApi>, ApiError> {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

        Ok(Arc::new(AwsQueue {
            client: aws_sdk_sqs::Client::new(&config),
        }))
    }

    async fn object_store(&self) -> Result<Arc<dyn ObjectStoreApi>, ApiError> {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

        Ok(Arc::new(AwsObjectStore {
            client: aws_sdk_s3::Client::new(&config),
        }))
    }
}

struct AwsQueue {
    client: aws_sdk_sqs::Client,
}

#[async_trait]
impl QueueApi for AwsQueue {
    async fn queue_url(&self, name: &str) -> Result<String, ApiError> {
        let output = self
            .client
            .get_queue_url()
            .queue_name(name)
            .send()
            .await
            .map_err(|err| ApiError(aws_sdk_sqs::error::DisplayErrorContext(&err).to_string()))?;

        output
            .queue_url
            .ok_or_else(|| ApiError(format!("no URL returned for queue {name}")))
    }

    async fn receive(
        &self,
        queue_url: &str,
        max_messages: i32,
        visibility_timeout: i32,
        wait_time: i32,
    ) -> Result<Vec<QueueItem>, ApiError> {
        let output = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(max_messages)
            .visibility_timeout(visibility_timeout)
            .wait_time_seconds(wait_time)
            .send()
            .await
            .map_err(|err| ApiError(aws_sdk_sqs::error::DisplayErrorContext(&err).to_string()))?;

        Ok(output
            .messages
            .unwrap_or_default()
            .into_iter()
            .map(|message| QueueItem {
                body: message.body.unwrap_or_default(),
                receipt_handle: message.receipt_handle.unwrap_or_default(),
                message_id: message.message_id.unwrap_or_default(),
            })
            .collect())
    }

    async fn publish(
        &self,
        queue_url: &str,
        body: &str,
        delay_seconds: i32,
    ) -> Result<(), ApiError> {
        self.client
            .send_message()
            .queue_url(queue_url)
            .message_body(body)
            .delay_seconds(delay_seconds)
            .send()
            .await
            .map(|_| ())
            .map_err(|err| ApiError(aws_sdk_sqs::error::DisplayErrorContext(&err).to_string()))
    }

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), ApiError> {
        self.client
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map(|_| ())
            .map_err(|err| ApiError(aws_sdk_sqs::error::DisplayErrorContext(&err).to_string()))
    }
}

struct AwsObjectStore {
    client: aws_sdk_s3::Client,
}

#[async_trait]
impl ObjectStoreApi for AwsObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ApiError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| ApiError(aws_sdk_s3::error::DisplayErrorContext(&err).to_string()))?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|err| ApiError(err.to_string()))?;

        Ok(body.into_bytes().to_vec())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), ApiError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map(|_| ())
            .map_err(|err| ApiError(aws_sdk_s3::error::DisplayErrorContext(&err).to_string()))
    }
}
