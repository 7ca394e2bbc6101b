//! Queue payload types describing inbound mail stored in the bucket.
//!
//! The outer envelope uses PascalCase field names and carries the inner
//! notification as a JSON string; the inner document uses camelCase. Both
//! round-trip through serde so a retried notification preserves every field
//! it arrived with.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "MessageId")]
    pub message_id: String,
    #[serde(rename = "TopicArn")]
    pub topic_arn: String,
    #[serde(rename = "Subject")]
    pub subject: String,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "SignatureVersion")]
    pub signature_version: String,
    #[serde(rename = "Signature")]
    pub signature: String,
    #[serde(rename = "SigningCertURL")]
    pub signing_cert_url: String,
    #[serde(rename = "UnsubscribeURL")]
    pub unsubscribe_url: String,
}

impl Envelope {
    pub const NOTIFICATION: &str = "Notification";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Notification {
    pub notification_type: String,
    pub mail: Mail,
    pub receipt: Receipt,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Mail {
    pub timestamp: String,
    pub source: String,
    pub message_id: String,
    pub destination: Vec<String>,
    pub headers_truncated: bool,
    pub headers: Vec<Header>,
    pub common_headers: CommonHeaders,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommonHeaders {
    pub return_path: String,
    pub from: Vec<String>,
    pub date: String,
    pub to: Vec<String>,
    pub message_id: String,
    pub subject: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Receipt {
    pub timestamp: String,
    pub processing_time_millis: u64,
    pub recipients: Vec<String>,
    pub spam_verdict: Verdict,
    pub virus_verdict: Verdict,
    pub spf_verdict: Verdict,
    pub dkim_verdict: Verdict,
    pub dmarc_verdict: Verdict,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Verdict {
    pub status: String,
}

/// A notification plus the number of delivery attempts already made.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryNotification {
    #[serde(flatten)]
    pub notification: Notification,
    #[serde(rename = "RetryCount", default)]
    pub retry_count: u32,
}

impl Notification {
    /// The envelope sender used towards the downstream host: the first
    /// non-empty `From` header address, falling back to the return path.
    pub fn from_address(&self) -> Option<&str> {
        let headers = &self.mail.common_headers;

        headers
            .from
            .iter()
            .map(|addr| addr.trim())
            .find(|addr| !addr.is_empty())
            .or_else(|| Some(headers.return_path.trim()).filter(|addr| !addr.is_empty()))
    }
}
