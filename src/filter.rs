//! Admission filtering for envelope senders and recipients.

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("denied sender: sender does not match the allowed emails pattern")]
    DeniedSender,
    #[error("denied recipients: recipients match the denied emails pattern")]
    DeniedRecipients,
}

/// Sender/recipient admission policy.
///
/// If `allow_from` is set and the sender does not match, the whole envelope
/// is denied. Independently, every recipient matching `deny_to` is moved to
/// the denied list.
#[derive(Debug, Clone, Default)]
pub struct FilterPolicy {
    allow_from: Option<Regex>,
    deny_to: Option<Regex>,
}

/// The outcome of filtering one envelope. Recipient order within both lists
/// follows the input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filtered {
    pub allowed: Vec<String>,
    pub denied: Vec<String>,
    pub error: Option<FilterError>,
}

impl FilterPolicy {
    pub fn new(allow_from: Option<Regex>, deny_to: Option<Regex>) -> Self {
        Self {
            allow_from,
            deny_to,
        }
    }

    /// Checks the sender alone, without touching any recipient list.
    pub fn check_from(&self, from: &str) -> Result<(), FilterError> {
        match &self.allow_from {
            Some(pattern) if !pattern.is_match(from) => Err(FilterError::DeniedSender),
            _ => Ok(()),
        }
    }

    pub fn filter(&self, from: &str, to: &[String]) -> Filtered {
        let mut allowed = Vec::new();
        let mut denied = Vec::new();
        let mut error = self.check_from(from).err();

        for recipient in to {
            if error == Some(FilterError::DeniedSender)
                || self
                    .deny_to
                    .as_ref()
                    .is_some_and(|pattern| pattern.is_match(recipient))
            {
                denied.push(recipient.clone());
            } else {
                allowed.push(recipient.clone());
            }
        }

        if error.is_none() && !denied.is_empty() {
            error = Some(FilterError::DeniedRecipients);
        }

        Filtered {
            allowed,
            denied,
            error,
        }
    }
}
