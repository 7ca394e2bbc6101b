//! Operational log records.
//!
//! Every record is a single JSON object on one stdout line. Two forms exist:
//! the mail form emitted for each relay attempt, and the event form used by
//! the observer and other components. Diagnostics that are not part of this
//! contract go through `tracing` instead.

use std::io::Write;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct MailRecord<'a> {
    #[serde(rename = "Time")]
    pub time: DateTime<Utc>,
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "From")]
    pub from: &'a str,
    #[serde(rename = "To")]
    pub to: &'a [String],
    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EventRecord<'a> {
    #[serde(rename = "Time")]
    pub time: DateTime<Utc>,
    #[serde(rename = "Component")]
    pub component: &'a str,
    #[serde(rename = "Msg", skip_serializing_if = "Option::is_none")]
    pub msg: Option<&'a str>,
    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
}

/// Logs a relay attempt.
pub fn mail(ip: IpAddr, from: &str, to: &[String], error: Option<&dyn std::fmt::Display>) {
    write_record(&MailRecord {
        time: Utc::now(),
        ip: ip.to_string(),
        from,
        to,
        error: error.map(|e| e.to_string()),
    });
}

/// Logs an informational event.
pub fn event(component: &str, msg: impl AsRef<str>) {
    write_record(&EventRecord {
        time: Utc::now(),
        component,
        msg: Some(msg.as_ref()),
        error: None,
    });
}

/// Logs an error event.
pub fn event_error(component: &str, error: impl AsRef<str>) {
    write_record(&EventRecord {
        time: Utc::now(),
        component,
        msg: None,
        error: Some(error.as_ref()),
    });
}

fn write_record(record: &impl Serialize) {
    // Concurrent sessions log at the same time, so each record goes out as
    // one write while holding the stdout lock.
    let Ok(mut line) = serde_json::to_vec(record) else {
        return;
    };
    line.push(b'\n');
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(&line);
}
