//! Command line surface and validated runtime configuration.
//!
//! Flags are parsed once in `main`; the validated [`Config`] is immutable
//! afterwards and handed to the server and observer by value. Secret
//! material never travels through flags: `BCRYPT_HASH`, `PASSWORD`,
//! `TLS_KEY_PASS` and `QUEUE_SMTP_PASS` come from the environment.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use regex::Regex;
use thiserror::Error;

use crate::auth::{AuthError, Authenticator, Credentials};
use crate::filter::FilterPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("allowed sender emails: {0}")]
    AllowFrom(regex::Error),
    #[error("denied recipient emails: {0}")]
    DenyTo(regex::Error),
    #[error("invalid allowed client IP: {0}")]
    Ip(String),
    #[error("invalid relay API: {0}")]
    RelayApi(String),
    #[error("startTLS and onlyTLS require certFile and keyFile")]
    MissingTlsFiles,
    #[error("observer queue name is required")]
    MissingQueueName,
    #[error("observer bucket name is required")]
    MissingBucketName,
    #[error("observer SMTP host is required")]
    MissingSmtpHost,
    #[error(transparent)]
    Auth(#[from] AuthError),
}

#[derive(Debug, Parser)]
#[command(
    name = "cloudrelay",
    about = "SMTP relay onto cloud transactional mail APIs",
    version
)]
pub struct Cli {
    /// TCP listen address
    #[arg(long, default_value = ":1025")]
    pub addr: String,
    /// SMTP service name
    #[arg(long, default_value = "AWS SMTP Relay")]
    pub name: String,
    /// Server hostname
    #[arg(long, default_value = "")]
    pub host: String,
    /// TLS cert file
    #[arg(long = "certFile", default_value = "")]
    pub cert_file: String,
    /// TLS key file
    #[arg(long = "keyFile", default_value = "")]
    pub key_file: String,
    /// Require TLS via the STARTTLS extension
    #[arg(long = "startTLS", default_value_t = false)]
    pub start_tls: bool,
    /// Listen for incoming TLS connections only
    #[arg(long = "onlyTLS", default_value_t = false)]
    pub only_tls: bool,
    /// Relay API to use (ses|pinpoint)
    #[arg(long = "relayAPI", default_value = "ses")]
    pub relay_api: String,
    /// Configuration set name forwarded to the mail API
    #[arg(long = "setName", default_value = "")]
    pub set_name: String,
    /// Allowed client IPs (comma-separated)
    #[arg(long, default_value = "")]
    pub ips: String,
    /// Authentication username
    #[arg(long, default_value = "")]
    pub user: String,
    /// Allowed sender emails regular expression
    #[arg(long = "allowFrom", default_value = "")]
    pub allow_from: String,
    /// Denied recipient emails regular expression
    #[arg(long = "denyTo", default_value = "")]
    pub deny_to: String,
    /// Read timeout in seconds
    #[arg(long = "readTimeout", default_value_t = 60)]
    pub read_timeout: u64,
    /// Write timeout in seconds
    #[arg(long = "writeTimeout", default_value_t = 60)]
    pub write_timeout: u64,
    /// Maximum message size in bytes
    #[arg(long = "maxMessageBytes", default_value_t = 1024 * 1024)]
    pub max_message_bytes: usize,
    /// SMTP conversation mirror ("", "stdout", "stderr" or a file path)
    #[arg(long, default_value = "")]
    pub debug: String,

    /// Enable the bounce-receipt observer
    #[arg(long = "SES.ObserverEnable", default_value_t = false)]
    pub observer_enable: bool,
    /// Observer queue name
    #[arg(long = "SES.SQS.Name", default_value = "")]
    pub sqs_name: String,
    /// Observer queue visibility timeout in seconds
    #[arg(long = "SES.SQS.Timeout", default_value_t = 10)]
    pub sqs_timeout: i32,
    /// Observer queue receive batch size
    #[arg(long = "SES.SQS.MaxMessages", default_value_t = 10)]
    pub sqs_max_messages: i32,
    /// Observer queue long-poll wait time in seconds
    #[arg(long = "SES.SQS.WaitTime", default_value_t = 10)]
    pub sqs_wait_time: i32,
    /// Observer bucket holding raw inbound messages
    #[arg(long = "SES.Bucket.Name", default_value = "")]
    pub bucket_name: String,
    /// Key prefix within the observer bucket
    #[arg(long = "SES.Bucket.KeyPrefix", default_value = "")]
    pub bucket_key_prefix: String,
    /// Downstream SMTP host
    #[arg(long = "SES.Smtp.Host", default_value = "")]
    pub smtp_host: String,
    /// Downstream SMTP port
    #[arg(long = "SES.Smtp.Port", default_value_t = 25)]
    pub smtp_port: u16,
    /// Connect to the downstream host with implicit TLS
    #[arg(long = "SES.Smtp.ConnectionTLS", default_value_t = false)]
    pub smtp_connection_tls: bool,
    /// Upgrade the downstream connection with STARTTLS
    #[arg(long = "SES.Smtp.ForceSTARTTLS", default_value_t = true)]
    pub smtp_force_starttls: bool,
    /// Accept invalid downstream TLS certificates
    #[arg(long = "SES.Smtp.InsecureTLS", default_value_t = true)]
    pub smtp_insecure_tls: bool,
    /// Downstream SMTP authorization identity
    #[arg(long = "SES.Smtp.Identity", default_value = "")]
    pub smtp_identity: String,
    /// Downstream SMTP user
    #[arg(long = "SES.Smtp.User", default_value = "")]
    pub smtp_user: String,
    /// Downstream SMTP password [overridden by QUEUE_SMTP_PASS]
    #[arg(long = "SES.Smtp.Pass", default_value = "")]
    pub smtp_pass: String,
    /// EHLO name used towards the downstream host
    #[arg(long = "SES.Smtp.MyName", default_value = "AWS-SMTP-Relay-Observer")]
    pub smtp_my_name: String,
    /// Delivery attempts per notification (0 disables retries)
    #[arg(long = "RetryCount", default_value_t = 0)]
    pub retry_count: u32,
    /// Delay in seconds before a retried notification becomes visible
    #[arg(long = "RetryDelaySeconds", default_value_t = 0)]
    pub retry_delay_seconds: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayApi {
    Ses,
    Pinpoint,
}

impl FromStr for RelayApi {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ses" => Ok(RelayApi::Ses),
            "pinpoint" => Ok(RelayApi::Pinpoint),
            other => Err(ConfigError::RelayApi(other.to_string())),
        }
    }
}

/// Where the SMTP conversation mirror goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugSink {
    Off,
    Stdout,
    Stderr,
    File(PathBuf),
}

impl DebugSink {
    fn parse(value: &str) -> Self {
        match value {
            "" => DebugSink::Off,
            v if v.contains("stderr") => DebugSink::Stderr,
            v if v.contains("stdout") || v == "-" => DebugSink::Stdout,
            path => DebugSink::File(PathBuf::from(path)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub name: String,
    pub host: String,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub start_tls: bool,
    pub only_tls: bool,
    pub relay_api: RelayApi,
    pub set_name: Option<String>,
    pub authenticator: Authenticator,
    pub filter: FilterPolicy,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_message_bytes: usize,
    pub debug: DebugSink,
    pub observer: Option<ObserverConfig>,
}

#[derive(Debug, Clone)]
pub struct ObserverConfig {
    pub queue_name: String,
    pub visibility_timeout: i32,
    pub max_messages: i32,
    pub wait_time: i32,
    pub bucket: String,
    pub key_prefix: String,
    pub smtp: DownstreamConfig,
    pub retry_count: u32,
    pub retry_delay_seconds: i32,
}

#[derive(Debug, Clone)]
pub struct DownstreamConfig {
    pub host: String,
    pub port: u16,
    pub connection_tls: bool,
    pub force_starttls: bool,
    pub insecure_tls: bool,
    pub identity: String,
    pub user: String,
    pub pass: String,
    pub my_name: String,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let allow_from = compile_pattern(&cli.allow_from).map_err(ConfigError::AllowFrom)?;
        let deny_to = compile_pattern(&cli.deny_to).map_err(ConfigError::DenyTo)?;

        let mut allowlist = HashSet::new();
        if !cli.ips.is_empty() {
            for ip in cli.ips.split(',') {
                let ip = ip.trim();
                allowlist.insert(
                    ip.parse::<IpAddr>()
                        .map_err(|_| ConfigError::Ip(ip.to_string()))?,
                );
            }
        }

        let credentials = Credentials::from_env(&cli.user)?;

        let has_tls = !cli.cert_file.is_empty() && !cli.key_file.is_empty();
        if (cli.start_tls || cli.only_tls) && !has_tls {
            return Err(ConfigError::MissingTlsFiles);
        }

        let observer = if cli.observer_enable {
            Some(ObserverConfig::from_cli(&cli)?)
        } else {
            None
        };

        Ok(Config {
            addr: normalize_listen_addr(&cli.addr),
            name: cli.name,
            host: cli.host,
            cert_file: non_empty_path(&cli.cert_file),
            key_file: non_empty_path(&cli.key_file),
            start_tls: cli.start_tls,
            only_tls: cli.only_tls,
            relay_api: cli.relay_api.parse()?,
            set_name: Some(cli.set_name).filter(|s| !s.is_empty()),
            authenticator: Authenticator::new(allowlist, credentials),
            filter: FilterPolicy::new(allow_from, deny_to),
            read_timeout: Duration::from_secs(cli.read_timeout),
            write_timeout: Duration::from_secs(cli.write_timeout),
            max_message_bytes: cli.max_message_bytes,
            debug: DebugSink::parse(&cli.debug),
            observer,
        })
    }

    pub fn has_tls(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some()
    }
}

impl ObserverConfig {
    fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        if cli.sqs_name.is_empty() {
            return Err(ConfigError::MissingQueueName);
        }
        if cli.bucket_name.is_empty() {
            return Err(ConfigError::MissingBucketName);
        }
        if cli.smtp_host.is_empty() {
            return Err(ConfigError::MissingSmtpHost);
        }

        let pass = std::env::var("QUEUE_SMTP_PASS").unwrap_or_else(|_| cli.smtp_pass.clone());

        Ok(ObserverConfig {
            queue_name: cli.sqs_name.clone(),
            visibility_timeout: cli.sqs_timeout,
            max_messages: cli.sqs_max_messages,
            wait_time: cli.sqs_wait_time,
            bucket: cli.bucket_name.clone(),
            key_prefix: cli.bucket_key_prefix.clone(),
            smtp: DownstreamConfig {
                host: cli.smtp_host.clone(),
                port: cli.smtp_port,
                connection_tls: cli.smtp_connection_tls,
                force_starttls: cli.smtp_force_starttls,
                insecure_tls: cli.smtp_insecure_tls,
                identity: cli.smtp_identity.clone(),
                user: cli.smtp_user.clone(),
                pass,
                my_name: cli.smtp_my_name.clone(),
            },
            retry_count: cli.retry_count,
            retry_delay_seconds: cli.retry_delay_seconds,
        })
    }
}

fn compile_pattern(pattern: &str) -> Result<Option<Regex>, regex::Error> {
    if pattern.is_empty() {
        Ok(None)
    } else {
        Regex::new(pattern).map(Some)
    }
}

fn non_empty_path(value: &str) -> Option<PathBuf> {
    if value.is_empty() {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

// ":1025" means all interfaces on port 1025.
fn normalize_listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, ConfigError> {
        let cli = Cli::parse_from(std::iter::once("cloudrelay").chain(args.iter().copied()));
        Config::from_cli(cli)
    }

    #[test]
    fn defaults() {
        let config = parse(&[]).unwrap();

        assert_eq!(config.addr, "0.0.0.0:1025");
        assert_eq!(config.name, "AWS SMTP Relay");
        assert_eq!(config.relay_api, RelayApi::Ses);
        assert_eq!(config.set_name, None);
        assert_eq!(config.read_timeout, Duration::from_secs(60));
        assert_eq!(config.max_message_bytes, 1024 * 1024);
        assert_eq!(config.debug, DebugSink::Off);
        assert!(!config.has_tls());
        assert!(config.observer.is_none());
        assert!(!config.authenticator.requires_auth());
    }

    #[test]
    fn invalid_sender_pattern_is_fatal() {
        assert!(matches!(
            parse(&["--allowFrom", "("]),
            Err(ConfigError::AllowFrom(_))
        ));
        assert!(matches!(
            parse(&["--denyTo", "["]),
            Err(ConfigError::DenyTo(_))
        ));
    }

    #[test]
    fn ip_allowlist_is_parsed() {
        let config = parse(&["--ips", "127.0.0.1,::1"]).unwrap();

        assert!(config.authenticator.ip_allowed("127.0.0.1".parse().unwrap()));
        assert!(config.authenticator.ip_allowed("::1".parse().unwrap()));
        assert!(!config.authenticator.ip_allowed("10.1.2.3".parse().unwrap()));

        assert!(matches!(
            parse(&["--ips", "not-an-ip"]),
            Err(ConfigError::Ip(_))
        ));
    }

    #[test]
    fn relay_api_is_validated() {
        assert_eq!(
            parse(&["--relayAPI", "pinpoint"]).unwrap().relay_api,
            RelayApi::Pinpoint
        );
        assert!(matches!(
            parse(&["--relayAPI", "sns"]),
            Err(ConfigError::RelayApi(_))
        ));
    }

    #[test]
    fn observer_requires_queue_bucket_and_host() {
        assert!(matches!(
            parse(&["--SES.ObserverEnable"]),
            Err(ConfigError::MissingQueueName)
        ));
        assert!(matches!(
            parse(&["--SES.ObserverEnable", "--SES.SQS.Name", "inbound"]),
            Err(ConfigError::MissingBucketName)
        ));
        assert!(matches!(
            parse(&[
                "--SES.ObserverEnable",
                "--SES.SQS.Name",
                "inbound",
                "--SES.Bucket.Name",
                "mail",
            ]),
            Err(ConfigError::MissingSmtpHost)
        ));

        let config = parse(&[
            "--SES.ObserverEnable",
            "--SES.SQS.Name",
            "inbound",
            "--SES.Bucket.Name",
            "mail",
            "--SES.Bucket.KeyPrefix",
            "prefix/",
            "--SES.Smtp.Host",
            "smtp.example.org",
            "--RetryCount",
            "3",
        ])
        .unwrap();
        let observer = config.observer.unwrap();

        assert_eq!(observer.queue_name, "inbound");
        assert_eq!(observer.key_prefix, "prefix/");
        assert_eq!(observer.visibility_timeout, 10);
        assert_eq!(observer.max_messages, 10);
        assert_eq!(observer.smtp.port, 25);
        assert!(observer.smtp.force_starttls);
        assert!(observer.smtp.insecure_tls);
        assert_eq!(observer.smtp.my_name, "AWS-SMTP-Relay-Observer");
        assert_eq!(observer.retry_count, 3);
    }

    #[test]
    fn mandatory_tls_requires_key_material() {
        assert!(matches!(
            parse(&["--startTLS"]),
            Err(ConfigError::MissingTlsFiles)
        ));
        assert!(matches!(
            parse(&["--onlyTLS"]),
            Err(ConfigError::MissingTlsFiles)
        ));
        assert!(
            parse(&["--startTLS", "--certFile", "cert.pem", "--keyFile", "key.pem"]).is_ok()
        );
    }

    #[test]
    fn debug_sink_parsing() {
        assert_eq!(DebugSink::parse(""), DebugSink::Off);
        assert_eq!(DebugSink::parse("stdout"), DebugSink::Stdout);
        assert_eq!(DebugSink::parse("-"), DebugSink::Stdout);
        assert_eq!(DebugSink::parse("stderr"), DebugSink::Stderr);
        assert_eq!(
            DebugSink::parse("/tmp/smtp.log"),
            DebugSink::File(PathBuf::from("/tmp/smtp.log"))
        );
    }

    #[test]
    fn explicit_listen_address_is_kept() {
        let config = parse(&["--addr", "127.0.0.1:2525"]).unwrap();

        assert_eq!(config.addr, "127.0.0.1:2525");
    }
}
