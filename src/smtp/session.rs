use std::net::IpAddr;
use std::sync::Arc;

use base64ct::{Base64, Encoding};
use smtp_proto::{
    AUTH_CRAM_MD5, AUTH_LOGIN, AUTH_PLAIN, EXT_8BIT_MIME, EXT_AUTH, EXT_ENHANCED_STATUS_CODES,
    EXT_SMTP_UTF8, EXT_START_TLS, EhloResponse, Request,
};
use tracing::{debug, trace};

use crate::auth::Authenticator;
use crate::cram::ServerExchange;
use crate::relay::{RelayClient, RelayError};

const DATA_END: &[u8] = b"\r\n.\r\n";

/// Slack on top of the relay limit so the relay sender can observe an
/// overrun instead of the session truncating exactly at the boundary.
const DATA_BUFFER_SLACK: usize = 1024;

pub struct Session {
    relay: Arc<dyn RelayClient>,
    authenticator: Authenticator,
    peer_ip: IpAddr,
    max_message_bytes: usize,
    require_tls: bool,
    tls_offered: bool,
    tls_active: bool,

    peer_name: Option<String>,
    authenticated: bool,
    pending_auth: Option<PendingAuth>,
    envelope: Option<Envelope>,
    data: Option<DataState>,
}

struct Envelope {
    from: String,
    to: Vec<String>,
}

enum PendingAuth {
    Plain,
    LoginUser,
    LoginPassword { username: String },
    Cram { exchange: ServerExchange },
}

struct DataState {
    buf: Vec<u8>,
    total: usize,
    overflow: bool,
    tail: Vec<u8>,
}

pub enum SessionReply {
    ReplyAndContinue(u16, String),
    ReplyAndStop(u16, String),
    RawReply(Vec<u8>),
    IngestData(u16, String),
    IngestAuth(u16, String),
    StartTls(u16, String),
}

pub enum DataReply {
    ReplyAndContinue(u16, String),
    ContinueIngest,
}

impl Session {
    pub const MAX_RECIPIENTS: usize = 50;

    const RESPONSE_OK: &str = "2.0.0 Ok";
    const RESPONSE_FROM_OK: &str = "2.1.0 Originator <[email]> ok";
    const RESPONSE_TO_OK: &str = "2.1.5 Recipient <[email]> ok";
    const RESPONSE_SYNTAX_ERROR: &str = "5.5.2 Syntax error";
    const RESPONSE_AUTH_SUCCESS: &str = "2.7.0 Authentication succeeded";
    const RESPONSE_START_DATA: &str = "3.5.4 Start mail input; end with <CRLF>.<CRLF>";
    const RESPONSE_BYE: &str = "2.0.0 Goodbye";
    const RESPONSE_MESSAGE_ACCEPTED: &str = "2.6.0 Message accepted for delivery";
    const RESPONSE_BAD_SEQUENCE: &str = "5.5.1 Bad sequence of commands";
    const RESPONSE_MAIL_FIRST: &str = "5.5.1 Use MAIL first";
    const RESPONSE_HELLO_FIRST: &str = "5.5.1 Be nice and say EHLO first";
    const RESPONSE_NO_VALID_RECIPIENTS: &str = "5.5.1 No valid recipients";
    const RESPONSE_NESTED_MAIL: &str = "5.5.1 Error: nested MAIL command";
    const RESPONSE_ALREADY_AUTHENTICATED: &str = "5.5.1 Already authenticated";
    const RESPONSE_AUTH_ERROR: &str = "5.7.8 Authentication credentials invalid";
    const RESPONSE_AUTH_CANCELLED: &str = "5.7.0 Authentication cancelled";
    const RESPONSE_AUTHENTICATION_REQUIRED: &str = "5.7.1 Authentication required";
    const RESPONSE_STARTTLS_REQUIRED: &str = "5.7.0 Must issue a STARTTLS command first";
    const RESPONSE_ALREADY_TLS: &str = "5.7.4 Already in TLS mode";
    const RESPONSE_COMMAND_NOT_IMPLEMENTED: &str = "5.5.1 Command not implemented";
    const RESPONSE_MUST_USE_ESMTP: &str = "5.5.1 Must use EHLO";
    const RESPONSE_NO_VRFY: &str = "5.5.1 VRFY command is disabled";
    const RESPONSE_TOO_MANY_RECIPIENTS: &str = "4.5.3 Too many recipients";
    const RESPONSE_MESSAGE_TOO_BIG: &str = "5.3.4 Message size exceeds the fixed maximum";
    const RESPONSE_LOCAL_ERROR: &str = "4.3.0 Local error in processing";
    const RESPONSE_READY_TLS: &str = "2.0.0 Ready to start TLS";

    pub fn new(
        peer_ip: IpAddr,
        relay: Arc<dyn RelayClient>,
        authenticator: Authenticator,
        max_message_bytes: usize,
        require_tls: bool,
        tls_offered: bool,
    ) -> Self {
        Self {
            relay,
            authenticator,
            peer_ip,
            max_message_bytes,
            require_tls,
            tls_offered,
            tls_active: false,
            peer_name: None,
            authenticated: false,
            pending_auth: None,
            envelope: None,
            data: None,
        }
    }

    pub fn peer_ip(&self) -> IpAddr {
        self.peer_ip
    }

    /// Marks the connection as upgraded after a completed TLS handshake.
    pub fn tls_established(&mut self) {
        self.tls_active = true;
    }

    /// Whether a SASL exchange is in flight, so the conversation mirror can
    /// elide credentials.
    pub fn in_auth_exchange(&self) -> bool {
        self.pending_auth.is_some()
    }

    pub async fn handle(
        &mut self,
        request: Result<Request<String>, smtp_proto::Error>,
    ) -> SessionReply {
        let request = match request {
            Ok(r) => r,
            Err(e) => {
                debug!("failed to parse request: {e}");

                return SessionReply::ReplyAndContinue(500, Self::RESPONSE_SYNTAX_ERROR.into());
            }
        };

        if let Request::Auth { mechanism, .. } = request {
            // The Debug form of Request would print credentials passed as an
            // initial response, so AUTH only gets its mechanism traced.
            trace!(
                "received AUTH with mechanism {mechanism} from {}",
                self.peer_ip
            );
        } else {
            trace!("received request: {request:?} from {}", self.peer_ip);
        }

        match request {
            Request::Ehlo { host } => {
                // RFC 5321, 4.1.1.1
                let mut response = EhloResponse::new(host.as_str());
                response.capabilities = EXT_ENHANCED_STATUS_CODES | EXT_8BIT_MIME | EXT_SMTP_UTF8;

                if self.tls_offered && !self.tls_active {
                    response.capabilities |= EXT_START_TLS;
                }
                if self.authenticator.requires_auth() {
                    response.capabilities |= EXT_AUTH;
                    if self.authenticator.offers_password_auth() {
                        response.auth_mechanisms |= AUTH_PLAIN | AUTH_LOGIN;
                    }
                    if self.authenticator.offers_cram() {
                        response.auth_mechanisms |= AUTH_CRAM_MD5;
                    }
                }

                let mut buf = Vec::with_capacity(64);
                response.write(&mut buf).ok();

                self.peer_name = Some(host);

                SessionReply::RawReply(buf)
            }
            Request::Helo { host: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_MUST_USE_ESMTP.into())
            }
            Request::Lhlo { host: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            Request::StartTls => {
                if self.tls_active {
                    return SessionReply::ReplyAndContinue(504, Self::RESPONSE_ALREADY_TLS.into());
                }
                if !self.tls_offered {
                    return SessionReply::ReplyAndContinue(
                        502,
                        Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into(),
                    );
                }

                SessionReply::StartTls(220, Self::RESPONSE_READY_TLS.into())
            }
            Request::Auth {
                mechanism,
                initial_response,
            } => self.handle_auth_command(mechanism, initial_response),
            Request::Quit => {
                // RFC 5321, 4.1.1.10
                SessionReply::ReplyAndStop(221, Self::RESPONSE_BYE.into())
            }
            Request::Noop { value: _ } => {
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            Request::Rset => {
                // RFC 5321, 4.1.1.5; does not clear the EHLO or AUTH state
                self.envelope = None;
                self.data = None;
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            // ask for EHLO before processing any of the commands below
            _ignored_command if self.peer_name.is_none() => {
                SessionReply::ReplyAndContinue(503, Self::RESPONSE_HELLO_FIRST.into())
            }
            Request::Mail { from } => {
                // RFC 5321, 4.1.1.2
                debug!("received MAIL FROM: {}", from.address);

                if self.require_tls && !self.tls_active {
                    return SessionReply::ReplyAndContinue(
                        530,
                        Self::RESPONSE_STARTTLS_REQUIRED.into(),
                    );
                }
                if self.authenticator.requires_auth() && !self.authenticated {
                    return SessionReply::ReplyAndContinue(
                        530,
                        Self::RESPONSE_AUTHENTICATION_REQUIRED.into(),
                    );
                }
                if self.envelope.is_some() {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_NESTED_MAIL.into());
                }

                // from-only filter: a denied sender never gets to RCPT
                if let Err(denied) = self.relay.filter_from(&from.address) {
                    return SessionReply::ReplyAndContinue(550, format!("5.7.1 {denied}"));
                }

                let response_message = Self::RESPONSE_FROM_OK.replace("[email]", &from.address);
                self.envelope = Some(Envelope {
                    from: from.address,
                    to: Vec::new(),
                });

                SessionReply::ReplyAndContinue(250, response_message)
            }
            Request::Rcpt { to } => {
                // RFC 5321, 4.1.1.3
                debug!("received RCPT TO: {}", to.address);

                let Some(envelope) = self.envelope.as_mut() else {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_MAIL_FIRST.into());
                };

                if envelope.to.len() >= Self::MAX_RECIPIENTS {
                    return SessionReply::ReplyAndContinue(
                        452,
                        Self::RESPONSE_TOO_MANY_RECIPIENTS.into(),
                    );
                }

                let filtered = self
                    .relay
                    .filter_to(&envelope.from, std::slice::from_ref(&to.address));
                if let Some(denied) = filtered.error {
                    return SessionReply::ReplyAndContinue(550, format!("5.7.1 {denied}"));
                }

                let response_message = Self::RESPONSE_TO_OK.replace("[email]", &to.address);
                envelope.to.push(to.address);

                SessionReply::ReplyAndContinue(250, response_message)
            }
            Request::Data => {
                // RFC 5321, 4.1.1.4
                let Some(envelope) = self.envelope.as_ref() else {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
                };
                if envelope.to.is_empty() {
                    return SessionReply::ReplyAndContinue(
                        554,
                        Self::RESPONSE_NO_VALID_RECIPIENTS.into(),
                    );
                }

                self.data = Some(DataState::new());

                SessionReply::IngestData(354, Self::RESPONSE_START_DATA.into())
            }
            Request::Vrfy { value: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_NO_VRFY.into())
            }
            Request::Bdat { .. }
            | Request::Expn { .. }
            | Request::Help { .. }
            | Request::Etrn { .. }
            | Request::Atrn { .. }
            | Request::Burl { .. } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
        }
    }

    fn handle_auth_command(&mut self, mechanism: u64, initial_response: String) -> SessionReply {
        // RFC 4954
        if self.authenticated {
            return SessionReply::ReplyAndContinue(
                503,
                Self::RESPONSE_ALREADY_AUTHENTICATED.into(),
            );
        }
        if !self.authenticator.requires_auth() {
            return SessionReply::ReplyAndContinue(
                502,
                Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into(),
            );
        }
        if self.require_tls && !self.tls_active {
            return SessionReply::ReplyAndContinue(530, Self::RESPONSE_STARTTLS_REQUIRED.into());
        }

        if mechanism == AUTH_PLAIN && self.authenticator.offers_password_auth() {
            if initial_response.is_empty() {
                self.pending_auth = Some(PendingAuth::Plain);
                return SessionReply::IngestAuth(334, "Go ahead".into());
            }
            self.finish_plain_auth(initial_response.as_bytes())
        } else if mechanism == AUTH_LOGIN && self.authenticator.offers_password_auth() {
            if initial_response.is_empty() {
                self.pending_auth = Some(PendingAuth::LoginUser);
                // base64 "Username:"
                return SessionReply::IngestAuth(334, "VXNlcm5hbWU6".into());
            }
            match decode_base64_text(initial_response.as_bytes()) {
                Ok(username) => {
                    self.pending_auth = Some(PendingAuth::LoginPassword { username });
                    // base64 "Password:"
                    SessionReply::IngestAuth(334, "UGFzc3dvcmQ6".into())
                }
                Err(()) => SessionReply::ReplyAndContinue(501, Self::RESPONSE_SYNTAX_ERROR.into()),
            }
        } else if mechanism == AUTH_CRAM_MD5 && self.authenticator.offers_cram() {
            match self.authenticator.start_cram(self.peer_ip) {
                Ok(mut exchange) => {
                    let challenge = match exchange.challenge() {
                        Ok(challenge) => Base64::encode_string(challenge.as_bytes()),
                        Err(_) => {
                            return SessionReply::ReplyAndContinue(
                                454,
                                Self::RESPONSE_LOCAL_ERROR.into(),
                            );
                        }
                    };
                    self.pending_auth = Some(PendingAuth::Cram { exchange });
                    SessionReply::IngestAuth(334, challenge)
                }
                Err(err) => {
                    debug!("refusing CRAM-MD5 exchange: {err}");
                    SessionReply::ReplyAndContinue(535, Self::RESPONSE_AUTH_ERROR.into())
                }
            }
        } else {
            debug!("received unsupported AUTH mechanism");
            SessionReply::ReplyAndContinue(535, Self::RESPONSE_AUTH_ERROR.into())
        }
    }

    /// Handles one client line of an ongoing SASL exchange. May reply with
    /// another 334 continuation (LOGIN password step).
    pub fn handle_auth_response(&mut self, line: &[u8]) -> SessionReply {
        let line = line.trim_ascii_end();

        if line == b"*" {
            self.pending_auth = None;
            return SessionReply::ReplyAndContinue(501, Self::RESPONSE_AUTH_CANCELLED.into());
        }

        match self.pending_auth.take() {
            Some(PendingAuth::Plain) => self.finish_plain_auth(line),
            Some(PendingAuth::LoginUser) => match decode_base64_text(line) {
                Ok(username) => {
                    self.pending_auth = Some(PendingAuth::LoginPassword { username });
                    SessionReply::IngestAuth(334, "UGFzc3dvcmQ6".into())
                }
                Err(()) => SessionReply::ReplyAndContinue(501, Self::RESPONSE_SYNTAX_ERROR.into()),
            },
            Some(PendingAuth::LoginPassword { username }) => match decode_base64_text(line) {
                Ok(password) => self.finish_password_auth(&username, &password),
                Err(()) => SessionReply::ReplyAndContinue(501, Self::RESPONSE_SYNTAX_ERROR.into()),
            },
            Some(PendingAuth::Cram { mut exchange }) => match decode_base64_text(line) {
                Ok(response) => match exchange.validate(&response) {
                    Ok(true) => {
                        self.authenticated = true;
                        SessionReply::ReplyAndContinue(235, Self::RESPONSE_AUTH_SUCCESS.into())
                    }
                    Ok(false) => {
                        SessionReply::ReplyAndContinue(535, Self::RESPONSE_AUTH_ERROR.into())
                    }
                    Err(_) => {
                        SessionReply::ReplyAndContinue(501, Self::RESPONSE_SYNTAX_ERROR.into())
                    }
                },
                Err(()) => SessionReply::ReplyAndContinue(501, Self::RESPONSE_SYNTAX_ERROR.into()),
            },
            None => SessionReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into()),
        }
    }

    fn finish_plain_auth(&mut self, data: &[u8]) -> SessionReply {
        let Ok((username, password)) = decode_plain_auth(data) else {
            return SessionReply::ReplyAndContinue(501, Self::RESPONSE_SYNTAX_ERROR.into());
        };

        trace!(
            "decoded credentials, username: {username} password ({} characters)",
            password.len()
        );

        self.finish_password_auth(&username, &password)
    }

    fn finish_password_auth(&mut self, username: &str, password: &str) -> SessionReply {
        match self
            .authenticator
            .verify_password(self.peer_ip, username, password)
        {
            Ok(()) => {
                self.authenticated = true;
                SessionReply::ReplyAndContinue(235, Self::RESPONSE_AUTH_SUCCESS.into())
            }
            Err(err) => {
                debug!("authentication failed: {err}");
                SessionReply::ReplyAndContinue(535, Self::RESPONSE_AUTH_ERROR.into())
            }
        }
    }

    pub async fn handle_data(&mut self, chunk: &[u8]) -> DataReply {
        let Some(mut state) = self.data.take() else {
            return DataReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
        };

        state.push(chunk, self.max_message_bytes + DATA_BUFFER_SLACK);

        if !state.terminated() {
            self.data = Some(state);
            return DataReply::ContinueIngest;
        }

        let Some(envelope) = self.envelope.take() else {
            return DataReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
        };

        let body = state.into_body();
        trace!("received message ({} bytes)", body.len());

        let result = self
            .relay
            .send(
                self.peer_ip,
                &envelope.from,
                &envelope.to,
                &mut body.as_slice(),
            )
            .await;

        match result {
            Ok(()) => DataReply::ReplyAndContinue(250, Self::RESPONSE_MESSAGE_ACCEPTED.into()),
            Err(RelayError::MessageTooLarge(_)) => {
                debug!("failed to relay message: message too big");
                DataReply::ReplyAndContinue(552, Self::RESPONSE_MESSAGE_TOO_BIG.into())
            }
            Err(err @ RelayError::Denied(_)) => {
                DataReply::ReplyAndContinue(550, format!("5.7.1 {err}"))
            }
            Err(err) => {
                debug!("failed to relay message: {err}");
                DataReply::ReplyAndContinue(451, Self::RESPONSE_LOCAL_ERROR.into())
            }
        }
    }
}

impl DataState {
    fn new() -> Self {
        Self {
            buf: Vec::new(),
            total: 0,
            overflow: false,
            tail: Vec::new(),
        }
    }

    fn push(&mut self, chunk: &[u8], cap: usize) {
        self.total += chunk.len();

        self.tail.extend_from_slice(chunk);
        if self.tail.len() > DATA_END.len() {
            self.tail.drain(..self.tail.len() - DATA_END.len());
        }

        if !self.overflow {
            self.buf.extend_from_slice(chunk);
            if self.buf.len() > cap {
                // keep the connection drained but stop buffering; the relay
                // sender reports the overrun
                self.overflow = true;
                self.buf.truncate(cap);
            }
        }
    }

    fn terminated(&self) -> bool {
        self.tail == DATA_END || (self.total == 3 && self.buf == b".\r\n")
    }

    fn into_body(mut self) -> Vec<u8> {
        if self.overflow {
            return self.buf;
        }
        if self.buf == b".\r\n" {
            return Vec::new();
        }
        if self.buf.ends_with(DATA_END) {
            self.buf.truncate(self.buf.len() - DATA_END.len());
        }
        unstuff(&self.buf)
    }
}

// RFC 5321, 4.5.2: remove the transparency dot at the start of each line
fn unstuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut at_line_start = true;

    for &byte in data {
        if at_line_start && byte == b'.' {
            at_line_start = false;
            continue;
        }
        at_line_start = byte == b'\n';
        out.push(byte);
    }

    out
}

fn decode_base64_text(data: &[u8]) -> Result<String, ()> {
    let text = std::str::from_utf8(data.trim_ascii()).map_err(|_| ())?;
    let decoded = Base64::decode_vec(text).map_err(|_| ())?;
    String::from_utf8(decoded).map_err(|_| ())
}

fn decode_plain_auth(data: &[u8]) -> Result<(String, String), ()> {
    let text = std::str::from_utf8(data.trim_ascii()).map_err(|_| ())?;
    let decoded = Base64::decode_vec(text).map_err(|_| ())?;

    let mut parts = decoded.split(|&b| b == 0);

    let authzid = parts.next().ok_or(())?;
    if !authzid.is_empty() {
        trace!(
            "ignoring received authorization identity: {}",
            String::from_utf8_lossy(authzid)
        );
    }
    let username = parts.next().ok_or(())?;
    let password = parts.next().ok_or(())?;
    if parts.count() != 0 {
        return Err(());
    }

    Ok((
        std::str::from_utf8(username).map_err(|_| ())?.to_string(),
        std::str::from_utf8(password).map_err(|_| ())?.to_string(),
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::auth::Credentials;
    use crate::cram;
    use crate::filter::{FilterError, FilterPolicy, Filtered};
    use async_trait::async_trait;
    use regex::Regex;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tokio::io::{AsyncRead, AsyncReadExt};

    struct RecordedSend {
        from: String,
        to: Vec<String>,
        data: Vec<u8>,
    }

    #[derive(Default)]
    struct MockRelay {
        policy: FilterPolicy,
        sent: Mutex<Vec<RecordedSend>>,
        fail_with: Mutex<Option<RelayError>>,
    }

    impl MockRelay {
        fn with_policy(policy: FilterPolicy) -> Self {
            Self {
                policy,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl RelayClient for MockRelay {
        fn filter_from(&self, from: &str) -> Result<(), FilterError> {
            self.policy.check_from(from)
        }

        fn filter_to(&self, from: &str, to: &[String]) -> Filtered {
            self.policy.filter(from, to)
        }

        async fn send(
            &self,
            _origin: IpAddr,
            from: &str,
            to: &[String],
            data: &mut (dyn AsyncRead + Send + Unpin),
        ) -> Result<(), RelayError> {
            if let Some(err) = self.fail_with.lock().unwrap().take() {
                return Err(err);
            }
            let mut body = Vec::new();
            data.read_to_end(&mut body)
                .await
                .map_err(RelayError::Read)?;
            self.sent.lock().unwrap().push(RecordedSend {
                from: from.to_string(),
                to: to.to_vec(),
                data: body,
            });
            Ok(())
        }
    }

    fn session(relay: Arc<MockRelay>, authenticator: Authenticator) -> Session {
        Session::new(
            "127.0.0.1".parse().unwrap(),
            relay,
            authenticator,
            1024 * 1024,
            false,
            false,
        )
    }

    fn request(line: &str) -> Result<Request<String>, smtp_proto::Error> {
        Request::parse(&mut format!("{line}\r\n").as_bytes().iter()).map(Request::into_owned)
    }

    async fn expect_reply(session: &mut Session, line: &str, code: u16) -> String {
        match session.handle(request(line)).await {
            SessionReply::ReplyAndContinue(c, message)
            | SessionReply::ReplyAndStop(c, message)
            | SessionReply::IngestData(c, message)
            | SessionReply::IngestAuth(c, message)
            | SessionReply::StartTls(c, message) => {
                assert_eq!(c, code, "unexpected code for {line}: {message}");
                message
            }
            SessionReply::RawReply(buf) => {
                let text = String::from_utf8(buf).unwrap();
                assert!(
                    text.starts_with(&code.to_string()),
                    "unexpected reply for {line}: {text}"
                );
                text
            }
        }
    }

    async fn send_body(session: &mut Session, body: &[u8]) -> (u16, String) {
        let mut payload = body.to_vec();
        payload.extend_from_slice(DATA_END);
        match session.handle_data(&payload).await {
            DataReply::ReplyAndContinue(code, message) => (code, message),
            DataReply::ContinueIngest => panic!("expected a reply"),
        }
    }

    #[tokio::test]
    async fn accepts_a_simple_message() {
        let relay = Arc::new(MockRelay::default());
        let mut session = session(relay.clone(), Authenticator::default());

        expect_reply(&mut session, "EHLO client.example.org", 250).await;
        expect_reply(&mut session, "MAIL FROM:<alice@example.org>", 250).await;
        expect_reply(&mut session, "RCPT TO:<bob@example.org>", 250).await;
        expect_reply(&mut session, "DATA", 354).await;
        let (code, _) = send_body(&mut session, b"TEST").await;
        assert_eq!(code, 250);

        let sent = relay.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].from, "alice@example.org");
        assert_eq!(sent[0].to, vec!["bob@example.org".to_string()]);
        assert_eq!(sent[0].data, b"TEST");
    }

    #[tokio::test]
    async fn commands_require_ehlo_first() {
        let relay = Arc::new(MockRelay::default());
        let mut session = session(relay, Authenticator::default());

        expect_reply(&mut session, "MAIL FROM:<alice@example.org>", 503).await;
    }

    #[tokio::test]
    async fn denied_sender_is_rejected_at_mail() {
        let policy = FilterPolicy::new(Some(Regex::new(r"^admin@example\.org$").unwrap()), None);
        let relay = Arc::new(MockRelay::with_policy(policy));
        let mut session = session(relay.clone(), Authenticator::default());

        expect_reply(&mut session, "EHLO client", 250).await;
        let message = expect_reply(&mut session, "MAIL FROM:<alice@example.org>", 550).await;
        assert!(message.contains("denied sender"));
        // no envelope was opened, so RCPT is out of sequence
        expect_reply(&mut session, "RCPT TO:<bob@example.org>", 503).await;
    }

    #[tokio::test]
    async fn denied_recipient_is_rejected_at_rcpt() {
        let policy = FilterPolicy::new(None, Some(Regex::new(r"^bob@example\.org$").unwrap()));
        let relay = Arc::new(MockRelay::with_policy(policy));
        let mut session = session(relay.clone(), Authenticator::default());

        expect_reply(&mut session, "EHLO client", 250).await;
        expect_reply(&mut session, "MAIL FROM:<alice@example.org>", 250).await;
        expect_reply(&mut session, "RCPT TO:<bob@example.org>", 550).await;
        expect_reply(&mut session, "RCPT TO:<charlie@example.org>", 250).await;
        expect_reply(&mut session, "DATA", 354).await;
        let (code, _) = send_body(&mut session, b"TEST").await;
        assert_eq!(code, 250);

        let sent = relay.sent.lock().unwrap();
        assert_eq!(sent[0].to, vec!["charlie@example.org".to_string()]);
    }

    #[tokio::test]
    async fn recipient_count_is_bounded() {
        let relay = Arc::new(MockRelay::default());
        let mut session = session(relay, Authenticator::default());

        expect_reply(&mut session, "EHLO client", 250).await;
        expect_reply(&mut session, "MAIL FROM:<alice@example.org>", 250).await;
        for i in 0..Session::MAX_RECIPIENTS {
            expect_reply(&mut session, &format!("RCPT TO:<rcpt{i}@example.org>"), 250).await;
        }
        expect_reply(&mut session, "RCPT TO:<late@example.org>", 452).await;
    }

    #[tokio::test]
    async fn mail_requires_authentication_when_configured() {
        let credentials =
            Credentials::new("user", Some(bcrypt::hash("secret", 4).unwrap()), None).unwrap();
        let authenticator = Authenticator::new(HashSet::new(), Some(credentials));
        let relay = Arc::new(MockRelay::default());
        let mut session = session(relay, authenticator);

        expect_reply(&mut session, "EHLO client", 250).await;
        expect_reply(&mut session, "MAIL FROM:<alice@example.org>", 530).await;
    }

    #[tokio::test]
    async fn plain_auth_with_initial_response() {
        let credentials =
            Credentials::new("user", Some(bcrypt::hash("secret", 4).unwrap()), None).unwrap();
        let authenticator = Authenticator::new(HashSet::new(), Some(credentials));
        let relay = Arc::new(MockRelay::default());
        let mut session = session(relay, authenticator);

        expect_reply(&mut session, "EHLO client", 250).await;
        let token = Base64::encode_string(b"\0user\0secret");
        expect_reply(&mut session, &format!("AUTH PLAIN {token}"), 235).await;
        expect_reply(&mut session, "MAIL FROM:<alice@example.org>", 250).await;
    }

    #[tokio::test]
    async fn plain_auth_with_wrong_password_fails() {
        let credentials =
            Credentials::new("user", Some(bcrypt::hash("secret", 4).unwrap()), None).unwrap();
        let authenticator = Authenticator::new(HashSet::new(), Some(credentials));
        let relay = Arc::new(MockRelay::default());
        let mut session = session(relay, authenticator);

        expect_reply(&mut session, "EHLO client", 250).await;
        let token = Base64::encode_string(b"\0user\0guess");
        expect_reply(&mut session, &format!("AUTH PLAIN {token}"), 535).await;
    }

    #[tokio::test]
    async fn login_auth_two_step() {
        let credentials =
            Credentials::new("user", Some(bcrypt::hash("secret", 4).unwrap()), None).unwrap();
        let authenticator = Authenticator::new(HashSet::new(), Some(credentials));
        let relay = Arc::new(MockRelay::default());
        let mut session = session(relay, authenticator);

        expect_reply(&mut session, "EHLO client", 250).await;
        let prompt = expect_reply(&mut session, "AUTH LOGIN", 334).await;
        assert_eq!(prompt, "VXNlcm5hbWU6");

        let reply = session.handle_auth_response(Base64::encode_string(b"user").as_bytes());
        assert!(matches!(reply, SessionReply::IngestAuth(334, _)));

        let reply = session.handle_auth_response(Base64::encode_string(b"secret").as_bytes());
        assert!(matches!(reply, SessionReply::ReplyAndContinue(235, _)));
    }

    #[tokio::test]
    async fn cram_md5_auth_round_trip() {
        let credentials = Credentials::new("user", None, Some("password".to_string())).unwrap();
        let authenticator = Authenticator::new(HashSet::new(), Some(credentials));
        let relay = Arc::new(MockRelay::default());
        let mut session = session(relay, authenticator);

        expect_reply(&mut session, "EHLO client", 250).await;
        let wire_challenge = expect_reply(&mut session, "AUTH CRAM-MD5", 334).await;

        let response = cram::client_respond("user", "password", &wire_challenge).unwrap();
        let reply = session.handle_auth_response(response.as_bytes());

        assert!(matches!(reply, SessionReply::ReplyAndContinue(235, _)));
    }

    #[tokio::test]
    async fn cram_md5_is_not_offered_without_plain_secret() {
        let credentials =
            Credentials::new("user", Some(bcrypt::hash("secret", 4).unwrap()), None).unwrap();
        let authenticator = Authenticator::new(HashSet::new(), Some(credentials));
        let relay = Arc::new(MockRelay::default());
        let mut session = session(relay, authenticator);

        expect_reply(&mut session, "EHLO client", 250).await;
        expect_reply(&mut session, "AUTH CRAM-MD5", 535).await;
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let relay = Arc::new(MockRelay::default());
        *relay.fail_with.lock().unwrap() = Some(RelayError::MessageTooLarge(16));
        let mut session = session(relay.clone(), Authenticator::default());

        expect_reply(&mut session, "EHLO client", 250).await;
        expect_reply(&mut session, "MAIL FROM:<alice@example.org>", 250).await;
        expect_reply(&mut session, "RCPT TO:<bob@example.org>", 250).await;
        expect_reply(&mut session, "DATA", 354).await;
        let (code, _) = send_body(&mut session, b"way too large").await;
        assert_eq!(code, 552);
    }

    #[tokio::test]
    async fn data_terminator_split_across_chunks() {
        let relay = Arc::new(MockRelay::default());
        let mut session = session(relay.clone(), Authenticator::default());

        expect_reply(&mut session, "EHLO client", 250).await;
        expect_reply(&mut session, "MAIL FROM:<alice@example.org>", 250).await;
        expect_reply(&mut session, "RCPT TO:<bob@example.org>", 250).await;
        expect_reply(&mut session, "DATA", 354).await;

        assert!(matches!(
            session.handle_data(b"hello wor").await,
            DataReply::ContinueIngest
        ));
        assert!(matches!(
            session.handle_data(b"ld\r\n.").await,
            DataReply::ContinueIngest
        ));
        let reply = session.handle_data(b"\r\n").await;
        assert!(matches!(reply, DataReply::ReplyAndContinue(250, _)));

        assert_eq!(relay.sent.lock().unwrap()[0].data, b"hello world");
    }

    #[tokio::test]
    async fn dot_stuffed_lines_are_unstuffed() {
        let relay = Arc::new(MockRelay::default());
        let mut session = session(relay.clone(), Authenticator::default());

        expect_reply(&mut session, "EHLO client", 250).await;
        expect_reply(&mut session, "MAIL FROM:<alice@example.org>", 250).await;
        expect_reply(&mut session, "RCPT TO:<bob@example.org>", 250).await;
        expect_reply(&mut session, "DATA", 354).await;
        let (code, _) = send_body(&mut session, b"line\r\n..dot line").await;
        assert_eq!(code, 250);

        assert_eq!(relay.sent.lock().unwrap()[0].data, b"line\r\n.dot line");
    }

    #[tokio::test]
    async fn rset_clears_the_envelope() {
        let relay = Arc::new(MockRelay::default());
        let mut session = session(relay, Authenticator::default());

        expect_reply(&mut session, "EHLO client", 250).await;
        expect_reply(&mut session, "MAIL FROM:<alice@example.org>", 250).await;
        expect_reply(&mut session, "RSET", 250).await;
        expect_reply(&mut session, "RCPT TO:<bob@example.org>", 503).await;
        expect_reply(&mut session, "MAIL FROM:<alice@example.org>", 250).await;
    }

    #[tokio::test]
    async fn starttls_is_rejected_when_not_offered() {
        let relay = Arc::new(MockRelay::default());
        let mut session = session(relay, Authenticator::default());

        expect_reply(&mut session, "EHLO client", 250).await;
        expect_reply(&mut session, "STARTTLS", 502).await;
    }

    #[tokio::test]
    async fn mail_requires_tls_when_starttls_is_mandatory() {
        let relay = Arc::new(MockRelay::default());
        let mut session = Session::new(
            "127.0.0.1".parse().unwrap(),
            relay,
            Authenticator::default(),
            1024,
            true,
            true,
        );

        expect_reply(&mut session, "EHLO client", 250).await;
        expect_reply(&mut session, "MAIL FROM:<alice@example.org>", 530).await;

        let reply = session.handle(request("STARTTLS")).await;
        assert!(matches!(reply, SessionReply::StartTls(220, _)));
        session.tls_established();

        expect_reply(&mut session, "EHLO client", 250).await;
        expect_reply(&mut session, "MAIL FROM:<alice@example.org>", 250).await;
    }
}
