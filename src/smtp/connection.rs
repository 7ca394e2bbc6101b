use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use smtp_proto::Request;
use thiserror::Error;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tracing::{debug, trace};

use crate::config::DebugSink;
use crate::smtp::session::{DataReply, Session, SessionReply};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),
    #[error("failed to write tcp stream: {0}")]
    Write(std::io::Error),
    #[error("failed to read tcp stream: {0}")]
    Read(std::io::Error),
    #[error("connection dropped unexpectedly")]
    Dropped,
    #[error("connection timed out")]
    Timeout,
}

const BUFFER_SIZE: usize = 1024;
const CODE_READY: u16 = 220;

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

/// What to do with the connection after the command loop returns.
pub enum Next<S> {
    Done,
    UpgradeTls(S),
}

/// Mirror of the SMTP conversation for the `--debug` flag. Body chunks and
/// SASL payloads are not mirrored.
pub struct DebugMirror {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl DebugMirror {
    pub fn from_config(debug: &DebugSink) -> std::io::Result<Option<Self>> {
        let sink: Box<dyn Write + Send> = match debug {
            DebugSink::Off => return Ok(None),
            DebugSink::Stdout => Box::new(std::io::stdout()),
            DebugSink::Stderr => Box::new(std::io::stderr()),
            DebugSink::File(path) => Box::new(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?,
            ),
        };

        Ok(Some(Self {
            sink: Mutex::new(sink),
        }))
    }

    fn client_line(&self, line: &[u8]) {
        self.write_line('C', &String::from_utf8_lossy(line));
    }

    fn server_line(&self, line: &str) {
        self.write_line('S', line);
    }

    fn write_line(&self, direction: char, line: &str) {
        if let Ok(mut sink) = self.sink.lock() {
            let _ = writeln!(sink, "{direction}: {}", line.trim_end());
        }
    }
}

/// Drives one SMTP command loop over the given stream. Returns the stream
/// back when the session accepted STARTTLS, so the caller can run the
/// handshake and re-enter with the encrypted stream.
pub async fn run<S>(
    stream: S,
    session: &mut Session,
    limits: &Limits,
    greeting: Option<&str>,
    mirror: Option<&DebugMirror>,
) -> Result<Next<S>, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (source, mut sink) = tokio::io::split(stream);

    // NOTE: we re-use this Vec<u8> to avoid re-allocating the buffer
    let mut buffer = Vec::with_capacity(BUFFER_SIZE);
    let mut reader = BufReader::new(source);

    trace!("handling connection with {}", session.peer_ip());

    if let Some(greeting) = greeting {
        write_reply(CODE_READY, greeting, &mut sink, limits, mirror).await?;
    }

    'session: loop {
        read_line(&mut reader, &mut buffer, limits).await?;
        if let Some(mirror) = mirror {
            mirror.client_line(&buffer);
        }

        let request = Request::parse(&mut buffer.iter()).map(Request::into_owned);

        match session.handle(request).await {
            SessionReply::ReplyAndContinue(code, message) => {
                write_reply(code, &message, &mut sink, limits, mirror).await?;
            }
            SessionReply::ReplyAndStop(code, message) => {
                write_reply(code, &message, &mut sink, limits, mirror).await?;
                break 'session;
            }
            SessionReply::RawReply(buf) => {
                write_raw(&buf, &mut sink, limits, mirror).await?;
            }
            SessionReply::StartTls(code, message) => {
                write_reply(code, &message, &mut sink, limits, mirror).await?;

                let stream = reader.into_inner().unsplit(sink);
                return Ok(Next::UpgradeTls(stream));
            }
            SessionReply::IngestData(code, message) => {
                write_reply(code, &message, &mut sink, limits, mirror).await?;

                'data: loop {
                    read_buf(&mut reader, &mut buffer, limits).await?;

                    match session.handle_data(&buffer).await {
                        DataReply::ContinueIngest => continue 'data,
                        DataReply::ReplyAndContinue(code, message) => {
                            write_reply(code, &message, &mut sink, limits, mirror).await?;
                            continue 'session;
                        }
                    }
                }
            }
            SessionReply::IngestAuth(code, message) => {
                let mut reply = SessionReply::IngestAuth(code, message);

                while let SessionReply::IngestAuth(code, message) = reply {
                    write_reply(code, &message, &mut sink, limits, mirror).await?;

                    read_line(&mut reader, &mut buffer, limits).await?;
                    if let Some(mirror) = mirror {
                        mirror.client_line(b"<credentials elided>");
                    }

                    reply = session.handle_auth_response(&buffer);
                }

                if let SessionReply::ReplyAndContinue(code, message) = reply {
                    write_reply(code, &message, &mut sink, limits, mirror).await?;
                }
            }
        }
    }

    // send tls close notify
    sink.shutdown().await.map_err(ConnectionError::Write)?;

    Ok(Next::Done)
}

async fn read_buf(
    reader: impl AsyncBufReadExt + Unpin,
    buffer: &mut Vec<u8>,
    limits: &Limits,
) -> Result<usize, ConnectionError> {
    buffer.clear();

    tokio::time::timeout(
        limits.read_timeout,
        reader.take(BUFFER_SIZE as u64).read_buf(buffer),
    )
    .await
    .map_err(|_| ConnectionError::Timeout)?
    .map_err(ConnectionError::Read)
    .and_then(|size| {
        if size > 0 {
            Ok(size)
        } else {
            Err(ConnectionError::Dropped)
        }
    })
}

async fn read_line(
    reader: impl AsyncBufReadExt + Unpin,
    buffer: &mut Vec<u8>,
    limits: &Limits,
) -> Result<usize, ConnectionError> {
    buffer.clear();

    tokio::time::timeout(
        limits.read_timeout,
        reader.take(BUFFER_SIZE as u64).read_until(b'\n', buffer),
    )
    .await
    .map_err(|_| ConnectionError::Timeout)?
    .map_err(ConnectionError::Read)
    .and_then(|size| {
        if size > 0 {
            Ok(size)
        } else {
            Err(ConnectionError::Dropped)
        }
    })
}

async fn write_reply(
    code: u16,
    message: &str,
    sink: impl AsyncWriteExt + Unpin,
    limits: &Limits,
    mirror: Option<&DebugMirror>,
) -> Result<(), ConnectionError> {
    let line = format!("{code} {message}\r\n");
    if let Some(mirror) = mirror {
        mirror.server_line(&line);
    }
    debug!("sending: {code} {message}");

    write_raw_unmirrored(line.as_bytes(), sink, limits).await
}

async fn write_raw(
    buf: &[u8],
    sink: impl AsyncWriteExt + Unpin,
    limits: &Limits,
    mirror: Option<&DebugMirror>,
) -> Result<(), ConnectionError> {
    if let Some(mirror) = mirror {
        mirror.server_line(&String::from_utf8_lossy(buf));
    }
    trace!("sending {} bytes", buf.len());

    write_raw_unmirrored(buf, sink, limits).await
}

async fn write_raw_unmirrored(
    buf: &[u8],
    mut sink: impl AsyncWriteExt + Unpin,
    limits: &Limits,
) -> Result<(), ConnectionError> {
    tokio::time::timeout(limits.write_timeout, sink.write_all(buf))
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(ConnectionError::Write)
}
