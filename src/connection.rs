//! Line-oriented I/O for one inbound SMTP connection

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time;
use tracing::debug;

use crate::error::{ConnectionError, SmtpError, SmtpLimits};
use crate::response::Reply;
use crate::session::{Action, SmtpSession};

/// How a served connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// QUIT, or the session refused to go on
    Closed,
    /// `220` was sent for STARTTLS; the caller upgrades the stream
    StartTls,
}

enum Line {
    Complete(Vec<u8>),
    TooLong,
}

/// Wraps a stream with the reads and writes an SMTP server needs.
///
/// Every read waits at most `idle_timeout` for a complete line.
pub struct Connection<S> {
    stream: BufReader<S>,
    idle_timeout: Duration,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, idle_timeout: Duration) -> Self {
        Self {
            stream: BufReader::new(stream),
            idle_timeout,
        }
    }

    /// Gives the stream back. Input read ahead but not consumed is dropped.
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    /// Reads up to and including the next LF.
    ///
    /// A line longer than `limit` is consumed entirely and reported as
    /// `TooLong` without being kept in memory.
    async fn read_raw_line(&mut self, limit: usize) -> Result<Line, ConnectionError> {
        let stream = &mut self.stream;
        let read = async move {
            let mut line = Vec::new();
            let mut too_long = false;
            loop {
                let available = stream.fill_buf().await?;
                if available.is_empty() {
                    return Err(ConnectionError::Closed);
                }
                let (used, done) = match available.iter().position(|b| *b == b'\n') {
                    Some(idx) => (idx + 1, true),
                    None => (available.len(), false),
                };
                if !too_long {
                    line.extend_from_slice(&available[..used]);
                    if line.len() > limit {
                        too_long = true;
                        line = Vec::new();
                    }
                }
                stream.consume(used);

                if done {
                    return Ok(if too_long {
                        Line::TooLong
                    } else {
                        Line::Complete(line)
                    });
                }
            }
        };

        time::timeout(self.idle_timeout, read)
            .await
            .map_err(|_| ConnectionError::Timeout)?
    }

    /// Reads one command line, without its line ending.
    pub async fn read_line(&mut self) -> Result<String, ConnectionError> {
        match self.read_raw_line(SmtpLimits::COMMAND_LINE_MAX_LENGTH).await? {
            Line::TooLong => Err(ConnectionError::Protocol(SmtpError::LineTooLong {
                max: SmtpLimits::COMMAND_LINE_MAX_LENGTH,
            })),
            Line::Complete(line) => {
                let line = String::from_utf8(line)
                    .map_err(|_| ConnectionError::Protocol(SmtpError::NonUtf8))?;
                Ok(strip_line_ending(&line).to_string())
            }
        }
    }

    /// Reads the message body up to the lone `.` line.
    ///
    /// A leading dot is removed from every other line and each line is
    /// stored with a CRLF ending. A body over `max_size` is read to the end
    /// and discarded.
    pub async fn read_data(&mut self, max_size: usize) -> Result<Vec<u8>, ConnectionError> {
        let mut body = Vec::new();
        let mut too_big = false;
        let mut line_too_long = false;

        loop {
            let line = match self.read_raw_line(SmtpLimits::TEXT_LINE_MAX_LENGTH).await? {
                Line::Complete(line) => line,
                Line::TooLong => {
                    line_too_long = true;
                    continue;
                }
            };

            let content = strip_line_ending_bytes(&line);
            if content == b"." {
                break;
            }
            let content = content.strip_prefix(b".").unwrap_or(content);

            if too_big || line_too_long {
                continue;
            }
            if body.len() + content.len() + 2 > max_size {
                too_big = true;
                body = Vec::new();
                continue;
            }
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }

        if too_big {
            return Err(ConnectionError::Protocol(SmtpError::MessageTooBig { max: max_size }));
        }
        if line_too_long {
            return Err(ConnectionError::Protocol(SmtpError::LineTooLong {
                max: SmtpLimits::TEXT_LINE_MAX_LENGTH,
            }));
        }
        Ok(body)
    }

    pub async fn write_reply(&mut self, reply: &Reply) -> Result<(), ConnectionError> {
        let stream = self.stream.get_mut();
        stream.write_all(reply.format().as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Runs the command loop until the client leaves or asks for TLS.
    ///
    /// The greeting is the caller's job. An idle client gets a `421` before
    /// the `Timeout` error is returned.
    pub async fn serve(&mut self, session: &mut SmtpSession) -> Result<Exit, ConnectionError> {
        loop {
            let line = match self.read_line().await {
                Ok(line) => line,
                Err(ConnectionError::Protocol(err)) => {
                    self.write_reply(&err.to_reply()).await?;
                    continue;
                }
                Err(ConnectionError::Timeout) => {
                    let _ = self.write_reply(&Reply::idle_timeout(session.hostname())).await;
                    return Err(ConnectionError::Timeout);
                }
                Err(err) => return Err(err),
            };

            let action = session.handle_line(&line);
            debug!(peer = %session.peer(), ">> {}", action.reply());
            match action {
                Action::Reply(reply) => self.write_reply(&reply).await?,
                Action::StartData(reply) => {
                    self.write_reply(&reply).await?;
                    let reply = match self.read_data(session.max_message_size()).await {
                        Ok(body) => session.receive_data(body).await,
                        Err(ConnectionError::Protocol(err)) => session.abort_data(err),
                        Err(ConnectionError::Timeout) => {
                            let _ = self.write_reply(&Reply::idle_timeout(session.hostname())).await;
                            return Err(ConnectionError::Timeout);
                        }
                        Err(err) => return Err(err),
                    };
                    self.write_reply(&reply).await?;
                }
                Action::StartTls(reply) => {
                    self.write_reply(&reply).await?;
                    return Ok(Exit::StartTls);
                }
                Action::Close(reply) => {
                    self.write_reply(&reply).await?;
                    return Ok(Exit::Closed);
                }
            }
        }
    }
}

fn strip_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

fn strip_line_ending_bytes(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::session::SessionSettings;
    use crate::sink::{DeliveryError, MessageSink};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<Envelope>>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn deliver(&self, envelope: Envelope) -> Result<(), DeliveryError> {
            self.delivered.lock().unwrap().push(envelope);
            Ok(())
        }
    }

    fn pair() -> (Connection<DuplexStream>, DuplexStream) {
        let (server, client) = duplex(64 * 1024);
        (Connection::new(server, TIMEOUT), client)
    }

    async fn read_all(mut client: DuplexStream) -> String {
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_read_line() {
        let (mut conn, mut client) = pair();
        client.write_all(b"HELO a\r\nNOOP\n").await.unwrap();

        assert_eq!(conn.read_line().await.unwrap(), "HELO a");
        assert_eq!(conn.read_line().await.unwrap(), "NOOP");

        drop(client);
        assert!(matches!(conn.read_line().await, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_read_line_too_long() {
        let (mut conn, mut client) = pair();
        let long = format!("NOOP {}\r\nQUIT\r\n", "x".repeat(SmtpLimits::COMMAND_LINE_MAX_LENGTH));
        client.write_all(long.as_bytes()).await.unwrap();

        assert!(matches!(
            conn.read_line().await,
            Err(ConnectionError::Protocol(SmtpError::LineTooLong { .. }))
        ));
        assert_eq!(conn.read_line().await.unwrap(), "QUIT");
    }

    #[tokio::test]
    async fn test_read_line_non_utf8() {
        let (mut conn, mut client) = pair();
        client.write_all(b"HELO \xff\xfe\r\nQUIT\r\n").await.unwrap();

        assert!(matches!(
            conn.read_line().await,
            Err(ConnectionError::Protocol(SmtpError::NonUtf8))
        ));
        assert_eq!(conn.read_line().await.unwrap(), "QUIT");
    }

    #[tokio::test]
    async fn test_read_data() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"Subject: hi\r\n\r\n..leading-dot\nbare lf\r\n.\r\nQUIT\r\n")
            .await
            .unwrap();

        let body = conn.read_data(1024).await.unwrap();
        assert_eq!(body, b"Subject: hi\r\n\r\n.leading-dot\r\nbare lf\r\n");
        assert_eq!(conn.read_line().await.unwrap(), "QUIT");
    }

    #[tokio::test]
    async fn test_read_data_too_big() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"0123456789\r\n0123456789\r\n.\r\nNOOP\r\n")
            .await
            .unwrap();

        assert!(matches!(
            conn.read_data(16).await,
            Err(ConnectionError::Protocol(SmtpError::MessageTooBig { max: 16 }))
        ));
        // the rest of the body was consumed
        assert_eq!(conn.read_line().await.unwrap(), "NOOP");
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (server, client) = duplex(1024);
        let mut conn = Connection::new(server, Duration::from_millis(50));
        let sink = Arc::new(RecordingSink::default());
        let mut session = SmtpSession::new(
            "127.0.0.1:1".parse().unwrap(),
            Arc::new(SessionSettings::default()),
            sink,
        );

        let result = conn.serve(&mut session).await;
        assert!(matches!(result, Err(ConnectionError::Timeout)));
        drop(conn);

        assert_eq!(
            read_all(client).await,
            "421 localhost Idle timeout, closing connection\r\n"
        );
    }

    #[tokio::test]
    async fn test_serve_transaction() {
        let (mut conn, mut client) = pair();
        let sink = Arc::new(RecordingSink::default());
        let mut session = SmtpSession::new(
            "127.0.0.1:1".parse().unwrap(),
            Arc::new(SessionSettings::default()),
            sink.clone(),
        );

        client
            .write_all(b"MAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nDATA\r\nhello\r\n.\r\nQUIT\r\n")
            .await
            .unwrap();

        assert_eq!(conn.serve(&mut session).await.unwrap(), Exit::Closed);
        drop(conn);

        let transcript = read_all(client).await;
        let codes: Vec<&str> = transcript.lines().map(|l| &l[..3]).collect();
        assert_eq!(codes, vec!["250", "250", "354", "250", "221"]);

        let delivered = sink.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].reverse_path(), "<a@x>");
        assert_eq!(delivered[0].recipients()[0].as_ref(), "b@y");
        assert_eq!(delivered[0].body(), b"hello\r\n");
    }

    #[tokio::test]
    async fn test_serve_starttls_exit() {
        let (mut conn, mut client) = pair();
        let settings = SessionSettings {
            starttls: true,
            ..Default::default()
        };
        let mut session = SmtpSession::new(
            "127.0.0.1:1".parse().unwrap(),
            Arc::new(settings),
            Arc::new(RecordingSink::default()),
        );

        client.write_all(b"EHLO c\r\nSTARTTLS\r\n").await.unwrap();
        assert_eq!(conn.serve(&mut session).await.unwrap(), Exit::StartTls);
        drop(conn);

        assert!(read_all(client).await.ends_with("220 Ready to start TLS\r\n"));
    }
}
