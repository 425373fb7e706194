use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Local;
use tracing::info;

use crate::envelope::Envelope;
use crate::sink::{DeliveryError, MessageSink};

/// Writes every message to standard output (or any other writer) instead
/// of relaying it.
///
/// Writes run on the blocking pool; a stalled pipe never holds up a
/// runtime worker.
pub struct PrintSink {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl PrintSink {
    pub fn stdout() -> Self {
        Self::with_writer(Box::new(io::stdout()))
    }

    pub fn with_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }
}

impl std::fmt::Debug for PrintSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrintSink").finish()
    }
}

fn render(envelope: &Envelope) -> Vec<u8> {
    let separator = "─".repeat(60);
    let recipients = envelope
        .recipients()
        .iter()
        .map(|r| format!("<{}>", r))
        .collect::<Vec<_>>()
        .join(", ");

    let peer = envelope
        .peer()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let mut out = Vec::with_capacity(envelope.body().len() + 256);
    out.extend_from_slice(
        format!(
            "{}\nReceived: {} from {}\nFrom: {}\nTo: {}\n{}\n",
            separator,
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            peer,
            envelope.reverse_path(),
            recipients,
            separator
        )
        .as_bytes(),
    );
    out.extend_from_slice(envelope.body());
    if !envelope.body().ends_with(b"\n") {
        out.push(b'\n');
    }
    out.extend_from_slice(format!("{}\n", separator).as_bytes());
    out
}

#[async_trait]
impl MessageSink for PrintSink {
    async fn deliver(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        let rendered = render(&envelope);
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut writer = writer
                .lock()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "output writer poisoned"))?;
            writer.write_all(&rendered)?;
            writer.flush()
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        info!(
            from = %envelope.reverse_path(),
            recipients = envelope.recipients().len(),
            size = envelope.body().len(),
            "message printed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<StdMutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_print_envelope() {
        let buf = SharedBuf::default();
        let sink = PrintSink::with_writer(Box::new(buf.clone()));
        let envelope = Envelope::new(
            Some("a@x".parse().unwrap()),
            vec!["b@y".parse().unwrap(), "c@z".parse().unwrap()],
            b"Subject: hi\r\n\r\nhello\r\n".to_vec(),
        )
        .with_peer("127.0.0.1:4242".parse().unwrap());

        sink.deliver(envelope).await.unwrap();

        let printed = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(printed.contains(" from 127.0.0.1:4242\n"));
        assert!(printed.contains("From: <a@x>\n"));
        assert!(printed.contains("To: <b@y>, <c@z>\n"));
        assert!(printed.contains("Subject: hi\r\n\r\nhello\r\n"));
    }

    #[tokio::test]
    async fn test_print_null_sender() {
        let buf = SharedBuf::default();
        let sink = PrintSink::with_writer(Box::new(buf.clone()));
        let envelope = Envelope::new(None, vec!["b@y".parse().unwrap()], b"bounce".to_vec());

        sink.deliver(envelope).await.unwrap();

        let printed = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(printed.contains(" from unknown\n"));
        assert!(printed.contains("From: <>\n"));
        assert!(printed.contains("bounce\n"));
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "reader went away"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_write_failure() {
        let sink = PrintSink::with_writer(Box::new(BrokenPipe));
        let envelope = Envelope::new(None, vec!["b@y".parse().unwrap()], b"lost".to_vec());

        match sink.deliver(envelope).await {
            Err(DeliveryError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
