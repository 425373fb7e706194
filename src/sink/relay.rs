use async_trait::async_trait;
use tracing::{info, warn};

use crate::envelope::Envelope;
use crate::relay::RelayClient;
use crate::sink::{DeliveryError, MessageSink};

/// Forwards every accepted message through an authenticated upstream server.
#[derive(Debug, Clone)]
pub struct RelaySink {
    client: RelayClient,
}

impl RelaySink {
    pub fn new(client: RelayClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MessageSink for RelaySink {
    async fn deliver(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        match self.client.send(&envelope).await {
            Ok(response) => {
                info!(
                    from = %envelope.reverse_path(),
                    recipients = envelope.recipients().len(),
                    size = envelope.body().len(),
                    upstream = %self.client.host(),
                    "relayed: {} {}",
                    response.code,
                    response.first_line().unwrap_or_default()
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    from = %envelope.reverse_path(),
                    upstream = %self.client.host(),
                    authentication = err.is_authentication(),
                    network = err.is_network(),
                    "relay failed: {}",
                    err
                );
                Err(DeliveryError::Relay(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::ClientSecurity;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_relay_failure_surfaces_as_delivery_error() {
        // Upstream that turns the client away right at the greeting
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(b"554 no service for you\r\n")
                .await
                .unwrap();
            // Swallow the QUIT, then hang up
            let mut lines = BufReader::new(stream).lines();
            let _ = lines.next_line().await;
        });

        let client = RelayClient::new("127.0.0.1", port, ClientSecurity::None)
            .timeout(Some(Duration::from_secs(5)));
        let sink = RelaySink::new(client);
        let envelope = Envelope::new(None, vec!["b@y".parse().unwrap()], b"hi\r\n".to_vec());

        match sink.deliver(envelope).await {
            Err(DeliveryError::Relay(err)) => assert!(err.is_rejection(), "{:?}", err),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
