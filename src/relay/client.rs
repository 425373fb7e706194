//! High level relay client: one upstream connection per envelope

use std::fmt::Display;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::envelope::Envelope;
use crate::relay::authentication::{
    Credentials, Mechanism, DEFAULT_ENCRYPTED_MECHANISMS, DEFAULT_UNENCRYPTED_MECHANISMS,
};
use crate::relay::codec::ClientCodec;
use crate::relay::commands::*;
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::extension::{Extension, ServerInfo};
use crate::relay::net::{ClientTlsParameters, NetworkStream};
use crate::relay::response::parse_response;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CHALLENGES: usize = 10;

/// How to apply TLS to a client connection
#[derive(Clone, Debug)]
pub enum ClientSecurity {
    /// Insecure connection only (for testing purposes)
    None,
    /// Start with insecure connection and use `STARTTLS` when available
    Opportunistic(ClientTlsParameters),
    /// Start with insecure connection and require `STARTTLS`
    Required(ClientTlsParameters),
    /// Use TLS wrapped connection
    Wrapper(ClientTlsParameters),
}

/// Returns the string replacing all the CRLF with "\<CRLF\>"
/// Used for debug displays
fn escape_crlf(string: &str) -> String {
    string.replace("\r\n", "<CRLF>")
}

/// Contains client configuration
#[derive(Clone, Debug)]
pub struct RelayClient {
    host: String,
    port: u16,
    security: ClientSecurity,
    /// Name sent during EHLO
    hello_name: String,
    credentials: Option<Credentials>,
    /// Optional enforced authentication mechanism
    authentication_mechanism: Option<Vec<Mechanism>>,
    /// Bounds every network operation
    timeout: Option<Duration>,
}

impl RelayClient {
    /// Creates a new relay client
    ///
    /// Defaults are:
    ///
    /// * No authentication
    /// * `localhost` as EHLO name
    /// * A 60 seconds timeout for smtp commands
    pub fn new(host: impl Into<String>, port: u16, security: ClientSecurity) -> RelayClient {
        RelayClient {
            host: host.into(),
            port,
            security,
            hello_name: "localhost".to_string(),
            credentials: None,
            authentication_mechanism: None,
            timeout: Some(Duration::from_secs(60)),
        }
    }

    /// Set the name used during EHLO
    pub fn hello_name(mut self, name: impl Into<String>) -> RelayClient {
        self.hello_name = name.into();
        self
    }

    /// Set the client credentials
    pub fn credentials(mut self, credentials: Credentials) -> RelayClient {
        self.credentials = Some(credentials);
        self
    }

    /// Set the authentication mechanism to use
    pub fn authentication_mechanism(mut self, mechanism: Vec<Mechanism>) -> RelayClient {
        self.authentication_mechanism = Some(mechanism);
        self
    }

    /// Set the timeout duration
    pub fn timeout(mut self, timeout: Option<Duration>) -> RelayClient {
        self.timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn get_accepted_mechanism(&self, encrypted: bool) -> &[Mechanism] {
        match self.authentication_mechanism {
            Some(ref mechanism) => mechanism,
            None => {
                if encrypted {
                    DEFAULT_ENCRYPTED_MECHANISMS
                } else {
                    DEFAULT_UNENCRYPTED_MECHANISMS
                }
            }
        }
    }

    async fn resolve(&self) -> Result<SocketAddr, RelayError> {
        let mut addresses = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|_| RelayError::Resolution)?;
        addresses.next().ok_or(RelayError::Resolution)
    }

    /// Delivers one envelope, from the greeting to `QUIT`
    ///
    /// Any negative reply aborts the whole send. `QUIT` is attempted in every
    /// case once connected.
    pub async fn send(&self, envelope: &Envelope) -> RelayResult {
        let addr = self.resolve().await?;
        debug!("connecting to {}", addr);

        let wrapper = match self.security {
            ClientSecurity::Wrapper(ref tls_parameters) => Some(tls_parameters),
            _ => None,
        };
        let stream = NetworkStream::connect(&addr, self.timeout, wrapper)
            .await
            .map_err(|e| match wrapper {
                Some(_) => RelayError::Tls(e),
                None => RelayError::Io(e),
            })?;

        let mut connection = SmtpConnection::new(stream, self.timeout);
        let result = self.transaction(&mut connection, envelope).await;
        connection.close().await;
        result
    }

    async fn transaction(&self, connection: &mut SmtpConnection, envelope: &Envelope) -> RelayResult {
        connection.read_response().await?;

        let server_info = self.ehlo(connection).await?;
        let server_info = self.try_tls(connection, server_info).await?;
        self.try_login(connection, &server_info).await?;

        let eight_bit = server_info.supports_feature(Extension::EightBitMime);
        connection
            .command(MailCommand::new(envelope.sender().cloned(), eight_bit))
            .await?;

        for recipient in envelope.recipients() {
            connection.command(RcptCommand::new(recipient.clone())).await?;
            debug!("to=<{}>", recipient);
        }

        connection.command(DataCommand).await?;
        let response = connection.message(envelope.body()).await?;

        debug!(
            "relayed to {}:{} ({} recipient(s)): {}",
            self.host,
            self.port,
            envelope.recipients().len(),
            response.first_line().unwrap_or_default()
        );
        Ok(response)
    }

    /// Gets the EHLO response and parses server information.
    async fn ehlo(&self, connection: &mut SmtpConnection) -> Result<ServerInfo, RelayError> {
        let ehlo_response = connection
            .command(EhloCommand::new(self.hello_name.clone()))
            .await?;
        let server_info = ServerInfo::from_response(&ehlo_response)?;

        debug!("server {}", server_info);
        Ok(server_info)
    }

    async fn try_tls(
        &self,
        connection: &mut SmtpConnection,
        server_info: ServerInfo,
    ) -> Result<ServerInfo, RelayError> {
        match (
            &self.security,
            server_info.supports_feature(Extension::StartTls),
        ) {
            (ClientSecurity::Required(_), false) => {
                Err(From::from("Could not encrypt connection, aborting"))
            }
            (ClientSecurity::Opportunistic(_), false)
            | (ClientSecurity::None, _)
            | (ClientSecurity::Wrapper(_), _) => Ok(server_info),
            (ClientSecurity::Opportunistic(ref tls_parameters), true)
            | (ClientSecurity::Required(ref tls_parameters), true) => {
                connection.command(StarttlsCommand).await?;
                connection.upgrade_tls(tls_parameters).await?;

                debug!("connection encrypted");

                // Send EHLO again
                self.ehlo(connection).await
            }
        }
    }

    async fn try_login(
        &self,
        connection: &mut SmtpConnection,
        server_info: &ServerInfo,
    ) -> Result<(), RelayError> {
        let credentials = match self.credentials {
            Some(ref credentials) => credentials,
            None => return Ok(()),
        };

        let accepted_mechanisms = self.get_accepted_mechanism(connection.is_encrypted());
        let mechanism = accepted_mechanisms
            .iter()
            .find(|mechanism| server_info.supports_auth_mechanism(**mechanism))
            .ok_or_else(|| {
                RelayError::Authentication("No supported authentication mechanisms available".to_string())
            })?;

        match connection.auth(*mechanism, credentials).await {
            Ok(_) => {
                debug!("authenticated as {} with {}", credentials.username(), mechanism);
                Ok(())
            }
            Err(RelayError::Transient(response)) | Err(RelayError::Permanent(response)) => {
                Err(RelayError::Authentication(format!(
                    "{} {}",
                    response.code,
                    response.first_line().unwrap_or_default()
                )))
            }
            Err(err) => Err(err),
        }
    }
}

/// Low level client over one upstream connection
struct SmtpConnection {
    /// None after a failed TLS upgrade
    stream: Option<BufReader<NetworkStream>>,
    timeout: Option<Duration>,
}

impl SmtpConnection {
    fn new(stream: NetworkStream, timeout: Option<Duration>) -> SmtpConnection {
        SmtpConnection {
            stream: Some(BufReader::new(stream)),
            timeout,
        }
    }

    fn is_encrypted(&self) -> bool {
        self.stream
            .as_ref()
            .map(|s| s.get_ref().is_encrypted())
            .unwrap_or(false)
    }

    /// Upgrades the underlying connection to SSL/TLS.
    async fn upgrade_tls(&mut self, tls_parameters: &ClientTlsParameters) -> Result<(), RelayError> {
        let stream = self
            .stream
            .take()
            .ok_or(RelayError::Client("Connection closed"))?
            .into_inner();
        let upgraded = with_timeout(self.timeout, async {
            stream.upgrade_tls(tls_parameters).await.map_err(RelayError::Tls)
        })
        .await?;
        self.stream = Some(BufReader::new(upgraded));
        Ok(())
    }

    /// Sends an AUTH command with the given mechanism, and handles challenge if needed
    async fn auth(&mut self, mechanism: Mechanism, credentials: &Credentials) -> RelayResult {
        let mut challenges = MAX_CHALLENGES;
        let mut response = self
            .secret_command(AuthCommand::new(mechanism, credentials, None)?)
            .await?;

        while challenges > 0 && response.has_code(334) {
            challenges -= 1;
            response = self
                .secret_command(AuthCommand::new_from_response(
                    mechanism,
                    credentials,
                    &response,
                )?)
                .await?;
        }

        if challenges == 0 {
            Err(RelayError::ResponseParsing("Unexpected number of challenges"))
        } else {
            Ok(response)
        }
    }

    /// Sends the message content followed by the terminating dot line.
    async fn message(&mut self, body: &[u8]) -> RelayResult {
        let mut codec = ClientCodec::new();
        let timeout = self.timeout;
        let stream = self
            .stream
            .as_mut()
            .ok_or(RelayError::Client("Connection closed"))?
            .get_mut();

        with_timeout(timeout, async {
            codec.encode(body, &mut *stream).await?;
            codec.finish(&mut *stream).await?;
            stream.flush().await?;
            Ok::<(), RelayError>(())
        })
        .await?;
        debug!(">> {} bytes of message data", body.len());

        self.read_response().await
    }

    /// Sends an SMTP command
    async fn command<C: Display>(&mut self, command: C) -> RelayResult {
        self.write(command.to_string().as_bytes(), false).await?;
        self.read_response().await
    }

    /// Sends a command carrying credentials, kept out of the logs
    async fn secret_command<C: Display>(&mut self, command: C) -> RelayResult {
        self.write(command.to_string().as_bytes(), true).await?;
        self.read_response().await
    }

    /// Writes a string to the server
    async fn write(&mut self, string: &[u8], redact: bool) -> Result<(), RelayError> {
        let timeout = self.timeout;
        let stream = self
            .stream
            .as_mut()
            .ok_or(RelayError::Client("Connection closed"))?
            .get_mut();

        with_timeout(timeout, async {
            stream.write_all(string).await?;
            stream.flush().await?;
            Ok::<(), RelayError>(())
        })
        .await?;

        if redact {
            debug!(">> <credentials>");
        } else {
            debug!(
                ">> {}",
                escape_crlf(String::from_utf8_lossy(string).as_ref())
            );
        }
        Ok(())
    }

    /// Gets the SMTP response
    async fn read_response(&mut self) -> RelayResult {
        let timeout = self.timeout;
        let reader = self
            .stream
            .as_mut()
            .ok_or(RelayError::Client("Connection closed"))?;

        let buffer = with_timeout(timeout, async {
            let mut buffer = String::with_capacity(100);
            loop {
                let start = buffer.len();
                if reader.read_line(&mut buffer).await? == 0 {
                    return Err(RelayError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed by upstream",
                    )));
                }
                // "NNN-" announces another line of the same reply
                if buffer.as_bytes().get(start + 3) != Some(&b'-') {
                    return Ok::<String, RelayError>(buffer);
                }
            }
        })
        .await?;

        debug!("<< {}", escape_crlf(&buffer));

        let (_remaining, response) = parse_response(&buffer)?;
        if response.is_positive() {
            Ok(response)
        } else {
            Err(response.into())
        }
    }

    /// Closes the SMTP transaction if possible.
    async fn close(&mut self) {
        if self.stream.is_none() {
            return;
        }
        match tokio::time::timeout(CLOSE_TIMEOUT, self.command(QuitCommand)).await {
            Ok(Ok(_)) => (),
            Ok(Err(err)) => debug!("QUIT failed: {}", err),
            Err(_) => debug!("QUIT timed out"),
        }
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.get_mut().shutdown().await;
        }
    }
}

async fn with_timeout<F, T>(timeout: Option<Duration>, f: F) -> Result<T, RelayError>
where
    F: std::future::Future<Output = Result<T, RelayError>>,
{
    match timeout {
        Some(duration) => tokio::time::timeout(duration, f)
            .await
            .map_err(|_| RelayError::Timeout)?,
        None => f.await,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_escape_crlf() {
        assert_eq!(escape_crlf("\r\n"), "<CRLF>");
        assert_eq!(escape_crlf("EHLO my_name\r\n"), "EHLO my_name<CRLF>");
        assert_eq!(
            escape_crlf("EHLO my_name\r\nSIZE 42\r\n"),
            "EHLO my_name<CRLF>SIZE 42<CRLF>"
        );
    }

    #[test]
    fn test_accepted_mechanisms() {
        let client = RelayClient::new("localhost", 25, ClientSecurity::None);
        assert_eq!(client.get_accepted_mechanism(true), DEFAULT_ENCRYPTED_MECHANISMS);
        assert!(client.get_accepted_mechanism(false).is_empty());

        let client = client.authentication_mechanism(vec![Mechanism::Login]);
        assert_eq!(client.get_accepted_mechanism(false), &[Mechanism::Login]);
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        let client = RelayClient::new("invalid host name", 25, ClientSecurity::None);
        let envelope = Envelope::new(None, vec!["b@y".parse().unwrap()], b"hi\r\n".to_vec());
        let err = client.send(&envelope).await.unwrap_err();
        assert!(err.is_network(), "{:?}", err);
    }
}
