//! Network streams used by the relay client

use std::fmt;
use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::{Certificate, ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use rustls_pemfile::certs;
use tokio::io::{self, AsyncRead, AsyncWrite, ErrorKind, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Parameters to use for secure clients
#[derive(Clone)]
pub struct ClientTlsParameters {
    /// A connector from `tokio-rustls`
    pub connector: TlsConnector,
    /// The domain to send during the TLS handshake
    pub domain: String,
}

impl fmt::Debug for ClientTlsParameters {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("ClientTlsParameters")
            .field("connector", &"ClientConfig")
            .field("domain", &self.domain)
            .finish()
    }
}

impl ClientTlsParameters {
    /// Creates a `ClientTlsParameters`
    pub fn new(domain: String, connector: TlsConnector) -> ClientTlsParameters {
        ClientTlsParameters { connector, domain }
    }

    /// Trusts the bundled web PKI roots, plus the PEM certificates in
    /// `extra_roots` when given.
    pub fn with_roots(domain: String, extra_roots: Option<&Path>) -> io::Result<ClientTlsParameters> {
        let mut root_store = RootCertStore::empty();
        root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));

        if let Some(path) = extra_roots {
            let mut reader = StdBufReader::new(File::open(path)?);
            let ders = certs(&mut reader)?;
            let (added, ignored) = root_store.add_parsable_certificates(&ders);
            if added == 0 {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    format!("no usable certificate in {:?} ({} ignored)", path, ignored),
                ));
            }
        }

        Ok(Self::with_root_store(domain, root_store))
    }

    /// Trusts exactly the given certificates
    pub fn with_certificates(domain: String, certificates: &[Certificate]) -> io::Result<ClientTlsParameters> {
        let mut root_store = RootCertStore::empty();
        for certificate in certificates {
            root_store
                .add(certificate)
                .map_err(|e| io::Error::new(ErrorKind::InvalidData, format!("{:?}", e)))?;
        }
        Ok(Self::with_root_store(domain, root_store))
    }

    fn with_root_store(domain: String, root_store: RootCertStore) -> ClientTlsParameters {
        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        ClientTlsParameters::new(domain, TlsConnector::from(Arc::new(config)))
    }

    async fn handshake(&self, stream: TcpStream) -> io::Result<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(self.domain.as_str())
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        self.connector.connect(server_name, stream).await
    }
}

/// Represents the different types of underlying network streams
#[allow(missing_debug_implementations)]
pub enum NetworkStream {
    /// Plain TCP stream
    Tcp(TcpStream),
    /// Encrypted TCP stream
    Tls(Box<TlsStream<TcpStream>>),
}

impl NetworkStream {
    /// Opens a connection, wrapped in TLS right away when `tls_parameters` is given
    pub async fn connect(
        addr: &std::net::SocketAddr,
        timeout: Option<Duration>,
        tls_parameters: Option<&ClientTlsParameters>,
    ) -> io::Result<NetworkStream> {
        let tcp_stream = with_timeout(timeout, TcpStream::connect(addr)).await?;

        match tls_parameters {
            Some(context) => with_timeout(timeout, context.handshake(tcp_stream))
                .await
                .map(|s| NetworkStream::Tls(Box::new(s))),
            None => Ok(NetworkStream::Tcp(tcp_stream)),
        }
    }

    /// Upgrades to TLS connection
    pub async fn upgrade_tls(self, tls_parameters: &ClientTlsParameters) -> io::Result<Self> {
        match self {
            NetworkStream::Tcp(stream) => {
                let tls_stream = tls_parameters.handshake(stream).await?;
                Ok(NetworkStream::Tls(Box::new(tls_stream)))
            }
            _ => Ok(self),
        }
    }

    /// Is the NetworkStream encrypted
    pub fn is_encrypted(&self) -> bool {
        matches!(self, NetworkStream::Tls(_))
    }
}

async fn with_timeout<F, T>(timeout: Option<Duration>, f: F) -> io::Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    match timeout {
        Some(duration) => match tokio::time::timeout(duration, f).await {
            Ok(r) => r,
            Err(e) => Err(io::Error::new(ErrorKind::TimedOut, e)),
        },
        None => f.await,
    }
}

impl AsyncRead for NetworkStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            NetworkStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetworkStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            NetworkStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            NetworkStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            NetworkStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            NetworkStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
