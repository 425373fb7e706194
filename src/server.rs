//! Listener loop: one task per connection

use std::io::{BufRead, BufReader as StdBufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::{Config, TlsFiles};
use crate::connection::{Connection, Exit};
use crate::error::ConnectionError;
use crate::ratelimiter::RateLimiter;
use crate::response::Reply;
use crate::session::{SessionSettings, SmtpSession};
use crate::sink::MessageSink;

pub struct Server {
    config: Arc<Config>,
    settings: Arc<SessionSettings>,
    sink: Arc<dyn MessageSink>,
    tls_acceptor: Option<TlsAcceptor>,
    sessions: Arc<Semaphore>,
    rate_limiter: Mutex<RateLimiter>,
}

impl Server {
    /// Prepares the server; reads the certificate and key when STARTTLS is configured
    pub fn new(config: Arc<Config>, sink: Arc<dyn MessageSink>) -> Result<Self> {
        let tls_acceptor = match &config.tls {
            Some(files) => {
                let acceptor = load_tls_acceptor(files)?;
                info!("STARTTLS enabled with certificate: {:?}", files.cert);
                Some(acceptor)
            }
            None => None,
        };
        Ok(Self::with_acceptor(config, sink, tls_acceptor))
    }

    /// Uses an already built acceptor instead of the configured files
    pub fn with_acceptor(
        config: Arc<Config>,
        sink: Arc<dyn MessageSink>,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Self {
        let mut settings = config.session_settings();
        settings.starttls = tls_acceptor.is_some();

        Self {
            settings: Arc::new(settings),
            sink,
            tls_acceptor,
            sessions: Arc::new(Semaphore::new(config.max_sessions)),
            rate_limiter: Mutex::new(RateLimiter::new(config.max_connections_per_minute)),
            config,
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(self.config.listen)
            .await
            .with_context(|| format!("Failed to bind to {}", self.config.listen))?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accepts connections until the task is dropped
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_client(stream, peer).await {
                            warn!(peer = %peer, "Error: {:#}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    pub async fn handle_client(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        {
            let mut limiter = self.rate_limiter.lock().await;
            if !limiter.check_and_add(peer.ip()) {
                info!(
                    peer = %peer,
                    "Rate limit exceeded ({} per minute)",
                    self.config.max_connections_per_minute
                );
                let reply = Reply::rate_limited(&self.settings.hostname);
                let _ = stream.write_all(reply.format().as_bytes()).await;
                return Ok(());
            }
        }

        let _permit = match self.sessions.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(peer = %peer, "Too many sessions ({}), refusing", self.config.max_sessions);
                let reply = Reply::too_busy(&self.settings.hostname);
                let _ = stream.write_all(reply.format().as_bytes()).await;
                return Ok(());
            }
        };

        info!(peer = %peer, "New connection");
        let mut session = SmtpSession::new(peer, self.settings.clone(), self.sink.clone());
        let mut connection = Connection::new(stream, self.config.idle_timeout);
        connection.write_reply(&session.greeting()).await?;

        let exit = connection.serve(&mut session).await;
        let result = match exit {
            Ok(Exit::StartTls) => match &self.tls_acceptor {
                Some(acceptor) => {
                    debug!(peer = %peer, "Starting STARTTLS handshake");
                    match acceptor.accept(connection.into_inner()).await {
                        Ok(tls_stream) => {
                            session.tls_established();
                            let mut connection = Connection::new(tls_stream, self.config.idle_timeout);
                            connection.serve(&mut session).await.map(|_| ())
                        }
                        Err(e) => {
                            warn!(peer = %peer, "TLS handshake failed: {}", e);
                            Ok(())
                        }
                    }
                }
                None => Ok(()),
            },
            Ok(Exit::Closed) => Ok(()),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => info!(peer = %peer, "Connection closed"),
            Err(ConnectionError::Timeout) => info!(peer = %peer, "Idle timeout"),
            Err(ConnectionError::Closed) => info!(peer = %peer, "Connection closed by client"),
            Err(e) => return Err(e).context("session aborted"),
        }
        Ok(())
    }
}

/// Builds the STARTTLS acceptor from a PEM certificate chain and key
pub fn load_tls_acceptor(files: &TlsFiles) -> Result<TlsAcceptor> {
    let cert_chain = load_certs(&files.cert)?;
    let private_key = load_private_key(&files.key)?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| anyhow::anyhow!("Failed to build TLS config: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let cert_file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open certificate: {:?}", path))?;
    let mut cert_reader = StdBufReader::new(cert_file);
    let cert_chain: Vec<Certificate> = certs(&mut cert_reader)
        .map_err(|_| anyhow::anyhow!("Failed to parse certificate"))?
        .into_iter()
        .map(Certificate)
        .collect();

    if cert_chain.is_empty() {
        return Err(anyhow::anyhow!("No certificate found in {:?}", path));
    }
    Ok(cert_chain)
}

fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let mut keys = read_keys(path, pkcs8_private_keys)?;
    if keys.is_empty() {
        keys = read_keys(path, rsa_private_keys)?;
    }
    if keys.is_empty() {
        return Err(anyhow::anyhow!("No private key found in {:?}", path));
    }

    Ok(PrivateKey(keys.remove(0)))
}

fn read_keys(
    path: &Path,
    parse: fn(&mut dyn BufRead) -> std::io::Result<Vec<Vec<u8>>>,
) -> Result<Vec<Vec<u8>>> {
    let key_file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open private key: {:?}", path))?;
    let mut key_reader = StdBufReader::new(key_file);
    parse(&mut key_reader).map_err(|_| anyhow::anyhow!("Failed to parse private key"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tls_files() {
        let files = TlsFiles {
            cert: "/nonexistent/cert.pem".into(),
            key: "/nonexistent/key.pem".into(),
        };
        let err = load_tls_acceptor(&files).err().unwrap();
        assert!(format!("{:#}", err).contains("Failed to open certificate"));
    }

    #[test]
    fn test_empty_certificate_file() {
        let path = std::env::temp_dir().join(format!("smtp-forwarder-empty-{}.pem", std::process::id()));
        std::fs::write(&path, "").unwrap();

        let err = load_certs(&path).err().unwrap();
        assert!(err.to_string().contains("No certificate found"));

        std::fs::remove_file(&path).unwrap();
    }
}
