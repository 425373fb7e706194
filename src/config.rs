//! Command line surface and the validated, immutable configuration

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use structopt::StructOpt;
use thiserror::Error;

use crate::error::SmtpLimits;
use crate::relay::{ClientSecurity, ClientTlsParameters, Credentials, RelayClient};
use crate::session::SessionSettings;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "smtp-forwarder",
    about = "An SMTP listener that relays accepted mail through an authenticated upstream server"
)]
pub struct Opt {
    /// Listening port
    #[structopt(short = "p", long = "port", default_value = "25")]
    pub port: u16,

    /// Listening address
    #[structopt(short = "a", long = "address", default_value = "0.0.0.0")]
    pub address: String,

    /// Upstream SMTP host
    #[structopt(long = "relay-host", default_value = "smtp.gmail.com")]
    pub relay_host: String,

    /// Upstream SMTP port
    #[structopt(long = "relay-port", default_value = "587")]
    pub relay_port: u16,

    /// Upstream user name (required unless --print)
    #[structopt(short = "u", long = "username")]
    pub username: Option<String>,

    /// Upstream password (required unless --print)
    #[structopt(short = "s", long = "secret")]
    pub secret: Option<String>,

    /// Upstream TLS mode: starttls, opportunistic, tls or none
    #[structopt(long = "relay-security", default_value = "starttls")]
    pub relay_security: RelaySecurity,

    /// Upstream network timeout in seconds
    #[structopt(long = "relay-timeout", default_value = "60")]
    pub relay_timeout: u64,

    /// Extra PEM certificates trusted for the upstream
    #[structopt(long = "relay-ca", parse(from_os_str))]
    pub relay_ca: Option<PathBuf>,

    /// Seconds a client may stay silent before being disconnected
    #[structopt(long = "idle-timeout", default_value = "300")]
    pub idle_timeout: u64,

    /// Maximum number of concurrent sessions
    #[structopt(long = "max-sessions", default_value = "100")]
    pub max_sessions: usize,

    /// Maximum connections per minute from the same IP (0: unlimited)
    #[structopt(long = "max-connections-per-minute", default_value = "0")]
    pub max_connections_per_minute: usize,

    /// Maximum message size in bytes
    #[structopt(long = "max-message-size", default_value = "10485760")]
    pub max_message_size: usize,

    /// Name used in the greeting and EHLO (default: system hostname)
    #[structopt(long = "hostname")]
    pub hostname: Option<String>,

    /// Print messages to stdout instead of relaying them
    #[structopt(long = "print")]
    pub print: bool,

    /// TLS certificate file, enables STARTTLS
    #[structopt(long = "tls-cert", parse(from_os_str))]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key file
    #[structopt(long = "tls-key", parse(from_os_str))]
    pub tls_key: Option<PathBuf>,

    /// Log file path
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Debug logging
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("--username and --secret are required unless --print is given")]
    MissingCredentials,

    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),

    #[error("--tls-cert and --tls-key must be given together")]
    IncompleteTls,

    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),

    #[error("invalid relay security '{0}' (expected starttls, opportunistic, tls or none)")]
    InvalidSecurity(String),
}

/// TLS policy towards the upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaySecurity {
    /// STARTTLS is mandatory
    StartTls,
    /// STARTTLS when offered
    Opportunistic,
    /// TLS from the first byte
    Tls,
    /// Plain text
    None,
}

impl FromStr for RelaySecurity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "starttls" => Ok(RelaySecurity::StartTls),
            "opportunistic" => Ok(RelaySecurity::Opportunistic),
            "tls" | "wrapper" => Ok(RelaySecurity::Tls),
            "none" | "plain" => Ok(RelaySecurity::None),
            _ => Err(ConfigError::InvalidSecurity(s.to_string())),
        }
    }
}

impl fmt::Display for RelaySecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RelaySecurity::StartTls => "starttls",
            RelaySecurity::Opportunistic => "opportunistic",
            RelaySecurity::Tls => "tls",
            RelaySecurity::None => "none",
        })
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct RelayCredentials {
    pub username: String,
    pub secret: String,
}

impl fmt::Debug for RelayCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayCredentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub credentials: RelayCredentials,
    pub security: RelaySecurity,
    pub timeout: Duration,
    pub ca_file: Option<PathBuf>,
}

impl RelayConfig {
    /// Builds the upstream client; loads the trust anchors when TLS is involved
    pub fn client(&self, hello_name: &str) -> io::Result<RelayClient> {
        let tls = || ClientTlsParameters::with_roots(self.host.clone(), self.ca_file.as_deref());
        let security = match self.security {
            RelaySecurity::StartTls => ClientSecurity::Required(tls()?),
            RelaySecurity::Opportunistic => ClientSecurity::Opportunistic(tls()?),
            RelaySecurity::Tls => ClientSecurity::Wrapper(tls()?),
            RelaySecurity::None => ClientSecurity::None,
        };

        Ok(RelayClient::new(self.host.clone(), self.port, security)
            .hello_name(hello_name)
            .credentials(Credentials::new(
                self.credentials.username.clone(),
                self.credentials.secret.clone(),
            ))
            .timeout(Some(self.timeout)))
    }
}

/// Where accepted messages go
#[derive(Debug, Clone)]
pub enum Delivery {
    Print,
    Relay(RelayConfig),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub hostname: String,
    pub idle_timeout: Duration,
    pub max_sessions: usize,
    pub max_connections_per_minute: usize,
    pub max_message_size: usize,
    pub tls: Option<TlsFiles>,
    pub delivery: Delivery,
    pub log_file: Option<PathBuf>,
    pub verbose: bool,
}

impl Config {
    pub fn from_opt(opt: Opt) -> Result<Config, ConfigError> {
        let ip: IpAddr = opt
            .address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(opt.address.clone()))?;

        if opt.idle_timeout == 0 {
            return Err(ConfigError::ZeroLimit("--idle-timeout"));
        }
        if opt.max_sessions == 0 {
            return Err(ConfigError::ZeroLimit("--max-sessions"));
        }
        if opt.max_message_size == 0 {
            return Err(ConfigError::ZeroLimit("--max-message-size"));
        }

        let tls = match (opt.tls_cert, opt.tls_key) {
            (Some(cert), Some(key)) => Some(TlsFiles { cert, key }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteTls),
        };

        let delivery = if opt.print {
            Delivery::Print
        } else {
            if opt.relay_timeout == 0 {
                return Err(ConfigError::ZeroLimit("--relay-timeout"));
            }
            let credentials = match (opt.username, opt.secret) {
                (Some(username), Some(secret)) if !username.is_empty() && !secret.is_empty() => {
                    RelayCredentials { username, secret }
                }
                _ => return Err(ConfigError::MissingCredentials),
            };
            Delivery::Relay(RelayConfig {
                host: opt.relay_host,
                port: opt.relay_port,
                credentials,
                security: opt.relay_security,
                timeout: Duration::from_secs(opt.relay_timeout),
                ca_file: opt.relay_ca,
            })
        };

        Ok(Config {
            listen: SocketAddr::new(ip, opt.port),
            hostname: opt.hostname.unwrap_or_else(system_hostname),
            idle_timeout: Duration::from_secs(opt.idle_timeout),
            max_sessions: opt.max_sessions,
            max_connections_per_minute: opt.max_connections_per_minute,
            max_message_size: opt.max_message_size,
            tls,
            delivery,
            log_file: opt.log_file,
            verbose: opt.verbose,
        })
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            hostname: self.hostname.clone(),
            max_message_size: self.max_message_size,
            starttls: self.tls.is_some(),
        }
    }
}

fn system_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

impl Default for Config {
    /// Print mode on loopback with the usual limits
    fn default() -> Self {
        Config {
            listen: SocketAddr::from(([127, 0, 0, 1], 2525)),
            hostname: "localhost".to_string(),
            idle_timeout: Duration::from_secs(300),
            max_sessions: 100,
            max_connections_per_minute: 0,
            max_message_size: SmtpLimits::DEFAULT_MAX_MESSAGE_SIZE,
            tls: None,
            delivery: Delivery::Print,
            log_file: None,
            verbose: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, ConfigError> {
        let mut argv = vec!["smtp-forwarder"];
        argv.extend_from_slice(args);
        Config::from_opt(Opt::from_iter(argv))
    }

    #[test]
    fn test_relay_defaults() {
        let config = parse(&["-u", "me@gmail.com", "-s", "app-password"]).unwrap();

        assert_eq!(config.listen, "0.0.0.0:25".parse().unwrap());
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.max_sessions, 100);
        assert_eq!(config.max_message_size, 10 * 1024 * 1024);
        assert!(config.tls.is_none());
        assert!(!config.hostname.is_empty());

        match config.delivery {
            Delivery::Relay(relay) => {
                assert_eq!(relay.host, "smtp.gmail.com");
                assert_eq!(relay.port, 587);
                assert_eq!(relay.security, RelaySecurity::StartTls);
                assert_eq!(relay.timeout, Duration::from_secs(60));
                assert_eq!(relay.credentials.username, "me@gmail.com");
            }
            Delivery::Print => panic!("expected relay delivery"),
        }
    }

    #[test]
    fn test_print_mode_needs_no_credentials() {
        let config = parse(&["--print", "-p", "2525", "-a", "127.0.0.1", "--hostname", "mx.test"]).unwrap();

        assert!(matches!(config.delivery, Delivery::Print));
        assert_eq!(config.listen, "127.0.0.1:2525".parse().unwrap());
        assert_eq!(config.hostname, "mx.test");
    }

    #[test]
    fn test_invalid_configurations() {
        assert!(matches!(parse(&[]), Err(ConfigError::MissingCredentials)));
        assert!(matches!(parse(&["-u", "me"]), Err(ConfigError::MissingCredentials)));
        assert!(matches!(
            parse(&["--print", "--max-sessions", "0"]),
            Err(ConfigError::ZeroLimit(_))
        ));
        assert!(matches!(
            parse(&["--print", "--tls-cert", "cert.pem"]),
            Err(ConfigError::IncompleteTls)
        ));
        assert!(matches!(
            parse(&["--print", "-a", "not-an-ip"]),
            Err(ConfigError::InvalidAddress(_))
        ));
        assert!(Opt::from_iter_safe(vec!["smtp-forwarder", "--relay-security", "maybe"]).is_err());
    }

    #[test]
    fn test_relay_security() {
        assert_eq!("STARTTLS".parse::<RelaySecurity>().unwrap(), RelaySecurity::StartTls);
        assert_eq!("tls".parse::<RelaySecurity>().unwrap(), RelaySecurity::Tls);
        assert_eq!("none".parse::<RelaySecurity>().unwrap(), RelaySecurity::None);
        assert!("ssl3".parse::<RelaySecurity>().is_err());
    }

    #[test]
    fn test_secret_not_in_debug() {
        let config = parse(&["-u", "me", "-s", "hunter2"]).unwrap();
        assert!(!format!("{:?}", config).contains("hunter2"));
    }

    #[test]
    fn test_session_settings() {
        let config = parse(&["--print", "--tls-cert", "c.pem", "--tls-key", "k.pem"]).unwrap();
        let settings = config.session_settings();
        assert!(settings.starttls);
        assert_eq!(settings.max_message_size, config.max_message_size);
    }
}
