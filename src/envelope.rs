use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::{SmtpError, SmtpLimits};

/// Email address as it appears in a reverse-path or forward-path
#[derive(PartialEq, Eq, Clone, Debug, Hash)]
pub struct EmailAddress(String);

impl EmailAddress {
    pub fn new(address: String) -> Result<EmailAddress, SmtpError> {
        // Only guard the protocol framing here; real validation is the
        // upstream server's job.
        if address.is_empty() {
            return Err(SmtpError::Syntax("empty address".to_string()));
        }
        if address.len() > SmtpLimits::PATH_MAX_LENGTH {
            return Err(SmtpError::Syntax(format!(
                "path too long (max {} characters)",
                SmtpLimits::PATH_MAX_LENGTH
            )));
        }
        if address.chars().any(|c| {
            !c.is_ascii() || c.is_ascii_control() || c.is_ascii_whitespace() || c == '<' || c == '>'
        }) {
            return Err(SmtpError::Syntax(format!("invalid address <{}>", address)));
        }

        Ok(EmailAddress(address))
    }
}

impl FromStr for EmailAddress {
    type Err = SmtpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EmailAddress::new(s.to_string())
    }
}

impl Display for EmailAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EmailAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Snapshot of one mail transaction.
///
/// A `None` sender is the null reverse-path `<>` used by bounces.
#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct Envelope {
    sender: Option<EmailAddress>,
    recipients: Vec<EmailAddress>,
    body: Vec<u8>,
    /// Client the transaction came from, when known
    peer: Option<SocketAddr>,
}

impl Envelope {
    pub fn new(sender: Option<EmailAddress>, recipients: Vec<EmailAddress>, body: Vec<u8>) -> Self {
        Envelope {
            sender,
            recipients,
            body,
            peer: None,
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn sender(&self) -> Option<&EmailAddress> {
        self.sender.as_ref()
    }

    pub fn recipients(&self) -> &[EmailAddress] {
        &self.recipients
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Sender in angle-bracket form, `<>` for the null path
    pub fn reverse_path(&self) -> String {
        match &self.sender {
            Some(address) => format!("<{}>", address),
            None => "<>".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_address() {
        assert!(EmailAddress::new("foobar@example.org".to_string()).is_ok());
        assert!(EmailAddress::new("postmaster".to_string()).is_ok());
        assert!(EmailAddress::new("foo\rbar@localhost".to_string()).is_err());
        assert!(EmailAddress::new(">foobar@example.org".to_string()).is_err());
        assert!(EmailAddress::new("foo bar@example.org".to_string()).is_err());
        assert!(EmailAddress::new(String::new()).is_err());
        assert!(EmailAddress::new("a".repeat(SmtpLimits::PATH_MAX_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_reverse_path() {
        let envelope = Envelope::new(None, vec!["b@y".parse().unwrap()], vec![]);
        assert_eq!(envelope.reverse_path(), "<>");

        let envelope = Envelope::new(Some("a@x".parse().unwrap()), vec![], vec![]);
        assert_eq!(envelope.reverse_path(), "<a@x>");
    }
}
