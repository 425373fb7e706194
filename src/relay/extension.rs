//! ESMTP features advertised by the upstream server

use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};

use crate::relay::authentication::Mechanism;
use crate::relay::error::RelayError;
use crate::relay::response::Response;

/// Supported ESMTP keywords
#[derive(PartialEq, Eq, Hash, Copy, Clone, Debug)]
pub enum Extension {
    /// 8BITMIME keyword
    ///
    /// RFC 6152: https://tools.ietf.org/html/rfc6152
    EightBitMime,
    /// SMTPUTF8 keyword
    ///
    /// RFC 6531: https://tools.ietf.org/html/rfc6531
    SmtpUtfEight,
    /// STARTTLS keyword
    ///
    /// RFC 2487: https://tools.ietf.org/html/rfc2487
    StartTls,
    /// PIPELINING keyword
    Pipelining,
    /// AUTH mechanism
    Authentication(Mechanism),
}

impl Display for Extension {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Extension::EightBitMime => write!(f, "8BITMIME"),
            Extension::SmtpUtfEight => write!(f, "SMTPUTF8"),
            Extension::StartTls => write!(f, "STARTTLS"),
            Extension::Pipelining => write!(f, "PIPELINING"),
            Extension::Authentication(ref mechanism) => write!(f, "AUTH {}", mechanism),
        }
    }
}

/// Contains information about an SMTP server
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct ServerInfo {
    /// Server name
    ///
    /// The name given in the server banner
    pub name: String,
    /// ESMTP features supported by the server
    ///
    /// It contains the features supported by the server and known by the `Extension` module.
    pub features: HashSet<Extension>,
}

impl Display for ServerInfo {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{} with {}",
            self.name,
            if self.features.is_empty() {
                "no supported features".to_string()
            } else {
                format!("{:?}", self.features)
            }
        )
    }
}

impl ServerInfo {
    /// Parses a EHLO response to create a `ServerInfo`
    pub fn from_response(response: &Response) -> Result<ServerInfo, RelayError> {
        let name = match response.first_word() {
            Some(name) => name,
            None => return Err(RelayError::ResponseParsing("Could not read server name")),
        };

        let mut features: HashSet<Extension> = HashSet::new();

        for line in response.message.iter().skip(1) {
            let mut split = line.split(|c: char| c == ' ' || c == '=');
            let keyword = match split.next() {
                Some(keyword) => keyword.to_ascii_uppercase(),
                None => continue,
            };
            match keyword.as_str() {
                "8BITMIME" => {
                    features.insert(Extension::EightBitMime);
                }
                "SMTPUTF8" => {
                    features.insert(Extension::SmtpUtfEight);
                }
                "STARTTLS" => {
                    features.insert(Extension::StartTls);
                }
                "PIPELINING" => {
                    features.insert(Extension::Pipelining);
                }
                "AUTH" => {
                    for mechanism in split.filter_map(Mechanism::from_keyword) {
                        features.insert(Extension::Authentication(mechanism));
                    }
                }
                _ => (),
            };
        }

        Ok(ServerInfo {
            name: name.to_string(),
            features,
        })
    }

    /// Checks if the server supports an ESMTP feature
    pub fn supports_feature(&self, keyword: Extension) -> bool {
        self.features.contains(&keyword)
    }

    /// Checks if the server supports an ESMTP feature
    pub fn supports_auth_mechanism(&self, mechanism: Mechanism) -> bool {
        self.features
            .contains(&Extension::Authentication(mechanism))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::relay::response::Code;

    #[test]
    fn test_extension_fmt() {
        assert_eq!(format!("{}", Extension::EightBitMime), "8BITMIME".to_string());
        assert_eq!(
            format!("{}", Extension::Authentication(Mechanism::Plain)),
            "AUTH PLAIN".to_string()
        );
    }

    #[test]
    fn test_serverinfo() {
        let response = Response::new(
            Code::new(250),
            vec![
                "me".to_string(),
                "8BITMIME".to_string(),
                "SIZE 42".to_string(),
                "AUTH PLAIN CRAM-MD5 LOGIN".to_string(),
                "STARTTLS".to_string(),
            ],
        );

        let server_info = ServerInfo::from_response(&response).unwrap();

        assert_eq!(server_info.name, "me");
        assert!(server_info.supports_feature(Extension::EightBitMime));
        assert!(server_info.supports_feature(Extension::StartTls));
        assert!(!server_info.supports_feature(Extension::SmtpUtfEight));
        assert!(server_info.supports_auth_mechanism(Mechanism::Plain));
        assert!(server_info.supports_auth_mechanism(Mechanism::Login));
    }

    #[test]
    fn test_serverinfo_legacy_auth() {
        let response = Response::new(
            Code::new(250),
            vec!["me".to_string(), "AUTH=LOGIN".to_string()],
        );

        let server_info = ServerInfo::from_response(&response).unwrap();

        assert!(server_info.supports_auth_mechanism(Mechanism::Login));
        assert!(!server_info.supports_auth_mechanism(Mechanism::Plain));
        assert!(!server_info.supports_feature(Extension::StartTls));
    }
}
