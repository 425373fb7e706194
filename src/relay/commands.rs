//! SMTP commands sent to the upstream server

use std::fmt::{self, Display, Formatter};

use crate::envelope::EmailAddress;
use crate::relay::authentication::{Credentials, Mechanism};
use crate::relay::error::RelayError;
use crate::relay::response::Response;

/// EHLO command
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct EhloCommand {
    client_id: String,
}

impl Display for EhloCommand {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "EHLO {}\r\n", self.client_id)
    }
}

impl EhloCommand {
    pub fn new(client_id: String) -> EhloCommand {
        EhloCommand { client_id }
    }
}

/// STARTTLS command
#[derive(PartialEq, Eq, Clone, Debug, Copy)]
pub struct StarttlsCommand;

impl Display for StarttlsCommand {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str("STARTTLS\r\n")
    }
}

/// MAIL command
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct MailCommand {
    sender: Option<EmailAddress>,
    eight_bit: bool,
}

impl Display for MailCommand {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "MAIL FROM:<{}>",
            self.sender.as_ref().map(|s| s.as_ref()).unwrap_or("")
        )?;
        if self.eight_bit {
            f.write_str(" BODY=8BITMIME")?;
        }
        f.write_str("\r\n")
    }
}

impl MailCommand {
    pub fn new(sender: Option<EmailAddress>, eight_bit: bool) -> MailCommand {
        MailCommand { sender, eight_bit }
    }
}

/// RCPT command
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct RcptCommand {
    recipient: EmailAddress,
}

impl Display for RcptCommand {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "RCPT TO:<{}>\r\n", self.recipient)
    }
}

impl RcptCommand {
    pub fn new(recipient: EmailAddress) -> RcptCommand {
        RcptCommand { recipient }
    }
}

/// DATA command
#[derive(PartialEq, Eq, Clone, Debug, Copy)]
pub struct DataCommand;

impl Display for DataCommand {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str("DATA\r\n")
    }
}

/// QUIT command
#[derive(PartialEq, Eq, Clone, Debug, Copy)]
pub struct QuitCommand;

impl Display for QuitCommand {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str("QUIT\r\n")
    }
}

/// AUTH command, or a bare response to a `334` challenge
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct AuthCommand {
    mechanism: Mechanism,
    response: Option<String>,
    challenge_reply: bool,
}

impl Display for AuthCommand {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let encoded_response = self.response.as_ref().map(base64::encode);

        if self.challenge_reply {
            write!(f, "{}\r\n", encoded_response.unwrap_or_default())
        } else {
            match encoded_response {
                Some(response) => write!(f, "AUTH {} {}\r\n", self.mechanism, response),
                None => write!(f, "AUTH {}\r\n", self.mechanism),
            }
        }
    }
}

impl AuthCommand {
    /// Creates an AUTH command (from a challenge if provided)
    pub fn new(
        mechanism: Mechanism,
        credentials: &Credentials,
        challenge: Option<String>,
    ) -> Result<AuthCommand, RelayError> {
        let response = if mechanism.supports_initial_response() || challenge.is_some() {
            Some(mechanism.response(credentials, challenge.as_deref())?)
        } else {
            None
        };
        Ok(AuthCommand {
            mechanism,
            response,
            challenge_reply: challenge.is_some(),
        })
    }

    /// Creates the reply to a `334` challenge
    pub fn new_from_response(
        mechanism: Mechanism,
        credentials: &Credentials,
        response: &Response,
    ) -> Result<AuthCommand, RelayError> {
        if !response.has_code(334) {
            return Err(RelayError::ResponseParsing("Expecting a challenge"));
        }

        let encoded_challenge = response
            .first_word()
            .ok_or(RelayError::ResponseParsing("Could not read auth challenge"))?;

        let decoded_challenge = String::from_utf8(base64::decode(encoded_challenge)?)?;

        Self::new(mechanism, credentials, Some(decoded_challenge))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::relay::response::Code;

    #[test]
    fn test_display() {
        let email: EmailAddress = "test@example.com".parse().unwrap();
        assert_eq!(
            format!("{}", EhloCommand::new("my_name".to_string())),
            "EHLO my_name\r\n"
        );
        assert_eq!(
            format!("{}", MailCommand::new(Some(email.clone()), false)),
            "MAIL FROM:<test@example.com>\r\n"
        );
        assert_eq!(
            format!("{}", MailCommand::new(None, false)),
            "MAIL FROM:<>\r\n"
        );
        assert_eq!(
            format!("{}", MailCommand::new(Some(email.clone()), true)),
            "MAIL FROM:<test@example.com> BODY=8BITMIME\r\n"
        );
        assert_eq!(
            format!("{}", RcptCommand::new(email)),
            "RCPT TO:<test@example.com>\r\n"
        );
        assert_eq!(format!("{}", QuitCommand), "QUIT\r\n");
        assert_eq!(format!("{}", DataCommand), "DATA\r\n");
        assert_eq!(format!("{}", StarttlsCommand), "STARTTLS\r\n");
    }

    #[test]
    fn test_auth_plain() {
        let credentials = Credentials::new("test".to_string(), "1234".to_string());
        assert_eq!(
            format!(
                "{}",
                AuthCommand::new(Mechanism::Plain, &credentials, None).unwrap()
            ),
            "AUTH PLAIN AHRlc3QAMTIzNA==\r\n"
        );
    }

    #[test]
    fn test_auth_login() {
        let credentials = Credentials::new("user".to_string(), "password".to_string());
        assert_eq!(
            format!(
                "{}",
                AuthCommand::new(Mechanism::Login, &credentials, None).unwrap()
            ),
            "AUTH LOGIN\r\n"
        );

        let challenge = Response::new(Code::new(334), vec!["VXNlcm5hbWU6".to_string()]);
        assert_eq!(
            format!(
                "{}",
                AuthCommand::new_from_response(Mechanism::Login, &credentials, &challenge)
                    .unwrap()
            ),
            "dXNlcg==\r\n"
        );

        let challenge = Response::new(Code::new(334), vec!["UGFzc3dvcmQ6".to_string()]);
        assert_eq!(
            format!(
                "{}",
                AuthCommand::new_from_response(Mechanism::Login, &credentials, &challenge)
                    .unwrap()
            ),
            "cGFzc3dvcmQ=\r\n"
        );
    }
}
