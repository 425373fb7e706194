//! Error types for the inbound SMTP side

use std::io;

use thiserror::Error;

use crate::response::Reply;

/// Errors raised while interpreting a client's command stream.
///
/// None of these end the session: each one turns into a reply and the
/// client may carry on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SmtpError {
    #[error("Syntax error, command unrecognized")]
    UnknownCommand,

    #[error("Syntax error in parameters: {0}")]
    Syntax(String),

    #[error("Line too long (max {max} characters)")]
    LineTooLong { max: usize },

    #[error("Invalid character encoding")]
    NonUtf8,

    #[error("Bad sequence of commands: {0}")]
    BadSequence(String),

    #[error("Too many recipients (max {max})")]
    TooManyRecipients { max: usize },

    #[error("Message exceeds fixed maximum message size ({max} bytes)")]
    MessageTooBig { max: usize },

    #[error("{message}")]
    Rejected { code: u16, message: String },

    #[error("Transaction failed: {0}")]
    Delivery(String),

    #[error("TLS not available")]
    TlsUnavailable,

    #[error("Command not implemented")]
    NotImplemented,
}

impl SmtpError {
    pub fn code(&self) -> u16 {
        match self {
            SmtpError::UnknownCommand => 500,
            SmtpError::Syntax(_) => 501,
            SmtpError::LineTooLong { .. } => 500,
            SmtpError::NonUtf8 => 500,
            SmtpError::BadSequence(_) => 503,
            SmtpError::TooManyRecipients { .. } => 452,
            SmtpError::MessageTooBig { .. } => 552,
            SmtpError::Rejected { code, .. } => *code,
            SmtpError::Delivery(_) => 554,
            SmtpError::TlsUnavailable => 454,
            SmtpError::NotImplemented => 502,
        }
    }

    pub fn to_reply(&self) -> Reply {
        Reply::new(self.code(), self.to_string())
    }
}

impl From<SmtpError> for Reply {
    fn from(err: SmtpError) -> Reply {
        err.to_reply()
    }
}

/// Connection-level failures. These terminate the session.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("idle timeout")]
    Timeout,

    #[error("connection closed by peer")]
    Closed,

    #[error(transparent)]
    Protocol(SmtpError),
}

/// Size limits from RFC 5321, section 4.5.3.1
pub struct SmtpLimits;

impl SmtpLimits {
    /// Maximum length of a command line including CRLF
    pub const COMMAND_LINE_MAX_LENGTH: usize = 512;

    /// Maximum length of a text line including CRLF
    pub const TEXT_LINE_MAX_LENGTH: usize = 1000;

    /// Maximum length of a reverse-path or forward-path
    pub const PATH_MAX_LENGTH: usize = 256;

    /// Maximum number of recipients per transaction
    pub const MAX_RECIPIENTS: usize = 100;

    /// Default cap on the message body
    pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
}
