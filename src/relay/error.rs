use std::io;
use std::string::FromUtf8Error;

use base64::DecodeError;

use crate::relay::response::{Response, Severity};

/// Everything that can go wrong while talking to the upstream.
#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    /// 4xx reply
    #[error("upstream deferred: {}", describe(.0))]
    Transient(Response),
    /// 5xx reply
    #[error("upstream refused: {}", describe(.0))]
    Permanent(Response),
    /// Credentials refused, or no mechanism both sides support
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("malformed reply: {0}")]
    ResponseParsing(&'static str),
    #[error("malformed AUTH challenge: {0}")]
    ChallengeParsing(#[from] DecodeError),
    #[error("AUTH challenge is not UTF-8: {0}")]
    Utf8Parsing(#[from] FromUtf8Error),
    #[error("{0}")]
    Client(&'static str),
    #[error("cannot resolve upstream host")]
    Resolution,
    #[error("upstream i/o: {0}")]
    Io(#[from] io::Error),
    #[error("upstream tls: {0}")]
    Tls(io::Error),
    #[error("unparsable reply ({0:?})")]
    Parsing(nom::error::ErrorKind),
    #[error("upstream timed out")]
    Timeout,
}

fn describe(response: &Response) -> String {
    format!(
        "{} {}",
        response.code,
        response.first_line().unwrap_or("(no text)")
    )
}

impl RelayError {
    /// The upstream answered with a negative reply
    pub fn is_rejection(&self) -> bool {
        matches!(self, RelayError::Transient(_) | RelayError::Permanent(_))
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, RelayError::Authentication(_))
    }

    /// Nothing useful was said by the upstream
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            RelayError::Io(_) | RelayError::Tls(_) | RelayError::Timeout | RelayError::Resolution
        )
    }
}

impl From<nom::Err<nom::error::Error<&str>>> for RelayError {
    fn from(err: nom::Err<nom::error::Error<&str>>) -> RelayError {
        let kind = match err {
            nom::Err::Error(e) | nom::Err::Failure(e) => e.code,
            nom::Err::Incomplete(_) => nom::error::ErrorKind::Complete,
        };
        RelayError::Parsing(kind)
    }
}

impl From<Response> for RelayError {
    fn from(response: Response) -> RelayError {
        match response.code.severity() {
            Severity::TransientNegativeCompletion => RelayError::Transient(response),
            Severity::PermanentNegativeCompletion => RelayError::Permanent(response),
            _ => RelayError::Client("positive reply treated as an error"),
        }
    }
}

impl From<&'static str> for RelayError {
    fn from(message: &'static str) -> RelayError {
        RelayError::Client(message)
    }
}

pub type RelayResult = Result<Response, RelayError>;
