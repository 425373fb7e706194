//! Where completed transactions go.
//!
//! A sink decides whether to take a transaction at all (`accept`) and
//! performs the final hand-off (`deliver`). The session consults `accept`
//! at `MAIL`, at every `RCPT` and once more when the body is complete, then
//! calls `deliver` exactly once per envelope.

use std::io;

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::Envelope;
use crate::relay::RelayError;

mod print;
mod relay;

pub use self::print::PrintSink;
pub use self::relay::RelaySink;

/// A policy decision refusing a sender, a recipient or a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: u16,
    pub message: String,
}

impl Rejection {
    /// Permanent refusal with the usual `550`
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_code(550, message)
    }

    pub fn with_code(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("relay: {0}")]
    Relay(#[from] RelayError),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Policy hook. Accepts everything unless overridden.
    fn accept(&self, _envelope: &Envelope) -> Result<(), Rejection> {
        Ok(())
    }

    /// Hands over one completed transaction.
    async fn deliver(&self, envelope: Envelope) -> Result<(), DeliveryError>;
}
