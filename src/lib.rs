//! SMTP listener that hands every accepted message to a sink: an
//! authenticated upstream relay, or standard output.
//!
//! A connection goes through three stages. [`Connection`] reads command
//! lines and the DATA section, [`SmtpSession`] checks each command against
//! the transaction state, and a [`MessageSink`] accepts and delivers the
//! resulting [`Envelope`].

pub mod command;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod logging;
mod ratelimiter;
pub mod relay;
pub mod response;
pub mod server;
pub mod session;
pub mod sink;

pub use crate::command::Command;
pub use crate::config::{Config, Delivery, Opt};
pub use crate::connection::{Connection, Exit};
pub use crate::envelope::{EmailAddress, Envelope};
pub use crate::error::{ConnectionError, SmtpError, SmtpLimits};
pub use crate::response::Reply;
pub use crate::server::Server;
pub use crate::session::{Action, SessionSettings, SmtpSession, SmtpState};
pub use crate::sink::{DeliveryError, MessageSink, PrintSink, Rejection, RelaySink};
