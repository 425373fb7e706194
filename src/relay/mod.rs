//! Outbound SMTP client used to forward accepted mail upstream.
//!
//! Every envelope gets its own connection: greeting, `EHLO`, optional
//! `STARTTLS` and `AUTH`, then `MAIL`/`RCPT`/`DATA` and `QUIT`.

pub mod authentication;
mod client;
mod codec;
pub mod commands;
mod error;
pub mod extension;
mod net;
pub mod response;

pub use self::authentication::{Credentials, Mechanism};
pub use self::client::{ClientSecurity, RelayClient};
pub use self::error::{RelayError, RelayResult};
pub use self::net::ClientTlsParameters;
pub use self::response::{Code, Response, Severity};
