//! SMTP session state management

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::command::Command;
use crate::envelope::{EmailAddress, Envelope};
use crate::error::{SmtpError, SmtpLimits};
use crate::logging::safe_log_string;
use crate::response::Reply;
use crate::sink::{MessageSink, Rejection};

/// Where the session stands in the mail transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    /// Connected, no HELO/EHLO yet
    Greeting,
    /// HELO received - ready for MAIL command
    Ready,
    /// MAIL FROM received - ready for RCPT commands
    MailFrom,
    /// At least one RCPT TO received - ready for DATA or more RCPT commands
    RcptTo,
    /// DATA accepted, the body is being read
    Data,
    /// QUIT received
    Closed,
}

/// Per-server values every session needs
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Name used in the greeting and in replies
    pub hostname: String,
    pub max_message_size: usize,
    /// Whether STARTTLS can be offered at all
    pub starttls: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            max_message_size: SmtpLimits::DEFAULT_MAX_MESSAGE_SIZE,
            starttls: false,
        }
    }
}

/// What the connection has to do after a command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write the reply and read the next command
    Reply(Reply),
    /// Write the `354` reply and read the message body
    StartData(Reply),
    /// Write the `220` reply and upgrade the stream
    StartTls(Reply),
    /// Write the reply and close the connection
    Close(Reply),
}

impl Action {
    pub fn reply(&self) -> &Reply {
        match self {
            Action::Reply(reply)
            | Action::StartData(reply)
            | Action::StartTls(reply)
            | Action::Close(reply) => reply,
        }
    }
}

impl From<SmtpError> for Action {
    fn from(err: SmtpError) -> Action {
        Action::Reply(err.to_reply())
    }
}

/// Manages the state and data for a single SMTP session
pub struct SmtpSession {
    peer: SocketAddr,
    state: SmtpState,
    /// Client domain from HELO/EHLO
    helo: Option<String>,
    sender: Option<EmailAddress>,
    recipients: Vec<EmailAddress>,
    tls_active: bool,
    settings: Arc<SessionSettings>,
    sink: Arc<dyn MessageSink>,
}

impl SmtpSession {
    pub fn new(peer: SocketAddr, settings: Arc<SessionSettings>, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            peer,
            state: SmtpState::Greeting,
            helo: None,
            sender: None,
            recipients: Vec::new(),
            tls_active: false,
            settings,
            sink,
        }
    }

    pub fn state(&self) -> SmtpState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn helo(&self) -> Option<&str> {
        self.helo.as_deref()
    }

    pub fn sender(&self) -> Option<&EmailAddress> {
        self.sender.as_ref()
    }

    pub fn recipients(&self) -> &[EmailAddress] {
        &self.recipients
    }

    pub fn hostname(&self) -> &str {
        &self.settings.hostname
    }

    pub fn max_message_size(&self) -> usize {
        self.settings.max_message_size
    }

    pub fn greeting(&self) -> Reply {
        Reply::greeting(&self.settings.hostname)
    }

    /// Clears sender and recipients, keeps the HELO name
    fn reset_transaction(&mut self) {
        self.sender = None;
        self.recipients.clear();
        self.state = if self.helo.is_some() {
            SmtpState::Ready
        } else {
            SmtpState::Greeting
        };
    }

    /// Interprets one command line
    pub fn handle_line(&mut self, line: &str) -> Action {
        debug!(peer = %self.peer, "<< {}", safe_log_string(line));

        match Command::parse(line) {
            Ok(command) => self.handle_command(command),
            Err(err) => err.into(),
        }
    }

    pub fn handle_command(&mut self, command: Command) -> Action {
        if matches!(self.state, SmtpState::Data | SmtpState::Closed) {
            return SmtpError::BadSequence("no command expected now".to_string()).into();
        }

        if matches!(command, Command::Helo(_) | Command::Ehlo(_))
            && !matches!(self.state, SmtpState::Greeting | SmtpState::Ready)
        {
            return SmtpError::BadSequence("transaction in progress, use RSET first".to_string())
                .into();
        }

        match command {
            Command::Helo(domain) => {
                self.helo = Some(domain);
                self.reset_transaction();
                Action::Reply(Reply::helo(&self.settings.hostname, self.client_name()))
            }
            Command::Ehlo(domain) => {
                self.helo = Some(domain);
                self.reset_transaction();
                Action::Reply(Reply::ehlo(
                    &self.settings.hostname,
                    self.client_name(),
                    &self.capabilities(),
                ))
            }
            Command::Mail { from, size } => match self.mail(from, size) {
                Ok(reply) => Action::Reply(reply),
                Err(err) => err.into(),
            },
            Command::Rcpt(recipient) => match self.rcpt(recipient) {
                Ok(reply) => Action::Reply(reply),
                Err(err) => err.into(),
            },
            Command::Data => {
                if self.state != SmtpState::RcptTo {
                    return SmtpError::BadSequence("DATA requires RCPT first".to_string()).into();
                }
                self.state = SmtpState::Data;
                Action::StartData(Reply::start_data())
            }
            Command::Rset => {
                self.reset_transaction();
                Action::Reply(Reply::ok())
            }
            Command::Noop => Action::Reply(Reply::ok()),
            Command::Vrfy | Command::Expn => Action::Reply(Reply::new(
                252,
                "Cannot VRFY user, but will accept message and attempt delivery",
            )),
            Command::Help => Action::Reply(Reply::new(
                214,
                "Commands: HELO EHLO MAIL RCPT DATA RSET NOOP QUIT VRFY HELP STARTTLS",
            )),
            Command::StartTls => {
                if !self.settings.starttls {
                    return SmtpError::TlsUnavailable.into();
                }
                if self.tls_active {
                    return SmtpError::BadSequence("TLS already active".to_string()).into();
                }
                Action::StartTls(Reply::start_tls())
            }
            Command::Auth => SmtpError::NotImplemented.into(),
            Command::Quit => {
                self.state = SmtpState::Closed;
                Action::Close(Reply::quit(&self.settings.hostname))
            }
        }
    }

    fn client_name(&self) -> &str {
        self.helo.as_deref().unwrap_or("unknown")
    }

    fn capabilities(&self) -> Vec<String> {
        let mut capabilities = vec![
            "PIPELINING".to_string(),
            format!("SIZE {}", self.settings.max_message_size),
            "8BITMIME".to_string(),
        ];
        if self.settings.starttls && !self.tls_active {
            capabilities.push("STARTTLS".to_string());
        }
        capabilities.push("HELP".to_string());
        capabilities
    }

    fn check_policy(&self, envelope: &Envelope) -> Result<(), SmtpError> {
        self.sink
            .accept(envelope)
            .map_err(|Rejection { code, message }| SmtpError::Rejected { code, message })
    }

    fn mail(&mut self, from: Option<EmailAddress>, size: Option<usize>) -> Result<Reply, SmtpError> {
        if !matches!(self.state, SmtpState::Greeting | SmtpState::Ready) {
            return Err(SmtpError::BadSequence(
                "sender already specified".to_string(),
            ));
        }
        if let Some(size) = size {
            if size > self.settings.max_message_size {
                return Err(SmtpError::MessageTooBig {
                    max: self.settings.max_message_size,
                });
            }
        }

        let candidate = Envelope::new(from.clone(), Vec::new(), Vec::new()).with_peer(self.peer);
        if let Err(err) = self.check_policy(&candidate) {
            info!(peer = %self.peer, "sender {} rejected: {}", candidate.reverse_path(), err);
            return Err(err);
        }

        debug!(peer = %self.peer, "sender {}", candidate.reverse_path());
        self.sender = from;
        self.recipients.clear();
        self.state = SmtpState::MailFrom;
        Ok(Reply::ok())
    }

    fn rcpt(&mut self, recipient: EmailAddress) -> Result<Reply, SmtpError> {
        if !matches!(self.state, SmtpState::MailFrom | SmtpState::RcptTo) {
            return Err(SmtpError::BadSequence("RCPT requires MAIL first".to_string()));
        }
        if self.recipients.len() >= SmtpLimits::MAX_RECIPIENTS {
            return Err(SmtpError::TooManyRecipients {
                max: SmtpLimits::MAX_RECIPIENTS,
            });
        }

        let mut recipients = self.recipients.clone();
        recipients.push(recipient.clone());
        let candidate = Envelope::new(self.sender.clone(), recipients, Vec::new()).with_peer(self.peer);
        if let Err(err) = self.check_policy(&candidate) {
            info!(peer = %self.peer, "recipient <{}> rejected: {}", recipient, err);
            return Err(err);
        }

        debug!(peer = %self.peer, "recipient <{}>", recipient);
        self.recipients.push(recipient);
        self.state = SmtpState::RcptTo;
        Ok(Reply::ok())
    }

    /// Completes the transaction with the body read by the connection.
    ///
    /// The sink is awaited before the reply is produced; the session is back
    /// in `Ready` whatever the outcome.
    pub async fn receive_data(&mut self, body: Vec<u8>) -> Reply {
        if self.state != SmtpState::Data {
            return SmtpError::BadSequence("no DATA in progress".to_string()).to_reply();
        }

        let sender = self.sender.take();
        let recipients = std::mem::take(&mut self.recipients);
        self.reset_transaction();

        let envelope = Envelope::new(sender, recipients, body).with_peer(self.peer);
        if let Err(err) = self.check_policy(&envelope) {
            info!(peer = %self.peer, "message from {} rejected: {}", envelope.reverse_path(), err);
            return err.to_reply();
        }

        let from = envelope.reverse_path();
        let size = envelope.body().len();
        match self.sink.deliver(envelope).await {
            Ok(()) => {
                info!(peer = %self.peer, from = %from, size, "message accepted");
                Reply::queued()
            }
            Err(err) => {
                warn!(peer = %self.peer, from = %from, "delivery failed: {}", err);
                SmtpError::Delivery(err.to_string()).to_reply()
            }
        }
    }

    /// Ends a DATA phase that could not produce a message
    pub fn abort_data(&mut self, err: SmtpError) -> Reply {
        if self.state == SmtpState::Data {
            self.reset_transaction();
        }
        info!(peer = %self.peer, "message refused: {}", err);
        err.to_reply()
    }

    /// Called once the stream has been upgraded after `STARTTLS`.
    ///
    /// The client must start over with EHLO.
    pub fn tls_established(&mut self) {
        self.tls_active = true;
        self.helo = None;
        self.reset_transaction();
        debug!(peer = %self.peer, "TLS established");
    }
}
