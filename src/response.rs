//! Replies sent back to SMTP clients

use std::fmt;

/// A numeric SMTP reply, possibly spanning several lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![message.into()],
        }
    }

    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    pub fn greeting(hostname: &str) -> Self {
        Self::new(220, format!("{} ESMTP smtp-forwarder ready", hostname))
    }

    pub fn ok() -> Self {
        Self::new(250, "OK")
    }

    pub fn helo(hostname: &str, client: &str) -> Self {
        Self::new(250, format!("{} Hello {}", hostname, client))
    }

    /// EHLO greeting line followed by one line per capability
    pub fn ehlo(hostname: &str, client: &str, capabilities: &[String]) -> Self {
        let mut lines = vec![format!("{} Hello {}", hostname, client)];
        lines.extend(capabilities.iter().cloned());
        Self::multiline(250, lines)
    }

    pub fn start_data() -> Self {
        Self::new(354, "Start mail input; end with <CRLF>.<CRLF>")
    }

    pub fn queued() -> Self {
        Self::new(250, "OK: Message accepted")
    }

    pub fn start_tls() -> Self {
        Self::new(220, "Ready to start TLS")
    }

    pub fn quit(hostname: &str) -> Self {
        Self::new(221, format!("{} Bye", hostname))
    }

    pub fn idle_timeout(hostname: &str) -> Self {
        Self::new(421, format!("{} Idle timeout, closing connection", hostname))
    }

    pub fn too_busy(hostname: &str) -> Self {
        Self::new(421, format!("{} Too many connections, try again later", hostname))
    }

    pub fn rate_limited(hostname: &str) -> Self {
        Self::new(421, format!("{} Too many connections from your IP", hostname))
    }

    /// Wire form, CRLF terminated, using `NNN-` continuation lines
    pub fn format(&self) -> String {
        let mut out = String::new();
        let last = self.lines.len().saturating_sub(1);
        if self.lines.is_empty() {
            out.push_str(&format!("{}\r\n", self.code));
        }
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            out.push_str(&format!("{}{}{}\r\n", self.code, sep, line));
        }
        out
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.lines.join(" / "))
    }
}
