//! Parsing of client command lines

use crate::envelope::EmailAddress;
use crate::error::SmtpError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    Mail {
        from: Option<EmailAddress>,
        size: Option<usize>,
    },
    Rcpt(EmailAddress),
    Data,
    Rset,
    Noop,
    Quit,
    Vrfy,
    Expn,
    Help,
    StartTls,
    Auth,
}

impl Command {
    /// Parse one command line, without its CRLF.
    pub fn parse(line: &str) -> Result<Command, SmtpError> {
        let line = line.trim_end();
        let (verb, args) = match line.find(' ') {
            Some(idx) => (&line[..idx], line[idx + 1..].trim()),
            None => (line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => Ok(Command::Helo(domain_argument("HELO", args)?)),
            "EHLO" => Ok(Command::Ehlo(domain_argument("EHLO", args)?)),
            "MAIL" => parse_mail(args),
            "RCPT" => parse_rcpt(args),
            "DATA" => no_arguments("DATA", args, Command::Data),
            "RSET" => no_arguments("RSET", args, Command::Rset),
            "QUIT" => no_arguments("QUIT", args, Command::Quit),
            "STARTTLS" => no_arguments("STARTTLS", args, Command::StartTls),
            "NOOP" => Ok(Command::Noop),
            "VRFY" => Ok(Command::Vrfy),
            "EXPN" => Ok(Command::Expn),
            "HELP" => Ok(Command::Help),
            "AUTH" => Ok(Command::Auth),
            _ => Err(SmtpError::UnknownCommand),
        }
    }
}

fn domain_argument(verb: &str, args: &str) -> Result<String, SmtpError> {
    match args.split_whitespace().next() {
        Some(domain) => Ok(domain.to_string()),
        None => Err(SmtpError::Syntax(format!("{} requires domain address", verb))),
    }
}

fn no_arguments(verb: &str, args: &str, command: Command) -> Result<Command, SmtpError> {
    if args.is_empty() {
        Ok(command)
    } else {
        Err(SmtpError::Syntax(format!("{} takes no arguments", verb)))
    }
}

/// Strips a case-insensitive `FROM:`/`TO:` prefix
fn strip_keyword<'a>(args: &'a str, keyword: &str) -> Option<&'a str> {
    match args.get(..keyword.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(keyword) => {
            Some(args[keyword.len()..].trim_start())
        }
        _ => None,
    }
}

/// Splits `<path> params...` into the path content and the trailing parameters
fn split_path(args: &str) -> Result<(&str, &str), SmtpError> {
    if !args.starts_with('<') {
        return Err(SmtpError::Syntax(
            "address must be enclosed in angle brackets".to_string(),
        ));
    }
    let end = args
        .find('>')
        .ok_or_else(|| SmtpError::Syntax("unterminated address".to_string()))?;
    let mut path = &args[1..end];
    // Drop an obsolete source route, "@a,@b:user@c"
    if path.starts_with('@') {
        if let Some(idx) = path.find(':') {
            path = &path[idx + 1..];
        }
    }
    Ok((path, args[end + 1..].trim()))
}

fn parse_mail(args: &str) -> Result<Command, SmtpError> {
    let rest = strip_keyword(args, "FROM:")
        .ok_or_else(|| SmtpError::Syntax("MAIL command must be 'MAIL FROM:<address>'".to_string()))?;
    let (path, params) = split_path(rest)?;

    let from = if path.is_empty() {
        None
    } else {
        Some(EmailAddress::new(path.to_string())?)
    };

    let mut size = None;
    for param in params.split_whitespace() {
        let (key, value) = param.split_once('=').unwrap_or((param, ""));
        if key.eq_ignore_ascii_case("SIZE") {
            let parsed = value
                .parse::<usize>()
                .map_err(|_| SmtpError::Syntax(format!("invalid SIZE value '{}'", value)))?;
            size = Some(parsed);
        }
    }

    Ok(Command::Mail { from, size })
}

fn parse_rcpt(args: &str) -> Result<Command, SmtpError> {
    let rest = strip_keyword(args, "TO:")
        .ok_or_else(|| SmtpError::Syntax("RCPT command must be 'RCPT TO:<address>'".to_string()))?;
    let (path, _params) = split_path(rest)?;
    if path.is_empty() {
        return Err(SmtpError::Syntax("recipient address cannot be empty".to_string()));
    }
    Ok(Command::Rcpt(EmailAddress::new(path.to_string())?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_helo() {
        assert_eq!(
            Command::parse("HELO client.local").unwrap(),
            Command::Helo("client.local".to_string())
        );
        assert_eq!(
            Command::parse("ehlo client.local").unwrap(),
            Command::Ehlo("client.local".to_string())
        );
        assert!(matches!(Command::parse("HELO"), Err(SmtpError::Syntax(_))));
    }

    #[test]
    fn test_parse_mail() {
        assert_eq!(
            Command::parse("MAIL FROM:<a@x>").unwrap(),
            Command::Mail {
                from: Some("a@x".parse().unwrap()),
                size: None
            }
        );
        assert_eq!(
            Command::parse("mail from: <a@x> SIZE=1024 BODY=8BITMIME").unwrap(),
            Command::Mail {
                from: Some("a@x".parse().unwrap()),
                size: Some(1024)
            }
        );
        assert_eq!(
            Command::parse("MAIL FROM:<>").unwrap(),
            Command::Mail {
                from: None,
                size: None
            }
        );
    }

    #[test]
    fn test_parse_mail_invalid() {
        assert!(matches!(
            Command::parse("MAIL a@x"),
            Err(SmtpError::Syntax(_))
        ));
        assert!(matches!(
            Command::parse("MAIL FROM:a@x"),
            Err(SmtpError::Syntax(_))
        ));
        assert!(matches!(
            Command::parse("MAIL FROM:<a@x"),
            Err(SmtpError::Syntax(_))
        ));
        assert!(matches!(
            Command::parse("MAIL FROM:<a@x> SIZE=lots"),
            Err(SmtpError::Syntax(_))
        ));
    }

    #[test]
    fn test_parse_rcpt() {
        assert_eq!(
            Command::parse("RCPT TO:<b@y>").unwrap(),
            Command::Rcpt("b@y".parse().unwrap())
        );
        assert_eq!(
            Command::parse("RCPT TO:<@relay.example:b@y>").unwrap(),
            Command::Rcpt("b@y".parse().unwrap())
        );
        assert!(matches!(
            Command::parse("RCPT TO:<>"),
            Err(SmtpError::Syntax(_))
        ));
    }

    #[test]
    fn test_parse_simple_verbs() {
        assert_eq!(Command::parse("DATA").unwrap(), Command::Data);
        assert_eq!(Command::parse("rset").unwrap(), Command::Rset);
        assert_eq!(Command::parse("NOOP anything").unwrap(), Command::Noop);
        assert_eq!(Command::parse("QUIT").unwrap(), Command::Quit);
        assert_eq!(Command::parse("STARTTLS").unwrap(), Command::StartTls);
        assert!(matches!(Command::parse("DATA now"), Err(SmtpError::Syntax(_))));
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(Command::parse("BDAT 100"), Err(SmtpError::UnknownCommand));
        assert_eq!(Command::parse(""), Err(SmtpError::UnknownCommand));
    }
}
