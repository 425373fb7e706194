//! SMTP replies received from the upstream server

use std::fmt::{self, Display, Formatter};

use nom::branch::alt;
use nom::bytes::complete::take_while_m_n;
use nom::character::complete::{line_ending, not_line_ending, one_of};
use nom::combinator::{map_res, opt, verify};
use nom::IResult;

/// First digit of a reply code
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Severity {
    /// 2yx
    PositiveCompletion,
    /// 3yz
    PositiveIntermediate,
    /// 4yz
    TransientNegativeCompletion,
    /// 5yz
    PermanentNegativeCompletion,
}

/// A three digit reply code
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct Code(u16);

impl Code {
    pub fn new(value: u16) -> Code {
        Code(value)
    }

    pub fn value(self) -> u16 {
        self.0
    }

    pub fn severity(self) -> Severity {
        match self.0 / 100 {
            2 => Severity::PositiveCompletion,
            3 => Severity::PositiveIntermediate,
            4 => Severity::TransientNegativeCompletion,
            _ => Severity::PermanentNegativeCompletion,
        }
    }
}

impl Display for Code {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Contains an SMTP reply, with separated code and message
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Response {
    pub code: Code,
    pub message: Vec<String>,
}

impl Response {
    pub fn new(code: Code, message: Vec<String>) -> Response {
        Response { code, message }
    }

    /// 2xx and 3xx replies
    pub fn is_positive(&self) -> bool {
        matches!(
            self.code.severity(),
            Severity::PositiveCompletion | Severity::PositiveIntermediate
        )
    }

    pub fn has_code(&self, code: u16) -> bool {
        self.code.value() == code
    }

    pub fn first_line(&self) -> Option<&str> {
        self.message.first().map(String::as_str)
    }

    /// First word of the first line, the server name in greetings and EHLO replies
    pub fn first_word(&self) -> Option<&str> {
        self.first_line().and_then(|line| line.split_whitespace().next())
    }
}

fn parse_code(input: &str) -> IResult<&str, Code> {
    map_res(
        verify(
            take_while_m_n(3, 3, |c: char| c.is_ascii_digit()),
            |digits: &str| matches!(digits.as_bytes()[0], b'2'..=b'5'),
        ),
        |digits: &str| digits.parse::<u16>().map(Code),
    )(input)
}

/// One reply line: code, whether more lines follow, text
fn parse_line(input: &str) -> IResult<&str, (Code, bool, &str)> {
    let (input, code) = parse_code(input)?;
    let (input, separator) = opt(one_of(" -"))(input)?;
    let (input, text) = not_line_ending(input)?;
    let (input, _) = alt((line_ending, nom::combinator::eof))(input)?;
    Ok((input, (code, separator == Some('-'), text)))
}

/// Parses a complete, possibly multi-line, reply
pub fn parse_response(input: &str) -> IResult<&str, Response> {
    let (mut rest, (code, mut more, text)) = parse_line(input)?;
    let mut message = vec![text.to_string()];

    while more {
        let (next, (line_code, line_more, line_text)) = parse_line(rest)?;
        if line_code != code {
            return Err(nom::Err::Failure(nom::error::Error::new(
                rest,
                nom::error::ErrorKind::Verify,
            )));
        }
        message.push(line_text.to_string());
        more = line_more;
        rest = next;
    }

    Ok((rest, Response::new(code, message)))
}
