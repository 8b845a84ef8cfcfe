//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Postern.
//
// Postern is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published by  the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Postern is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without even  the implied warranty  of MERCHANTABILITY  or
// FITNESS FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Postern. If not, see <http://www.gnu.org/licenses/>.

//! Wire-level syntax: command-line framing, the verb/argument split, and
//! the `MAIL FROM` / `RCPT TO` address forms.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref RX_MAIL_FROM: Regex =
        Regex::new("^(?i)FROM:<([^>]*)>(.*)$").unwrap();
    static ref RX_RCPT_TO: Regex = Regex::new("^(?i)TO:<(.+)>").unwrap();
    static ref RX_SIZE_PARAM: Regex = Regex::new("^(?i)SIZE=(.*)$").unwrap();
}

/// A raw command line as received from the client, including the trailing
/// CRLF.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CmdLine(String);

/// A defect in a command line that does not abort parsing of later
/// commands by itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineFault {
    /// The line was terminated by a bare LF. Framing faults poison the
    /// rest of the stream.
    MissingCrlf,
    /// A verb defined by RFC 5321 §4.1.1 to take no argument was given
    /// one.
    UnexpectedArgument,
}

impl LineFault {
    pub fn message(self) -> &'static str {
        match self {
            LineFault::MissingCrlf => "line must end in CRLF",
            LineFault::UnexpectedArgument => "unexpected argument",
        }
    }
}

impl CmdLine {
    pub fn new(line: impl Into<String>) -> Self {
        CmdLine(line.into())
    }

    pub fn check_valid(&self) -> Result<(), LineFault> {
        if !self.0.ends_with("\r\n") {
            return Err(LineFault::MissingCrlf);
        }

        match self.verb().as_str() {
            "RSET" | "DATA" | "QUIT" if !self.arg().is_empty() => {
                Err(LineFault::UnexpectedArgument)
            },
            _ => Ok(()),
        }
    }

    /// The upper-cased text before the first space, or before the line
    /// terminator when there is no space.
    pub fn verb(&self) -> String {
        match self.0.find(' ') {
            Some(ix) => self.0[..ix].to_ascii_uppercase(),
            None => self.0[..self.0.len().saturating_sub(2)]
                .to_ascii_uppercase(),
        }
    }

    /// The text after the first space and before the line terminator, with
    /// trailing whitespace stripped; empty when there is no space.
    pub fn arg(&self) -> &str {
        match self.0.find(' ') {
            Some(ix) => self.0[ix + 1..self.0.len() - 2].trim_end(),
            None => "",
        }
    }
}

/// An address as the client supplied it, plus derived views.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailAddress(String);

impl MailAddress {
    pub fn new(email: impl Into<String>) -> Self {
        MailAddress(email.into())
    }

    /// The email address exactly as provided. Empty for the null
    /// reverse-path.
    pub fn email(&self) -> &str {
        &self.0
    }

    /// The canonical host part: the lowercased text after the last `@`, or
    /// empty when there is none.
    pub fn hostname(&self) -> String {
        match self.0.rfind('@') {
            Some(ix) => self.0[ix + 1..].to_lowercase(),
            None => String::new(),
        }
    }
}

impl std::fmt::Display for MailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressParseError {
    /// The `FROM:<…>` / `TO:<…>` shape did not match.
    Syntax,
    /// A SIZE parameter was present but its value is not an unsigned
    /// integer.
    BadSize,
}

/// The parsed argument of a `MAIL` command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailFromArg {
    /// May be empty: `MAIL FROM:<>` is the null reverse-path used by
    /// bounce messages.
    pub reverse_path: String,
    pub size: Option<u64>,
}

/// Parses the argument of a `MAIL` command, e.g.
/// `FROM:<foo@bar.com> SIZE=1024`.
///
/// Parameters other than SIZE are ignored.
pub fn parse_mail_from(arg: &str) -> Result<MailFromArg, AddressParseError> {
    let cap = RX_MAIL_FROM.captures(arg).ok_or(AddressParseError::Syntax)?;

    let mut size = None::<u64>;
    for parm in cap
        .get(2)
        .map(|c| c.as_str())
        .unwrap_or("")
        .split(' ')
        .filter(|p| !p.is_empty())
    {
        if let Some(size_cap) = RX_SIZE_PARAM.captures(parm) {
            size = Some(
                size_cap
                    .get(1)
                    .unwrap()
                    .as_str()
                    .parse::<u64>()
                    .map_err(|_| AddressParseError::BadSize)?,
            );
        }
    }

    Ok(MailFromArg {
        reverse_path: cap.get(1).unwrap().as_str().to_owned(),
        size,
    })
}

/// Parses the argument of an `RCPT` command, e.g. `TO:<foo@bar.com>`.
///
/// Unlike the reverse-path, the forward-path may not be empty.
pub fn parse_rcpt_to(arg: &str) -> Result<String, AddressParseError> {
    RX_RCPT_TO
        .captures(arg)
        .map(|cap| cap.get(1).unwrap().as_str().to_owned())
        .ok_or(AddressParseError::Syntax)
}

#[cfg(test)]
mod test {
    use super::*;

    fn line(s: &str) -> CmdLine {
        CmdLine::new(s)
    }

    #[test]
    fn verb_and_arg_derivation() {
        assert_eq!("EHLO", line("EHLO mail.example.com\r\n").verb());
        assert_eq!(
            "mail.example.com",
            line("EHLO mail.example.com\r\n").arg()
        );
        assert_eq!("QUIT", line("quit\r\n").verb());
        assert_eq!("", line("quit\r\n").arg());
        // Trailing whitespace in the argument is stripped.
        assert_eq!("x", line("NOOP x \r\n").arg());
        // The verb is everything before the first space, even when that
        // leaves garbage.
        assert_eq!("", line(" DATA\r\n").verb());
        assert_eq!("", line("\r\n").verb());
    }

    #[test]
    fn framing_validation() {
        assert_eq!(Ok(()), line("NOOP\r\n").check_valid());
        assert_eq!(
            Err(LineFault::MissingCrlf),
            line("NOOP\n").check_valid()
        );
        assert_eq!(
            Err(LineFault::UnexpectedArgument),
            line("DATA please\r\n").check_valid()
        );
        assert_eq!(
            Err(LineFault::UnexpectedArgument),
            line("RSET now\r\n").check_valid()
        );
        assert_eq!(
            Err(LineFault::UnexpectedArgument),
            line("QUIT bye\r\n").check_valid()
        );
        // Verbs with defined arguments keep them.
        assert_eq!(Ok(()), line("HELO host\r\n").check_valid());
    }

    #[test]
    fn mail_from_parsing() {
        let parsed = parse_mail_from("FROM:<foo@bar.com>").unwrap();
        assert_eq!("foo@bar.com", parsed.reverse_path);
        assert_eq!(None, parsed.size);

        // Null reverse-path.
        let parsed = parse_mail_from("FROM:<>").unwrap();
        assert_eq!("", parsed.reverse_path);

        // Case-insensitive form, parameters scanned for SIZE.
        let parsed =
            parse_mail_from("from:<a@x> BODY=8BITMIME SIZE=123").unwrap();
        assert_eq!("a@x", parsed.reverse_path);
        assert_eq!(Some(123), parsed.size);

        assert_eq!(
            Err(AddressParseError::BadSize),
            parse_mail_from("FROM:<a@x> SIZE=xyz")
        );
        assert_eq!(
            Err(AddressParseError::BadSize),
            parse_mail_from("FROM:<a@x> SIZE=99999999999999999999999")
        );
        assert_eq!(
            Err(AddressParseError::Syntax),
            parse_mail_from("FROM:a@x")
        );
        assert_eq!(Err(AddressParseError::Syntax), parse_mail_from(""));
    }

    #[test]
    fn rcpt_to_parsing() {
        assert_eq!("foo@bar.com", parse_rcpt_to("TO:<foo@bar.com>").unwrap());
        assert_eq!("a@x", parse_rcpt_to("to:<a@x>").unwrap());
        // The forward-path may not be empty.
        assert_eq!(Err(AddressParseError::Syntax), parse_rcpt_to("TO:<>"));
        assert_eq!(
            Err(AddressParseError::Syntax),
            parse_rcpt_to("foo@bar.com")
        );
    }

    #[test]
    fn address_hostname() {
        assert_eq!("bar.com", MailAddress::new("foo@BAR.Com").hostname());
        assert_eq!("", MailAddress::new("foo").hostname());
        assert_eq!("", MailAddress::new("").hostname());
        // The host part follows the *last* @.
        assert_eq!("c.com", MailAddress::new("a@b@C.COM").hostname());
        assert_eq!("foo@bar.com", MailAddress::new("foo@bar.com").email());
    }
}
