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

//! The reply codes this server speaks: primary codes from RFC 5321 and
//! enhanced status codes from RFC 3463.
//!
//! The module is designed to be wildcard-imported, and defines submodules
//! with short names for accessing the enum values in a consistent way.

use std::borrow::Cow;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum PrimaryCode {
    ServiceReady = 220,
    ServiceClosing = 221,
    Ok = 250,
    StartMailInput = 354,
    // Not a code RFC 5321 defines, but existing deployments match on it
    // when a TLS handshake fails, so it stays.
    TlsHandshakeFailed = 403,
    ActionAborted = 451,
    CommandSyntaxError = 500,
    ParameterSyntaxError = 501,
    CommandNotImplemented = 502,
    BadSequenceOfCommands = 503,
    ActionNotTakenPermanent = 550,
    TransactionFailed = 554,
}

pub mod pc {
    pub use super::PrimaryCode::*;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ClassCode {
    Success = 2,
    TempFail = 4,
    PermFail = 5,
}

pub mod cc {
    pub use super::ClassCode::*;
}

/// Subject and detail of an enhanced status code, encoded as
/// `subject * 10 + detail`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SubjectCode {
    Undefined = 0,
    OtherAddressStatus = 10,
    BadSenderMailboxAddressSyntax = 17,
    OtherMailSystem = 30,
    OtherProtocolStatus = 50,
    InvalidCommand = 51,
    SyntaxError = 52,
    InvalidCommandArguments = 54,
    OtherSecurity = 70,
}

pub mod sc {
    pub use super::SubjectCode::*;
}

/// A complete SMTP reply, excluding the continuation/final distinction.
///
/// Embedder callbacks and envelope operations wrap one of these in
/// [`crate::Error::Smtp`] to dictate the exact reply the client sees.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SmtpResponse<'a>(
    pub PrimaryCode,
    pub Option<(ClassCode, SubjectCode)>,
    pub Cow<'a, str>,
);

impl fmt::Display for SmtpResponse<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 as u16)?;
        if let Some((class, subject)) = self.1 {
            let subject = subject as u8;
            write!(f, " {}.{}.{}", class as u8, subject / 10, subject % 10)?;
        }
        if !self.2.is_empty() {
            write!(f, " {}", self.2)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn response_rendering() {
        assert_eq!(
            "554 5.5.1 Error: no valid recipients",
            SmtpResponse(
                pc::TransactionFailed,
                Some((cc::PermFail, sc::InvalidCommand)),
                Cow::Borrowed("Error: no valid recipients"),
            )
            .to_string(),
        );
        assert_eq!(
            "250 2.1.0 Ok",
            SmtpResponse(
                pc::Ok,
                Some((cc::Success, sc::OtherAddressStatus)),
                Cow::Borrowed("Ok"),
            )
            .to_string(),
        );
        assert_eq!(
            "403 4.7.0 TLS handshake failed",
            SmtpResponse(
                pc::TlsHandshakeFailed,
                Some((cc::TempFail, sc::OtherSecurity)),
                Cow::Borrowed("TLS handshake failed"),
            )
            .to_string(),
        );
        assert_eq!(
            "451 denied",
            SmtpResponse(pc::ActionAborted, None, Cow::Borrowed("denied"))
                .to_string(),
        );
        assert_eq!(
            "501 5.1.7 Bad sender address syntax",
            SmtpResponse(
                pc::ParameterSyntaxError,
                Some((cc::PermFail, sc::BadSenderMailboxAddressSyntax)),
                Cow::Borrowed("Bad sender address syntax"),
            )
            .to_string(),
        );
    }
}
