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

//! The contract between the session machine and the embedder.

use std::borrow::Cow;
use std::io;
use std::net::SocketAddr;

use crate::smtp::codes::*;
use crate::smtp::syntax::MailAddress;
use crate::support::error::Error;

/// One accepted connection, as seen by embedder callbacks.
pub trait Connection {
    /// The remote network address.
    fn addr(&self) -> SocketAddr;

    /// Force-closes the connection.
    ///
    /// Safe to call from any task; a session blocked on the socket
    /// observes the close as an I/O error and terminates.
    fn close(&self) -> io::Result<()>;
}

/// The per-message context created by the `on_new_mail` callback.
///
/// `add_recipient` is called once per `RCPT TO`; `begin_data` once when
/// `DATA` arrives; `write_line` once per body line, dot-unstuffed and
/// including its trailing CRLF; `close` when the terminating `.` has been
/// seen.
///
/// Returning [`Error::Smtp`] from any operation makes its payload the reply
/// the client sees. Any other error selects a default reply: `550 bad
/// recipient` for `add_recipient`, `550 failed` for `write_line`, and
/// `451 4.3.0 Error: transaction failed` for `begin_data` and `close`.
pub trait Envelope: Send {
    fn add_recipient(&mut self, rcpt: MailAddress) -> Result<(), Error>;
    fn begin_data(&mut self) -> Result<(), Error>;
    fn write_line(&mut self, line: &[u8]) -> Result<(), Error>;
    fn close(&mut self) -> Result<(), Error>;
}

/// A minimal envelope that accumulates recipients and discards the body.
///
/// Embedders typically hold one of these inside their own envelope and
/// delegate to it, layering policy on top (rejecting recipients, capturing
/// body lines) without re-implementing the bookkeeping.
#[derive(Debug, Default)]
pub struct BasicEnvelope {
    rcpts: Vec<MailAddress>,
}

impl BasicEnvelope {
    pub fn new() -> Self {
        BasicEnvelope::default()
    }

    pub fn recipients(&self) -> &[MailAddress] {
        &self.rcpts
    }
}

impl Envelope for BasicEnvelope {
    fn add_recipient(&mut self, rcpt: MailAddress) -> Result<(), Error> {
        self.rcpts.push(rcpt);
        Ok(())
    }

    fn begin_data(&mut self) -> Result<(), Error> {
        if self.rcpts.is_empty() {
            return Err(Error::Smtp(SmtpResponse(
                pc::TransactionFailed,
                Some((cc::PermFail, sc::InvalidCommand)),
                Cow::Borrowed("Error: no valid recipients"),
            )));
        }
        Ok(())
    }

    fn write_line(&mut self, _line: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}
