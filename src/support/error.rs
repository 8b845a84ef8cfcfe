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

use std::io;

use thiserror::Error;

use crate::smtp::codes::SmtpResponse;

#[derive(Error, Debug)]
pub enum Error {
    /// An error whose payload is a complete SMTP reply.
    ///
    /// When a callback or envelope operation returns this, the session
    /// sends the payload verbatim as its reply and carries on; any other
    /// error selects a context-dependent default reply instead.
    #[error("{0}")]
    Smtp(SmtpResponse<'static>),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    /// Any other embedder-supplied error.
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an arbitrary embedder error that carries no SMTP reply of its
    /// own.
    pub fn other(
        err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error::Other(err.into())
    }
}
