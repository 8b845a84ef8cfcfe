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

//! Postern is an embeddable SMTP (RFC 5321) receiving server.
//!
//! The crate owns the wire protocol: the per-connection session state
//! machine, command-line decoding, reply generation, extension negotiation
//! (PIPELINING, SIZE, ENHANCEDSTATUSCODES, 8BITMIME, DSN, STARTTLS, AUTH
//! PLAIN advertisement), the DATA-phase body reader with dot-unstuffing, TLS
//! upgrade in place, and timeout enforcement. Everything about *accepting*
//! mail is delegated to the embedder through callbacks on [`Server`] and the
//! [`Envelope`] trait; what happens to accepted bytes is entirely the
//! embedder's business.
//!
//! ```no_run
//! use postern::{BasicEnvelope, Connection, Envelope, Error, MailAddress, Server};
//!
//! fn on_new_mail(
//!     _conn: &dyn Connection,
//!     from: MailAddress,
//!     _size: Option<u64>,
//! ) -> Result<Box<dyn Envelope>, Error> {
//!     log::info!("new mail from {:?}", from.email());
//!     Ok(Box::new(BasicEnvelope::new()))
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Error> {
//!     let server = Server {
//!         addr: ":2500".to_owned(),
//!         on_new_mail: Some(Box::new(on_new_mail)),
//!         max_size: 10 * 1024 * 1024,
//!         ..Server::default()
//!     };
//!     server.listen_and_serve().await
//! }
//! ```
//!
//! Postern receives mail; it does not send, queue, or relay it, and it does
//! not inspect message content beyond the line framing DATA requires.

mod smtp;
mod support;

pub use crate::smtp::codes::{
    cc, pc, sc, ClassCode, PrimaryCode, SmtpResponse, SubjectCode,
};
pub use crate::smtp::envelope::{BasicEnvelope, Connection, Envelope};
pub use crate::smtp::server::{
    LogSink, OnNewConnection, OnNewMail, OnProtoError, Server,
};
pub use crate::smtp::syntax::MailAddress;
pub use crate::support::error::Error;

#[cfg(test)]
static INIT_TEST_LOG: std::sync::Once = std::sync::Once::new();

#[cfg(test)]
fn init_test_log() {
    INIT_TEST_LOG.call_once(|| {
        if !std::env::var("TEST_LOG").ok().map_or(false, |v| "1" == v) {
            return;
        }

        let stderr = log4rs::append::console::ConsoleAppender::builder()
            .target(log4rs::append::console::Target::Stderr)
            .encoder(Box::new(log4rs::encode::pattern::PatternEncoder::new(
                "{d(%H:%M:%S%.3f)} [{l}][{t}] {m}{n}",
            )))
            .build();
        let log_config = log4rs::config::Config::builder()
            .appender(
                log4rs::config::Appender::builder()
                    .build("stderr", Box::new(stderr)),
            )
            .build(
                log4rs::config::Root::builder()
                    .appender("stderr")
                    .build(log::LevelFilter::Trace),
            )
            .unwrap();
        log4rs::init_config(log_config).unwrap();
    })
}
