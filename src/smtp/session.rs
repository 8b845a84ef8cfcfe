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

//! The per-connection session state machine.
//!
//! A session reads command lines in strict order, synthesizes exactly one
//! reply per command (EHLO's multi-line extension listing counts as one;
//! DATA produces `354` plus a terminal status), and dispatches acceptance
//! decisions to the embedder callbacks configured on the server.

use std::borrow::Cow;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::str;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader,
    BufWriter,
};

use super::codes::*;
use super::envelope::{Connection, Envelope};
use super::server::Server;
use super::syntax::{self, CmdLine, LineFault, MailAddress};
use crate::support::{
    async_io::ServerIo, error::Error, log_prefix::LogPrefix,
};

const MAX_LINE: usize = 4096;

/// How long a session lingers after a rejected MAIL FROM before the
/// connection is torn down.
///
/// The delay is a deliberate anti-abuse tarpit, not an oversight: it parks
/// the client on a dead transaction while the rejection drains.
const MAIL_REJECT_LINGER: Duration = Duration::from_millis(100);

pub(crate) struct Session {
    srv: Arc<Server>,
    conn: SessionConn,
    br: BufReader<ServerIo>,
    bw: BufWriter<ServerIo>,
    log_prefix: LogPrefix,
    host_name: String,

    quit: bool,
    /// The greeting verb the client last used (HELO or EHLO) and the host
    /// name it announced.
    hello: Option<(String, String)>,
    /// The current mail transaction. Non-null exactly between an accepted
    /// MAIL FROM and the next RSET, hello, or completed DATA.
    env: Option<Box<dyn Envelope>>,
}

/// The view of a session handed to embedder callbacks.
#[derive(Clone)]
struct SessionConn {
    io: ServerIo,
    peer: SocketAddr,
}

impl Connection for SessionConn {
    fn addr(&self) -> SocketAddr {
        self.peer
    }

    fn close(&self) -> io::Result<()> {
        self.io.shutdown_socket()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    /// The last in a series of responses.
    ///
    /// Indicates no continuation and forces a flush.
    Final,
    /// A non-final response that is safe to buffer.
    Delayable,
}

impl ResponseKind {
    fn or_final(self, phinal: bool) -> Self {
        if phinal {
            ResponseKind::Final
        } else {
            self
        }
    }

    fn indicator(self) -> char {
        match self {
            Final => ' ',
            Delayable => '-',
        }
    }
}

use self::ResponseKind::*;

impl Session {
    pub(crate) fn new(
        srv: Arc<Server>,
        io: ServerIo,
        peer: SocketAddr,
        host_name: String,
        log_prefix: LogPrefix,
    ) -> Self {
        Session {
            srv,
            conn: SessionConn {
                io: io.clone(),
                peer,
            },
            br: BufReader::new(io.clone()),
            bw: BufWriter::new(io),
            log_prefix,
            host_name,
            quit: false,
            hello: None,
            env: None,
        }
    }

    pub(crate) async fn run(&mut self) -> Result<(), Error> {
        let srv = Arc::clone(&self.srv);
        if let Some(ref hook) = srv.on_new_connection {
            if let Err(e) = hook(&self.conn) {
                info!("{} Connection rejected: {}", self.log_prefix, e);
                self.send_smtp_error_or(
                    &e,
                    SmtpResponse(
                        pc::TransactionFailed,
                        None,
                        Cow::Borrowed("connection rejected"),
                    ),
                )
                .await?;
                return Ok(());
            }
        }

        self.send_response(
            Final,
            pc::ServiceReady,
            None,
            Cow::Owned(format!(
                "{} ESMTP {}",
                self.host_name,
                env!("CARGO_PKG_NAME"),
            )),
        )
        .await?;

        let mut buffer = Vec::new();
        while !self.quit {
            self.run_command(&mut buffer).await?;
        }

        Ok(())
    }

    async fn run_command(&mut self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        buffer.clear();

        let deadline = self.srv.read_timeout;
        with_deadline(
            deadline,
            (&mut self.br).take(MAX_LINE as u64).read_until(b'\n', buffer),
        )
        .await?;

        if buffer.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF reached at start of command",
            )));
        }

        if !buffer.ends_with(b"\n") {
            return Err(Error::Io(if buffer.len() >= MAX_LINE {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    "command line longer than the read buffer",
                )
            } else {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF reached within command",
                )
            }));
        }

        let line = match str::from_utf8(buffer) {
            Ok(s) => CmdLine::new(s),
            Err(_) => {
                warn!("{} Non-UTF-8 command received", self.log_prefix);
                return self
                    .send_response(
                        Final,
                        pc::CommandSyntaxError,
                        Some((cc::PermFail, sc::OtherProtocolStatus)),
                        Cow::Borrowed("Malformed UTF-8"),
                    )
                    .await;
            },
        };

        if let Err(fault) = line.check_valid() {
            self.send_response(
                Final,
                pc::CommandSyntaxError,
                None,
                Cow::Borrowed(fault.message()),
            )
            .await?;
            if LineFault::MissingCrlf == fault {
                // A framing fault poisons everything after it on the
                // stream; there is no way to resynchronise.
                self.quit = true;
            }
            return Ok(());
        }

        match line.verb().as_str() {
            "HELO" | "EHLO" => {
                let verb = line.verb();
                let host = line.arg().to_owned();
                self.cmd_hello(verb, host).await
            },
            "STARTTLS" => self.cmd_starttls().await,
            "QUIT" => self.cmd_quit().await,
            "RSET" => self.cmd_reset().await,
            "NOOP" => self.cmd_noop().await,
            "MAIL" => self.cmd_mail(line.arg()).await,
            "RCPT" => self.cmd_rcpt(line.arg()).await,
            "DATA" => self.cmd_data().await,
            _ => {
                self.send_response(
                    Final,
                    pc::CommandNotImplemented,
                    Some((cc::PermFail, sc::SyntaxError)),
                    Cow::Borrowed("Error: command not recognized"),
                )
                .await
            },
        }
    }

    async fn cmd_hello(
        &mut self,
        verb: String,
        host: String,
    ) -> Result<(), Error> {
        let extended = "EHLO" == verb;
        self.log_prefix.set_helo(host.clone());
        info!("{} SMTP {}", self.log_prefix, verb);

        // A fresh greeting abandons any transaction in progress.
        self.env = None;
        self.hello = Some((verb, host));

        if !extended {
            return self
                .send_response(
                    Final,
                    pc::Ok,
                    None,
                    Cow::Owned(self.host_name.clone()),
                )
                .await;
        }

        self.send_response(
            Delayable,
            pc::Ok,
            None,
            Cow::Owned(self.host_name.clone()),
        )
        .await?;

        // The extension listing is a function of the configuration alone,
        // in this exact order.
        let mut extensions = Vec::<Cow<'static, str>>::new();
        if self.srv.plain_auth {
            extensions.push(Cow::Borrowed("AUTH PLAIN"));
        }
        if self.srv.ssl_acceptor.is_some() {
            extensions.push(Cow::Borrowed("STARTTLS"));
        }
        if self.srv.max_size != 0 {
            extensions.push(Cow::Owned(format!("SIZE {}", self.srv.max_size)));
        }
        extensions.extend(
            ["PIPELINING", "ENHANCEDSTATUSCODES", "8BITMIME", "DSN"]
                .map(Cow::Borrowed),
        );

        let last = extensions.len() - 1;
        for (ix, ext) in extensions.into_iter().enumerate() {
            self.send_response(
                Delayable.or_final(ix == last),
                pc::Ok,
                None,
                ext,
            )
            .await?;
        }

        Ok(())
    }

    async fn cmd_mail(&mut self, arg: &str) -> Result<(), Error> {
        if self.env.is_some() {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed("Error: nested MAIL command"),
                )
                .await;
        }

        let parsed = match syntax::parse_mail_from(arg) {
            Ok(parsed) => parsed,
            Err(syntax::AddressParseError::Syntax) => {
                self.srv.log(format_args!(
                    "{} Invalid MAIL arg: {:?}",
                    self.log_prefix, arg,
                ));
                return self
                    .send_response(
                        Final,
                        pc::ParameterSyntaxError,
                        Some((
                            cc::PermFail,
                            sc::BadSenderMailboxAddressSyntax,
                        )),
                        Cow::Borrowed("Bad sender address syntax"),
                    )
                    .await;
            },
            Err(syntax::AddressParseError::BadSize) => {
                return self
                    .send_response(
                        Final,
                        pc::ParameterSyntaxError,
                        Some((cc::PermFail, sc::InvalidCommandArguments)),
                        Cow::Borrowed(
                            "Syntax error in parameters or arguments \
                             (invalid SIZE parameter)",
                        ),
                    )
                    .await;
            },
        };

        let from = MailAddress::new(parsed.reverse_path);
        let srv = Arc::clone(&self.srv);
        let Some(ref on_new_mail) = srv.on_new_mail else {
            // A server without an on_new_mail hook cannot accept mail at
            // all; treat the command like a rejection rather than a crash.
            error!(
                "{} Server has no on_new_mail hook; rejecting MAIL FROM",
                self.log_prefix,
            );
            return self.reject_mail_from().await;
        };

        match on_new_mail(&self.conn, from.clone(), parsed.size) {
            Ok(env) => {
                info!(
                    "{} Start mail transaction from {:?}",
                    self.log_prefix,
                    from.email(),
                );
                self.env = Some(env);
                self.send_response(
                    Final,
                    pc::Ok,
                    Some((cc::Success, sc::OtherAddressStatus)),
                    Cow::Borrowed("Ok"),
                )
                .await
            },
            Err(e) => {
                self.srv.log(format_args!(
                    "{} Rejecting MAIL FROM {:?}: {}",
                    self.log_prefix,
                    from.email(),
                    e,
                ));
                self.reject_mail_from().await
            },
        }
    }

    /// Refuses a MAIL FROM: reply `451 denied`, give the client a moment
    /// to drain, then tear the connection down.
    async fn reject_mail_from(&mut self) -> Result<(), Error> {
        self.send_response(
            Final,
            pc::ActionAborted,
            None,
            Cow::Borrowed("denied"),
        )
        .await?;

        tokio::time::sleep(MAIL_REJECT_LINGER).await;
        let _ = self.conn.close();
        self.quit = true;
        Ok(())
    }

    async fn cmd_rcpt(&mut self, arg: &str) -> Result<(), Error> {
        if self.env.is_none() {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed("Error: need MAIL command"),
                )
                .await;
        }

        let forward_path = match syntax::parse_rcpt_to(arg) {
            Ok(forward_path) => forward_path,
            Err(_) => {
                self.srv.log(format_args!(
                    "{} Bad RCPT address: {:?}",
                    self.log_prefix, arg,
                ));
                return self
                    .send_response(
                        Final,
                        pc::ParameterSyntaxError,
                        Some((
                            cc::PermFail,
                            sc::BadSenderMailboxAddressSyntax,
                        )),
                        Cow::Borrowed("Bad recipient address syntax"),
                    )
                    .await;
            },
        };

        let result = self
            .env
            .as_mut()
            .expect("RCPT reached with no envelope")
            .add_recipient(MailAddress::new(forward_path));
        match result {
            Ok(()) => {
                self.send_response(
                    Final,
                    pc::Ok,
                    Some((cc::Success, sc::OtherAddressStatus)),
                    Cow::Borrowed("Ok"),
                )
                .await
            },
            Err(e) => {
                self.send_smtp_error_or(
                    &e,
                    SmtpResponse(
                        pc::ActionNotTakenPermanent,
                        None,
                        Cow::Borrowed("bad recipient"),
                    ),
                )
                .await
            },
        }
    }

    async fn cmd_data(&mut self) -> Result<(), Error> {
        let Some(mut env) = self.env.take() else {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed("Error: need RCPT command"),
                )
                .await;
        };

        if let Err(e) = env.begin_data() {
            return match e {
                Error::Smtp(resp) => {
                    // The embedder chose the reply; the transaction stays
                    // open.
                    self.env = Some(env);
                    self.send_response(Final, resp.0, resp.1, resp.2).await
                },
                e => {
                    self.srv.log(format_args!(
                        "{} BeginData error: {}",
                        self.log_prefix, e,
                    ));
                    self.send_response(
                        Final,
                        pc::ActionAborted,
                        Some((cc::TempFail, sc::OtherMailSystem)),
                        Cow::Borrowed("Error: transaction failed"),
                    )
                    .await
                },
            };
        }

        self.send_response(
            Final,
            pc::StartMailInput,
            None,
            Cow::Borrowed("Go ahead"),
        )
        .await?;

        let deadline = self.srv.read_timeout;
        let outcome =
            copy_data_lines(&mut self.br, deadline, env.as_mut()).await?;
        match outcome {
            DataOutcome::Complete => match env.close() {
                Ok(()) => {
                    info!("{} Message accepted", self.log_prefix);
                    self.send_response(
                        Final,
                        pc::Ok,
                        Some((cc::Success, sc::Undefined)),
                        Cow::Borrowed("Ok: queued"),
                    )
                    .await
                },
                Err(Error::Smtp(resp)) => {
                    self.send_response(Final, resp.0, resp.1, resp.2).await
                },
                Err(e) => {
                    self.srv.log(format_args!(
                        "{} Close error: {}",
                        self.log_prefix, e,
                    ));
                    self.send_response(
                        Final,
                        pc::ActionAborted,
                        Some((cc::TempFail, sc::OtherMailSystem)),
                        Cow::Borrowed("Error: transaction failed"),
                    )
                    .await
                },
            },
            DataOutcome::WriteFailed(e) => {
                // The envelope stays; only RSET, a fresh hello, or a
                // completed DATA clears it.
                self.env = Some(env);
                self.send_smtp_error_or(
                    &e,
                    SmtpResponse(
                        pc::ActionNotTakenPermanent,
                        None,
                        Cow::Borrowed("failed"),
                    ),
                )
                .await
            },
        }
    }

    async fn cmd_starttls(&mut self) -> Result<(), Error> {
        let srv = Arc::clone(&self.srv);
        let Some(ref acceptor) = srv.ssl_acceptor else {
            return self
                .send_response(
                    Final,
                    pc::CommandNotImplemented,
                    Some((cc::PermFail, sc::SyntaxError)),
                    Cow::Borrowed("Error: command not recognized"),
                )
                .await;
        };

        if self.conn.io.is_ssl() {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed("Error: TLS already active"),
                )
                .await;
        }

        // RFC 3207 forbids the client to pipeline past STARTTLS. Anything
        // already buffered is cleartext that would otherwise be read back
        // as if it had arrived protected.
        if !self.br.buffer().is_empty() {
            warn!(
                "{} Pipelined cleartext after STARTTLS",
                self.log_prefix,
            );
            self.send_response(
                Final,
                pc::BadSequenceOfCommands,
                Some((cc::PermFail, sc::InvalidCommand)),
                Cow::Borrowed("Error: pipelining across STARTTLS"),
            )
            .await?;
            self.quit = true;
            return Ok(());
        }

        self.send_response(
            Final,
            pc::ServiceReady,
            None,
            Cow::Borrowed("Ready to start TLS"),
        )
        .await?;

        info!("{} Start TLS handshake", self.log_prefix);

        let deadline = self.srv.read_timeout;
        let handshake =
            with_deadline(deadline, self.conn.io.ssl_accept(acceptor)).await;
        match handshake {
            Ok(()) => {
                info!(
                    "{} TLS handshake completed: {}",
                    self.log_prefix,
                    self.conn.io.ssl_string().unwrap_or_default(),
                );

                // RFC 3207: discard all knowledge gained from the client
                // before the handshake, and rebuild the buffers against
                // the upgraded stream.
                if let Some((verb, host)) = self.hello.take() {
                    info!(
                        "{} Discarding pre-TLS {} from {:?}",
                        self.log_prefix, verb, host,
                    );
                }
                self.env = None;
                self.br = BufReader::new(self.conn.io.clone());
                self.bw = BufWriter::new(self.conn.io.clone());
                Ok(())
            },
            Err(e) => {
                warn!("{} TLS handshake failed: {}", self.log_prefix, e);
                self.send_smtp_error_or(
                    &e,
                    SmtpResponse(
                        pc::TlsHandshakeFailed,
                        Some((cc::TempFail, sc::OtherSecurity)),
                        Cow::Borrowed("TLS handshake failed"),
                    ),
                )
                .await?;
                Err(e)
            },
        }
    }

    async fn cmd_reset(&mut self) -> Result<(), Error> {
        self.env = None;
        self.send_response(
            Final,
            pc::Ok,
            Some((cc::Success, sc::Undefined)),
            Cow::Borrowed("OK"),
        )
        .await
    }

    async fn cmd_noop(&mut self) -> Result<(), Error> {
        self.send_response(
            Final,
            pc::Ok,
            Some((cc::Success, sc::Undefined)),
            Cow::Borrowed("OK"),
        )
        .await
    }

    async fn cmd_quit(&mut self) -> Result<(), Error> {
        self.quit = true;
        let _ = self
            .send_response(
                Final,
                pc::ServiceClosing,
                Some((cc::Success, sc::Undefined)),
                Cow::Borrowed("Bye"),
            )
            .await;
        Ok(())
    }

    /// Sends the reply carried by `err` when it is an SMTP-reply error,
    /// and `fallback` otherwise.
    async fn send_smtp_error_or(
        &mut self,
        err: &Error,
        fallback: SmtpResponse<'_>,
    ) -> Result<(), Error> {
        match *err {
            Error::Smtp(ref resp) => {
                let resp = resp.clone();
                self.send_response(Final, resp.0, resp.1, resp.2).await
            },
            _ => {
                let SmtpResponse(code, enhanced, text) = fallback;
                self.send_response(Final, code, enhanced, text).await
            },
        }
    }

    async fn send_response(
        &mut self,
        kind: ResponseKind,
        primary_code: PrimaryCode,
        enhanced: Option<(ClassCode, SubjectCode)>,
        quip: Cow<'_, str>,
    ) -> Result<(), Error> {
        use std::fmt::Write as _;

        let mut s = String::new();
        let _ = write!(s, "{}{}", primary_code as u16, kind.indicator());
        if let Some((class, subject)) = enhanced {
            let subject = subject as u8;
            let _ =
                write!(s, "{}.{}.{} ", class as u8, subject / 10, subject % 10);
        }
        let _ = write!(s, "{}\r\n", quip);

        let deadline = self.srv.write_timeout;
        with_deadline(deadline, async {
            self.bw.write_all(s.as_bytes()).await?;
            if Final == kind {
                self.bw.flush().await?;
            }
            Ok::<(), io::Error>(())
        })
        .await?;

        Ok(())
    }
}

/// How a DATA body read ended, short of a session-fatal I/O error.
enum DataOutcome {
    /// The terminating `.` was seen and every line was delivered.
    Complete,
    /// The envelope refused a body line; the rest of the body was not
    /// read.
    WriteFailed(Error),
}

/// Streams body lines from `src` into `env` until the terminating `.`
/// line.
///
/// Each line is dot-unstuffed and delivered with its trailing CRLF; the
/// terminator itself is not delivered. `deadline` is armed before each
/// read.
async fn copy_data_lines<R>(
    src: &mut R,
    deadline: Duration,
    env: &mut (dyn Envelope + '_),
) -> Result<DataOutcome, Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        with_deadline(
            deadline,
            (&mut *src).take(MAX_LINE as u64).read_until(b'\n', &mut buffer),
        )
        .await?;

        if buffer.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF encountered in DATA payload",
            )));
        }

        if !buffer.ends_with(b"\n") {
            return Err(Error::Io(if buffer.len() >= MAX_LINE {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    "body line longer than the read buffer",
                )
            } else {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF encountered in DATA payload",
                )
            }));
        }

        if b".\r\n" == &buffer[..] {
            return Ok(DataOutcome::Complete);
        }

        // Dot-unstuffing: a leading '.' escapes a line which itself
        // starts with one.
        let line = if b'.' == buffer[0] {
            &buffer[1..]
        } else {
            &buffer[..]
        };

        if let Err(e) = env.write_line(line) {
            return Ok(DataOutcome::WriteFailed(e));
        }
    }
}

/// Runs `op` under `deadline`, armed immediately before the operation; a
/// zero deadline disables the timer.
async fn with_deadline<T, E: From<io::Error>>(
    deadline: Duration,
    op: impl Future<Output = Result<T, E>>,
) -> Result<T, E> {
    if deadline.is_zero() {
        op.await
    } else {
        match tokio::time::timeout(deadline, op).await {
            Ok(result) => result,
            Err(_elapsed) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "connection deadline expired",
            )
            .into()),
        }
    }
}
