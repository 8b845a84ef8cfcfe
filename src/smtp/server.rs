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

//! Server configuration and the listener accept loop.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use log::error;
use openssl::ssl::SslAcceptor;
use tokio::net::{TcpListener, TcpStream};

use crate::smtp::envelope::{Connection, Envelope};
use crate::smtp::session::Session;
use crate::smtp::syntax::MailAddress;
use crate::support::{
    async_io::ServerIo, error::Error, log_prefix::LogPrefix,
};

/// Called on each new connection before the greeting banner is sent.
///
/// A returned error rejects the connection: its SMTP reply (or `554
/// connection rejected`) is sent and the connection is closed.
pub type OnNewConnection =
    Box<dyn Fn(&dyn Connection) -> Result<(), Error> + Send + Sync>;

/// Called when a `MAIL FROM` line arrives, with the reverse-path and the
/// declared SIZE, if any.
///
/// On success the returned envelope receives the rest of the transaction.
/// On error the client is told `451 denied` and, after a short pause, the
/// connection is torn down.
pub type OnNewMail = Box<
    dyn Fn(
            &dyn Connection,
            MailAddress,
            Option<u64>,
        ) -> Result<Box<dyn Envelope>, Error>
        + Send
        + Sync,
>;

/// Overrides the standard logging of client-attributable events.
pub type LogSink = Box<dyn Fn(fmt::Arguments<'_>) + Send + Sync>;

/// Observes errors that terminate a session.
pub type OnProtoError = Box<dyn Fn(&Error) + Send + Sync>;

/// An SMTP server.
///
/// The configuration is plain data plus callbacks; it is immutable once
/// serving starts, and every field has a usable default except
/// `on_new_mail`, without which any `MAIL FROM` is refused.
#[derive(Default)]
pub struct Server {
    /// TCP address to listen on; `:25` if empty.
    pub addr: String,
    /// Host name to announce; if empty, the output of the system
    /// `hostname` command is used, else nothing is announced.
    pub hostname: String,
    /// Deadline armed before each read; zero disables.
    pub read_timeout: Duration,
    /// Deadline armed before each write; zero disables.
    pub write_timeout: Duration,
    /// Advertise `AUTH PLAIN` (assumes the embedder fronts this with TLS).
    pub plain_auth: bool,
    /// Advertise STARTTLS and use this acceptor to upgrade connections.
    pub ssl_acceptor: Option<SslAcceptor>,
    /// Maximum message size to advertise via the SIZE extension; 0
    /// disables the advertisement.
    pub max_size: u64,
    pub on_new_connection: Option<OnNewConnection>,
    pub on_new_mail: Option<OnNewMail>,
    pub log: Option<LogSink>,
    pub on_proto_error: Option<OnProtoError>,
}

impl Server {
    /// Binds `self.addr` and serves connections until the listener fails
    /// permanently.
    pub async fn listen_and_serve(self) -> Result<(), Error> {
        let listener = TcpListener::bind(listen_addr(&self.addr)).await?;
        self.serve(listener).await
    }

    /// Serves connections from an existing listener, one task per accepted
    /// connection.
    ///
    /// Transient accept errors are logged and the loop continues; a
    /// permanent accept error ends the call. Per-session faults never
    /// propagate here.
    pub async fn serve(self, listener: TcpListener) -> Result<(), Error> {
        // TODO send 421 to connected clients on graceful server shutdown
        // (RFC 5321 s3.8)
        let host_name = self.resolve_hostname();
        let srv = Arc::new(self);

        loop {
            let (sock, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_transient_accept_error(&e) => {
                    srv.log(format_args!("Accept error: {}", e));
                    continue;
                },
                Err(e) => return Err(e.into()),
            };

            let srv = Arc::clone(&srv);
            let host_name = host_name.clone();
            tokio::spawn(async move {
                run_session(srv, sock, peer, host_name).await;
            });
        }
    }

    pub(crate) fn log(&self, args: fmt::Arguments<'_>) {
        match self.log {
            Some(ref sink) => sink(args),
            None => log::info!("{}", args),
        }
    }

    pub(crate) fn proto_error(&self, err: &Error) {
        if let Some(ref hook) = self.on_proto_error {
            hook(err);
        }
    }

    /// The host name announced in the banner and HELO/EHLO replies,
    /// resolved once when serving starts.
    fn resolve_hostname(&self) -> String {
        if !self.hostname.is_empty() {
            return self.hostname.clone();
        }

        match process::Command::new("hostname").output() {
            Ok(out) => String::from_utf8_lossy(&out.stdout).trim().to_owned(),
            Err(_) => String::new(),
        }
    }
}

async fn run_session(
    srv: Arc<Server>,
    sock: TcpStream,
    peer: SocketAddr,
    host_name: String,
) {
    let log_prefix = LogPrefix::new(format!("smtp:{}", peer));

    // The reactor registration moves to the session's ServerIo; tokio's
    // own is dropped here.
    let sock = match sock.into_std() {
        Ok(sock) => sock,
        Err(e) => {
            error!("{} Unable to detach accepted socket: {}", log_prefix, e);
            return;
        },
    };
    let io = match ServerIo::new_owned_socket(sock) {
        Ok(io) => io,
        Err(e) => {
            error!("{} Unable to set up connection I/O: {}", log_prefix, e);
            return;
        },
    };

    let mut session =
        Session::new(Arc::clone(&srv), io, peer, host_name, log_prefix.clone());
    match session.run().await {
        Ok(()) => {
            srv.log(format_args!("{} Normal client disconnect", log_prefix))
        },
        Err(e) => {
            srv.proto_error(&e);
            srv.log(format_args!("{} Client error: {}", log_prefix, e));
        },
    }
}

/// Maps the configured listen address to one `TcpListener::bind` accepts:
/// blank means `:25`, and a bare `:port` means all interfaces.
fn listen_addr(addr: &str) -> String {
    let addr = if addr.is_empty() { ":25" } else { addr };
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => addr.to_owned(),
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn listen_addr_defaults() {
        assert_eq!("0.0.0.0:25", listen_addr(""));
        assert_eq!("0.0.0.0:2500", listen_addr(":2500"));
        assert_eq!("127.0.0.1:2500", listen_addr("127.0.0.1:2500"));
    }

    #[test]
    fn transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "aborted",
        )));
        assert!(!is_transient_accept_error(&io::Error::new(
            io::ErrorKind::AddrInUse,
            "in use",
        )));
    }
}
