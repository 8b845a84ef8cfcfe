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

use std::any::Any;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task;

use openssl::ssl::{ErrorCode, HandshakeError, SslAcceptor, SslStream};
use tokio::io::{
    unix::AsyncFd, AsyncRead, AsyncWrite, Interest, ReadBuf,
};

use crate::support::error::Error;

/// The main type for doing async I/O on server connections.
///
/// This fulfils three roles:
/// - Owning the accepted socket for exactly as long as any part of the
///   session refers to it.
/// - Supporting switching from cleartext to TLS mid-stream (STARTTLS).
/// - Letting another task force-close the connection while the session
///   task is blocked on I/O.
///
/// Clones of a `ServerIo` track the same underlying state, so the session's
/// buffered reader, its buffered writer, and the connection handle given to
/// embedder callbacks all refer to one socket.
#[derive(Clone)]
pub struct ServerIo {
    fd: Arc<AsyncFd<RawFd>>,
    mode: Arc<Mutex<Mode>>,
    _owned: Arc<dyn Any + Send + Sync>,
}

enum Mode {
    Cleartext(SocketRw),
    Ssl(SslStream<SocketRw>),
}

impl ServerIo {
    /// Sets up a `ServerIo` which runs over the given socket.
    ///
    /// The `ServerIo` owns the socket, and the socket is closed when the
    /// last clone is dropped. This only fails if making the socket
    /// non-blocking fails or if it cannot be registered with the reactor.
    pub fn new_owned_socket(
        sock: impl AsRawFd + Any + Send + Sync,
    ) -> Result<Self, Error> {
        let raw = sock.as_raw_fd();
        nix::fcntl::fcntl(
            raw,
            nix::fcntl::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )?;

        let fd = Arc::new(AsyncFd::with_interest(
            raw,
            Interest::READABLE | Interest::WRITABLE,
        )?);

        Ok(Self {
            mode: Arc::new(Mutex::new(Mode::Cleartext(SocketRw(
                Arc::clone(&fd),
            )))),
            fd,
            _owned: Arc::new(sock),
        })
    }

    pub fn is_ssl(&self) -> bool {
        matches!(*self.mode.lock().unwrap(), Mode::Ssl(_))
    }

    /// Describes the negotiated TLS session, if any.
    pub fn ssl_string(&self) -> Option<String> {
        match *self.mode.lock().unwrap() {
            Mode::Cleartext(..) => None,
            Mode::Ssl(ref stream) => {
                let ssl = stream.ssl();
                let cipher = ssl.current_cipher();
                Some(format!(
                    "{tls_version}:{cipher}:{strength}",
                    tls_version = ssl.version_str(),
                    cipher = cipher.map_or("NONE", |c| c.name()),
                    strength = cipher.map_or(0, |c| c.bits().algorithm),
                ))
            },
        }
    }

    /// Shuts the socket down in both directions, forcing any task blocked
    /// on it to observe EOF or EPIPE.
    ///
    /// This is the force-close operation exposed to embedder callbacks; it
    /// is safe to call from any task.
    pub fn shutdown_socket(&self) -> io::Result<()> {
        nix::sys::socket::shutdown(
            *self.fd.get_ref(),
            nix::sys::socket::Shutdown::Both,
        )
        .map_err(nix_to_io)
    }

    /// Performs server-side TLS setup with the given acceptor, switching
    /// this stream to TLS mode on success.
    ///
    /// The caller must not issue reads or writes through other clones while
    /// the handshake runs; they would bypass the TLS layer.
    pub async fn ssl_accept(
        &self,
        acceptor: &SslAcceptor,
    ) -> Result<(), Error> {
        let mut result = acceptor.accept(SocketRw(Arc::clone(&self.fd)));

        // The workflow around the ready guards is awkward because there's
        // no way to tell Tokio "I just saw that it's not ready, block until
        // it's ready again"; there's also no way to know which operation we
        // need without running through one pass of the OpenSSL
        // implementation. Instead, we get the guard when Tokio thinks the
        // operation is ready (but we know it probably isn't, because
        // OpenSSL just told us, but because of the await point it may have
        // become actually ready) and then need to do another round of the
        // loop to test whether it's still blocked. Then, once we do get
        // another WANT_READ/WANT_WRITE while holding the guard, we can
        // finally tell Tokio that it's not ready and drop the guard.
        let mut read_guard: Option<tokio::io::unix::AsyncFdReadyGuard<'_, RawFd>> = None;
        let mut write_guard: Option<tokio::io::unix::AsyncFdReadyGuard<'_, RawFd>> = None;

        loop {
            match result {
                Ok(stream) => {
                    *self.mode.lock().unwrap() = Mode::Ssl(stream);
                    return Ok(());
                },

                Err(HandshakeError::SetupFailure(e)) => {
                    return Err(e.into());
                },

                Err(HandshakeError::Failure(mhss)) => {
                    return Err(mhss_to_error(mhss));
                },

                Err(HandshakeError::WouldBlock(mhss)) => {
                    match mhss.error().code() {
                        ErrorCode::WANT_READ => {
                            if let Some(mut guard) = read_guard.take() {
                                guard.clear_ready();
                            }

                            read_guard = Some(self.fd.readable().await?);
                            result = mhss.handshake();
                        },

                        ErrorCode::WANT_WRITE => {
                            if let Some(mut guard) = write_guard.take() {
                                guard.clear_ready();
                            }

                            write_guard = Some(self.fd.writable().await?);
                            result = mhss.handshake();
                        },

                        _ => return Err(mhss_to_error(mhss)),
                    }
                },
            }
        }
    }

    /// Called when an error is returned from `ssl_read` or `ssl_write`.
    ///
    /// The main purpose of this function is to handle the cases where
    /// OpenSSL returns `WANT_READ` or `WANT_WRITE`: it arranges a readiness
    /// check for the socket and clears its readiness status if currently
    /// set. Because of this, it is critical that this *only* be called
    /// immediately after `ssl_read` or `ssl_write`, with no await points in
    /// between, so that we can be certain that the `WANT_READ` or
    /// `WANT_WRITE` indicate that there is absolutely no data on the
    /// socket.
    fn on_rw_ssl_error(
        &self,
        ctx: &mut task::Context<'_>,
        e: openssl::ssl::Error,
    ) -> task::Poll<io::Result<()>> {
        match e.code() {
            ErrorCode::WANT_READ => {
                futures::ready!(self.fd.poll_read_ready(ctx))?.clear_ready();
                // Call again to get tokio to actually watch for more
                // changes.
                futures::ready!(self.fd.poll_read_ready(ctx))?.retain_ready();
                // If we get here, the FD has somehow become ready meanwhile.
                task::Poll::Ready(Ok(()))
            },

            ErrorCode::WANT_WRITE => {
                futures::ready!(self.fd.poll_write_ready(ctx))?.clear_ready();
                futures::ready!(self.fd.poll_write_ready(ctx))?
                    .retain_ready();
                task::Poll::Ready(Ok(()))
            },

            // As can be seen in the `fmt::Display` implementation of
            // `openssl::ssl::Error`, EOF is represented by the SYSCALL
            // error code with no associated IO error, and into_io_error()
            // doesn't bother to translate that.
            ErrorCode::SYSCALL => task::Poll::Ready(Err(e
                .into_io_error()
                .unwrap_or_else(|_| io::ErrorKind::UnexpectedEof.into()))),

            _ => task::Poll::Ready(Err(e
                .into_io_error()
                .unwrap_or_else(|e| io::Error::new(io::ErrorKind::Other, e)))),
        }
    }
}

impl AsyncRead for ServerIo {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let mut mode = self.mode.lock().unwrap();
        match *mode {
            Mode::Cleartext(ref mut f) => Pin::new(f).poll_read(ctx, buf),
            Mode::Ssl(ref mut ssl) => loop {
                match ssl.ssl_read(buf.initialize_unfilled()) {
                    Ok(n) => {
                        buf.advance(n);
                        return task::Poll::Ready(Ok(()));
                    },

                    Err(e) => futures::ready!(self.on_rw_ssl_error(ctx, e))?,
                }
            },
        }
    }
}

impl AsyncWrite for ServerIo {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        let mut mode = self.mode.lock().unwrap();
        match *mode {
            Mode::Cleartext(ref mut f) => Pin::new(f).poll_write(ctx, buf),
            Mode::Ssl(ref mut ssl) => loop {
                match ssl.ssl_write(buf) {
                    Ok(n) => return task::Poll::Ready(Ok(n)),
                    Err(e) => futures::ready!(self.on_rw_ssl_error(ctx, e))?,
                }
            },
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        // OpenSSL doesn't buffer anything itself (i.e. SslStream::flush()
        // just delegates to the underlying writer without invoking OpenSSL)
        // and we also have no buffers, so there's nothing to do.
        task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        // Best-effort close_notify; the socket is dropped right after
        // shutdown either way.
        if let Mode::Ssl(ref mut ssl) = *self.mode.lock().unwrap() {
            let _ = ssl.shutdown();
        }
        task::Poll::Ready(Ok(()))
    }
}

/// Implements both the synchronous and asynchronous read and write traits
/// atop the raw socket.
///
/// OpenSSL drives the synchronous pair; cleartext mode drives the
/// asynchronous pair. The structure holds the `AsyncFd` itself as we need
/// to "see through" the SSL stream in order to wait on the underlying
/// socket to become ready.
struct SocketRw(Arc<AsyncFd<RawFd>>);

impl io::Read for SocketRw {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        nix::unistd::read(*self.0.get_ref(), dst).map_err(nix_to_io)
    }
}

impl io::Write for SocketRw {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        nix::unistd::write(*self.0.get_ref(), src).map_err(nix_to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsyncRead for SocketRw {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        loop {
            let mut guard = futures::ready!(self.0.poll_read_ready(ctx))?;

            match guard.try_io(|fd| {
                nix::unistd::read(*fd.get_ref(), buf.initialize_unfilled())
                    .map_err(nix_to_io)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return task::Poll::Ready(Ok(()));
                },

                Ok(Err(e)) => return task::Poll::Ready(Err(e)),

                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for SocketRw {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        loop {
            let mut guard = futures::ready!(self.0.poll_write_ready(ctx))?;

            if let Ok(result) = guard.try_io(|fd| {
                nix::unistd::write(*fd.get_ref(), buf).map_err(nix_to_io)
            }) {
                return task::Poll::Ready(result);
            }
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        task::Poll::Ready(Ok(()))
    }
}

fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn mhss_to_error(
    mhss: openssl::ssl::MidHandshakeSslStream<SocketRw>,
) -> Error {
    let e = mhss.into_error();
    if let Some(es) = e.ssl_error() {
        Error::Ssl(es.clone())
    } else {
        match e.into_io_error() {
            Ok(io) => Error::Io(io),
            Err(e) if e.code() == ErrorCode::SYSCALL => {
                Error::Io(io::ErrorKind::UnexpectedEof.into())
            },
            Err(e) => Error::Io(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}
