use std::{
    future::Future as _,
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use actix_rt::time::{sleep, Instant, Sleep};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::pool::{Acquired, Route};

/// Trait alias for types impl [tokio::io::AsyncRead] and [tokio::io::AsyncWrite].
pub trait ConnectionIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> ConnectionIo for T {}

/// Boxed transport stream, plain TCP or TLS.
pub type BoxedSocket = Box<dyn ConnectionIo>;

/// A connection leased from the pool.
///
/// Give it back with [`Connection::release`] once the response has been fully read, or
/// discard it with [`Connection::close`]. A connection dropped without either is closed.
pub struct Connection {
    io: Option<BoxedSocket>,
    created: Instant,
    reused: bool,
    read_timeout: Option<Duration>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    acquired: Acquired,
}

impl Connection {
    pub(super) fn new(
        io: BoxedSocket,
        created: Instant,
        reused: bool,
        read_timeout: Option<Duration>,
        acquired: Acquired,
    ) -> Self {
        Self {
            io: Some(io),
            created,
            reused,
            read_timeout,
            read_deadline: None,
            acquired,
        }
    }

    /// Route this connection is bound to.
    pub fn route(&self) -> &Route {
        self.acquired.route()
    }

    /// Returns true if the connection was taken from the idle set rather than freshly opened.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Instant the underlying socket was opened.
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Release this connection back to the pool for reuse.
    pub fn release(mut self) {
        if let Some(io) = self.io.take() {
            self.acquired.release(io, self.created);
        }
    }

    /// Close this connection and free its pool slot.
    pub fn close(mut self) {
        if let Some(io) = self.io.take() {
            self.acquired.close(io);
        }
    }

    fn io_mut(&mut self) -> io::Result<&mut BoxedSocket> {
        self.io
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection was released"))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(io) = self.io.take() {
            self.acquired.close(io);
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let read_timeout = this.read_timeout;

        let io = match this.io_mut() {
            Ok(io) => io,
            Err(err) => return Poll::Ready(Err(err)),
        };

        match Pin::new(io).poll_read(cx, buf) {
            Poll::Ready(res) => {
                this.read_deadline = None;
                Poll::Ready(res)
            }
            Poll::Pending => {
                let Some(timeout) = read_timeout else {
                    return Poll::Pending;
                };

                let deadline = this
                    .read_deadline
                    .get_or_insert_with(|| Box::pin(sleep(timeout)));

                if deadline.as_mut().poll(cx).is_ready() {
                    this.read_deadline = None;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "read timed out",
                    )));
                }

                Poll::Pending
            }
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().io_mut() {
            Ok(io) => Pin::new(io).poll_write(cx, buf),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().io_mut() {
            Ok(io) => Pin::new(io).poll_flush(cx),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().io_mut() {
            Ok(io) => Pin::new(io).poll_shutdown(cx),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().io_mut() {
            Ok(io) => Pin::new(io).poll_write_vectored(cx, bufs),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn is_write_vectored(&self) -> bool {
        self.io.as_ref().is_some_and(|io| io.is_write_vectored())
    }
}
