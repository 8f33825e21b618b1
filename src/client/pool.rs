//! Client connection pooling keyed on the route (scheme, host, port) of the request URI.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    future::Future,
    pin::{pin, Pin},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
    time::Duration,
};

use actix_rt::time::{sleep, Instant, Sleep};
use actix_service::Service;
use futures_util::FutureExt as _;
use http::Uri;
use pin_project_lite::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::Notify,
};

use super::{
    config::ConnectorConfig,
    connection::{BoxedSocket, Connection},
    error::{ConnectError, InvalidUrl},
};
use crate::{error::CleanupError, reaper::IdleCleanup, tls::TlsContext};

const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;

/// URI scheme supported by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Https)
    }

    fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => HTTP_PORT,
            Scheme::Https => HTTPS_PORT,
        }
    }
}

/// A distinct connection target: (scheme, host, port).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Route {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// Derives the route of a request URI, filling in the scheme's default port.
    pub fn from_uri(uri: &Uri) -> Result<Self, InvalidUrl> {
        let scheme = match uri.scheme_str() {
            Some(s) if s.eq_ignore_ascii_case("http") => Scheme::Http,
            Some(s) if s.eq_ignore_ascii_case("https") => Scheme::Https,
            Some(_) => return Err(InvalidUrl::UnknownScheme),
            None => return Err(InvalidUrl::MissingScheme),
        };

        let host = match uri.host() {
            Some(host) if !host.is_empty() => host.trim_start_matches('[').trim_end_matches(']'),
            _ => return Err(InvalidUrl::MissingHost),
        };

        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());

        Ok(Self::new(scheme, host.to_ascii_lowercase(), port))
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host name or IP address, without IPv6 brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.authority())
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently checked out (or being opened).
    pub leased: usize,
    /// Connections waiting in the pool for reuse.
    pub idle: usize,
    /// Per-route breakdown.
    pub routes: HashMap<Route, RouteStats>,
}

impl PoolStats {
    pub fn live(&self) -> usize {
        self.leased + self.idle
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteStats {
    pub leased: usize,
    pub idle: usize,
}

/// Connections pool to reuse I/O per [`Route`].
///
/// Live connections (leased plus idle) never exceed `max_per_route` for one route nor
/// `max_total` overall. Callers past the route limit wait in turn for a slot; callers past
/// only the total limit evict the oldest idle connection of another route.
pub struct ConnectionPool<S> {
    connector: S,
    tls: Option<TlsContext>,
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    config: ConnectorConfig,
    state: Mutex<PoolState>,
    released: Notify,
}

#[derive(Default)]
struct PoolState {
    routes: HashMap<Route, RouteEntry>,
    live: usize,
    closed: bool,
}

#[derive(Default)]
struct RouteEntry {
    idle: VecDeque<IdleConnection>,
    leased: usize,
}

impl RouteEntry {
    fn live(&self) -> usize {
        self.leased + self.idle.len()
    }

    fn is_empty(&self) -> bool {
        self.live() == 0
    }
}

struct IdleConnection {
    io: BoxedSocket,
    created: Instant,
    idle_since: Instant,
}

enum Checkout {
    Idle(IdleConnection),
    Connect,
    Wait,
}

impl<S> ConnectionPool<S> {
    /// Construct a new connection pool.
    ///
    /// `tls` is the trust context secure routes were configured with, if any; it is kept for
    /// inspection, the connector is what actually performs handshakes.
    pub fn new(connector: S, config: ConnectorConfig, tls: Option<TlsContext>) -> Self {
        Self {
            connector,
            tls,
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState::default()),
                released: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.inner.config
    }

    /// TLS context secure routes of this pool are bound to.
    pub fn tls_context(&self) -> Option<&TlsContext> {
        self.tls.as_ref()
    }

    pub fn connector(&self) -> &S {
        &self.connector
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state();

        let routes = state
            .routes
            .iter()
            .map(|(route, entry)| {
                let stats = RouteStats {
                    leased: entry.leased,
                    idle: entry.idle.len(),
                };
                (route.clone(), stats)
            })
            .collect::<HashMap<_, _>>();

        PoolStats {
            leased: routes.values().map(|r| r.leased).sum(),
            idle: routes.values().map(|r| r.idle).sum(),
            routes,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    /// Closes connections idle for longer than `threshold`.
    ///
    /// Leased connections are never touched. Returns the number of connections closed.
    pub fn close_idle_connections(&self, threshold: Duration) -> Result<usize, CleanupError> {
        self.inner.close_idle(threshold)
    }

    /// Closes the pool: idle connections are shut down, waiters fail with
    /// [`ConnectError::PoolClosed`] and leased connections are closed when given back.
    pub fn close(&self) {
        self.inner.shutdown();
    }
}

impl<S> ConnectionPool<S>
where
    S: Service<Route, Response = BoxedSocket, Error = ConnectError>,
{
    /// Leases a connection for `uri`, reusing an idle one when available.
    pub async fn acquire(&self, uri: &Uri) -> Result<Connection, ConnectError> {
        let route = Route::from_uri(uri)?;
        let read_timeout = self.inner.config.read_timeout_opt();

        loop {
            let mut released = pin!(self.inner.released.notified());
            released.as_mut().enable();

            match self.inner.checkout(&route)? {
                Checkout::Idle(mut conn) => {
                    let mut acquired = Acquired::new(route.clone(), Arc::clone(&self.inner));

                    match liveness(&mut conn.io) {
                        ConnectionState::Live => {
                            log::trace!("reusing pooled connection to {route}");
                            return Ok(Connection::new(
                                conn.io,
                                conn.created,
                                true,
                                read_timeout,
                                acquired,
                            ));
                        }
                        ConnectionState::Tainted | ConnectionState::Closed => {
                            log::debug!("discarding stale pooled connection to {route}");
                            acquired.close(conn.io);
                        }
                    }
                }

                Checkout::Connect => {
                    let acquired = Acquired::new(route.clone(), Arc::clone(&self.inner));

                    // dropping `acquired` on failure gives the reserved slot back
                    let io = self.connector.call(route.clone()).await?;
                    log::debug!("opened connection to {route}");

                    return Ok(Connection::new(
                        io,
                        Instant::now(),
                        false,
                        read_timeout,
                        acquired,
                    ));
                }

                Checkout::Wait => {
                    log::trace!("connection pool exhausted for {route}, waiting");
                    released.await;
                }
            }
        }
    }
}

impl<S> IdleCleanup for ConnectionPool<S>
where
    S: Send + Sync + 'static,
{
    fn close_idle_connections(&self, idle_timeout: Duration) -> Result<usize, CleanupError> {
        self.inner.close_idle(idle_timeout)
    }
}

impl<S> Drop for ConnectionPool<S> {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserves a slot for `route`: either hands out an idle connection, allows a new one to
    /// be opened, or asks the caller to wait.
    fn checkout(&self, route: &Route) -> Result<Checkout, ConnectError> {
        let mut evicted = None;

        let checkout = {
            let mut state = self.state();

            if state.closed {
                return Err(ConnectError::PoolClosed);
            }

            let entry = state.routes.entry(route.clone()).or_default();

            if let Some(conn) = entry.idle.pop_back() {
                entry.leased += 1;
                return Ok(Checkout::Idle(conn));
            }

            if entry.live() >= self.config.max_per_route {
                Checkout::Wait
            } else if state.live < self.config.max_total {
                state.reserve(route);
                Checkout::Connect
            } else if let Some(conn) = state.evict_oldest_idle() {
                evicted = Some(conn);
                state.reserve(route);
                Checkout::Connect
            } else {
                if state.routes.get(route).is_some_and(RouteEntry::is_empty) {
                    state.routes.remove(route);
                }
                Checkout::Wait
            }
        };

        if let Some(conn) = evicted {
            log::debug!("evicted idle connection to make room for {route}");
            self.close_io(conn.io);
        }

        Ok(checkout)
    }

    fn release(&self, route: &Route, io: BoxedSocket, created: Instant) {
        let rejected = {
            let mut state = self.state();

            if state.closed {
                state.forget(route);
                Some(io)
            } else {
                if let Some(entry) = state.routes.get_mut(route) {
                    entry.leased = entry.leased.saturating_sub(1);
                    entry.idle.push_back(IdleConnection {
                        io,
                        created,
                        idle_since: Instant::now(),
                    });
                }
                None
            }
        };

        if let Some(io) = rejected {
            self.close_io(io);
        }

        self.released.notify_waiters();
    }

    fn discard(&self, route: &Route, io: Option<BoxedSocket>) {
        self.state().forget(route);

        if let Some(io) = io {
            self.close_io(io);
        }

        self.released.notify_waiters();
    }

    /// Closes connections idle for longer than `threshold`.
    ///
    /// The lock is taken once per connection so checkouts and releases interleave with a
    /// long scan. Idle queues are ordered oldest first, so each route's expired connections
    /// form a prefix of its queue.
    fn close_idle(&self, threshold: Duration) -> Result<usize, CleanupError> {
        let now = Instant::now();

        let routes: Vec<Route> = {
            let state = self.state();

            if state.closed {
                return Err(CleanupError::PoolClosed);
            }

            state.routes.keys().cloned().collect()
        };

        let mut closed = 0;

        for route in &routes {
            while let Some(conn) = self.pop_expired(route, now, threshold)? {
                self.close_io(conn.io);
                closed += 1;
            }
        }

        if closed > 0 {
            log::debug!("closed {closed} connection(s) idle for more than {threshold:?}");
            self.released.notify_waiters();
        }

        Ok(closed)
    }

    fn pop_expired(
        &self,
        route: &Route,
        now: Instant,
        threshold: Duration,
    ) -> Result<Option<IdleConnection>, CleanupError> {
        let mut state = self.state();

        if state.closed {
            return Err(CleanupError::PoolClosed);
        }

        let Some(entry) = state.routes.get_mut(route) else {
            return Ok(None);
        };

        match entry.idle.front() {
            Some(conn) if now.saturating_duration_since(conn.idle_since) > threshold => {}
            _ => return Ok(None),
        }

        let conn = entry.idle.pop_front();
        if entry.is_empty() {
            state.routes.remove(route);
        }

        if conn.is_some() {
            state.live -= 1;
        }

        Ok(conn)
    }

    fn shutdown(&self) {
        let idle = {
            let mut state = self.state();

            if state.closed {
                return;
            }

            state.closed = true;

            let mut idle = Vec::new();
            for entry in state.routes.values_mut() {
                idle.extend(entry.idle.drain(..));
            }

            state.live -= idle.len();
            state.routes.retain(|_, entry| !entry.is_empty());

            idle
        };

        idle.into_iter().for_each(|conn| self.close_io(conn.io));

        self.released.notify_waiters();
    }

    /// Spawns a graceful shutdown task for the underlying I/O with a timeout.
    ///
    /// Without a disconnect timeout or outside a runtime the socket is simply dropped.
    fn close_io(&self, io: BoxedSocket) {
        if let Some(timeout) = self.config.disconnect_timeout {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(CloseConnection::new(io, timeout));
            }
        }
    }
}

impl PoolState {
    fn reserve(&mut self, route: &Route) {
        self.live += 1;
        self.routes.entry(route.clone()).or_default().leased += 1;
    }

    /// Drops the bookkeeping of one leased connection of `route`.
    fn forget(&mut self, route: &Route) {
        self.live = self.live.saturating_sub(1);

        if let Some(entry) = self.routes.get_mut(route) {
            entry.leased = entry.leased.saturating_sub(1);

            if entry.is_empty() {
                self.routes.remove(route);
            }
        }
    }

    fn evict_oldest_idle(&mut self) -> Option<IdleConnection> {
        let route = self
            .routes
            .iter()
            .filter_map(|(route, entry)| entry.idle.front().map(|conn| (route, conn.idle_since)))
            .min_by_key(|(_, idle_since)| *idle_since)
            .map(|(route, _)| route.clone())?;

        let entry = self.routes.get_mut(&route)?;
        let conn = entry.idle.pop_front()?;

        if entry.is_empty() {
            self.routes.remove(&route);
        }

        self.live -= 1;
        Some(conn)
    }
}

/// Handle to a reserved pool slot, carried by a leased [`Connection`].
pub(crate) struct Acquired {
    /// route key to identify the connection.
    route: Route,
    /// handle to the connection pool.
    inner: Arc<PoolInner>,
    /// false until the slot was given back.
    done: bool,
}

impl Acquired {
    fn new(route: Route, inner: Arc<PoolInner>) -> Self {
        Self {
            route,
            inner,
            done: false,
        }
    }

    pub(super) fn route(&self) -> &Route {
        &self.route
    }

    /// Release IO back into pool.
    pub(super) fn release(&mut self, io: BoxedSocket, created: Instant) {
        self.done = true;
        self.inner.release(&self.route, io, created);
    }

    /// Close the IO.
    pub(super) fn close(&mut self, io: BoxedSocket) {
        self.done = true;
        self.inner.discard(&self.route, Some(io));
    }
}

impl Drop for Acquired {
    fn drop(&mut self) {
        if !self.done {
            self.inner.discard(&self.route, None);
        }
    }
}

enum ConnectionState {
    /// IO is pending and a new request would wake it.
    Live,

    /// IO unexpectedly has unread data and should be dropped.
    Tainted,

    /// IO reached EOF or failed.
    Closed,
}

fn liveness(io: &mut BoxedSocket) -> ConnectionState {
    let check = ConnectionCheckFuture { io };
    check.now_or_never().unwrap_or(ConnectionState::Live)
}

/// Type for check the connection and determine if it's usable.
struct ConnectionCheckFuture<'a> {
    io: &'a mut BoxedSocket,
}

impl Future for ConnectionCheckFuture<'_> {
    type Output = ConnectionState;

    // this future is only used to get access to Context.
    // It should never return Poll::Pending.
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut buf = [0; 2];
        let mut read_buf = ReadBuf::new(&mut buf);

        let state = match Pin::new(&mut *this.io).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) if !read_buf.filled().is_empty() => ConnectionState::Tainted,
            Poll::Pending => ConnectionState::Live,
            _ => ConnectionState::Closed,
        };

        Poll::Ready(state)
    }
}

pin_project! {
    #[project = CloseConnectionProj]
    struct CloseConnection<Io> {
        io: Io,
        #[pin]
        timeout: Sleep,
    }
}

impl<Io> CloseConnection<Io>
where
    Io: AsyncWrite + Unpin,
{
    fn new(io: Io, timeout: Duration) -> Self {
        CloseConnection {
            io,
            timeout: sleep(timeout),
        }
    }
}

impl<Io> Future for CloseConnection<Io>
where
    Io: AsyncWrite + Unpin,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();

        match this.timeout.poll(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Pin::new(this.io).poll_shutdown(cx).map(|res| {
                // best effort, the socket is dropped either way
                if let Err(err) = res {
                    log::debug!("error shutting down pooled connection: {err}");
                }
            }),
        }
    }
}
