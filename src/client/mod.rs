//! Pooled HTTP transport.

use std::{fmt, sync::Arc, time::Duration};

use http::{
    header::{HeaderMap, PROXY_AUTHORIZATION, USER_AGENT},
    HeaderValue, Uri,
};

use crate::{codec::Codecs, tls::TlsContext};

mod config;
mod connection;
mod connector;
mod error;
pub(crate) mod pool;
pub mod proxy;

pub use self::{
    config::ConnectorConfig,
    connection::{BoxedSocket, Connection, ConnectionIo},
    connector::TcpConnector,
    error::{ConnectError, InvalidUrl},
    pool::{ConnectionPool, PoolStats, Route, RouteStats, Scheme},
    proxy::{ProxyConfig, ProxyEndpoint},
};

/// Transport shared by every request of one registry client.
///
/// Cheap to clone; clones share the connection pool, timeouts and default headers. Redirects are
/// never followed by the transport.
#[derive(Clone)]
pub struct HttpClient(Arc<ClientInner>);

struct ClientInner {
    pool: Arc<ConnectionPool<TcpConnector>>,
    default_headers: HeaderMap,
    codecs: Codecs,
    proxy: Option<ProxyEndpoint>,
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("user_agent", &self.user_agent())
            .field("connect_timeout", &self.connect_timeout())
            .field("read_timeout", &self.read_timeout())
            .field("proxy", &self.0.proxy.as_ref().map(ProxyEndpoint::uri))
            .field("tls", &self.tls_context())
            .field("codecs", &self.0.codecs)
            .finish()
    }
}

impl HttpClient {
    pub(crate) fn new(
        pool: Arc<ConnectionPool<TcpConnector>>,
        user_agent: HeaderValue,
        codecs: Codecs,
        proxy: Option<ProxyEndpoint>,
    ) -> Self {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, user_agent);

        if let Some(proxy) = &proxy {
            default_headers.insert(PROXY_AUTHORIZATION, proxy.authorization().clone());
        }

        Self(Arc::new(ClientInner {
            pool,
            default_headers,
            codecs,
            proxy,
        }))
    }

    /// Leases a connection to the route of `uri`.
    ///
    /// Give it back with [`Connection::release`] once the response was read completely.
    pub async fn connect(&self, uri: &Uri) -> Result<Connection, ConnectError> {
        self.0.pool.acquire(uri).await
    }

    /// Headers every request must carry: `User-Agent` and, when proxied,
    /// `Proxy-Authorization`.
    pub fn default_headers(&self) -> &HeaderMap {
        &self.0.default_headers
    }

    pub fn user_agent(&self) -> Option<&HeaderValue> {
        self.0.default_headers.get(USER_AGENT)
    }

    /// Always false; redirects are handled by the caller.
    pub fn follow_redirects(&self) -> bool {
        false
    }

    pub fn connect_timeout(&self) -> Duration {
        self.0.pool.config().connect_timeout
    }

    pub fn read_timeout(&self) -> Duration {
        self.0.pool.config().read_timeout
    }

    pub fn codecs(&self) -> &Codecs {
        &self.0.codecs
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.0.pool.stats()
    }

    pub fn proxy(&self) -> Option<&ProxyEndpoint> {
        self.0.proxy.as_ref()
    }

    /// Trust context secure routes use, if one was configured.
    pub fn tls_context(&self) -> Option<&TlsContext> {
        self.0.pool.tls_context()
    }

    pub fn is_closed(&self) -> bool {
        self.0.pool.is_closed()
    }

    pub(crate) fn pool(&self) -> &Arc<ConnectionPool<TcpConnector>> {
        &self.0.pool
    }

    pub(crate) fn close(&self) {
        self.0.pool.close();
    }
}
