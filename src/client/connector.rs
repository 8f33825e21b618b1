use std::{fmt, time::Duration};

use actix_rt::net::TcpStream;
use actix_service::Service;
use futures_core::future::BoxFuture;
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use super::{
    connection::BoxedSocket,
    error::ConnectError,
    pool::Route,
    proxy::{self, ProxyEndpoint},
};
use crate::tls::TlsContext;

/// Opens transport streams for pool routes.
///
/// Plain routes yield a TCP stream, secure routes a TLS stream negotiated with the context the
/// connector was built with. With a proxy configured every route is dialled through it.
#[derive(Clone)]
pub struct TcpConnector {
    tls: TlsConnector,
    proxy: Option<ProxyEndpoint>,
    timeout: Option<Duration>,
}

impl fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnector")
            .field("proxy", &self.proxy.as_ref().map(ProxyEndpoint::uri))
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl TcpConnector {
    pub fn new(tls: &TlsContext) -> Self {
        Self {
            tls: TlsConnector::from(tls.config()),
            proxy: None,
            timeout: None,
        }
    }

    /// Bounds TCP connect, proxy tunnelling and TLS handshake together.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Dials every route through `proxy`.
    pub fn proxy(mut self, proxy: Option<ProxyEndpoint>) -> Self {
        self.proxy = proxy;
        self
    }

    async fn establish(self, route: Route) -> Result<BoxedSocket, ConnectError> {
        let tcp = match &self.proxy {
            Some(proxy) => TcpStream::connect((proxy.host(), proxy.port())).await?,
            None => TcpStream::connect((route.host(), route.port())).await?,
        };

        if let Err(err) = tcp.set_nodelay(true) {
            log::trace!("cannot set TCP_NODELAY for {route}: {err}");
        }

        if !route.scheme().is_secure() {
            return Ok(Box::new(tcp));
        }

        let tcp = match &self.proxy {
            Some(proxy) => proxy::tunnel(tcp, &route, proxy).await?,
            None => tcp,
        };

        let server_name = ServerName::try_from(route.host().to_owned())
            .map_err(|_| ConnectError::InvalidDnsName(route.host().to_owned()))?;

        let stream = self
            .tls
            .connect(server_name, tcp)
            .await
            .map_err(ConnectError::Tls)?;

        log::trace!("TLS session established with {route}");

        Ok(Box::new(stream))
    }
}

impl Service<Route> for TcpConnector {
    type Response = BoxedSocket;
    type Error = ConnectError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    actix_service::always_ready!();

    fn call(&self, route: Route) -> Self::Future {
        let timeout = self.timeout;
        let connect = self.clone().establish(route);

        Box::pin(async move {
            match timeout {
                Some(timeout) => actix_rt::time::timeout(timeout, connect)
                    .await
                    .map_err(|_| ConnectError::Timeout)?,
                None => connect.await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt as _, AsyncWriteExt as _},
        net::TcpListener,
    };

    use super::*;
    use crate::client::{pool::Scheme, proxy::ProxyConfig};

    fn connector() -> TcpConnector {
        TcpConnector::new(&TlsContext::system().unwrap())
    }

    #[actix_rt::test]
    async fn plain_route() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = actix_rt::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut io = connector()
            .call(Route::new(Scheme::Http, "127.0.0.1", port))
            .await
            .unwrap();
        io.write_all(b"ping").await.unwrap();

        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[actix_rt::test]
    async fn connection_refused() {
        // bind then drop to find a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let res = connector()
            .call(Route::new(Scheme::Http, "127.0.0.1", port))
            .await;
        assert!(matches!(res, Err(ConnectError::Io(_))));
    }

    #[actix_rt::test]
    async fn plain_route_through_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let proxy = ProxyConfig::new("127.0.0.1", port).endpoint().unwrap();

        let server = actix_rt::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        // origin is never dialled directly
        let mut io = connector()
            .proxy(Some(proxy))
            .call(Route::new(Scheme::Http, "registry.invalid", 8080))
            .await
            .unwrap();
        io.write_all(b"GET ").await.unwrap();

        assert_eq!(&server.await.unwrap(), b"GET ");
    }

    #[actix_rt::test]
    async fn timeout_covers_tunnel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let proxy = ProxyConfig::new("127.0.0.1", port).endpoint().unwrap();

        // proxy accepts but never answers the CONNECT request
        actix_rt::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            actix_rt::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let res = connector()
            .proxy(Some(proxy))
            .timeout(Some(Duration::from_millis(200)))
            .call(Route::new(Scheme::Https, "registry.local", 443))
            .await;
        assert!(matches!(res, Err(ConnectError::Timeout)));
    }
}
