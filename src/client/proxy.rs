//! Proxy support.
//!
//! A configured proxy is attached to the connector rather than the pool: plain routes are
//! dialled through the proxy directly, secure routes open an HTTP `CONNECT` tunnel first.

use std::fmt;

use base64::Engine as _;
use derive_more::{Display, From};
use http::{header::InvalidHeaderValue, uri::InvalidUri, HeaderValue, Uri};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use super::{error::ConnectError, pool::Route};

/// Credentials sent when none are configured.
///
/// Some proxy stacks ignore a proxy entirely unless credentials are set, so a placeholder
/// pair is always sent.
pub const PLACEHOLDER_CREDENTIALS: (&str, &str) = ("guest", "guest");

const MAX_RESPONSE_HEAD: usize = 8 * 1024;
const MAX_HEADERS: usize = 32;

/// Proxy settings as given to the client builder.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ProxyConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Credentials that will be presented to the proxy.
    ///
    /// Falls back to [`PLACEHOLDER_CREDENTIALS`] unless both user name and password are set.
    pub fn effective_credentials(&self) -> (&str, &str) {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) => (user, password),
            _ => PLACEHOLDER_CREDENTIALS,
        }
    }

    /// Resolves the settings into the endpoint the connector dials.
    pub fn endpoint(&self) -> Result<ProxyEndpoint, InvalidProxy> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(InvalidProxy::MissingHost);
        }

        let authority = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{}", self.port)
        } else {
            format!("{host}:{}", self.port)
        };

        let uri = Uri::try_from(format!("http://{authority}"))?;

        let (user, password) = self.effective_credentials();
        let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
        let mut authorization = HeaderValue::try_from(format!("Basic {token}"))?;
        authorization.set_sensitive(true);

        Ok(ProxyEndpoint {
            host: host.trim_start_matches('[').trim_end_matches(']').to_owned(),
            port: self.port,
            uri,
            authorization,
        })
    }
}

/// A proxy ready to be dialled.
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
    host: String,
    port: u16,
    uri: Uri,
    authorization: HeaderValue,
}

impl ProxyEndpoint {
    /// `http://host:port` of the proxy.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `Proxy-Authorization` header value.
    pub fn authorization(&self) -> &HeaderValue {
        &self.authorization
    }
}

#[derive(Debug, Display, From)]
#[non_exhaustive]
pub enum InvalidProxy {
    #[display("Missing proxy host")]
    MissingHost,

    #[display("Invalid proxy address: {}", _0)]
    Uri(InvalidUri),

    #[display("Invalid proxy credentials: {}", _0)]
    Credentials(InvalidHeaderValue),
}

impl std::error::Error for InvalidProxy {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InvalidProxy::MissingHost => None,
            InvalidProxy::Uri(err) => Some(err),
            InvalidProxy::Credentials(err) => Some(err),
        }
    }
}

/// Asks the proxy on the other end of `io` to open a tunnel to `route`.
///
/// Returns the stream once the proxy answered with a 2xx status; nothing past the response
/// head is consumed.
pub(crate) async fn tunnel<Io>(
    mut io: Io,
    route: &Route,
    proxy: &ProxyEndpoint,
) -> Result<Io, ConnectError>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    let authority = route.authority();
    let auth = proxy
        .authorization()
        .to_str()
        .map_err(|_| ConnectError::Proxy("credentials are not visible ASCII".to_owned()))?;

    let request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Authorization: {auth}\r\n\r\n"
    );

    io.write_all(request.as_bytes()).await?;
    io.flush().await?;

    let head = read_response_head(&mut io).await?;
    let status = parse_status(&head)
        .ok_or_else(|| ConnectError::Proxy("malformed response to CONNECT".to_owned()))?;

    if (200..300).contains(&status) {
        log::trace!("proxy {} opened tunnel to {authority}", proxy.uri());
        Ok(io)
    } else {
        Err(ConnectError::Proxy(format!("CONNECT {authority} answered with {status}")))
    }
}

/// Reads byte-wise up to the blank line ending the response head.
async fn read_response_head<Io>(io: &mut Io) -> Result<Vec<u8>, ConnectError>
where
    Io: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(ConnectError::Proxy("response head too large".to_owned()));
        }

        if io.read(&mut byte).await? == 0 {
            return Err(ConnectError::Proxy("connection closed during CONNECT".to_owned()));
        }

        head.push(byte[0]);
    }

    Ok(head)
}

fn parse_status(head: &[u8]) -> Option<u16> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);

    match res.parse(head) {
        Ok(httparse::Status::Complete(_)) => res.code,
        Ok(httparse::Status::Partial) | Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    use super::*;
    use crate::client::pool::Scheme;

    #[test]
    fn placeholder_credentials() {
        let proxy = ProxyConfig::new("proxy.local", 3128);
        assert_eq!(proxy.effective_credentials(), ("guest", "guest"));

        let endpoint = proxy.endpoint().unwrap();
        assert_eq!(endpoint.authorization(), "Basic Z3Vlc3Q6Z3Vlc3Q=");
        assert!(endpoint.authorization().is_sensitive());
    }

    #[test]
    fn configured_credentials() {
        let proxy = ProxyConfig::new("proxy.local", 3128).credentials("agent", "pa55");
        assert_eq!(proxy.effective_credentials(), ("agent", "pa55"));
        assert_eq!(
            proxy.endpoint().unwrap().authorization(),
            "Basic YWdlbnQ6cGE1NQ=="
        );
        assert!(!format!("{proxy:?}").contains("pa55"));
    }

    #[test]
    fn proxy_uri() {
        let endpoint = ProxyConfig::new("proxy.local", 3128).endpoint().unwrap();
        assert_eq!(endpoint.uri().to_string(), "http://proxy.local:3128/");

        let endpoint = ProxyConfig::new("::1", 8080).endpoint().unwrap();
        assert_eq!(endpoint.uri().host(), Some("[::1]"));
        assert_eq!(endpoint.host(), "::1");

        assert!(matches!(
            ProxyConfig::new(" ", 8080).endpoint(),
            Err(InvalidProxy::MissingHost)
        ));
        assert!(matches!(
            ProxyConfig::new("bad host", 8080).endpoint(),
            Err(InvalidProxy::Uri(_))
        ));
    }

    #[test]
    fn status_line() {
        assert_eq!(parse_status(b"HTTP/1.1 200 Connection established\r\n\r\n"), Some(200));
        let head = b"HTTP/1.0 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic\r\n\r\n";
        assert_eq!(parse_status(head), Some(407));
        assert_eq!(parse_status(b"SSH-2.0-OpenSSH\r\n\r\n"), None);
    }

    #[test]
    fn malformed_response_head() {
        // incomplete head
        assert_eq!(parse_status(b"HTTP/1.1 200 OK\r\n"), None);
        // header line without a colon
        assert_eq!(parse_status(b"HTTP/1.1 200 OK\r\nnot a header\r\n\r\n"), None);
        // status code out of range
        assert_eq!(parse_status(b"HTTP/1.1 2000 OK\r\n\r\n"), None);
        assert_eq!(parse_status(b"HTTP/2 200 OK\r\n\r\n"), None);
    }

    #[actix_rt::test]
    async fn tunnel_established() {
        let (client, mut server) = tokio::io::duplex(1024);
        let route = Route::new(Scheme::Https, "registry.local", 443);
        let proxy = ProxyConfig::new("proxy.local", 3128).endpoint().unwrap();

        let proxy_side = actix_rt::spawn(async move {
            let head = read_response_head(&mut server).await.unwrap();
            server
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();

            let mut tunnelled = [0; 5];
            server.read_exact(&mut tunnelled).await.unwrap();
            (String::from_utf8(head).unwrap(), tunnelled)
        });

        let mut io = tunnel(client, &route, &proxy).await.unwrap();

        // stream stays usable past the tunnel handshake
        io.write_all(b"hello").await.unwrap();

        let (head, tunnelled) = proxy_side.await.unwrap();
        assert!(head.starts_with("CONNECT registry.local:443 HTTP/1.1\r\n"));
        assert!(head.contains("Host: registry.local:443\r\n"));
        assert!(head.contains("Proxy-Authorization: Basic Z3Vlc3Q6Z3Vlc3Q=\r\n"));
        assert_eq!(&tunnelled, b"hello");
    }

    #[actix_rt::test]
    async fn tunnel_refused() {
        let (client, mut server) = tokio::io::duplex(1024);
        let route = Route::new(Scheme::Https, "registry.local", 443);
        let proxy = ProxyConfig::new("proxy.local", 3128).endpoint().unwrap();

        actix_rt::spawn(async move {
            let _ = read_response_head(&mut server).await;
            let _ = server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await;
        });

        let err = tunnel(client, &route, &proxy).await.unwrap_err();
        assert!(matches!(err, ConnectError::Proxy(msg) if msg.contains("407")));
    }
}
