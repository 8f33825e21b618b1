use std::io;

use derive_more::{Display, From};

/// A set of errors that can occur while connecting to a registry server.
#[derive(Debug, Display, From)]
#[non_exhaustive]
pub enum ConnectError {
    /// Invalid URL
    #[display("Invalid URL: {}", _0)]
    Url(InvalidUrl),

    /// Host name can not be used as a TLS server name
    #[display("Invalid DNS name: {}", _0)]
    #[from(ignore)]
    InvalidDnsName(String),

    /// Connecting took too long
    #[display("Timeout while establishing connection")]
    Timeout,

    /// Proxy refused to open a tunnel
    #[display("Proxy refused tunnel: {}", _0)]
    #[from(ignore)]
    Proxy(String),

    /// TLS handshake failed
    #[display("TLS handshake failed: {}", _0)]
    #[from(ignore)]
    Tls(io::Error),

    /// Connection pool has been closed
    #[display("Connection pool is closed")]
    PoolClosed,

    /// Connection io error
    #[display("{}", _0)]
    Io(io::Error),
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectError::Url(err) => Some(err),
            ConnectError::Tls(err) | ConnectError::Io(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug, Display, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidUrl {
    #[display("Missing URL scheme")]
    MissingScheme,

    #[display("Unknown URL scheme")]
    UnknownScheme,

    #[display("Missing host name")]
    MissingHost,
}

impl std::error::Error for InvalidUrl {}
