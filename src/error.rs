//! Client construction, configuration and maintenance errors.

use std::{io, path::PathBuf};

use derive_more::{Display, Error, From};
use http::header::InvalidHeaderValue;

pub use crate::client::{ConnectError, InvalidUrl};
pub use crate::client::proxy::InvalidProxy;

/// Trust configuration could not be turned into a TLS context.
#[derive(Debug, Display, From)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// Trust store file could not be opened or read
    #[display("Cannot read trust store {path:?}: {source}")]
    #[from(ignore)]
    TrustStoreIo { path: PathBuf, source: io::Error },

    /// Trust store file is neither a well-formed PEM bundle nor a PKCS#12 store
    #[display("Malformed trust store {path:?}: {source}")]
    #[from(ignore)]
    TrustStoreFormat { path: PathBuf, source: io::Error },

    /// Password does not open the PKCS#12 trust store
    #[display("Wrong password for trust store {:?}", _0)]
    #[from(ignore)]
    TrustStorePassword(PathBuf),

    /// Trust store file holds no usable certificate
    #[display("Trust store {:?} contains no usable certificates", _0)]
    #[from(ignore)]
    EmptyTrustStore(PathBuf),

    /// Certificate verifier could not be built from the trust store
    #[display("Cannot build certificate verifier: {}", _0)]
    Verifier(rustls::client::VerifierBuilderError),

    /// TLS configuration error
    #[display("TLS configuration error: {}", _0)]
    Tls(rustls::Error),
}

impl std::error::Error for ConfigurationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigurationError::TrustStoreIo { source, .. }
            | ConfigurationError::TrustStoreFormat { source, .. } => Some(source),
            ConfigurationError::TrustStorePassword(_) | ConfigurationError::EmptyTrustStore(_) => {
                None
            }
            ConfigurationError::Verifier(err) => Some(err),
            ConfigurationError::Tls(err) => Some(err),
        }
    }
}

/// Client assembly failed; nothing was returned and everything acquired was released.
#[derive(Debug, Display, From)]
#[non_exhaustive]
pub enum ClientBuildError {
    /// Trust configuration error
    #[display("SSL configuration issue: {}", _0)]
    Configuration(ConfigurationError),

    /// Encoder name is not known to the codec registry
    #[display("Unknown encoder: {}", _0)]
    #[from(ignore)]
    UnknownEncoder(String),

    /// Decoder name is not known to the codec registry
    #[display("Unknown decoder: {} (accept: {})", name, accept)]
    #[from(ignore)]
    UnknownDecoder { name: String, accept: String },

    /// User agent is not a valid header value
    #[display("Invalid user agent: {}", _0)]
    UserAgent(InvalidHeaderValue),

    /// Proxy settings can not be applied
    #[display("Invalid proxy configuration: {}", _0)]
    Proxy(InvalidProxy),

    /// Connection cleaner worker could not be started
    #[display("Cannot start connection cleaner: {}", _0)]
    Worker(io::Error),
}

impl std::error::Error for ClientBuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientBuildError::Configuration(err) => Some(err),
            ClientBuildError::UserAgent(err) => Some(err),
            ClientBuildError::Proxy(err) => Some(err),
            ClientBuildError::Worker(err) => Some(err),
            ClientBuildError::UnknownEncoder(_) | ClientBuildError::UnknownDecoder { .. } => None,
        }
    }
}

/// A single idle connection cleanup run failed.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CleanupError {
    /// Connection pool has been closed
    #[display("Connection pool is closed")]
    PoolClosed,

    /// Connection pool no longer exists
    #[display("Connection pool has been dropped")]
    PoolDropped,

    /// Cleanup run panicked
    #[display("Cleanup run panicked: {}", _0)]
    Panicked(#[error(not(source))] String),
}
