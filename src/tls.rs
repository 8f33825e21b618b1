//! TLS trust resolution.
//!
//! A [`TrustStrategy`] picks where the roots used to validate registry server certificates come
//! from: the platform trust store, or a caller-supplied trust store file (a PEM bundle, or a
//! password-protected PKCS#12 store). Resolving it yields a [`TlsContext`], a shared Rustls
//! client configuration plus the identity of the trust it was built from.
//!
//! Custom trust stores relax host name verification: the presented chain must still validate
//! against the custom roots, but a certificate issued for a different host name is accepted.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use rustls::{
    client::{
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        WebPkiServerVerifier,
    },
    crypto::{ring, CryptoProvider},
    pki_types::{CertificateDer, ServerName, UnixTime},
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};

use crate::error::ConfigurationError;

const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Policy for the trust anchor used to validate server certificates.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum TrustStrategy {
    /// Secure routes use the platform default.
    #[default]
    None,

    /// Platform trust store, explicitly requested.
    System,

    /// Trust store file, PEM or PKCS#12.
    CustomFile { path: PathBuf, password: String },
}

impl fmt::Debug for TrustStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustStrategy::None => f.write_str("None"),
            TrustStrategy::System => f.write_str("System"),
            TrustStrategy::CustomFile { path, .. } => f
                .debug_struct("CustomFile")
                .field("path", path)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Where the roots of a [`TlsContext`] came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustKind {
    System,
    Custom { path: PathBuf },
}

/// Resolved TLS client context.
#[derive(Clone)]
pub struct TlsContext {
    trust: TrustKind,
    hostname_verification: bool,
    config: Arc<ClientConfig>,
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("trust", &self.trust)
            .field("hostname_verification", &self.hostname_verification)
            .finish_non_exhaustive()
    }
}

impl TlsContext {
    /// Builds a context trusting the platform roots.
    ///
    /// Falls back to the bundled Mozilla roots when the platform store yields nothing usable.
    pub fn system() -> Result<Self, ConfigurationError> {
        let provider = provider();
        let roots = system_roots();

        let mut config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();

        config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];

        Ok(Self {
            trust: TrustKind::System,
            hostname_verification: true,
            config: Arc::new(config),
        })
    }

    /// Builds a context trusting only the certificates of a trust store file.
    ///
    /// See [`load_trust_store`] for the accepted formats and how `password` is used.
    pub fn custom(path: &Path, password: &str) -> Result<Self, ConfigurationError> {
        let roots = Arc::new(load_trust_store(path, password)?);
        let provider = provider();

        let verifier = RelaxedHostnameVerifier::new(roots, Arc::clone(&provider))?;

        let mut config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();

        config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];

        log::warn!(
            "host name verification is disabled for servers trusted through {}",
            path.display()
        );

        Ok(Self {
            trust: TrustKind::Custom {
                path: path.to_owned(),
            },
            hostname_verification: false,
            config: Arc::new(config),
        })
    }

    pub fn trust(&self) -> &TrustKind {
        &self.trust
    }

    /// Returns false when certificates for other host names are accepted.
    pub fn hostname_verification(&self) -> bool {
        self.hostname_verification
    }

    pub fn config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }
}

/// Resolves trust strategies into TLS contexts.
pub struct TrustConfigurator;

impl TrustConfigurator {
    /// Resolves `strategy`.
    ///
    /// Returns `None` for [`TrustStrategy::None`]; secure routes then fall back to the system
    /// context built by the connector.
    pub fn resolve(strategy: &TrustStrategy) -> Result<Option<TlsContext>, ConfigurationError> {
        match strategy {
            TrustStrategy::None => Ok(None),
            TrustStrategy::System => TlsContext::system().map(Some),
            TrustStrategy::CustomFile { path, password } => {
                TlsContext::custom(path, password).map(Some)
            }
        }
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn system_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        log::debug!("error loading platform root certificate: {err}");
    }

    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    if ignored > 0 {
        log::debug!("ignored {ignored} unparsable platform root certificate(s)");
    }

    if added == 0 {
        log::warn!("no usable platform root certificates found, using bundled roots");
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    roots
}

/// Loads every certificate of a trust store file into a root store.
///
/// DER files are read as PKCS#12 stores: `password` must pass the store's integrity check and
/// decrypts the certificate bags. Anything else is read as a PEM bundle, which carries no
/// password.
///
/// The file is read in one go and closed before parsing starts.
pub fn load_trust_store(
    path: &Path,
    password: &str,
) -> Result<RootCertStore, ConfigurationError> {
    let data = fs::read(path).map_err(|source| ConfigurationError::TrustStoreIo {
        path: path.to_owned(),
        source,
    })?;

    let certs = if is_der(&data) {
        pkcs12_certificates(path, &data, password)?
    } else {
        pem_certificates(path, &data)?
    };

    if certs.is_empty() {
        return Err(ConfigurationError::EmptyTrustStore(path.to_owned()));
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);

    if added == 0 {
        return Err(ConfigurationError::EmptyTrustStore(path.to_owned()));
    }

    if ignored > 0 {
        log::warn!(
            "ignored {ignored} unparsable certificate(s) in trust store {}",
            path.display()
        );
    }

    Ok(roots)
}

/// DER encoding starts with a SEQUENCE tag.
fn is_der(data: &[u8]) -> bool {
    data.first() == Some(&0x30)
}

fn pem_certificates(
    path: &Path,
    mut data: &[u8],
) -> Result<Vec<CertificateDer<'static>>, ConfigurationError> {
    rustls_pemfile::certs(&mut data)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ConfigurationError::TrustStoreFormat {
            path: path.to_owned(),
            source,
        })
}

fn pkcs12_certificates(
    path: &Path,
    data: &[u8],
    password: &str,
) -> Result<Vec<CertificateDer<'static>>, ConfigurationError> {
    let pfx = p12::PFX::parse(data).map_err(|err| malformed(path, err))?;

    if !pfx.verify_mac(password) {
        return Err(ConfigurationError::TrustStorePassword(path.to_owned()));
    }

    let certs = pfx
        .cert_x509_bags(password)
        .map_err(|err| malformed(path, err))?;

    Ok(certs.into_iter().map(CertificateDer::from).collect())
}

fn malformed(path: &Path, err: impl fmt::Display) -> ConfigurationError {
    ConfigurationError::TrustStoreFormat {
        path: path.to_owned(),
        source: io::Error::new(io::ErrorKind::InvalidData, err.to_string()),
    }
}

/// Validates chains against a fixed root store but accepts host name mismatches.
#[derive(Debug)]
pub struct RelaxedHostnameVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl RelaxedHostnameVerifier {
    pub fn new(
        roots: Arc<RootCertStore>,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, ConfigurationError> {
        let inner = WebPkiServerVerifier::builder_with_provider(roots, provider).build()?;
        Ok(Self { inner })
    }
}

impl ServerCertVerifier for RelaxedHostnameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        // the name check runs last, after the chain validated against the roots
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(err) if is_name_mismatch(&err) => {
                log::debug!("accepting certificate not issued for {server_name:?}");
                Ok(ServerCertVerified::assertion())
            }
            res => res,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn is_name_mismatch(err: &rustls::Error) -> bool {
    matches!(
        err,
        rustls::Error::InvalidCertificate(
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
        )
    )
}
