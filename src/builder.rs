use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use http::HeaderValue;

use crate::{
    client::{ConnectionPool, ConnectorConfig, HttpClient, ProxyConfig, TcpConnector},
    codec::{CodecRegistry, Codecs, DecoderWrapper, EncoderWrapper, StaticCodecRegistry},
    config::ClientConfig,
    error::ClientBuildError,
    metrics::{MetricsSink, NoopMetrics},
    reaper::IdleConnectionReaper,
    tls::{TlsContext, TrustConfigurator, TrustStrategy},
    RegistryClient,
};

enum EncoderChoice {
    Named(String),
    Wrapper(Arc<dyn EncoderWrapper>),
}

enum DecoderChoice {
    Named { name: String, accept: String },
    Wrapper(Arc<dyn DecoderWrapper>),
}

/// A registry client builder.
///
/// Setters only record values; everything is validated and assembled by
/// [`build`](Self::build).
///
/// ```no_run
/// # fn main() -> Result<(), registry_client::error::ClientBuildError> {
/// let client = registry_client::ClientBuilder::new()
///     .client_name("discovery")
///     .connection_timeout(2_000)
///     .read_timeout(5_000)
///     .max_connections_per_host(20)
///     .system_ssl_configuration()
///     .build()?;
///
/// assert!(!client.client().follow_redirects());
/// client.destroy_resources();
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    config: ClientConfig,
    encoder: Option<EncoderChoice>,
    decoder: Option<DecoderChoice>,
    registry: Arc<dyn CodecRegistry>,
    metrics: Arc<dyn MetricsSink>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        ClientBuilder {
            config: ClientConfig::default(),
            encoder: None,
            decoder: None,
            registry: Arc::new(StaticCodecRegistry::new()),
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Name of the client, used for the user agent and the cleaner thread name.
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.config.client_name = name.into();
        self
    }

    /// Agent name sent instead of the client name.
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.user_agent = Some(agent.into());
        self
    }

    /// Version appended to the user agent.
    ///
    /// Defaults to the version of this crate.
    pub fn build_version(mut self, version: impl Into<String>) -> Self {
        self.config.build_version = version.into();
        self
    }

    /// Connect timeout in milliseconds. Zero disables it.
    pub fn connection_timeout(mut self, millis: u64) -> Self {
        self.config.connect_timeout = Duration::from_millis(millis);
        self
    }

    /// Read timeout in milliseconds. Zero disables it.
    pub fn read_timeout(mut self, millis: u64) -> Self {
        self.config.read_timeout = Duration::from_millis(millis);
        self
    }

    /// Seconds a pooled connection may stay idle before the cleaner closes it.
    pub fn connection_idle_timeout(mut self, secs: u64) -> Self {
        self.config.idle_timeout = Duration::from_secs(secs);
        self
    }

    /// Live connection limit per route. Zero means no limit.
    pub fn max_connections_per_host(mut self, limit: usize) -> Self {
        self.config.max_connections_per_host = limit;
        self
    }

    /// Live connection limit over all routes. Zero means no limit.
    pub fn max_total_connections(mut self, limit: usize) -> Self {
        self.config.max_total_connections = limit;
        self
    }

    /// Routes every connection through an HTTP proxy.
    ///
    /// Unless both user name and password are given, placeholder credentials are sent.
    pub fn proxy(
        mut self,
        host: impl Into<String>,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Self {
        let mut proxy = ProxyConfig::new(host, port);

        if let (Some(user), Some(password)) = (username, password) {
            proxy = proxy.credentials(user, password);
        }

        self.config.proxy = Some(proxy);
        self
    }

    /// Trust the platform root certificates.
    ///
    /// Replaces a trust store file set before.
    pub fn system_ssl_configuration(mut self) -> Self {
        self.config.trust = TrustStrategy::System;
        self
    }

    /// Trust only the certificates of a trust store file.
    ///
    /// PKCS#12 stores are opened with `password`; PEM bundles are read as is.
    ///
    /// Host names of servers trusted this way are not verified. Replaces a system trust
    /// configuration set before.
    pub fn trust_store_file(mut self, path: impl Into<PathBuf>, password: impl Into<String>) -> Self {
        self.config.trust = TrustStrategy::CustomFile {
            path: path.into(),
            password: password.into(),
        };
        self
    }

    /// Request body encoder, resolved through the codec registry.
    pub fn encoder(mut self, name: impl Into<String>) -> Self {
        self.encoder = Some(EncoderChoice::Named(name.into()));
        self
    }

    pub fn encoder_wrapper(mut self, encoder: Arc<dyn EncoderWrapper>) -> Self {
        self.encoder = Some(EncoderChoice::Wrapper(encoder));
        self
    }

    /// Response body decoder, resolved through the codec registry.
    pub fn decoder(mut self, name: impl Into<String>, accept: impl Into<String>) -> Self {
        self.decoder = Some(DecoderChoice::Named {
            name: name.into(),
            accept: accept.into(),
        });
        self
    }

    /// Response body decoder used as is.
    ///
    /// A wrapper has no accept mode, so [`ClientConfig::decoder`] stays `None`; the decoder is
    /// reachable through the client's codecs.
    pub fn decoder_wrapper(mut self, decoder: Arc<dyn DecoderWrapper>) -> Self {
        self.decoder = Some(DecoderChoice::Wrapper(decoder));
        self
    }

    /// Registry named codecs are resolved from.
    pub fn codec_registry(mut self, registry: Arc<dyn CodecRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Sink for connection cleaner metrics.
    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    /// Period between two connection cleaner runs.
    ///
    /// Defaults to 30 seconds.
    pub fn cleaner_interval(mut self, interval: Duration) -> Self {
        self.config.cleaner_interval = interval;
        self
    }

    /// Assembles the client and starts its connection cleaner.
    ///
    /// On error nothing is left running: a pool already built is closed when dropped.
    pub fn build(self) -> Result<RegistryClient, ClientBuildError> {
        let ClientBuilder {
            mut config,
            encoder,
            decoder,
            registry,
            metrics,
        } = self;

        // trust
        let tls = TrustConfigurator::resolve(&config.trust)?;
        let connector_tls = match &tls {
            Some(ctx) => ctx.clone(),
            None => TlsContext::system()?,
        };

        let connector_config = ConnectorConfig::default()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .max_per_route(config.max_connections_per_host)
            .max_total(config.max_total_connections);

        // proxy
        let proxy = config
            .proxy
            .as_ref()
            .map(ProxyConfig::endpoint)
            .transpose()?;

        if let Some(proxy) = &proxy {
            log::debug!("{} connects through proxy {}", config.client_name, proxy.uri());
        }

        let connector = TcpConnector::new(&connector_tls)
            .timeout(connector_config.connect_timeout_opt())
            .proxy(proxy.clone());

        let pool = Arc::new(ConnectionPool::new(connector, connector_config, tls));

        // codecs
        let encoder = match encoder {
            None => None,
            Some(EncoderChoice::Wrapper(encoder)) => Some(encoder),
            Some(EncoderChoice::Named(name)) => match registry.encoder(&name) {
                Some(encoder) => Some(encoder),
                None => return Err(ClientBuildError::UnknownEncoder(name)),
            },
        };

        let decoder = match decoder {
            None => None,
            Some(DecoderChoice::Wrapper(decoder)) => Some(decoder),
            Some(DecoderChoice::Named { name, accept }) => {
                match registry.decoder(&name, &accept) {
                    Some(decoder) => {
                        config.decoder = Some((name, accept));
                        Some(decoder)
                    }
                    None => return Err(ClientBuildError::UnknownDecoder { name, accept }),
                }
            }
        };

        config.encoder = encoder.as_ref().map(|enc| enc.codec_name().to_owned());

        // user agent
        let user_agent = HeaderValue::try_from(config.full_user_agent())?;

        let client = HttpClient::new(pool, user_agent, Codecs::new(encoder, decoder), proxy);

        let reaper = IdleConnectionReaper::start(
            &config.client_name,
            Arc::downgrade(client.pool()),
            config.idle_timeout,
            config.cleaner_interval,
            metrics,
        )
        .map_err(ClientBuildError::Worker)?;

        log::debug!(
            "built registry client {} ({})",
            config.client_name,
            config.full_user_agent()
        );

        Ok(RegistryClient::new(config, client, reaper))
    }
}
