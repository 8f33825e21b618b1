use std::time::Duration;

use crate::{client::ProxyConfig, reaper::DEFAULT_PERIOD, tls::TrustStrategy};

pub(crate) const DEFAULT_CLIENT_NAME: &str = "registry-client";

/// Settings a registry client was built with.
///
/// Assembled by [`ClientBuilder`](crate::ClientBuilder) and immutable afterwards.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) client_name: String,
    pub(crate) user_agent: Option<String>,
    pub(crate) build_version: String,
    pub(crate) connect_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) max_connections_per_host: usize,
    pub(crate) max_total_connections: usize,
    pub(crate) trust: TrustStrategy,
    pub(crate) proxy: Option<ProxyConfig>,
    pub(crate) encoder: Option<String>,
    pub(crate) decoder: Option<(String, String)>,
    pub(crate) cleaner_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            user_agent: None,
            build_version: env!("CARGO_PKG_VERSION").to_owned(),
            connect_timeout: Duration::from_millis(5_000),
            read_timeout: Duration::from_millis(8_000),
            idle_timeout: Duration::from_secs(30),
            max_connections_per_host: 50,
            max_total_connections: 200,
            trust: TrustStrategy::None,
            proxy: None,
            encoder: None,
            decoder: None,
            cleaner_interval: DEFAULT_PERIOD,
        }
    }
}

impl ClientConfig {
    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    /// Agent name as configured, before the version is appended.
    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    pub fn build_version(&self) -> &str {
        &self.build_version
    }

    /// `<user agent or client name>/v<build version>`.
    pub fn full_user_agent(&self) -> String {
        let agent = self.user_agent.as_deref().unwrap_or(&self.client_name);
        format!("{agent}/v{}", self.build_version)
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Pooled connections idle for longer are closed by the connection cleaner.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn max_connections_per_host(&self) -> usize {
        self.max_connections_per_host
    }

    pub fn max_total_connections(&self) -> usize {
        self.max_total_connections
    }

    pub fn trust(&self) -> &TrustStrategy {
        &self.trust
    }

    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    /// Name of the request body encoder, if one was set.
    pub fn encoder(&self) -> Option<&str> {
        self.encoder.as_deref()
    }

    /// Name and accept mode of the response body decoder, if one was set.
    pub fn decoder(&self) -> Option<(&str, &str)> {
        self.decoder
            .as_ref()
            .map(|(name, accept)| (name.as_str(), accept.as_str()))
    }

    /// Always false.
    pub fn follow_redirects(&self) -> bool {
        false
    }

    pub fn cleaner_interval(&self) -> Duration {
        self.cleaner_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_composition() {
        let mut config = ClientConfig {
            client_name: "svc".to_owned(),
            build_version: "1.2.3".to_owned(),
            ..ClientConfig::default()
        };
        assert_eq!(config.full_user_agent(), "svc/v1.2.3");

        config.user_agent = Some("custom".to_owned());
        assert_eq!(config.full_user_agent(), "custom/v1.2.3");
    }
}
