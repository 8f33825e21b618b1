use std::time::Duration;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(8);
const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Connector configuration.
///
/// Fixed when the pool is constructed; there is no way to resize a live pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorConfig {
    pub(crate) connect_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) disconnect_timeout: Option<Duration>,
    pub(crate) max_per_route: usize,
    pub(crate) max_total: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            disconnect_timeout: Some(DEFAULT_DISCONNECT_TIMEOUT),
            max_per_route: 50,
            max_total: 200,
        }
    }
}

impl ConnectorConfig {
    /// Sets the connection timeout.
    ///
    /// This is the max time allowed to connect to the remote host, including DNS name
    /// resolution, proxy tunnelling and the TLS handshake. A zero duration disables it.
    ///
    /// By default, the timeout is 5 seconds.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the read timeout applied to every read on a leased connection.
    ///
    /// A zero duration disables it. By default, the timeout is 8 seconds.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set server connection disconnect timeout.
    ///
    /// Closed connections are shut down gracefully within this time when a runtime is
    /// available, otherwise the socket is dropped.
    pub fn disconnect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Set the maximum number of live connections per route.
    ///
    /// If limit is 0, routes are unbounded.
    pub fn max_per_route(mut self, limit: usize) -> Self {
        self.max_per_route = limit_or_unbounded(limit);
        self
    }

    /// Set the maximum number of live connections across all routes.
    ///
    /// If limit is 0, the pool is unbounded.
    pub fn max_total(mut self, limit: usize) -> Self {
        self.max_total = limit_or_unbounded(limit);
        self
    }

    pub(crate) fn connect_timeout_opt(&self) -> Option<Duration> {
        non_zero(self.connect_timeout)
    }

    pub(crate) fn read_timeout_opt(&self) -> Option<Duration> {
        non_zero(self.read_timeout)
    }
}

fn limit_or_unbounded(limit: usize) -> usize {
    if limit == 0 {
        u32::MAX as usize
    } else {
        limit
    }
}

fn non_zero(dur: Duration) -> Option<Duration> {
    if dur.is_zero() {
        None
    } else {
        Some(dur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limit_is_unbounded() {
        let config = ConnectorConfig::default().max_per_route(0).max_total(3);
        assert_eq!(config.max_per_route, u32::MAX as usize);
        assert_eq!(config.max_total, 3);
    }

    #[test]
    fn zero_timeout_disables() {
        let config = ConnectorConfig::default().read_timeout(Duration::ZERO);
        assert!(config.read_timeout_opt().is_none());
        assert_eq!(config.connect_timeout_opt(), Some(Duration::from_secs(5)));
    }
}
