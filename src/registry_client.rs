use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    builder::ClientBuilder,
    client::HttpClient,
    config::ClientConfig,
    reaper::{IdleConnectionReaper, ReaperState, ReaperStats},
};

/// A built registry client: the pooled transport plus its connection cleaner.
///
/// Resources are released by [`destroy_resources`](Self::destroy_resources) or on drop.
pub struct RegistryClient {
    config: ClientConfig,
    client: HttpClient,
    reaper: IdleConnectionReaper,
    destroyed: AtomicBool,
}

impl fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryClient")
            .field("config", &self.config)
            .field("client", &self.client)
            .field("reaper", &self.reaper.state())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl RegistryClient {
    pub(crate) fn new(config: ClientConfig, client: HttpClient, reaper: IdleConnectionReaper) -> Self {
        Self {
            config,
            client,
            reaper,
            destroyed: AtomicBool::new(false),
        }
    }

    /// Create new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Underlying transport.
    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn reaper_state(&self) -> ReaperState {
        self.reaper.state()
    }

    pub fn reaper_stats(&self) -> ReaperStats {
        self.reaper.stats()
    }

    /// Stops the connection cleaner, then closes the connection pool.
    ///
    /// Safe to call more than once; only the first call does anything.
    pub fn destroy_resources(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        log::debug!("destroying registry client {}", self.config.client_name());

        self.reaper.stop();
        self.client.close();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

impl Drop for RegistryClient {
    fn drop(&mut self) {
        self.destroy_resources();
    }
}
