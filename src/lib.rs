//! Pooled, TLS-aware HTTP transport for service registry agents.
//!
//! A [`RegistryClient`] is a long-lived client for talking to a cluster of registry servers. It
//! bundles:
//!
//! - a connection pool bounded per route and in total,
//! - TLS trust from the platform store or from a PEM or PKCS#12 trust store file,
//! - optional proxying, with `CONNECT` tunnels for secure routes,
//! - a background thread that closes pooled connections left idle for too long.
//!
//! # Building a client
//! ```no_run
//! # #[actix_rt::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use registry_client::ClientBuilder;
//!
//! let client = ClientBuilder::new()
//!     .client_name("discovery")
//!     .trust_store_file("/etc/registry/truststore.pem", "changeit")
//!     .proxy("proxy.internal", 3128, Some("agent"), Some("secret"))
//!     .connection_idle_timeout(30)
//!     .build()?;
//!
//! let uri = "https://registry.internal/eureka/v2/apps".parse()?;
//! let conn = client.client().connect(&uri).await?;
//!
//! // write the request, read the response, then give the connection back
//! conn.release();
//!
//! client.destroy_resources();
//! # Ok(())
//! # }
//! ```
//!
//! HTTP framing and body encoding happen in the request layer on top of this crate; the client
//! only carries the codecs, default headers and redirect policy that layer has to apply.

#![deny(rust_2018_idioms, nonstandard_style)]
#![warn(future_incompatible)]

mod builder;
pub mod client;
pub mod codec;
mod config;
pub mod error;
pub mod metrics;
pub mod reaper;
mod registry_client;
pub mod tls;

pub use self::builder::ClientBuilder;
pub use self::client::{Connection, HttpClient};
pub use self::config::ClientConfig;
pub use self::registry_client::RegistryClient;
