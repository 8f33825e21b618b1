use std::{
    io::Write as _,
    sync::Arc,
    time::{Duration, Instant},
};

use http::{header, Uri};
use registry_client::{
    client::ConnectError,
    codec::{DecoderWrapper, EncoderWrapper, StaticCodecRegistry},
    error::{ClientBuildError, ConfigurationError},
    metrics::{InMemoryMetrics, CLEANER_TIME},
    reaper::ReaperState,
    tls::TrustKind,
    ClientBuilder, RegistryClient,
};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::TcpListener,
};

const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok";

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Serves `RESPONSE` to every request head received, on every accepted connection.
async fn start_server() -> (u16, Arc<std::sync::atomic::AtomicUsize>) {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&accepted);
    actix_rt::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            counter.fetch_add(1, Ordering::SeqCst);

            actix_rt::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0; 256];

                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    head.extend_from_slice(&buf[..n]);

                    if head.windows(4).any(|w| w == b"\r\n\r\n") {
                        head.clear();
                        if stream.write_all(RESPONSE).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });

    (port, accepted)
}

async fn round_trip(client: &RegistryClient, uri: &Uri) -> bool {
    let mut conn = client.client().connect(uri).await.unwrap();
    let reused = conn.is_reused();

    conn.write_all(b"GET /eureka/apps HTTP/1.1\r\nhost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut buf = vec![0; RESPONSE.len()];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, RESPONSE);

    conn.release();
    reused
}

struct Json;

impl EncoderWrapper for Json {
    fn codec_name(&self) -> &str {
        "json"
    }

    fn content_type(&self) -> &str {
        "application/json"
    }
}

impl DecoderWrapper for Json {
    fn codec_name(&self) -> &str {
        "json"
    }
}

#[test]
fn user_agent() {
    let client = ClientBuilder::new()
        .client_name("svc")
        .build_version("1.2.3")
        .build()
        .unwrap();
    assert_eq!(client.client().user_agent().unwrap(), "svc/v1.2.3");
    assert_eq!(
        client.client().default_headers().get(header::USER_AGENT).unwrap(),
        "svc/v1.2.3"
    );

    let client = ClientBuilder::new()
        .client_name("svc")
        .user_agent("custom")
        .build_version("1.2.3")
        .build()
        .unwrap();
    assert_eq!(client.client().user_agent().unwrap(), "custom/v1.2.3");
}

#[test]
fn redirects_are_never_followed() {
    let client = ClientBuilder::new().build().unwrap();
    assert!(!client.client().follow_redirects());
    assert!(!client.config().follow_redirects());
}

#[test]
fn timeouts_and_limits() {
    let client = ClientBuilder::new()
        .connection_timeout(1_500)
        .read_timeout(2_500)
        .max_connections_per_host(2)
        .max_total_connections(5)
        .build()
        .unwrap();

    assert_eq!(client.client().connect_timeout(), Duration::from_millis(1_500));
    assert_eq!(client.client().read_timeout(), Duration::from_millis(2_500));
    assert_eq!(client.config().max_connections_per_host(), 2);
    assert_eq!(client.config().max_total_connections(), 5);
}

#[actix_rt::test]
async fn destroy_twice() {
    init_logger();

    let client = ClientBuilder::new().build().unwrap();
    assert_eq!(client.config().client_name(), "registry-client");

    client.destroy_resources();
    client.destroy_resources();

    assert!(client.is_destroyed());
    assert!(client.client().is_closed());
    assert_eq!(client.reaper_state(), ReaperState::Stopped);

    let res = client
        .client()
        .connect(&Uri::from_static("http://127.0.0.1:1/"))
        .await;
    assert!(matches!(res, Err(ConnectError::PoolClosed)));
}

#[test]
fn missing_trust_store() {
    let res = ClientBuilder::new()
        .trust_store_file("/nonexistent/registry-truststore.pem", "changeit")
        .build();

    assert!(matches!(
        res,
        Err(ClientBuildError::Configuration(ConfigurationError::TrustStoreIo { .. }))
    ));
}

#[test]
fn corrupt_trust_store() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"-----BEGIN CERTIFICATE-----\n%%%%\n-----END CERTIFICATE-----\n")
        .unwrap();

    let res = ClientBuilder::new()
        .trust_store_file(file.path(), "changeit")
        .build();
    assert!(matches!(res, Err(ClientBuildError::Configuration(_))));
}

#[test]
fn pkcs12_trust_store_password() {
    let cert = rcgen::generate_simple_self_signed(["registry.local".to_owned()]).unwrap();
    let pfx = p12::PFX::new(
        cert.cert.der(),
        &cert.key_pair.serialize_der(),
        None,
        "changeit",
        "registry",
    )
    .unwrap();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&pfx.to_der()).unwrap();

    let res = ClientBuilder::new()
        .trust_store_file(file.path(), "wrong")
        .build();
    assert!(matches!(
        res,
        Err(ClientBuildError::Configuration(ConfigurationError::TrustStorePassword(_)))
    ));

    let client = ClientBuilder::new()
        .trust_store_file(file.path(), "changeit")
        .build()
        .unwrap();
    assert!(!client.client().tls_context().unwrap().hostname_verification());
}

#[test]
fn trust_store_without_certificates() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"no certificates here\n").unwrap();

    let res = ClientBuilder::new()
        .trust_store_file(file.path(), "changeit")
        .build();
    assert!(matches!(
        res,
        Err(ClientBuildError::Configuration(ConfigurationError::EmptyTrustStore(_)))
    ));
}

#[test]
fn trust_identity() {
    let cert = rcgen::generate_simple_self_signed(["registry.local".to_owned()]).unwrap();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(cert.cert.pem().as_bytes()).unwrap();

    let custom = ClientBuilder::new()
        .trust_store_file(file.path(), "changeit")
        .build()
        .unwrap();
    let tls = custom.client().tls_context().unwrap();
    assert_eq!(
        tls.trust(),
        &TrustKind::Custom {
            path: file.path().to_owned()
        }
    );
    assert!(!tls.hostname_verification());

    let system = ClientBuilder::new().system_ssl_configuration().build().unwrap();
    let tls = system.client().tls_context().unwrap();
    assert_eq!(tls.trust(), &TrustKind::System);
    assert!(tls.hostname_verification());
}

#[test]
fn codecs() {
    let registry = Arc::new(
        StaticCodecRegistry::new()
            .with_encoder(Arc::new(Json))
            .with_decoder(Arc::new(Json)),
    );

    let client = ClientBuilder::new()
        .codec_registry(registry.clone())
        .encoder("json")
        .decoder("json", "full")
        .build()
        .unwrap();

    let codecs = client.client().codecs();
    assert_eq!(codecs.encoder().unwrap().content_type(), "application/json");
    assert_eq!(codecs.decoder().unwrap().codec_name(), "json");
    assert_eq!(client.config().encoder(), Some("json"));
    assert_eq!(client.config().decoder(), Some(("json", "full")));

    let res = ClientBuilder::new()
        .codec_registry(registry.clone())
        .encoder("xml")
        .build();
    assert!(matches!(res, Err(ClientBuildError::UnknownEncoder(name)) if name == "xml"));

    let res = ClientBuilder::new()
        .codec_registry(registry)
        .decoder("xml", "compact")
        .build();
    assert!(matches!(res, Err(ClientBuildError::UnknownDecoder { .. })));

    // wrappers bypass the registry
    let client = ClientBuilder::new()
        .encoder_wrapper(Arc::new(Json))
        .decoder_wrapper(Arc::new(Json))
        .build()
        .unwrap();
    assert_eq!(client.config().encoder(), Some("json"));
    assert_eq!(client.config().decoder(), None);
    assert_eq!(client.client().codecs().decoder().unwrap().codec_name(), "json");
}

#[test]
fn proxy_headers() {
    let client = ClientBuilder::new()
        .proxy("proxy.local", 3128, None, None)
        .build()
        .unwrap();

    let proxy = client.client().proxy().unwrap();
    assert_eq!(proxy.uri().to_string(), "http://proxy.local:3128/");
    assert_eq!(
        client
            .client()
            .default_headers()
            .get(header::PROXY_AUTHORIZATION)
            .unwrap(),
        "Basic Z3Vlc3Q6Z3Vlc3Q="
    );

    let client = ClientBuilder::new().build().unwrap();
    assert!(client
        .client()
        .default_headers()
        .get(header::PROXY_AUTHORIZATION)
        .is_none());
}

#[actix_rt::test]
async fn pooled_round_trips() {
    init_logger();

    let (port, accepted) = start_server().await;
    let uri: Uri = format!("http://127.0.0.1:{port}/eureka/apps").parse().unwrap();

    let client = ClientBuilder::new().build().unwrap();

    assert!(!round_trip(&client, &uri).await);
    assert!(round_trip(&client, &uri).await);
    assert!(round_trip(&client, &uri).await);

    assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 1);

    let stats = client.client().pool_stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.leased, 0);

    client.destroy_resources();
    assert_eq!(client.client().pool_stats().live(), 0);
}

#[actix_rt::test]
async fn cleaner_closes_idle_connections() {
    init_logger();

    let (port, _) = start_server().await;
    let uri: Uri = format!("http://127.0.0.1:{port}/").parse().unwrap();
    let metrics = Arc::new(InMemoryMetrics::new());

    let client = ClientBuilder::new()
        .connection_idle_timeout(0)
        .cleaner_interval(Duration::from_millis(50))
        .metrics(metrics.clone())
        .build()
        .unwrap();

    let mut leased = client.client().connect(&uri).await.unwrap();
    round_trip(&client, &uri).await;

    let deadline = Instant::now() + Duration::from_secs(5);
    while client.client().pool_stats().idle > 0 {
        assert!(Instant::now() < deadline, "idle connection was not closed");
        actix_rt::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(client.reaper_stats().closed >= 1);
    assert_eq!(client.reaper_stats().failed, 0);
    assert!(!metrics.timings(CLEANER_TIME).is_empty());

    // checked out connection survives every run
    assert_eq!(client.client().pool_stats().leased, 1);
    leased
        .write_all(b"GET / HTTP/1.1\r\nhost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut buf = vec![0; RESPONSE.len()];
    leased.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, RESPONSE);

    leased.release();
    client.destroy_resources();
}

#[actix_rt::test]
async fn connect_timeout_to_unresponsive_proxy() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    actix_rt::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        actix_rt::time::sleep(Duration::from_secs(5)).await;
        drop(stream);
    });

    let client = ClientBuilder::new()
        .connection_timeout(200)
        .proxy("127.0.0.1", port, Some("agent"), Some("secret"))
        .build()
        .unwrap();

    let res = client
        .client()
        .connect(&Uri::from_static("https://registry.local/eureka/apps"))
        .await;
    assert!(matches!(res, Err(ConnectError::Timeout)));
    assert_eq!(client.client().pool_stats().live(), 0);
}
