//! Test harness for router integration tests.
//!
//! Provides HTTP backends (header-echoing, upgrade-capable), a router
//! fixture wired to in-memory store and discovery, self-signed cert
//! generation, and a raw HTTP/1 client precise enough to exercise
//! keep-alive and 101 upgrades.

#![allow(dead_code)]

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::{header, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsConnector;

use edge_router::discovery::{Discovery, MemoryDiscovery};
use edge_router::store::{MemoryStore, Store};
use edge_router::{EventKind, HttpListener, ListenerConfig};

static INIT_CRYPTO: Once = Once::new();

pub fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

/// An HTTP/1 backend that answers with its marker, echoes proxy-relevant
/// request headers back as `echo-*` response headers, and upgrades
/// connections carrying `Upgrade: echo` into a raw byte echo.
pub struct HttpBackend {
    pub addr: SocketAddr,
    pub marker: String,
    connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

const ECHOED_HEADERS: [&str; 6] = [
    "host",
    "x-forwarded-for",
    "x-forwarded-proto",
    "x-request-start",
    "te",
    "transfer-encoding",
];

async fn backend_service(
    mut req: Request<Incoming>,
    marker: String,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let wants_echo_upgrade = req
        .headers()
        .get(header::UPGRADE)
        .map(|v| v == "echo")
        .unwrap_or(false);

    if wants_echo_upgrade {
        let on_upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            let Ok(upgraded) = on_upgrade.await else { return };
            let mut io = TokioIo::new(upgraded);
            let mut buf = [0u8; 4096];
            loop {
                match io.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if io.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        let mut resp = Response::new(Full::new(Bytes::new()));
        *resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        resp.headers_mut()
            .insert(header::UPGRADE, HeaderValue::from_static("echo"));
        resp.headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        return Ok(resp);
    }

    let mut resp = Response::new(Full::new(Bytes::from(marker)));
    for name in ECHOED_HEADERS {
        if let Some(value) = req.headers().get(name) {
            let echo_name = HeaderName::from_bytes(format!("echo-{name}").as_bytes())
                .expect("valid echo header name");
            resp.headers_mut().insert(echo_name, value.clone());
        }
    }
    Ok(resp)
}

impl HttpBackend {
    pub async fn spawn(marker: &str) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let marker_string = marker.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            conn_clone.fetch_add(1, Ordering::Relaxed);
                            let marker = marker_string.clone();
                            tokio::spawn(async move {
                                let service = service_fn(move |req| {
                                    backend_service(req, marker.clone())
                                });
                                let _ = hyper::server::conn::http1::Builder::new()
                                    .serve_connection(TokioIo::new(stream), service)
                                    .with_upgrades()
                                    .await;
                            });
                        }
                        Err(_) => break,
                    },
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            marker: marker.to_string(),
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Number of TCP connections the backend has accepted.
    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for HttpBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A running router on ephemeral ports, backed by in-memory store and
/// discovery.
pub struct TestRouter {
    pub listener: Arc<HttpListener>,
    pub store: Arc<MemoryStore>,
    pub discovery: Arc<MemoryDiscovery>,
    pub http_addr: SocketAddr,
    pub https_addr: SocketAddr,
}

impl TestRouter {
    pub async fn spawn() -> Self {
        init_crypto_provider();

        let store = Arc::new(MemoryStore::new());
        let discovery = Arc::new(MemoryDiscovery::new());
        let any: SocketAddr = "127.0.0.1:0".parse().expect("loopback addr");
        let listener = Arc::new(HttpListener::new(
            ListenerConfig::new(any, any),
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&discovery) as Arc<dyn Discovery>,
        ));
        listener.start().await.expect("router starts");

        let http_addr = listener.http_addr().expect("http bound");
        let https_addr = listener.https_addr().expect("https bound");
        Self {
            listener,
            store,
            discovery,
            http_addr,
            https_addr,
        }
    }

    /// Register `service`'s backend addresses with discovery.
    pub fn set_backends(&self, service: &str, backends: &[&HttpBackend]) {
        self.discovery
            .set_addresses(service, backends.iter().map(|b| b.address()).collect());
    }

    /// Add a route through the admin API and wait for the sync loop to
    /// install it.
    pub async fn add_domain(&self, domain: &str, service: &str, cert: &str, key: &str) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.listener.watch(tx.clone()).await;
        self.listener
            .add_http_domain(domain, service, cert, key)
            .await
            .expect("add domain");
        loop {
            let event = rx.recv().await.expect("add event");
            if event.event == EventKind::Add && event.domain == domain {
                break;
            }
        }
        self.listener.unwatch(&tx).await;
    }

    /// Remove a route and wait for the sync loop to drop it.
    pub async fn remove_domain(&self, domain: &str) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.listener.watch(tx.clone()).await;
        self.listener
            .remove_http_domain(domain)
            .await
            .expect("remove domain");
        loop {
            let event = rx.recv().await.expect("remove event");
            if event.event == EventKind::Remove && event.domain == domain {
                break;
            }
        }
        self.listener.unwatch(&tx).await;
    }
}

/// Self-signed certificate for a domain.
pub fn self_signed(domain: &str) -> rcgen::CertifiedKey {
    rcgen::generate_simple_self_signed(vec![domain.to_string()]).expect("self-signed cert")
}

/// Open a TLS client connection trusting `cert_der`, with SNI
/// `server_name`.
pub async fn tls_connect(
    addr: SocketAddr,
    server_name: &str,
    cert_der: &[u8],
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    init_crypto_provider();

    let mut root_store = rustls::RootCertStore::empty();
    root_store
        .add(CertificateDer::from(cert_der.to_vec()))
        .map_err(io::Error::other)?;

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    connector.connect(server_name, stream).await
}

/// One parsed HTTP/1 response.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Byte-accurate HTTP/1 client: reads exactly one response at a time so
/// keep-alive and post-upgrade bytes stay untouched in the buffer.
pub struct RawClient<S> {
    stream: S,
    buf: Vec<u8>,
}

impl RawClient<TcpStream> {
        pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self::new(TcpStream::connect(addr).await?))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> RawClient<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    pub async fn send(&mut self, raw: &str) -> io::Result<()> {
        self.stream.write_all(raw.as_bytes()).await
    }

    pub async fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await
    }

    async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; 4096];
        let n = self.stream.read(&mut chunk).await?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Read exactly `n` raw bytes (post-upgrade traffic).
    pub async fn read_bytes(&mut self, n: usize) -> io::Result<Vec<u8>> {
        while self.buf.len() < n {
            if self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed mid-read",
                ));
            }
        }
        Ok(self.buf.drain(..n).collect())
    }

    pub async fn read_response(&mut self) -> io::Result<RawResponse> {
        let header_end = loop {
            if let Some(pos) = find_subsequence(&self.buf, b"\r\n\r\n") {
                break pos + 4;
            }
            if self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed before response head",
                ));
            }
        };

        let head = String::from_utf8_lossy(&self.buf[..header_end]).to_string();
        let mut lines = head.split("\r\n");
        let status = lines
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad status line"))?;
        let headers: Vec<(String, String)> = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .collect();

        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .and_then(|(_, v)| v.parse::<usize>().ok())
            .unwrap_or(0);

        let total = header_end + content_length;
        while self.buf.len() < total {
            if self.fill().await? == 0 {
                break;
            }
        }
        let taken = total.min(self.buf.len());
        let body = self.buf[header_end..taken].to_vec();
        self.buf.drain(..taken);

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

/// One-shot GET over a fresh connection.
pub async fn http_get(addr: SocketAddr, host: &str) -> RawResponse {
    let mut client = RawClient::connect(addr).await.expect("connect");
    client
        .send(&format!(
            "GET / HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n"
        ))
        .await
        .expect("send request");
    client.read_response().await.expect("read response")
}
