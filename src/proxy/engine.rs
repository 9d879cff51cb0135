//! HTTP/1 proxy engine.
//!
//! Serves one client connection against a single upstream connection,
//! dialed on the first request and reused for every keep-alive exchange
//! on that connection. The client side is driven by hyper's http1 server
//! conn (which reads the next request only after the previous response),
//! the upstream side by a conn-level http1 client; both run with
//! protocol upgrades enabled so a 101 response hands the raw byte
//! streams to a bidirectional tunnel.

use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1 as client_http1;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use rand::seq::SliceRandom;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::table::{Route, RouteTable};

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Methods the proxy will forward; everything else is rejected.
fn method_allowed(method: &Method) -> bool {
    matches!(
        method.as_str(),
        "GET" | "HEAD" | "POST" | "PUT" | "DELETE" | "OPTIONS" | "TRACE"
    )
}

fn error_response(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from_static(message.as_bytes()))
        .map_err(|never| match never {})
        .boxed();
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    // Error responses end the exchange; the connection closes after the write.
    resp.headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    resp
}

fn host_of<B>(req: &Request<B>) -> String {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

fn set_request_start(headers: &mut HeaderMap) {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    if let Ok(value) = HeaderValue::from_str(&millis.to_string()) {
        headers.insert("x-request-start", value);
    }
}

/// Fold any prior X-Forwarded-For values into one comma-space separated
/// list and append the immediate peer.
fn append_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    let prior: Vec<String> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect();
    let chain = if prior.is_empty() {
        client_ip.to_string()
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };
    headers.remove("x-forwarded-for");
    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert("x-forwarded-for", value);
    }
}

/// Dial the route's backends in uniform random order; the first address
/// that accepts a TCP connection becomes the connection's upstream.
async fn dial(route: &Route) -> Option<client_http1::SendRequest<Incoming>> {
    let mut addrs = route.binding().addresses();
    {
        let mut rng = rand::thread_rng();
        addrs.shuffle(&mut rng);
    }
    for addr in addrs {
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(backend = %addr, error = %e, "backend dial failed");
                continue;
            }
        };
        match client_http1::handshake::<_, Incoming>(TokioIo::new(stream)).await {
            Ok((sender, conn)) => {
                tokio::spawn(async move {
                    if let Err(e) = conn.with_upgrades().await {
                        debug!(error = %e, "upstream connection ended");
                    }
                });
                return Some(sender);
            }
            Err(e) => {
                warn!(backend = %addr, error = %e, "backend handshake failed");
            }
        }
    }
    None
}

/// Copy raw bytes between the upgraded client and upstream streams until
/// both halves have closed.
async fn tunnel(client: OnUpgrade, upstream: OnUpgrade) {
    match tokio::try_join!(client, upstream) {
        Ok((client_io, upstream_io)) => {
            let mut client_io = TokioIo::new(client_io);
            let mut upstream_io = TokioIo::new(upstream_io);
            match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
                Ok((up, down)) => debug!(bytes_up = up, bytes_down = down, "tunnel closed"),
                Err(e) => debug!(error = %e, "tunnel ended with error"),
            }
        }
        Err(e) => debug!(error = %e, "protocol upgrade failed"),
    }
}

/// Per-connection proxy state. The route is fixed by SNI (TLS) or by the
/// first request's Host header and reused for the life of the connection,
/// as is the upstream connection.
struct ConnState {
    table: Arc<RouteTable>,
    route: Mutex<Option<Arc<Route>>>,
    upstream: Mutex<Option<client_http1::SendRequest<Incoming>>>,
    client_ip: IpAddr,
    tls: bool,
}

impl ConnState {
    async fn handle(&self, mut req: Request<Incoming>) -> Response<ProxyBody> {
        let route = {
            let mut slot = self.route.lock().await;
            match slot.as_ref() {
                Some(route) => Arc::clone(route),
                None => {
                    let host = host_of(&req);
                    match self.table.lookup(&host).await {
                        Some(route) => {
                            *slot = Some(Arc::clone(&route));
                            route
                        }
                        None => return error_response(StatusCode::NOT_FOUND, "Not Found"),
                    }
                }
            }
        };

        let mut upstream = self.upstream.lock().await;
        if upstream.is_none() {
            *upstream = dial(route.as_ref()).await;
        }
        let Some(sender) = upstream.as_mut() else {
            warn!(
                domain = %route.domain(),
                service = %route.service_name(),
                "no reachable backend"
            );
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable");
        };

        if !method_allowed(req.method()) {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        }

        let client_upgrade = req.extensions_mut().remove::<OnUpgrade>();
        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        parts.headers.remove(header::TE);
        parts.headers.remove(header::TRANSFER_ENCODING);
        append_forwarded_for(&mut parts.headers, self.client_ip);
        parts.headers.insert(
            "x-forwarded-proto",
            HeaderValue::from_static(if self.tls { "https" } else { "http" }),
        );
        set_request_start(&mut parts.headers);

        if sender.ready().await.is_err() {
            warn!(domain = %route.domain(), "upstream connection gone");
            return error_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        }
        let mut resp = match sender.send_request(Request::from_parts(parts, body)).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(domain = %route.domain(), error = %e, "upstream exchange failed");
                return error_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        };

        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            let upstream_upgrade = hyper::upgrade::on(&mut resp);
            if let Some(client_upgrade) = client_upgrade {
                tokio::spawn(tunnel(client_upgrade, upstream_upgrade));
            }
        }

        resp.map(BodyExt::boxed)
    }
}

/// Drive one client connection through the proxy.
///
/// `route` is pre-resolved for TLS connections (by SNI); plain
/// connections resolve it from the first request's Host header.
pub(crate) async fn serve_connection<I>(
    io: I,
    table: Arc<RouteTable>,
    route: Option<Arc<Route>>,
    client_ip: IpAddr,
    tls: bool,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let state = Arc::new(ConnState {
        table,
        route: Mutex::new(route),
        upstream: Mutex::new(None),
        client_ip,
        tls,
    });

    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(state.handle(req).await) }
    });

    let conn = server_http1::Builder::new().serve_connection(TokioIo::new(io), service);
    if let Err(e) = conn.with_upgrades().await {
        debug!(error = %e, "client connection ended");
    }
}
