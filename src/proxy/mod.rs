//! HTTP/HTTPS proxy core.
//!
//! This module provides:
//! - the concurrently readable route table and its service bindings
//! - SNI peeking for pre-handshake TLS dispatch
//! - the HTTP/1 proxy engine with keep-alive and upgrade passthrough
//! - the listener pair and admin API
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> SNI/Host dispatch -> Route table -> Service binding
//!                                                               |
//!                                          HTTP/1 engine <- upstream dial
//! ```

mod engine;
mod listener;
mod sni;
mod table;

pub use listener::{HttpListener, ListenerConfig, DEFAULT_ROUTE_PREFIX};
pub use sni::{peek_client_hello, ReplayStream};
pub use table::{
    normalize_host, EventKind, EventSink, Route, RouteEvent, RoutePayload, RouteTable,
    ServiceBinding,
};
