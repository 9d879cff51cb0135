//! edge-router
//!
//! A dynamically configured HTTP/HTTPS reverse proxy. Routes live in a
//! replicated coordination store and are applied by a sync loop; backend
//! addresses come from service discovery; requests are dispatched by Host
//! header or TLS SNI and proxied over a per-connection upstream.

pub mod config;
pub mod discovery;
mod error;
pub mod proxy;
pub mod store;
mod sync;

pub use error::RouterError;
pub use proxy::{
    EventKind, EventSink, HttpListener, ListenerConfig, Route, RouteEvent, RoutePayload,
    RouteTable, ServiceBinding,
};
