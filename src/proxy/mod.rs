//! HTTP reverse proxying.

pub mod client;
mod handler;

pub use client::{TransportError, UpstreamResponse};
pub use handler::{Proxy, ProxyError, ProxyRequest, ProxyResponse};
