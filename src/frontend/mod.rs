//! Inbound HTTP listener.
//!
//! Accepts client connections, turns each HTTP request into a
//! [`ProxyRequest`](crate::proxy::ProxyRequest) and writes back the
//! balancer's response.

mod listener;
mod session;

pub use listener::FrontendListener;
pub use session::SessionCookie;
