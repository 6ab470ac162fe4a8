//! Proxy worker module.
//!
//! # Module Structure
//!
//! - `server` - ProxyServer struct and accept loop
//! - `handler` - The per-request pipeline (route match, layered rules, failover)
//! - `sse` - Stateful `text/event-stream` rewriting
//! - `client` - Upstream HTTP client creation
//! - `network` - SO_REUSEPORT listener for the shared port

pub mod client;
mod handler;
mod network;
mod server;
mod sse;

pub use handler::{error_response, AppState};
pub use server::ProxyServer;
pub use sse::SseTransformer;
