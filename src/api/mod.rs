//! HTTP and WebSocket surface.

/// Route handlers and router assembly.
pub mod http;
/// Bearer-token auth middleware.
pub mod middleware;
/// Request/response DTOs.
pub mod protocol;
/// Server assembly and graceful shutdown.
pub mod server;
/// Real-time WebSocket fan-out.
pub mod ws;

pub use http::AppState;
pub use server::run_server;
pub use ws::Broadcaster;
