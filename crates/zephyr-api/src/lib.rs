//! Zephyr CI HTTP and WebSocket edge.

pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod ws;

pub use routes::create_router;
pub use state::AppState;
