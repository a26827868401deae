//! Signstream Gateway - connection pool, WebSocket ingress, HTTP surface

pub mod pool;
pub mod server;
pub mod ws;

pub use pool::{ClientSession, ConnectionPool, MessageSink};
pub use server::{build_router, run, AppState};
