//! Control surface: HTTP API and live status stream

pub mod handlers;
pub mod server;
pub mod websocket;

pub use server::{router, AppState, WebServer};
