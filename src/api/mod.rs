//! HTTP and WebSocket surface.

pub mod error;
pub mod models;
pub mod server;
pub mod services;
pub mod state;
pub mod ws;

pub use error::ApiError;
pub use state::AppState;
