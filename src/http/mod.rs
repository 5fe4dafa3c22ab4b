//! Inbound HTTP interface

pub mod handler;
pub mod server;
pub use handler::{AppState, ApiResponse};
pub use server::serve;
