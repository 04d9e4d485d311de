//! Hookline HTTP API.
//!
//! Signed webhook intake, dead-letter administration, health probes and the
//! metrics snapshot, served by axum over shared [`AppState`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod server;
pub mod state;

pub use config::{ApiConfig, Config, Environment};
pub use error::{ApiError, ApiResponse};
pub use server::{create_router, start_server};
pub use state::AppState;
