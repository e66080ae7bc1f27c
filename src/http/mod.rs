//! HTTP ingestion subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, trace, timeout)
//!     → request.rs (bounded body read, source and route resolution)
//!     → SecurityGateway::evaluate
//!     → response.rs (status, JSON decision, rate-limit headers)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{extract_context, X_REQUEST_ID};
pub use server::{AppState, HttpServer};
