//! # Observability Module
//!
//! Logging and request tracing for the Cairn node:
//!
//! - **Structured Logging**: JSON or pretty output filtered per crate
//! - **Request Tracing**: request IDs propagated through a span per request
//!
//! ## Usage
//!
//! ```rust,ignore
//! use axum::Router;
//! use cairn_node::observability::{init_logging, request_id_layer, LogFormat};
//!
//! init_logging("info", LogFormat::Json)?;
//!
//! let app: Router<()> = Router::new()
//!     .layer(request_id_layer());
//! ```

mod logging;
pub mod middleware;

pub use logging::{env_filter, init_logging, LogFormat};
pub use middleware::{request_id_layer, MiddlewareLayer, RequestId, REQUEST_ID_HEADER};
