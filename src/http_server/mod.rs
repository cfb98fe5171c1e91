//! # HTTP Surface
//!
//! - `/fn-execute/*` - HTTP triggers
//! - `/firehose` - firehose WebSocket
//! - `/health`, `/enqueuers`, `/subscriptions` - operator endpoints
//! - `POST /changes` - change ingest for the in-memory feed

mod admin_routes;
mod firehose_routes;
mod invoke_routes;
mod server;
mod state;

pub use admin_routes::{HealthResponse, SubscriptionsResponse};
pub use firehose_routes::FIREHOSE_PATH;
pub use invoke_routes::relative_path;
pub use server::{build_router, HttpServer};
pub use state::AppState;
