//! Admin HTTP surface for gleaner.
//!
//! A thin adapter over the GC engine:
//! - `/admin/s3gc/*` endpoints for operators (inspect, trigger, restore)
//! - Bearer-token authentication on every admin route
//! - Prometheus `/metrics` for scraping

pub mod auth;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
