//! Axum surface over the orchestrator and the durable store.
pub mod api;
pub mod error;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
