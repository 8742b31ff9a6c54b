//! Thin HTTP surface: request routing into the core services.

mod auth;
mod error;
mod handlers;
mod routes;
mod state;

pub use auth::CurrentUser;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::{ApiSettings, AppState};
