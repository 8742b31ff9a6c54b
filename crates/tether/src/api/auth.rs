//! Caller identity extraction.
//!
//! Authentication proper lives outside the core; handlers only need a user
//! id to scope every operation. The `x-tether-user` header carries it, with
//! an optional configured fallback for single-user deployments.

use axum::{extract::FromRequestParts, http::request::Parts};

use super::error::ApiError;
use super::state::AppState;

/// The authenticated caller, as far as the core is concerned.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    id: String,
}

impl CurrentUser {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("x-tether-user")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        let id = header
            .map(str::to_string)
            .or_else(|| state.settings.default_user.clone())
            .ok_or_else(|| ApiError::unauthorized("missing caller identity"))?;

        Ok(CurrentUser { id })
    }
}
