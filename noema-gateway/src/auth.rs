//! `X-API-Key` authentication (§4.J, §6): the credit-flow credential, independent of the
//! x402 payment-proof path handled separately in `x402_routes`.

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use sha2::{Digest, Sha256};

use noema_model::{ErrorKind, NoemaError, User};

use crate::error::AppError;
use crate::state::AppState;

const PREFIX_LEN: usize = 12;

/// Extracted user identity for an authenticated request. Resolves the `X-API-Key` header
/// to a live `ApiKey` record, verifies its digest, then loads the owning `User`.
pub struct AuthedUser(pub User);

impl<S> FromRequestParts<S> for AuthedUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);
        let raw = parts
            .headers
            .get("X-API-Key")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError(NoemaError::new(ErrorKind::Unauthorized, "missing X-API-Key header")))?;

        if raw.len() < PREFIX_LEN {
            return Err(AppError(NoemaError::new(ErrorKind::Unauthorized, "malformed API key")));
        }
        let prefix = &raw[..PREFIX_LEN];
        let key = state
            .store
            .find_api_key_by_prefix(prefix)
            .await
            .map_err(|_| AppError(NoemaError::new(ErrorKind::Unauthorized, "unknown API key")))?;

        let digest = format!("{:x}", Sha256::digest(raw.as_bytes()));
        if digest != key.secret_sha256 || !key.has_permission(noema_model::ApiKeyPermission::Generate) {
            return Err(AppError(NoemaError::new(ErrorKind::Unauthorized, "invalid API key")));
        }

        let user = state.store.find_user_by_id(&key.master_account_id).await?;
        Ok(AuthedUser(user))
    }
}

/// Admin-only credential for the internal surface (`INTERNAL_API_KEY_ADMIN`, §6 CLI).
pub fn check_admin_key(header: Option<&str>, expected: &str) -> Result<(), AppError> {
    match header {
        Some(h) if h == expected => Ok(()),
        _ => Err(AppError(NoemaError::new(ErrorKind::Unauthorized, "invalid admin key"))),
    }
}
