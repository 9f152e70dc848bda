//! Translates subsystem errors into the stable `{code, message}` shape every transport
//! shares (§7). Never surfaces a raw stack trace.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use noema_model::{ErrorKind, NoemaError};

pub struct AppError(pub NoemaError);

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
        ErrorKind::PaymentRequired => StatusCode::PAYMENT_REQUIRED,
        ErrorKind::PaymentAlreadyUsed => StatusCode::CONFLICT,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::UpstreamFailed => StatusCode::BAD_GATEWAY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::CostSettlementFailed => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Conflict => StatusCode::CONFLICT,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind);
        (status, Json(serde_json::json!({"error": {"code": self.0.kind.as_str(), "message": self.0.message}}))).into_response()
    }
}

impl From<NoemaError> for AppError {
    fn from(e: NoemaError) -> Self {
        AppError(e)
    }
}

impl From<noema_store::StoreError> for AppError {
    fn from(e: noema_store::StoreError) -> Self {
        AppError(e.into())
    }
}

impl From<noema_lifecycle::LifecycleError> for AppError {
    fn from(e: noema_lifecycle::LifecycleError) -> Self {
        AppError((&e).into())
    }
}

impl From<noema_scheduler::SchedulerError> for AppError {
    fn from(e: noema_scheduler::SchedulerError) -> Self {
        AppError((&e).into())
    }
}

impl From<noema_x402::X402Error> for AppError {
    fn from(e: noema_x402::X402Error) -> Self {
        AppError((&e).into())
    }
}
