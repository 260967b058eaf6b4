use axum::{http::StatusCode, response::{IntoResponse, Response}};
use thiserror::Error;

use crate::billing::BillingError;
use crate::tenants::TenantError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("payment required")]
    PaymentRequired,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("bad gateway: {0}")]
    BadGateway(String),
    #[error("{0}")]
    Message(String),
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Db(err) => AppError::Db(err),
            BillingError::PaymentNotFound(_) | BillingError::SubscriptionNotFound => {
                AppError::NotFound
            }
            BillingError::PlanNotFound(plan_id) => {
                AppError::BadRequest(format!("plan {plan_id} is not available"))
            }
            BillingError::Gateway(err) => AppError::BadGateway(err.to_string()),
            other @ (BillingError::PlanUnresolved { .. } | BillingError::TenantMismatch { .. }) => {
                AppError::Message(other.to_string())
            }
        }
    }
}

impl From<TenantError> for AppError {
    fn from(err: TenantError) -> Self {
        match err {
            TenantError::NotFound => AppError::NotFound,
            TenantError::Db(err) => AppError::Db(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::PaymentRequired => StatusCode::PAYMENT_REQUIRED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            AppError::Db(_) | AppError::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::debug!(?self);
        }
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_errors_map_to_http_statuses() {
        let cases = [
            (AppError::from(BillingError::PaymentNotFound(1)), StatusCode::NOT_FOUND),
            (AppError::from(BillingError::PlanNotFound(2)), StatusCode::BAD_REQUEST),
            (
                AppError::from(BillingError::PlanUnresolved { payment_id: 3 }),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (AppError::PaymentRequired, StatusCode::PAYMENT_REQUIRED),
        ];
        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }
}
