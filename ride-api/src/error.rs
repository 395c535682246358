use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ride_core::{BookingError, BookingStatus};
use serde::Serialize;

#[derive(Debug)]
pub enum AppError {
    Unauthorized(String),
    Booking(BookingError),
}

impl From<BookingError> for AppError {
    fn from(err: BookingError) -> Self {
        AppError::Booking(err)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub ok: bool,
    pub error_code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_seats: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_status: Option<BookingStatus>,
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Booking(err) => match err {
                BookingError::NotFound { .. } => StatusCode::NOT_FOUND,
                BookingError::Forbidden { .. } => StatusCode::FORBIDDEN,
                BookingError::InvalidState { .. } => StatusCode::BAD_REQUEST,
                BookingError::CapacityExceeded { .. } => StatusCode::CONFLICT,
                BookingError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            AppError::Unauthorized(msg) => ErrorBody {
                ok: false,
                error_code: "UNAUTHORIZED",
                message: msg.clone(),
                available_seats: None,
                current_status: None,
            },
            AppError::Booking(err) => ErrorBody {
                ok: false,
                error_code: err.code(),
                // Storage details stay in the logs.
                message: match err {
                    BookingError::Unavailable(_) => {
                        "Service temporarily unavailable, retry later".to_string()
                    }
                    other => other.to_string(),
                },
                available_seats: err.available_seats(),
                current_status: err.current_status(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Booking(BookingError::Unavailable(cause)) = &self {
            tracing::error!("Booking service unavailable: {}", cause);
        }

        (self.status(), Json(self.body())).into_response()
    }
}
