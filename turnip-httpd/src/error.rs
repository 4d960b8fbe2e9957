use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors relating to the HTTP frontend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend closed the connection before replying.
    #[error("backend closed the connection unexpectedly")]
    Backend,

    /// Authorisation service error.
    #[error(transparent)]
    VirtInfo(#[from] turnip::virtinfo::Error),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        tracing::error!("{self}");

        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}
