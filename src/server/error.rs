use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("anyhow: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T = ()> = std::result::Result<T, Error>;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::Anyhow(inner) => {
                tracing::error!(
                    backtrace = ?inner.backtrace(),
                    error = ?inner,
                    "internal server error"
                );
            }
            Error::Io(inner) => {
                tracing::error!(
                    error = ?inner,
                    "io error while handling request"
                );
            }
        }
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
    }
}
