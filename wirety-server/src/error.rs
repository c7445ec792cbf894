use hyper::{Body, Response, StatusCode};
use thiserror::Error;

use wirety_core::ErrorKind;

/// The server's single error type. Every fallible operation in this crate
/// either returns one of these directly or converts into one at the HTTP
/// boundary; nothing below `http` needs to know about status codes.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("unauthorized access")]
    Unauthorized,

    #[error("object not found")]
    NotFound,

    #[error("invalid request: {0}")]
    InvalidQuery(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Model(#[from] wirety_core::ModelError),

    #[error(transparent)]
    Ipam(#[from] wirety_core::IpamError),

    #[error(transparent)]
    Compile(#[from] wirety_core::CompileError),

    #[error("internal database error")]
    Database(#[from] rusqlite::Error),

    #[error("internal I/O error")]
    Io(#[from] std::io::Error),

    #[error("JSON error")]
    Json(#[from] serde_json::Error),

    #[error("internal HTTP error")]
    Http(#[from] hyper::http::Error),

    #[error("internal hyper error")]
    Hyper(#[from] hyper::Error),
}

impl ServerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::Unauthorized => ErrorKind::Authz,
            ServerError::NotFound => ErrorKind::NotFound,
            ServerError::InvalidQuery(_) => ErrorKind::Validation,
            ServerError::Conflict(_) => ErrorKind::Conflict,
            ServerError::Model(e) => e.kind(),
            ServerError::Ipam(e) => e.kind(),
            ServerError::Compile(e) => e.kind(),
            ServerError::Database(rusqlite::Error::QueryReturnedNoRows) => ErrorKind::NotFound,
            ServerError::Database(_) | ServerError::Io(_) | ServerError::Http(_) | ServerError::Hyper(_) => {
                ErrorKind::Fatal
            },
            ServerError::Json(_) => ErrorKind::Validation,
        }
    }
}

impl From<&ServerError> for StatusCode {
    fn from(error: &ServerError) -> StatusCode {
        match error.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Exhaustion => StatusCode::INSUFFICIENT_STORAGE,
            ErrorKind::Authz => StatusCode::UNAUTHORIZED,
            ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ServerError> for Response<Body> {
    fn from(e: ServerError) -> Self {
        let status = StatusCode::from(&e);
        Response::builder()
            .status(status)
            .body(Body::from(e.to_string()))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }
}
