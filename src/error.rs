use std::error::Error;

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::{
    archive::ArchiveError, indexer::IndexerError, nntp::NntpError, nzb::NzbError,
    session::SessionError,
};

/// Errors surfaced through the HTTP layer.
#[derive(Debug, Error)]
pub enum RestError {
    #[error("Session not found")]
    SessionNotFound,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid range header")]
    InvalidRange,

    #[error("Requested range not satisfiable")]
    RangeNotSatisfiable,

    #[error("Invalid stream id: {0}")]
    InvalidStreamId(String),

    #[error("Error parsing NZB")]
    Nzb(#[from] NzbError),

    #[error("Error in NNTP client")]
    Nntp(#[from] NntpError),

    #[error("Error reading archive")]
    Archive(#[from] ArchiveError),

    #[error("Indexer error")]
    Indexer(#[from] IndexerError),

    #[error("Session error")]
    Session(#[from] SessionError),
}

impl IntoResponse for RestError {
    fn into_response(self) -> Response {
        error!("{}: {:?}", self, self.source());

        let status = match self {
            RestError::SessionNotFound => StatusCode::NOT_FOUND,
            RestError::Unauthorized => StatusCode::UNAUTHORIZED,
            RestError::InvalidRange => StatusCode::BAD_REQUEST,
            RestError::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            RestError::InvalidStreamId(_) => StatusCode::BAD_REQUEST,
            RestError::Nzb(_) => StatusCode::BAD_GATEWAY,
            RestError::Nntp(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RestError::Archive(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RestError::Indexer(_) => StatusCode::BAD_GATEWAY,
            RestError::Session(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let payload = Json(json!({"message": self.to_string()}));

        (status, payload).into_response()
    }
}
