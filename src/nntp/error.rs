use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NntpError {
    #[error("I/O error")]
    Io(#[from] io::Error),

    #[error("TLS error")]
    Tls(#[from] native_tls::Error),

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Article not found: {0}")]
    ArticleMissing(String),

    #[error("Unexpected response: {code} {message}")]
    UnexpectedResponse { code: u16, message: String },

    #[error("Malformed response line: {0}")]
    Malformed(String),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Connection pool is shut down")]
    Shutdown,

    #[error("yEnc decode error: {0}")]
    Yenc(String),
}

impl NntpError {
    /// 430/423-class misses are recorded as validation misses rather than
    /// provider failures.
    pub fn is_missing(&self) -> bool {
        matches!(self, NntpError::ArticleMissing(_))
    }

    /// Errors that must not be retried on the same provider.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NntpError::Auth(_) | NntpError::Shutdown | NntpError::ArticleMissing(_)
        )
    }
}
