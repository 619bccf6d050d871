//! Error types for sicar-dl library
//!
//! Provides comprehensive error handling for registry lookups, captcha
//! retrieval and file downloads.

use thiserror::Error;

use crate::core::state::{OutputFormat, State};

/// Main error type for sicar-dl operations
#[derive(Debug, Error)]
pub enum Error {
    /// State code not recognized
    #[error("State code '{input}' not valid!{}", suggestion_hint(.suggestion))]
    StateNotFound {
        input: String,
        suggestion: Option<State>,
    },

    /// Email rejected before any request is made
    #[error("Email {0} not valid!")]
    InvalidEmail(String),

    /// Server answered with a non-success status
    #[error("Oh no! Failed to access {url}! (HTTP {status})")]
    UrlNotOk { url: String, status: u16 },

    /// Captcha image missing, empty or not an image
    #[error("Failed to download captcha!")]
    CaptchaDownloadFailed,

    /// Shapefile or CSV request rejected by the server
    #[error("Failed to download {format} for municipality {code}: {reason}")]
    FileDownloadFailed {
        format: OutputFormat,
        code: u64,
        reason: String,
    },

    /// Captcha solver could not produce an answer
    #[error("Captcha solver failed: {0}")]
    CaptchaSolver(String),

    /// HTTP-specific error
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// File I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid configuration or parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Network connectivity issues
    #[error("Network error: {0}")]
    NetworkError(String),
}

fn suggestion_hint(suggestion: &Option<State>) -> String {
    match suggestion {
        Some(state) => format!(" Did you mean '{}' ({})?", state.code(), state.name()),
        None => String::new(),
    }
}

impl Error {
    /// Whether the failure consumes one attempt of a city download instead of
    /// aborting the whole run
    pub fn is_attempt_failure(&self) -> bool {
        matches!(
            self,
            Error::CaptchaDownloadFailed
                | Error::FileDownloadFailed { .. }
                | Error::UrlNotOk { .. }
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Error::NetworkError(err.to_string())
        } else {
            Error::HttpError(err.to_string())
        }
    }
}

/// Convenience result type for sicar-dl operations
pub type Result<T> = std::result::Result<T, Error>;
