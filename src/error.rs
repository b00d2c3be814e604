//! Error kinds raised while relaying a message

use std::net::IpAddr;

use thiserror::Error;

/// Failure reported by the mail API capability.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("mail API rejected the request (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("cannot build endpoint URL: {0}")]
    Endpoint(String),
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("connection from {0} rejected by allow-list")]
    AccessDenied(IpAddr),

    #[error("failed to parse message: {0}")]
    ParseFailure(String),

    #[error("missing required email fields ({0})")]
    ValidationFailure(&'static str),

    #[error("failed to forward message: {0}")]
    ForwardFailure(#[from] ForwardError),

    #[error("message exceeds {max} bytes")]
    MessageTooLarge { max: usize },

    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("invalid configuration value for {key}: {value:?}")]
    InvalidConfiguration { key: &'static str, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Maps relay errors to the SMTP reply sent to the peer.
///
/// Replies are fixed strings: the peer never sees the underlying cause.
impl RelayError {
    pub fn to_response_code(&self) -> &'static str {
        match self {
            RelayError::AccessDenied(_) => "421",
            RelayError::ParseFailure(_) => "451",
            RelayError::ValidationFailure(_) => "550",
            RelayError::ForwardFailure(_) => "451",
            RelayError::MessageTooLarge { .. } => "552",
            RelayError::ConfigurationMissing(_)
            | RelayError::InvalidConfiguration { .. }
            | RelayError::Io(_) => "421",
        }
    }

    pub fn to_response(&self) -> String {
        let text = match self {
            RelayError::AccessDenied(_) => "4.7.1 Connection rejected",
            RelayError::ParseFailure(_) => "4.6.0 Error: message could not be parsed",
            RelayError::ValidationFailure(_) => "5.6.0 Missing required email fields (to)",
            RelayError::ForwardFailure(_) => "4.3.0 Failed to send email",
            RelayError::MessageTooLarge { .. } => "5.3.4 Message size exceeds fixed limit",
            RelayError::ConfigurationMissing(_)
            | RelayError::InvalidConfiguration { .. }
            | RelayError::Io(_) => "4.3.0 Service not available",
        };
        format!("{} {}\r\n", self.to_response_code(), text)
    }
}
