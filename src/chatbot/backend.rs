//! Interface to the generative backend.
//!
//! The generation client only talks to this trait, so tests can swap the
//! HTTP client for a scripted one.

use std::fmt;
use std::future::Future;

/// One piece of request content.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    InlineData { mime_type: String, data: Vec<u8> },
}

impl Part {
    pub fn text(s: impl Into<String>) -> Self {
        Part::Text(s.into())
    }

    pub fn inline(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Part::InlineData {
            mime_type: mime_type.into(),
            data,
        }
    }
}

/// Optional tools the backend may use while answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    GoogleSearch,
}

/// Per-request configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateConfig {
    pub system_instruction: Option<String>,
    pub thinking_budget: Option<i32>,
    pub tools: Vec<Tool>,
    /// Ask for `application/json` output.
    pub json_response: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendResponse {
    /// Concatenated text parts. May be empty.
    pub text: String,
}

/// Backend failures, classified by what the caller can do about them.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendError {
    /// The model name is not known to the backend.
    NotFound(String),
    /// Rate or volume quota rejected the request.
    ResourceExhausted(String),
    /// Any other error reported by the API.
    Api { status: u16, message: String },
    /// Transport failure.
    Http(String),
    /// The response body could not be decoded.
    Parse(String),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, BackendError::ResourceExhausted(_))
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::NotFound(e) => write!(f, "model not found: {e}"),
            BackendError::ResourceExhausted(e) => write!(f, "resource exhausted: {e}"),
            BackendError::Api { status, message } => write!(f, "API error {status}: {message}"),
            BackendError::Http(e) => write!(f, "HTTP error: {e}"),
            BackendError::Parse(e) => write!(f, "Parse error: {e}"),
        }
    }
}

impl std::error::Error for BackendError {}

/// A generative backend.
pub trait Backend: Send + Sync {
    fn generate_content(
        &self,
        model: &str,
        contents: &[Part],
        config: &GenerateConfig,
    ) -> impl Future<Output = Result<BackendResponse, BackendError>> + Send;

    /// All model identifiers the backend currently serves.
    fn list_models(&self) -> impl Future<Output = Result<Vec<String>, BackendError>> + Send;
}
