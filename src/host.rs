//! Narrow interface to the request-processing runtime hosting the scanner.

use crate::content_type::RequestHeaders;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Error message the gateway returns when a body overflows its buffer.
pub const BODY_TOO_LARGE_MESSAGE: &str =
    "request body did not fit into client body buffer, consider raising 'client_body_buffer_size'";

/// Failure retrieving the raw request body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BodyError {
    /// The body exceeds what the host is willing to buffer.
    #[error("request body too large")]
    TooLarge,
    /// Any other retrieval failure.
    #[error("failed to read request body: {0}")]
    Other(String),
}

impl BodyError {
    /// Map a host error message, recognising the buffer-overflow sentinel.
    pub fn from_message(message: &str) -> Self {
        if message == BODY_TOO_LARGE_MESSAGE {
            BodyError::TooLarge
        } else {
            BodyError::Other(message.to_string())
        }
    }
}

/// Header lookup failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to read request headers: {0}")]
pub struct HostError(pub String);

/// Capabilities the scanner needs from its host runtime.
pub trait Host {
    /// Request headers, name to all values.
    fn request_headers(&self) -> Result<RequestHeaders, HostError>;

    /// The complete raw request body.
    fn raw_body(&self) -> Result<Bytes, BodyError>;

    /// Set a header on the eventual response.
    fn set_response_header(&mut self, name: &str, value: &str);

    /// Short-circuit the request with this response instead of forwarding it.
    fn exit(&mut self, status: u16, body: &str, headers: HashMap<String, Vec<String>>);
}

/// A request read from a local file or stdin, for running the scanner
/// outside a gateway.
#[derive(Debug)]
pub struct LocalRequest {
    headers: RequestHeaders,
    body: Bytes,
    max_body_size: usize,
    /// Response headers set by the scanner.
    pub response_headers: HashMap<String, String>,
    /// Short-circuit status, if the request was not forwarded.
    pub exit_status: Option<u16>,
}

impl LocalRequest {
    /// Build a request from its parts.
    pub fn new(content_type: Option<String>, body: Bytes, max_body_size: usize) -> Self {
        let mut headers = RequestHeaders::new();
        if let Some(ct) = content_type {
            headers.insert("content-type".to_string(), vec![ct]);
        }
        Self {
            headers,
            body,
            max_body_size,
            response_headers: HashMap::new(),
            exit_status: None,
        }
    }

    /// Read the body from `path`, or stdin when `None`.
    pub async fn load(
        path: Option<&PathBuf>,
        content_type: Option<String>,
        max_body_size: usize,
    ) -> std::io::Result<Self> {
        let body = match path {
            Some(p) => tokio::fs::read(p).await?,
            None => {
                use tokio::io::AsyncReadExt;
                let mut buf = Vec::new();
                tokio::io::stdin().read_to_end(&mut buf).await?;
                buf
            }
        };
        Ok(Self::new(content_type, Bytes::from(body), max_body_size))
    }
}

impl Host for LocalRequest {
    fn request_headers(&self) -> Result<RequestHeaders, HostError> {
        Ok(self.headers.clone())
    }

    fn raw_body(&self) -> Result<Bytes, BodyError> {
        if self.body.len() > self.max_body_size {
            return Err(BodyError::from_message(BODY_TOO_LARGE_MESSAGE));
        }
        Ok(self.body.clone())
    }

    fn set_response_header(&mut self, name: &str, value: &str) {
        self.response_headers
            .insert(name.to_string(), value.to_string());
    }

    fn exit(&mut self, status: u16, _body: &str, _headers: HashMap<String, Vec<String>>) {
        self.exit_status = Some(status);
    }
}
