//! Failure taxonomy for a single request scan.

use crate::icap::IcapError;
use thiserror::Error;

/// Reasons a request body could not be scanned to completion.
///
/// A detected infection is not an error; see [`crate::RequestVerdict::Block`].
#[derive(Debug, Error)]
pub enum ScanError {
    /// The host could not buffer the whole body.
    #[error("request body exceeds the host buffering limit")]
    BodyTooLarge,

    /// The host failed to hand over the body or headers for another reason.
    #[error("failed to read request: {0}")]
    BodyRead(String),

    /// The Content-Type header is not a valid media type.
    #[error("failed to parse content type {content_type:?}: {reason}")]
    ContentTypeParse {
        /// Header value as received.
        content_type: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A multipart body could not be split into parts.
    #[error("multipart parse error: {0}")]
    MultipartParse(String),

    /// The scanner could not be reached or did not answer in time.
    #[error("ICAP transport error: {0}")]
    IcapTransport(#[source] IcapError),

    /// The scanner answered with something that is not a usable ICAP response.
    #[error("ICAP protocol error: {0}")]
    IcapProtocol(#[source] IcapError),
}

impl ScanError {
    /// HTTP status the host should short-circuit the request with.
    pub fn status_code(&self) -> u16 {
        match self {
            ScanError::BodyTooLarge => 413,
            _ => 500,
        }
    }
}

impl From<IcapError> for ScanError {
    fn from(e: IcapError) -> Self {
        if e.is_transport() {
            ScanError::IcapTransport(e)
        } else {
            ScanError::IcapProtocol(e)
        }
    }
}
