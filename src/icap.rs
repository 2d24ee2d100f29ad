//! ICAP client using OPTIONS preview negotiation followed by RESPMOD.

use crate::partition::ContentUnit;
use http::{HeaderMap, HeaderName, HeaderValue, Uri};
use memchr::{memchr, memmem};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Port used when the endpoint URL does not name one.
pub const DEFAULT_PORT: u16 = 1344;

/// Upper bound on a single response head.
const MAX_HEAD_SIZE: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// Error from ICAP operations.
#[derive(Debug, Error)]
pub enum IcapError {
    /// The scanner URL is not a usable `icap://` URL.
    #[error("Invalid ICAP URL {url:?}: {reason}")]
    InvalidUrl {
        /// URL as configured.
        url: String,
        /// What was wrong with it.
        reason: String,
    },
    /// Connection to the ICAP server failed.
    #[error("Connection to ICAP server failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),
    /// The exchange did not finish within the per-call timeout.
    #[error("ICAP request timed out")]
    Timeout,
    /// I/O error mid-exchange.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The server sent something that is not a valid ICAP response.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl IcapError {
    /// Whether the failure happened below the protocol (connect, timeout, socket).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            IcapError::ConnectionFailed(_) | IcapError::Timeout | IcapError::Io(_)
        )
    }
}

/// Parsed `icap://host[:port]/service` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcapEndpoint {
    url: String,
    authority: String,
    host: String,
    port: u16,
}

impl IcapEndpoint {
    /// Parse and validate a scanner URL.
    pub fn parse(url: &str) -> Result<Self, IcapError> {
        let invalid = |reason: &str| IcapError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let uri: Uri = url.parse().map_err(|_| invalid("not a URI"))?;
        if !uri
            .scheme_str()
            .is_some_and(|s| s.eq_ignore_ascii_case("icap"))
        {
            return Err(invalid("scheme must be icap"));
        }
        let authority = uri.authority().ok_or_else(|| invalid("missing host"))?;
        let host = authority.host();
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(Self {
            url: url.to_string(),
            authority: authority.as_str().to_string(),
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port: authority.port_u16().unwrap_or(DEFAULT_PORT),
        })
    }

    /// URL as used on the ICAP request line.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Host name or address to connect to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port to connect to.
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Status line and headers of an ICAP response.
///
/// Encapsulated bodies are not read; the verdict lives in the head.
#[derive(Debug, Clone)]
pub struct IcapResponse {
    /// ICAP status code.
    pub status: u16,
    /// Reason phrase from the status line.
    pub reason: String,
    /// Response headers, looked up case-insensitively.
    pub headers: HeaderMap,
}

impl IcapResponse {
    /// First value of a header, if present and printable.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name.to_ascii_lowercase().as_str())
            .and_then(|v| v.to_str().ok())
    }

    /// Preview size advertised in an OPTIONS response.
    pub fn preview(&self) -> Result<Option<usize>, IcapError> {
        match self.header("preview") {
            None => Ok(None),
            Some(value) => value.trim().parse().map(Some).map_err(|_| {
                IcapError::InvalidResponse(format!("invalid Preview header {value:?}"))
            }),
        }
    }
}

/// ICAP client for one scanner endpoint.
///
/// Holds no connection state: every OPTIONS and RESPMOD exchange opens its
/// own connection, so a client may be shared or built per request freely.
#[derive(Debug, Clone)]
pub struct IcapClient {
    endpoint: IcapEndpoint,
    timeout: Duration,
    debug: bool,
}

impl IcapClient {
    /// Create a new ICAP client.
    ///
    /// `debug` enables logging of raw request and response heads.
    pub fn new(endpoint: IcapEndpoint, timeout_ms: u64, debug: bool) -> Self {
        Self {
            endpoint,
            timeout: Duration::from_millis(timeout_ms),
            debug,
        }
    }

    /// Endpoint this client talks to.
    pub fn endpoint(&self) -> &IcapEndpoint {
        &self.endpoint
    }

    /// Negotiate with OPTIONS, then submit `unit` with RESPMOD.
    ///
    /// Returns the RESPMOD response uninterpreted.
    pub async fn scan(&self, unit: &ContentUnit) -> Result<IcapResponse, IcapError> {
        let preview = self.options().await?;
        debug!(
            url = %self.endpoint.url,
            preview = ?preview,
            "OPTIONS negotiated"
        );
        self.respmod(unit, preview).await
    }

    /// Send OPTIONS and return the advertised preview size.
    pub async fn options(&self) -> Result<Option<usize>, IcapError> {
        let response = match timeout(self.timeout, self.options_exchange()).await {
            Ok(result) => result?,
            Err(_) => return Err(IcapError::Timeout),
        };

        if response.status != 200 {
            return Err(IcapError::InvalidResponse(format!(
                "OPTIONS returned status {} {}",
                response.status, response.reason
            )));
        }
        response.preview()
    }

    /// Send RESPMOD for `unit`, previewing `preview` bytes when negotiated.
    pub async fn respmod(
        &self,
        unit: &ContentUnit,
        preview: Option<usize>,
    ) -> Result<IcapResponse, IcapError> {
        match timeout(self.timeout, self.respmod_exchange(unit, preview)).await {
            Ok(result) => result,
            Err(_) => Err(IcapError::Timeout),
        }
    }

    async fn connect(&self) -> Result<TcpStream, IcapError> {
        TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port))
            .await
            .map_err(IcapError::ConnectionFailed)
    }

    async fn options_exchange(&self) -> Result<IcapResponse, IcapError> {
        let mut stream = self.connect().await?;
        let request = self.options_request();
        self.log_head("OPTIONS request", request.as_bytes());

        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let mut reader = ResponseReader::default();
        let response = reader.read_response(&mut stream).await?;
        self.log_response("OPTIONS response", &response);
        Ok(response)
    }

    async fn respmod_exchange(
        &self,
        unit: &ContentUnit,
        preview: Option<usize>,
    ) -> Result<IcapResponse, IcapError> {
        let body = &unit.bytes[..];
        let preview_len = preview.map(|p| p.min(body.len()));
        let head = self.respmod_head(unit, preview_len);
        self.log_head("RESPMOD request", &head);

        let mut stream = self.connect().await?;
        stream.write_all(&head).await?;

        let mut reader = ResponseReader::default();

        if body.is_empty() {
            stream.flush().await?;
            let response = reader.read_response(&mut stream).await?;
            self.log_response("RESPMOD response", &response);
            return Ok(response);
        }

        // Without a negotiated preview the whole body goes out at once.
        let first = preview_len.unwrap_or(body.len());
        let complete = first == body.len();

        write_chunk(&mut stream, &body[..first]).await?;
        if preview_len.is_some() && complete {
            stream.write_all(b"0; ieof\r\n\r\n").await?;
        } else {
            stream.write_all(b"0\r\n\r\n").await?;
        }
        stream.flush().await?;

        let response = reader.read_response(&mut stream).await?;
        self.log_response("RESPMOD response", &response);
        if response.status != 100 {
            return Ok(response);
        }
        if complete {
            return Err(IcapError::InvalidResponse(
                "100 Continue received after the complete body".to_string(),
            ));
        }

        write_chunk(&mut stream, &body[first..]).await?;
        stream.write_all(b"0\r\n\r\n").await?;
        stream.flush().await?;

        let response = reader.read_response(&mut stream).await?;
        self.log_response("RESPMOD response", &response);
        if response.status == 100 {
            return Err(IcapError::InvalidResponse(
                "unexpected second 100 Continue".to_string(),
            ));
        }
        Ok(response)
    }

    fn options_request(&self) -> String {
        format!(
            "OPTIONS {} ICAP/1.0\r\nHost: {}\r\nEncapsulated: null-body=0\r\n\r\n",
            self.endpoint.url, self.endpoint.authority
        )
    }

    /// ICAP head plus the encapsulated HTTP response head for `unit`.
    fn respmod_head(&self, unit: &ContentUnit, preview_len: Option<usize>) -> Vec<u8> {
        let http_head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
            unit.media_type,
            unit.bytes.len()
        );

        let mut head = format!(
            "RESPMOD {} ICAP/1.0\r\nHost: {}\r\nAllow: 204\r\n",
            self.endpoint.url, self.endpoint.authority
        );
        if unit.bytes.is_empty() {
            head.push_str(&format!(
                "Encapsulated: res-hdr=0, null-body={}\r\n\r\n",
                http_head.len()
            ));
        } else {
            if let Some(len) = preview_len {
                head.push_str(&format!("Preview: {len}\r\n"));
            }
            head.push_str(&format!(
                "Encapsulated: res-hdr=0, res-body={}\r\n\r\n",
                http_head.len()
            ));
        }
        head.push_str(&http_head);
        head.into_bytes()
    }

    fn log_head(&self, what: &str, head: &[u8]) {
        if self.debug {
            debug!(head = %String::from_utf8_lossy(head), "{}", what);
        }
    }

    fn log_response(&self, what: &str, response: &IcapResponse) {
        if self.debug {
            debug!(
                status = response.status,
                headers = ?response.headers,
                "{}", what
            );
        }
    }
}

async fn write_chunk(stream: &mut TcpStream, data: &[u8]) -> Result<(), IcapError> {
    if data.is_empty() {
        return Ok(());
    }
    stream
        .write_all(format!("{:x}\r\n", data.len()).as_bytes())
        .await?;
    stream.write_all(data).await?;
    stream.write_all(b"\r\n").await?;
    Ok(())
}

/// Reads consecutive response heads off one connection, keeping any bytes
/// received past the current head for the next read.
#[derive(Debug, Default)]
struct ResponseReader {
    buf: Vec<u8>,
}

impl ResponseReader {
    async fn read_response<R: AsyncRead + Unpin>(
        &mut self,
        stream: &mut R,
    ) -> Result<IcapResponse, IcapError> {
        loop {
            if let Some(end) = memmem::find(&self.buf, b"\r\n\r\n") {
                let head: Vec<u8> = self.buf.drain(..end + 4).collect();
                return parse_head(&head[..end]);
            }
            if self.buf.len() > MAX_HEAD_SIZE {
                return Err(IcapError::InvalidResponse(
                    "response head too large".to_string(),
                ));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(IcapError::InvalidResponse(
                    "connection closed before end of response head".to_string(),
                ));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Parse a response head (without its terminating blank line).
fn parse_head(head: &[u8]) -> Result<IcapResponse, IcapError> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("ICAP/") {
        return Err(IcapError::InvalidResponse(format!("bad status line {status_line:?}")));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|code| (100..1000).contains(code))
        .ok_or_else(|| IcapError::InvalidResponse(format!("bad status code in {status_line:?}")))?;
    let reason = parts.next().unwrap_or_default().trim().to_string();

    let mut headers = HeaderMap::new();
    for line in lines {
        let colon = memchr(b':', line.as_bytes())
            .ok_or_else(|| IcapError::InvalidResponse(format!("malformed header line {line:?}")))?;
        let name = HeaderName::from_bytes(line[..colon].trim().as_bytes())
            .map_err(|_| IcapError::InvalidResponse(format!("invalid header name in {line:?}")))?;
        let value = HeaderValue::from_str(line[colon + 1..].trim())
            .map_err(|_| IcapError::InvalidResponse(format!("invalid header value in {line:?}")))?;
        headers.append(name, value);
    }

    Ok(IcapResponse {
        status,
        reason,
        headers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn client() -> IcapClient {
        IcapClient::new(
            IcapEndpoint::parse("icap://scanner.local:1345/avscan").unwrap(),
            15000,
            false,
        )
    }

    fn unit(bytes: &'static [u8]) -> ContentUnit {
        ContentUnit {
            name: "a.txt".to_string(),
            media_type: "text/plain".to_string(),
            bytes: Bytes::from_static(bytes),
        }
    }

    #[test]
    fn test_endpoint_parse() {
        let ep = IcapEndpoint::parse("icap://scanner.local:1345/avscan").unwrap();
        assert_eq!(ep.host(), "scanner.local");
        assert_eq!(ep.port(), 1345);
        assert_eq!(ep.url(), "icap://scanner.local:1345/avscan");

        let ep = IcapEndpoint::parse("icap://10.0.0.5/srv_clamav").unwrap();
        assert_eq!(ep.port(), DEFAULT_PORT);

        let ep = IcapEndpoint::parse("icap://[::1]:1344/avscan").unwrap();
        assert_eq!(ep.host(), "::1");
    }

    #[test]
    fn test_endpoint_parse_rejects() {
        for bad in ["http://scanner/avscan", "scanner:1344", "not a url", ""] {
            assert!(
                matches!(IcapEndpoint::parse(bad), Err(IcapError::InvalidUrl { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_head() {
        let resp = parse_head(
            b"ICAP/1.0 200 OK\r\nMethods: RESPMOD\r\nPreview: 1024\r\nISTag: \"abc\"",
        )
        .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.reason, "OK");
        assert_eq!(resp.header("methods"), Some("RESPMOD"));
        assert_eq!(resp.header("ISTAG"), Some("\"abc\""));
        assert_eq!(resp.preview().unwrap(), Some(1024));
    }

    #[test]
    fn test_parse_head_no_headers() {
        let resp = parse_head(b"ICAP/1.0 100 Continue").unwrap();
        assert_eq!(resp.status, 100);
        assert!(resp.headers.is_empty());
        assert_eq!(resp.preview().unwrap(), None);
    }

    #[test]
    fn test_parse_head_invalid() {
        assert!(parse_head(b"HTTP/1.1 200 OK").is_err());
        assert!(parse_head(b"ICAP/1.0 abc OK").is_err());
        assert!(parse_head(b"ICAP/1.0 204 No Content\r\nno colon here").is_err());
        assert!(parse_head(b"").is_err());
    }

    #[test]
    fn test_invalid_preview() {
        let resp = parse_head(b"ICAP/1.0 200 OK\r\nPreview: lots").unwrap();
        assert!(matches!(resp.preview(), Err(IcapError::InvalidResponse(_))));
    }

    #[test]
    fn test_options_request() {
        assert_eq!(
            client().options_request(),
            "OPTIONS icap://scanner.local:1345/avscan ICAP/1.0\r\n\
             Host: scanner.local:1345\r\n\
             Encapsulated: null-body=0\r\n\r\n"
        );
    }

    #[test]
    fn test_respmod_head_with_preview() {
        let head = client().respmod_head(&unit(b"hello"), Some(4));
        let head = String::from_utf8(head).unwrap();
        let http_head = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\n";
        assert!(head.starts_with("RESPMOD icap://scanner.local:1345/avscan ICAP/1.0\r\n"));
        assert!(head.contains("Allow: 204\r\n"));
        assert!(head.contains("Preview: 4\r\n"));
        assert!(head.contains(&format!(
            "Encapsulated: res-hdr=0, res-body={}\r\n\r\n",
            http_head.len()
        )));
        assert!(head.ends_with(http_head));
    }

    #[test]
    fn test_respmod_head_empty_unit() {
        let head = String::from_utf8(client().respmod_head(&unit(b""), Some(4))).unwrap();
        assert!(head.contains("null-body="));
        assert!(!head.contains("Preview:"));
    }

    #[test]
    fn test_error_kinds() {
        assert!(IcapError::Timeout.is_transport());
        assert!(IcapError::ConnectionFailed(std::io::ErrorKind::ConnectionRefused.into())
            .is_transport());
        assert!(!IcapError::InvalidResponse("x".into()).is_transport());
        assert_eq!(format!("{}", IcapError::Timeout), "ICAP request timed out");
    }

    #[tokio::test]
    async fn test_reader_keeps_trailing_bytes() {
        let data: &[u8] = b"ICAP/1.0 100 Continue\r\n\r\nICAP/1.0 204 No Content\r\nISTag: x\r\n\r\n";
        let mut stream = data;
        let mut reader = ResponseReader::default();
        assert_eq!(reader.read_response(&mut stream).await.unwrap().status, 100);
        let second = reader.read_response(&mut stream).await.unwrap();
        assert_eq!(second.status, 204);
        assert_eq!(second.header("istag"), Some("x"));
    }

    #[tokio::test]
    async fn test_reader_truncated() {
        let mut stream: &[u8] = b"ICAP/1.0 204 No Con";
        let mut reader = ResponseReader::default();
        assert!(matches!(
            reader.read_response(&mut stream).await,
            Err(IcapError::InvalidResponse(_))
        ));
    }
}
