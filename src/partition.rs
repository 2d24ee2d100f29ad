//! Splitting a request body into scannable content units.

use crate::content_type::{hex_byte, parse_media_type};
use crate::error::ScanError;
use bytes::Bytes;
use memchr::{memchr, memmem};
use tracing::debug;

/// One scannable slice of a request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentUnit {
    /// Declared filename; empty for a whole, non-multipart body.
    pub name: String,
    /// Media type sent to the scanner with the bytes.
    pub media_type: String,
    /// Unit payload.
    pub bytes: Bytes,
}

/// Split `body` according to its Content-Type.
///
/// Multipart bodies yield one unit per part, lazily and in order. Any other
/// non-empty body yields exactly one unnamed unit. An empty body yields
/// nothing.
pub fn partition(body: Bytes, content_type: &str) -> Result<ContentUnits, ScanError> {
    let media_type = parse_media_type(content_type)?;
    debug!(media_type = %media_type.essence, params = ?media_type.params, "Partitioning body");

    if body.is_empty() {
        return Ok(ContentUnits::single(None));
    }

    if media_type.is_multipart() {
        let boundary = match media_type.param("boundary") {
            Some(b) if !b.is_empty() => b,
            _ => {
                return Err(ScanError::MultipartParse(
                    "missing boundary parameter".to_string(),
                ))
            }
        };
        return Ok(ContentUnits {
            inner: Units::Multipart(MultipartParts::new(body, boundary)),
        });
    }

    Ok(ContentUnits::single(Some(ContentUnit {
        name: String::new(),
        media_type: content_type.to_string(),
        bytes: body,
    })))
}

/// Ordered, finite sequence of content units for one request.
///
/// Once an error is yielded the sequence ends.
#[derive(Debug)]
pub struct ContentUnits {
    inner: Units,
}

#[derive(Debug)]
enum Units {
    Single(Option<ContentUnit>),
    Multipart(MultipartParts),
}

impl ContentUnits {
    fn single(unit: Option<ContentUnit>) -> Self {
        Self {
            inner: Units::Single(unit),
        }
    }
}

impl Iterator for ContentUnits {
    type Item = Result<ContentUnit, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            Units::Single(unit) => unit.take().map(Ok),
            Units::Multipart(parts) => parts.next(),
        }
    }
}

const CRLF: &[u8] = b"\r\n";
const LF: &[u8] = b"\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preamble,
    Parts,
    /// The last part ended on a line that is not a valid delimiter.
    BadDelimiter,
    Done,
}

/// What a `--boundary` line announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delimiter {
    /// Another part starts at this offset.
    Next(usize),
    /// `--boundary--`, end of the multipart body.
    Close,
    /// Anything else after the boundary on that line.
    Invalid,
}

/// Lazy iterator over the parts of a multipart body.
///
/// Lines end in CRLF unless the opening delimiter line ends in a bare LF,
/// in which case LF is expected for the rest of the body.
#[derive(Debug)]
pub struct MultipartParts {
    body: Bytes,
    delimiter: Vec<u8>,
    newline: &'static [u8],
    pos: usize,
    state: State,
}

/// Classify what follows the boundary on a delimiter line.
///
/// `Next` carries the number of bytes up to and including the line break.
fn delimiter_kind(rest: &[u8], newline: &[u8]) -> Delimiter {
    let (close, rest) = match rest.strip_prefix(b"--") {
        Some(r) => (true, r),
        None => (false, rest),
    };
    let padding = rest
        .iter()
        .take_while(|b| **b == b' ' || **b == b'\t')
        .count();
    let tail = &rest[padding..];

    if close {
        if tail.is_empty() || tail.starts_with(newline) {
            Delimiter::Close
        } else {
            Delimiter::Invalid
        }
    } else if tail.starts_with(newline) {
        Delimiter::Next(padding + newline.len())
    } else {
        Delimiter::Invalid
    }
}

/// Whether the bytes after a boundary match can end a part's content.
fn ends_part(rest: &[u8]) -> bool {
    matches!(
        rest,
        [] | [b' ' | b'\t' | b'\r' | b'\n', ..] | [b'-', b'-', ..]
    )
}

impl MultipartParts {
    /// Iterate the parts of `body` separated by `boundary`.
    pub fn new(body: Bytes, boundary: &str) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 2);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(boundary.as_bytes());
        Self {
            body,
            delimiter,
            newline: CRLF,
            pos: 0,
            state: State::Preamble,
        }
    }

    fn fail(&mut self, detail: &str) -> Option<Result<ContentUnit, ScanError>> {
        self.state = State::Done;
        Some(Err(ScanError::MultipartParse(detail.to_string())))
    }

    /// Skip the preamble to the first valid delimiter line.
    ///
    /// Returns what it announces and the line break style it ends with.
    fn find_opening(&self) -> Option<(Delimiter, &'static [u8])> {
        let body = &self.body[..];
        let mut start = 0;
        while let Some(i) = memmem::find(&body[start..], &self.delimiter) {
            let at = start + i;
            start = at + 1;
            if at > 0 && body[at - 1] != b'\n' {
                continue;
            }
            let after = at + self.delimiter.len();
            for newline in [CRLF, LF] {
                match delimiter_kind(&body[after..], newline) {
                    Delimiter::Next(len) => return Some((Delimiter::Next(after + len), newline)),
                    Delimiter::Close => return Some((Delimiter::Close, newline)),
                    Delimiter::Invalid => {}
                }
            }
        }
        None
    }

    /// Find the delimiter closing the part whose content starts at `from`.
    ///
    /// The delimiter either opens the content or follows a line break that
    /// belongs to it. Returns the end of the content and what the delimiter
    /// line announces.
    fn find_part_end(&self, from: usize) -> Option<(usize, Delimiter)> {
        let body = &self.body[..];
        let mut start = from;
        while let Some(i) = memmem::find(&body[start..], &self.delimiter) {
            let at = start + i;
            start = at + 1;

            let content_end = if at == from {
                from
            } else if at >= from + self.newline.len() && body[..at].ends_with(self.newline) {
                at - self.newline.len()
            } else {
                continue;
            };

            let after = at + self.delimiter.len();
            if !ends_part(&body[after..]) {
                continue;
            }
            let kind = match delimiter_kind(&body[after..], self.newline) {
                Delimiter::Next(len) => Delimiter::Next(after + len),
                other => other,
            };
            return Some((content_end, kind));
        }
        None
    }

    /// Parse the header block at `self.pos`, advancing past its blank line.
    fn read_headers(&mut self) -> Result<Vec<(String, String)>, String> {
        let mut headers: Vec<(String, String)> = Vec::new();
        loop {
            let line_end = memchr(b'\n', &self.body[self.pos..])
                .map(|i| self.pos + i)
                .ok_or_else(|| "unexpected end of part headers".to_string())?;
            let raw = &self.body[self.pos..line_end];
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            let line = String::from_utf8_lossy(raw).into_owned();
            self.pos = line_end + 1;

            if line.is_empty() {
                return Ok(headers);
            }
            if line.starts_with(|c: char| c == ' ' || c == '\t') {
                match headers.last_mut() {
                    Some((_, value)) => {
                        value.push(' ');
                        value.push_str(line.trim());
                        continue;
                    }
                    None => return Err("malformed part header continuation".to_string()),
                }
            }
            match line.split_once(':') {
                Some((name, value)) if !name.trim().is_empty() => {
                    headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()))
                }
                _ => return Err(format!("malformed part header line {line:?}")),
            }
        }
    }
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

/// Filename declared by a part's Content-Disposition, reduced to its last
/// path segment. Unparseable dispositions give an empty name.
fn part_filename(headers: &[(String, String)]) -> String {
    header(headers, "content-disposition")
        .and_then(|value| parse_media_type(value).ok())
        .and_then(|disposition| disposition.param("filename").map(str::to_string))
        .map(|filename| match filename.rsplit_once('/') {
            Some((_, base)) if !base.is_empty() => base.to_string(),
            _ => filename,
        })
        .unwrap_or_default()
}

/// Decode a quoted-printable part body.
///
/// Trailing whitespace on each line is dropped, a trailing `=` joins the line
/// with the next, and hard line breaks are kept as sent.
fn decode_quoted_printable(input: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(input.len());
    for raw in input.split_inclusive(|b| *b == b'\n') {
        let (line, ending) = if let Some(line) = raw.strip_suffix(CRLF) {
            (line, CRLF)
        } else if let Some(line) = raw.strip_suffix(LF) {
            (line, LF)
        } else {
            (raw, &b""[..])
        };
        let kept = line
            .iter()
            .rposition(|b| *b != b' ' && *b != b'\t')
            .map_or(0, |i| i + 1);
        let (line, soft_break) = match line[..kept].strip_suffix(b"=") {
            Some(line) => (line, true),
            None => (&line[..kept], false),
        };

        let mut i = 0;
        while i < line.len() {
            if line[i] == b'=' {
                let byte = line
                    .get(i + 1..i + 3)
                    .and_then(hex_byte)
                    .ok_or_else(|| "invalid quoted-printable escape".to_string())?;
                out.push(byte);
                i += 3;
            } else {
                out.push(line[i]);
                i += 1;
            }
        }
        if !soft_break {
            out.extend_from_slice(ending);
        }
    }
    Ok(out)
}

impl Iterator for MultipartParts {
    type Item = Result<ContentUnit, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.state {
            State::Preamble => match self.find_opening() {
                Some((Delimiter::Next(start), newline)) => {
                    self.pos = start;
                    self.newline = newline;
                    self.state = State::Parts;
                }
                Some(_) => {
                    self.state = State::Done;
                    return None;
                }
                None => return self.fail("no opening boundary found"),
            },
            State::Parts => {}
            State::BadDelimiter => return self.fail("malformed boundary line"),
            State::Done => return None,
        }

        let headers = match self.read_headers() {
            Ok(h) => h,
            Err(detail) => return self.fail(&detail),
        };

        let content_start = self.pos;
        let (content_end, kind) = match self.find_part_end(content_start) {
            Some(found) => found,
            None => return self.fail("unexpected end of body before closing boundary"),
        };

        match kind {
            Delimiter::Next(next) => self.pos = next,
            Delimiter::Close => self.state = State::Done,
            Delimiter::Invalid => self.state = State::BadDelimiter,
        }

        let mut bytes = self.body.slice(content_start..content_end);
        let quoted_printable = header(&headers, "content-transfer-encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("quoted-printable"));
        if quoted_printable {
            match decode_quoted_printable(&bytes) {
                Ok(decoded) => bytes = Bytes::from(decoded),
                Err(detail) => return self.fail(&detail),
            }
        }

        Some(Ok(ContentUnit {
            name: part_filename(&headers),
            media_type: header(&headers, "content-type")
                .unwrap_or_default()
                .to_string(),
            bytes,
        }))
    }
}
