//! Content-Type resolution and media type parsing.

use crate::error::ScanError;
use std::collections::HashMap;
use tracing::warn;

/// Request headers as handed over by the host: name to all values.
pub type RequestHeaders = HashMap<String, Vec<String>>;

/// Media type assumed when the request carries no Content-Type.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Effective Content-Type of a request body.
///
/// Header names are matched case-insensitively and the first value is
/// returned verbatim; parameters are left for [`parse_media_type`]. The
/// lowercase `content-type` key wins over other spellings, which are then
/// tried in name order.
pub fn resolve_content_type(headers: &RequestHeaders) -> String {
    let value = headers
        .get("content-type")
        .or_else(|| {
            headers
                .iter()
                .filter(|(name, _)| name.eq_ignore_ascii_case("content-type"))
                .min_by(|a, b| a.0.cmp(b.0))
                .map(|(_, values)| values)
        })
        .and_then(|values| values.first());

    match value {
        Some(v) => v.clone(),
        None => {
            warn!(
                assumed = DEFAULT_CONTENT_TYPE,
                "content-type not set, assuming default"
            );
            DEFAULT_CONTENT_TYPE.to_string()
        }
    }
}

/// A parsed `type/subtype; key=value` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    /// Lowercased essence, e.g. `multipart/form-data`.
    pub essence: String,
    /// Parameters keyed by lowercased name.
    pub params: HashMap<String, String>,
}

impl MediaType {
    /// Parameter lookup by (case-insensitive) name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Whether the essence is any `multipart/*` type.
    pub fn is_multipart(&self) -> bool {
        self.essence.starts_with("multipart/")
    }
}

/// Parse a Content-Type (or Content-Disposition) value.
///
/// The leading token may be `type/subtype` or a bare token such as
/// `form-data`. Parameter values may be tokens or quoted strings. Duplicate
/// parameters are rejected. RFC 2231 extended (`name*=utf-8''..`) and
/// continued (`name*0`, `name*1*`) parameters are decoded into `name`.
pub fn parse_media_type(value: &str) -> Result<MediaType, ScanError> {
    let fail = |reason: &str| ScanError::ContentTypeParse {
        content_type: value.to_string(),
        reason: reason.to_string(),
    };

    let (head, mut rest) = match value.find(';') {
        Some(i) => (&value[..i], &value[i..]),
        None => (value, ""),
    };
    let essence = head.trim().to_ascii_lowercase();
    check_essence(&essence).map_err(fail)?;

    let mut params = HashMap::new();
    let mut extended: HashMap<String, HashMap<String, String>> = HashMap::new();
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        rest = match rest.strip_prefix(';') {
            Some(r) => r.trim_start(),
            None => return Err(fail("expected ';' between parameters")),
        };
        if rest.is_empty() {
            break;
        }

        let key_len = token_len(rest);
        if key_len == 0 {
            return Err(fail("invalid parameter name"));
        }
        let key = rest[..key_len].to_ascii_lowercase();
        rest = rest[key_len..].trim_start();
        rest = rest
            .strip_prefix('=')
            .ok_or_else(|| fail("parameter without value"))?
            .trim_start();

        let (val, remaining) = if rest.starts_with('"') {
            consume_quoted(rest).ok_or_else(|| fail("unterminated quoted string"))?
        } else {
            let len = token_len(rest);
            if len == 0 {
                return Err(fail("empty parameter value"));
            }
            (rest[..len].to_string(), &rest[len..])
        };
        rest = remaining;

        let pieces = match key.split_once('*') {
            Some((base, _)) => extended.entry(base.to_string()).or_default(),
            None => &mut params,
        };
        if pieces.insert(key, val).is_some() {
            return Err(fail("duplicate parameter name"));
        }
    }

    for (base, pieces) in extended {
        if let Some(value) = merge_extended(&base, &pieces) {
            params.insert(base, value);
        }
    }

    Ok(MediaType { essence, params })
}

/// Assemble an RFC 2231 parameter from its pieces.
///
/// A single `name*` value takes precedence over numbered continuations.
/// Values that fail to decode are dropped.
fn merge_extended(base: &str, pieces: &HashMap<String, String>) -> Option<String> {
    if let Some(value) = pieces.get(&format!("{base}*")) {
        return decode_extended(value);
    }

    let mut value = String::new();
    let mut found = false;
    for n in 0.. {
        if let Some(piece) = pieces.get(&format!("{base}*{n}")) {
            value.push_str(piece);
        } else if let Some(piece) = pieces.get(&format!("{base}*{n}*")) {
            let decoded = if n == 0 {
                decode_extended(piece)
            } else {
                percent_decode(piece)
            };
            if let Some(decoded) = decoded {
                value.push_str(&decoded);
            }
        } else {
            break;
        }
        found = true;
    }
    found.then_some(value)
}

/// Decode `charset'language'percent-encoded`; only UTF-8 and US-ASCII.
fn decode_extended(value: &str) -> Option<String> {
    let mut parts = value.splitn(3, '\'');
    let charset = parts.next()?;
    let _language = parts.next()?;
    let encoded = parts.next()?;
    if !(charset.eq_ignore_ascii_case("utf-8") || charset.eq_ignore_ascii_case("us-ascii")) {
        return None;
    }
    percent_decode(encoded)
}

fn percent_decode(value: &str) -> Option<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            out.push(hex_byte(bytes.get(i + 1..i + 3)?)?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Value of two hex digits, either case.
pub(crate) fn hex_byte(hex: &[u8]) -> Option<u8> {
    if hex.len() != 2 || !hex.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    u8::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok()
}

fn check_essence(essence: &str) -> Result<(), &'static str> {
    if essence.is_empty() {
        return Err("no media type");
    }
    let (kind, subtype) = match essence.split_once('/') {
        Some((k, s)) => (k, Some(s)),
        None => (essence, None),
    };
    if token_len(kind) != kind.len() || kind.is_empty() {
        return Err("invalid media type");
    }
    if let Some(subtype) = subtype {
        if subtype.is_empty() || token_len(subtype) != subtype.len() {
            return Err("expected token after '/'");
        }
    }
    Ok(())
}

fn is_token_char(c: char) -> bool {
    c.is_ascii() && !c.is_ascii_control() && !" ()<>@,;:\\\"/[]?=".contains(c)
}

/// Byte length of the token at the start of `s`.
fn token_len(s: &str) -> usize {
    s.find(|c: char| !is_token_char(c)).unwrap_or(s.len())
}

/// Consume a quoted string, returning its unescaped content and the remainder.
fn consume_quoted(s: &str) -> Option<(String, &str)> {
    let mut out = String::new();
    let mut chars = s.char_indices().skip(1);
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Some((out, &s[i + 1..])),
            '\\' => {
                let (_, escaped) = chars.next()?;
                out.push(escaped);
            }
            '\r' | '\n' => return None,
            _ => out.push(c),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &[&str])]) -> RequestHeaders {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_resolve_missing_content_type() {
        let h = headers(&[("host", &["example.com"])]);
        assert_eq!(resolve_content_type(&h), "application/octet-stream");
    }

    #[test]
    fn test_resolve_first_value_verbatim() {
        let h = headers(&[(
            "Content-Type",
            &["multipart/form-data; boundary=xyz", "text/plain"],
        )]);
        assert_eq!(resolve_content_type(&h), "multipart/form-data; boundary=xyz");
    }

    #[test]
    fn test_resolve_empty_value_list() {
        let h = headers(&[("content-type", &[])]);
        assert_eq!(resolve_content_type(&h), DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn test_parse_simple() {
        let mt = parse_media_type("Text/Plain").unwrap();
        assert_eq!(mt.essence, "text/plain");
        assert!(mt.params.is_empty());
        assert!(!mt.is_multipart());
    }

    #[test]
    fn test_parse_params() {
        let mt = parse_media_type(
            "multipart/form-data; Boundary=\"----abc\\\"def\"; charset=utf-8;",
        )
        .unwrap();
        assert!(mt.is_multipart());
        assert_eq!(mt.param("boundary"), Some("----abc\"def"));
        assert_eq!(mt.param("CHARSET"), Some("utf-8"));
    }

    #[test]
    fn test_parse_disposition() {
        let mt = parse_media_type("form-data; name=\"file\"; filename=\"a b.txt\"").unwrap();
        assert_eq!(mt.essence, "form-data");
        assert_eq!(mt.param("filename"), Some("a b.txt"));
    }

    #[test]
    fn test_resolve_prefers_lowercase_key() {
        let h = headers(&[
            ("Content-Type", &["text/plain"]),
            ("content-type", &["application/pdf"]),
            ("CONTENT-TYPE", &["image/png"]),
        ]);
        assert_eq!(resolve_content_type(&h), "application/pdf");

        let h = headers(&[("content-TYPE", &["image/png"]), ("Content-Type", &["text/plain"])]);
        assert_eq!(resolve_content_type(&h), "text/plain");
    }

    #[test]
    fn test_parse_extended_filename() {
        let mt = parse_media_type("form-data; name=\"f\"; filename*=UTF-8''a%20b.txt").unwrap();
        assert_eq!(mt.param("filename"), Some("a b.txt"));

        let mt = parse_media_type(
            "attachment; filename=\"plain.txt\"; filename*=utf-8''caf%C3%A9.txt",
        )
        .unwrap();
        assert_eq!(mt.param("filename"), Some("caf\u{e9}.txt"));
    }

    #[test]
    fn test_parse_continued_filename() {
        let mt = parse_media_type("attachment; filename*0=\"foo\"; filename*1*=%20bar").unwrap();
        assert_eq!(mt.param("filename"), Some("foo bar"));
    }

    #[test]
    fn test_parse_extended_unknown_charset_dropped() {
        let mt = parse_media_type("attachment; filename*=koi8-r''abc").unwrap();
        assert_eq!(mt.param("filename"), None);
    }

    #[test]
    fn test_hex_byte() {
        assert_eq!(hex_byte(b"3D"), Some(b'='));
        assert_eq!(hex_byte(b"c3"), Some(0xc3));
        assert_eq!(hex_byte(b"+1"), None);
        assert_eq!(hex_byte(b"4"), None);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "",
            "text/",
            "/plain",
            "text/plain; charset",
            "text/plain; charset=",
            "text/plain; a=1; a=2",
            "text/plain; name=\"open",
            "text plain",
        ] {
            assert!(
                matches!(parse_media_type(bad), Err(ScanError::ContentTypeParse { .. })),
                "{bad:?} should not parse"
            );
        }
    }
}
