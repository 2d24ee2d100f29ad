//! Infection verdicts from ICAP response heads.

use http::HeaderMap;
use tracing::debug;

/// Status the scanner returns when it left the content untouched.
pub const NO_CONTENT: u16 = 204;

/// Result of scanning one content unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The scanner did not modify the content.
    Clean,
    /// The scanner answered with anything but 204.
    NotClean {
        /// Whether one of the known infection headers was set.
        infection_signal: bool,
    },
    /// The unit could not be scanned.
    Error(String),
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// Whether any vendor infection header reports a finding.
///
/// Recognised headers:
/// - `X-Infection-Found` with any non-empty value
/// - `X-Virus-ID` with a non-empty value other than `no threats`
/// - `X-FSecure-Scan-Result` exactly `infected`
pub fn is_infected(headers: &HeaderMap) -> bool {
    let infection_found = header(headers, "x-infection-found");
    debug!(value = %infection_found, "X-Infection-Found");
    if !infection_found.is_empty() {
        return true;
    }

    let virus_id = header(headers, "x-virus-id");
    debug!(value = %virus_id, "X-Virus-ID");
    if !virus_id.is_empty() && virus_id != "no threats" {
        return true;
    }

    let fsecure = header(headers, "x-fsecure-scan-result");
    debug!(value = %fsecure, "X-FSecure-Scan-Result");
    fsecure == "infected"
}

/// Classify a RESPMOD response.
///
/// Only 204 counts as clean. Every other status is `NotClean` whether or not
/// an infection header is present; the signal is carried for logging.
pub fn classify(status: u16, headers: &HeaderMap) -> ScanOutcome {
    if status == NO_CONTENT {
        return ScanOutcome::Clean;
    }
    ScanOutcome::NotClean {
        infection_signal: is_infected(headers),
    }
}
