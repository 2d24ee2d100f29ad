//! Ordered, fail-fast scanning of a request's content units.

use crate::classifier::{classify, ScanOutcome};
use crate::error::ScanError;
use crate::icap::{IcapClient, IcapError, IcapResponse};
use crate::partition::ContentUnit;
use async_trait::async_trait;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Submits one content unit to a scanning service.
#[async_trait]
pub trait UnitScanner: Send + Sync {
    /// Scan `unit`, returning the service's raw response.
    async fn scan(&self, unit: &ContentUnit) -> Result<IcapResponse, IcapError>;
}

#[async_trait]
impl UnitScanner for IcapClient {
    async fn scan(&self, unit: &ContentUnit) -> Result<IcapResponse, IcapError> {
        IcapClient::scan(self, unit).await
    }
}

/// Final decision for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestVerdict {
    /// Let the request through untouched.
    Forward,
    /// A unit was not clean.
    Block,
    /// The body could not be scanned; short-circuit with `status`.
    Fail {
        /// HTTP status for the short-circuit response.
        status: u16,
        /// Diagnostic detail, never sent to the client.
        detail: String,
    },
}

impl RequestVerdict {
    /// Failure verdict for a scan error.
    pub fn from_error(err: &ScanError) -> Self {
        RequestVerdict::Fail {
            status: err.status_code(),
            detail: err.to_string(),
        }
    }

    /// Value of the virus-scanned diagnostic header for this verdict.
    pub fn scanned(&self) -> bool {
        !matches!(self, RequestVerdict::Fail { .. })
    }
}

/// Verdict plus how many units reached the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// The request's verdict.
    pub verdict: RequestVerdict,
    /// Units for which a scan attempt was made.
    pub units_scanned: usize,
}

/// Scan `units` in order, stopping at the first unit that is not clean or
/// cannot be scanned.
///
/// An empty sequence forwards without contacting the scanner.
pub async fn scan_units<I, S>(units: I, scanner: &S) -> ScanReport
where
    I: IntoIterator<Item = Result<ContentUnit, ScanError>>,
    S: UnitScanner + ?Sized,
{
    let mut units_scanned = 0;

    for (index, unit) in units.into_iter().enumerate() {
        let unit = match unit {
            Ok(u) => u,
            Err(e) => {
                error!(error = %e, index, "Failed to extract content unit");
                return ScanReport {
                    verdict: RequestVerdict::from_error(&e),
                    units_scanned,
                };
            }
        };

        debug!(
            index,
            name = %unit.name,
            media_type = %unit.media_type,
            size = unit.bytes.len(),
            "Scanning content unit"
        );
        units_scanned += 1;

        let start = Instant::now();
        let outcome = match scanner.scan(&unit).await {
            Ok(response) => classify(response.status, &response.headers),
            Err(e) => ScanOutcome::Error(ScanError::from(e).to_string()),
        };
        let scan_time = start.elapsed();

        match outcome {
            ScanOutcome::Clean => {
                info!(
                    name = %unit.name,
                    scan_time_ms = scan_time.as_millis(),
                    "Clean body/part"
                );
            }
            ScanOutcome::NotClean { infection_signal } => {
                warn!(
                    name = %unit.name,
                    media_type = %unit.media_type,
                    infection_signal,
                    scan_time_ms = scan_time.as_millis(),
                    "Body/part not clean"
                );
                return ScanReport {
                    verdict: RequestVerdict::Block,
                    units_scanned,
                };
            }
            ScanOutcome::Error(detail) => {
                error!(name = %unit.name, error = %detail, "Scan failed");
                return ScanReport {
                    verdict: RequestVerdict::Fail {
                        status: 500,
                        detail,
                    },
                    units_scanned,
                };
            }
        }
    }

    if units_scanned == 0 {
        info!("scanned, nothing to scan");
    }
    ScanReport {
        verdict: RequestVerdict::Forward,
        units_scanned,
    }
}
