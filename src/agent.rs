//! Virus scan agent: turns a request into a forward/block/fail decision.

use crate::config::Config;
use crate::content_type::{resolve_content_type, RequestHeaders};
use crate::error::ScanError;
use crate::host::{BodyError, Host};
use crate::icap::{IcapClient, IcapEndpoint, IcapError};
use crate::orchestrator::{scan_units, RequestVerdict, ScanReport};
use crate::partition::partition;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Response header reporting whether the body was scanned.
pub const SCANNED_HEADER: &str = "X-Kong-Virus-Scanned";

/// Outcome of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// What the host should do with the request.
    pub verdict: RequestVerdict,
    /// Value for [`SCANNED_HEADER`].
    pub scanned: bool,
    /// Units that reached the scanner.
    pub units_scanned: usize,
}

impl Decision {
    fn failed(err: &ScanError) -> Self {
        Self {
            verdict: RequestVerdict::from_error(err),
            scanned: false,
            units_scanned: 0,
        }
    }
}

impl From<ScanReport> for Decision {
    fn from(report: ScanReport) -> Self {
        Self {
            scanned: report.verdict.scanned(),
            verdict: report.verdict,
            units_scanned: report.units_scanned,
        }
    }
}

/// Virus scan agent.
///
/// Holds only read-only configuration; each evaluation builds its own ICAP
/// client, so one agent can serve concurrent requests.
#[derive(Debug, Clone)]
pub struct VirusScanAgent {
    config: Arc<Config>,
    endpoint: IcapEndpoint,
}

impl VirusScanAgent {
    /// Create a new agent, validating the scanner URL.
    pub fn new(config: Config) -> Result<Self, IcapError> {
        let endpoint = IcapEndpoint::parse(&config.scanner.url)?;

        info!(
            scanner = %endpoint.url(),
            timeout_ms = config.scanner.timeout_ms,
            "Virus scan agent initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            endpoint,
        })
    }

    /// Agent configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn client(&self) -> IcapClient {
        IcapClient::new(
            self.endpoint.clone(),
            self.config.scanner.timeout_ms,
            self.config.scanner.debug,
        )
    }

    /// Decide what to do with a request given its headers and body.
    pub async fn evaluate(
        &self,
        headers: &RequestHeaders,
        body: Result<Bytes, BodyError>,
    ) -> Decision {
        let content_type = resolve_content_type(headers);
        debug!(content_type = %content_type, "Request content type");

        let body = match body {
            Ok(b) => b,
            Err(BodyError::TooLarge) => {
                warn!("Failed to process request because it was too large");
                return Decision::failed(&ScanError::BodyTooLarge);
            }
            Err(BodyError::Other(msg)) => {
                error!(error = %msg, "Failed to read request body");
                return Decision::failed(&ScanError::BodyRead(msg));
            }
        };

        let units = match partition(body, &content_type) {
            Ok(units) => units,
            Err(e) => {
                error!(error = %e, content_type = %content_type, "Failed to partition body");
                return Decision::failed(&e);
            }
        };

        let client = self.client();
        scan_units(units, &client).await.into()
    }

    /// Evaluate the host's current request and apply the decision to it.
    pub async fn on_access<H: Host>(&self, host: &mut H) -> Decision {
        info!("Start processing request");

        let decision = match host.request_headers() {
            Ok(headers) => self.evaluate(&headers, host.raw_body()).await,
            Err(e) => {
                error!(error = %e, "Failed to read request headers");
                Decision::failed(&ScanError::BodyRead(e.0))
            }
        };

        host.set_response_header(SCANNED_HEADER, if decision.scanned { "true" } else { "false" });

        match &decision.verdict {
            RequestVerdict::Forward => {
                info!(units = decision.units_scanned, "Finished processing request, no virus detected");
            }
            RequestVerdict::Block => {
                warn!(units = decision.units_scanned, "Detected a virus");
                host.exit(400, "", HashMap::new());
            }
            RequestVerdict::Fail { status, detail } => {
                error!(status, error = %detail, "Finished processing request, scan failed");
                host.exit(*status, "", HashMap::new());
            }
        }

        decision
    }
}
