//! Virus scan agent for HTTP gateways.
//!
//! Scans request bodies, whole or per multipart part, with an ICAP
//! content-scanning service and decides whether to forward, block or fail
//! the request.

pub mod agent;
pub mod classifier;
pub mod config;
pub mod content_type;
pub mod error;
pub mod host;
pub mod icap;
pub mod orchestrator;
pub mod partition;

pub use agent::{Decision, VirusScanAgent, SCANNED_HEADER};
pub use classifier::{classify, is_infected, ScanOutcome};
pub use config::Config;
pub use content_type::{resolve_content_type, RequestHeaders};
pub use error::ScanError;
pub use host::{BodyError, Host, LocalRequest};
pub use icap::{IcapClient, IcapEndpoint, IcapError, IcapResponse};
pub use orchestrator::{scan_units, RequestVerdict, ScanReport, UnitScanner};
pub use partition::{partition, ContentUnit, ContentUnits};
