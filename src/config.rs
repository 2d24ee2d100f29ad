//! Configuration types for the virus scan agent.

use crate::icap::IcapEndpoint;
use serde::{Deserialize, Serialize};

/// Root configuration for the virus scan agent.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// ICAP scanner configuration.
    pub scanner: ScannerConfig,

    /// Body handling configuration.
    #[serde(default)]
    pub body: BodyConfig,
}

/// ICAP scanner configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScannerConfig {
    /// Scanner endpoint, e.g. `icap://localhost:1344/avscan`.
    pub url: String,

    /// Timeout for each ICAP call in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Log raw ICAP request and response heads.
    #[serde(default)]
    pub debug: bool,
}

/// Body handling configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BodyConfig {
    /// Largest body the local host buffers (bytes).
    #[serde(default = "default_max_size")]
    pub max_size: usize,
}

impl Default for BodyConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
        }
    }
}

fn default_max_size() -> usize {
    8_388_608 // 8MB
}

fn default_timeout() -> u64 {
    15000 // 15 seconds
}

impl Config {
    /// Configuration for `url` with every other setting at its default.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            scanner: ScannerConfig {
                url: url.into(),
                timeout_ms: default_timeout(),
                debug: false,
            },
            body: BodyConfig::default(),
        }
    }

    /// Load configuration from a YAML file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env_vars(&content);
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        IcapEndpoint::parse(&self.scanner.url)?;

        if self.scanner.timeout_ms == 0 {
            anyhow::bail!("scanner.timeout_ms must be greater than 0");
        }

        if self.body.max_size == 0 {
            anyhow::bail!("body.max_size must be greater than 0");
        }

        Ok(())
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# Virus Scan Agent Configuration

# ICAP scanning service
scanner:
  url: "icap://localhost:1344/avscan"
  timeout_ms: 15000            # per OPTIONS / RESPMOD call
  debug: false                 # log raw ICAP heads

# Body handling
body:
  max_size: 8388608            # 8MB, larger bodies are rejected with 413
"#
        .to_string()
    }
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };

    re.replace_all(content, |cap: &regex::Captures| {
        std::env::var(&cap[1]).unwrap_or_default()
    })
    .into_owned()
}
