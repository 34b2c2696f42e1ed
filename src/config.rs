//! Declarative configuration for peili
//!
//! Loaded once at startup from a YAML file; the endpoint set is fixed for
//! the life of the process. Numeric options use zero-means-default so a
//! partially filled config file behaves like the original deployment
//! defaults.

use crate::error::{PeiliError, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONCURRENCY: usize = 25;
const DEFAULT_MAX_MESSAGE_SIZE: u64 = 10 * 1024 * 1024;
const DEFAULT_INBOX_CAPACITY: usize = 1024;
const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Config {
    /// Ingress listen address; defaults to 0.0.0.0:8080
    #[serde(default)]
    pub listen: Option<SocketAddr>,

    #[serde(default)]
    pub http: HttpOptions,

    #[serde(default)]
    pub queue: QueueOptions,

    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct HttpOptions {
    /// Total deadline for each upstream call, in seconds; 0 means default
    #[serde(default)]
    pub timeout_secs: u64,

    /// Workers per endpoint group; 0 means default
    #[serde(default)]
    pub concurrency: usize,

    /// Skip TLS certificate verification for upstreams.
    ///
    /// Off by default; only enable for mirrors fronting self-signed
    /// upstreams.
    #[serde(default)]
    pub danger_accept_invalid_certs: bool,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct QueueOptions {
    /// Largest accepted request body, in bytes; 0 means default
    #[serde(default)]
    pub max_message_size: u64,

    /// Bound of each pipeline inbox; filling it blocks ingress. 0 means
    /// default
    #[serde(default)]
    pub inbox_capacity: usize,
}

/// One named group of equivalent upstream hosts.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct EndpointConfig {
    pub name: String,
    pub hosts: Vec<String>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| PeiliError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Config = serde_yaml::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Check endpoint structure and host URLs.
    ///
    /// Every host must parse as an absolute http(s) URL; anything else is
    /// fatal at startup, named by endpoint and offending host.
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(PeiliError::Config("no endpoints configured".to_string()));
        }

        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.name.is_empty() {
                return Err(PeiliError::Config("endpoint with empty name".to_string()));
            }
            if !seen.insert(endpoint.name.as_str()) {
                return Err(PeiliError::Config(format!(
                    "duplicate endpoint name '{}'",
                    endpoint.name
                )));
            }
            if endpoint.hosts.is_empty() {
                return Err(PeiliError::Config(format!(
                    "endpoint '{}' has no hosts",
                    endpoint.name
                )));
            }
            for host in &endpoint.hosts {
                if !is_valid_host_url(host) {
                    return Err(PeiliError::Config(format!(
                        "({}) [{}] is not a valid endpoint url",
                        endpoint.name, host
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn listen(&self) -> SocketAddr {
        self.listen.unwrap_or_else(|| {
            DEFAULT_LISTEN
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)))
        })
    }

    pub fn timeout(&self) -> Duration {
        let secs = if self.http.timeout_secs == 0 {
            DEFAULT_TIMEOUT_SECS
        } else {
            self.http.timeout_secs
        };
        Duration::from_secs(secs)
    }

    pub fn concurrency(&self) -> usize {
        if self.http.concurrency == 0 {
            DEFAULT_CONCURRENCY
        } else {
            self.http.concurrency
        }
    }

    pub fn max_message_size(&self) -> u64 {
        if self.queue.max_message_size == 0 {
            DEFAULT_MAX_MESSAGE_SIZE
        } else {
            self.queue.max_message_size
        }
    }

    pub fn inbox_capacity(&self) -> usize {
        if self.queue.inbox_capacity == 0 {
            DEFAULT_INBOX_CAPACITY
        } else {
            self.queue.inbox_capacity
        }
    }
}

fn is_valid_host_url(s: &str) -> bool {
    match url::Url::parse(s) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");
        tmp
    }

    #[test]
    fn test_full_config_parses() {
        let yaml = r#"
            listen: 127.0.0.1:9000
            http:
                timeout_secs: 5
                concurrency: 4
            queue:
                max_message_size: 1024
            endpoints:
                - name: audit
                  hosts: [http://127.0.0.1:18080]
                - name: mirror
                  hosts: [https://mirror-a.internal, https://mirror-b.internal]
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        assert_eq!(config.listen(), "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.concurrency(), 4);
        assert_eq!(config.max_message_size(), 1024);
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[1].hosts.len(), 2);
    }

    #[test]
    fn test_zero_means_default() {
        let yaml = r#"
            endpoints:
                - name: a
                  hosts: [http://localhost:1]
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert_eq!(config.concurrency(), 25);
        assert_eq!(config.max_message_size(), 10 * 1024 * 1024);
        assert_eq!(config.inbox_capacity(), 1024);
        assert!(!config.http.danger_accept_invalid_certs);
    }

    #[test]
    fn test_empty_endpoints_rejected() {
        let tmp = write_tmp_file("endpoints: []");
        let err = Config::from_file(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("no endpoints"));
    }

    #[test]
    fn test_invalid_host_names_endpoint_and_host() {
        let yaml = r#"
            endpoints:
                - name: audit
                  hosts: ["127.0.0.1:80"]
            "#;
        let tmp = write_tmp_file(yaml);
        let err = Config::from_file(tmp.path()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("audit"));
        assert!(msg.contains("127.0.0.1:80"));
    }

    #[test]
    fn test_bad_scheme_rejected() {
        let yaml = r#"
            endpoints:
                - name: a
                  hosts: ["ftp://files.internal"]
            "#;
        let tmp = write_tmp_file(yaml);
        assert!(Config::from_file(tmp.path()).is_err());
    }

    #[test]
    fn test_duplicate_endpoint_name_rejected() {
        let yaml = r#"
            endpoints:
                - name: a
                  hosts: [http://h1:1]
                - name: a
                  hosts: [http://h2:1]
            "#;
        let tmp = write_tmp_file(yaml);
        let err = Config::from_file(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_empty_hosts_rejected() {
        let yaml = r#"
            endpoints:
                - name: a
                  hosts: []
            "#;
        let tmp = write_tmp_file(yaml);
        let err = Config::from_file(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("no hosts"));
    }
}
