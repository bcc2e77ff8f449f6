use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Full configuration document: a `config` section and a `debug` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub config: ProxyConfig,
    #[serde(default)]
    pub debug: DebugFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Listen address, "host:port".
    pub listen: String,
    /// Implicit TLS on the listener.
    #[serde(default, deserialize_with = "flag")]
    pub ssl: bool,
    /// Certificate and key for the listener (required when ssl is on).
    pub ssl_cert: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,
    /// Upstream directory server, "host" or "host:port". Default port is
    /// 389, or 636 when upstream_ssl is on.
    pub upstream_ldap: String,
    #[serde(default, deserialize_with = "flag")]
    pub upstream_ssl: bool,
    /// Skip upstream certificate verification (lab setups only).
    #[serde(default, deserialize_with = "flag")]
    pub upstream_tls_skip_verify: bool,
    /// Directories scanned for filter module stems at startup.
    pub infilter_dir: Option<PathBuf>,
    pub outfilter_dir: Option<PathBuf>,
    /// Re-encode after every filter invocation; an encode failure then tears
    /// the connection pair down instead of passing the message unchanged.
    #[serde(default, deserialize_with = "flag")]
    pub filtervalidate: bool,
    #[serde(default, deserialize_with = "flag")]
    pub log_syslog: bool,
    #[serde(default = "default_true", deserialize_with = "flag")]
    pub log_stderr: bool,
    pub log_file: Option<PathBuf>,
    #[serde(default, deserialize_with = "flag")]
    pub usecache: bool,
    /// Cache entry lifetime in seconds.
    #[serde(default = "default_cacheexpire")]
    pub cacheexpire: u64,
    /// Enable the YAML attribute overlay on search result entries.
    #[serde(default, deserialize_with = "flag")]
    pub yaml_attributes: bool,
    pub yaml_dir: Option<PathBuf>,
    #[serde(default)]
    pub overlay_prefix: String,
    /// Close a pair after this many seconds without traffic (0 = disabled).
    #[serde(default)]
    pub idletimeout: u64,
}

fn default_true() -> bool {
    true
}

fn default_cacheexpire() -> u64 {
    120
}

/// Log-verbosity knobs. The whole section is hot-reloadable; everything else
/// requires a restart.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DebugFlags {
    #[serde(default, deserialize_with = "flag")]
    pub info: bool,
    #[serde(default, deserialize_with = "flag")]
    pub warn: bool,
    #[serde(default, deserialize_with = "flag")]
    pub err: bool,
    /// Hex-dump frames in both directions.
    #[serde(default, deserialize_with = "flag")]
    pub pkt: bool,
    /// Include bind PDUs (credentials!) in packet dumps.
    #[serde(default, deserialize_with = "flag")]
    pub pktsecure: bool,
    /// Socket lifecycle events.
    #[serde(default, deserialize_with = "flag")]
    pub net: bool,
    /// Cache decisions (lookup outcome, begin/complete).
    #[serde(default, deserialize_with = "flag")]
    pub cache: bool,
    /// Per-response cache appends.
    #[serde(default, deserialize_with = "flag")]
    pub cache2: bool,
    /// Filter pipeline tracing.
    #[serde(default, deserialize_with = "flag")]
    pub filter: bool,
}

/// Accept YAML booleans as well as the 0/1 integers operator configs use.
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }
    match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => Ok(b),
        Flag::Int(i) => Ok(i != 0),
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:1389".to_string(),
            ssl: false,
            ssl_cert: None,
            ssl_key: None,
            upstream_ldap: "127.0.0.1".to_string(),
            upstream_ssl: false,
            upstream_tls_skip_verify: false,
            infilter_dir: None,
            outfilter_dir: None,
            filtervalidate: false,
            log_syslog: false,
            log_stderr: true,
            log_file: None,
            usecache: false,
            cacheexpire: default_cacheexpire(),
            yaml_attributes: false,
            yaml_dir: None,
            overlay_prefix: String::new(),
            idletimeout: 0,
        }
    }
}

impl ProxyConfig {
    /// Upstream address with the scheme-implied default port applied.
    pub fn upstream_addr(&self) -> String {
        if self.upstream_ldap.contains(':') {
            self.upstream_ldap.clone()
        } else {
            let port = if self.upstream_ssl { 636 } else { 389 };
            format!("{}:{}", self.upstream_ldap, port)
        }
    }

    /// Hostname part of upstream_ldap (for TLS server name verification).
    pub fn upstream_host(&self) -> &str {
        match self.upstream_ldap.split_once(':') {
            Some((host, _)) => host,
            None => &self.upstream_ldap,
        }
    }
}
