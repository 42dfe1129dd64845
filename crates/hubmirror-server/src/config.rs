//! Server configuration.
//!
//! Scalar knobs come from CLI flags (with `HUBMIRROR_*` env fallbacks);
//! the optional `--config` JSON file supplies the same fields plus the
//! proxy/cache rule lists. CLI values win over file values.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

use hubmirror_cache::{parse_size_limit, CleanStrategy};

use crate::rules::{RuleConfig, RuleList};

#[derive(Debug, Parser)]
#[command(name = "hubmirror", about = "Caching mirror for a HuggingFace-compatible hub")]
pub struct Args {
    /// Optional JSON config file; CLI flags override its fields.
    #[arg(long, env = "HUBMIRROR_CONFIG")]
    pub config: Option<PathBuf>,
    #[arg(long, env = "HUBMIRROR_HOST")]
    pub host: Option<String>,
    #[arg(long, env = "HUBMIRROR_PORT")]
    pub port: Option<u16>,
    #[arg(long = "ssl-key", env = "HUBMIRROR_SSL_KEY")]
    pub ssl_key: Option<PathBuf>,
    #[arg(long = "ssl-cert", env = "HUBMIRROR_SSL_CERT")]
    pub ssl_cert: Option<PathBuf>,
    #[arg(long = "repos-path", env = "HUBMIRROR_REPOS_PATH")]
    pub repos_path: Option<PathBuf>,
    /// Total cache size cap, e.g. `500G`. Unset disables eviction.
    #[arg(long = "cache-size-limit", env = "HUBMIRROR_CACHE_SIZE_LIMIT")]
    pub cache_size_limit: Option<String>,
    /// One of LRU, FIFO, LARGE_FIRST.
    #[arg(long = "cache-clean-strategy", env = "HUBMIRROR_CACHE_CLEAN_STRATEGY")]
    pub cache_clean_strategy: Option<String>,
    #[arg(long = "hf-scheme", env = "HUBMIRROR_HF_SCHEME")]
    pub hf_scheme: Option<String>,
    #[arg(long = "hf-netloc", env = "HUBMIRROR_HF_NETLOC")]
    pub hf_netloc: Option<String>,
    #[arg(long = "hf-lfs-netloc", env = "HUBMIRROR_HF_LFS_NETLOC")]
    pub hf_lfs_netloc: Option<String>,
    #[arg(long = "mirror-scheme", env = "HUBMIRROR_MIRROR_SCHEME")]
    pub mirror_scheme: Option<String>,
    #[arg(long = "mirror-netloc", env = "HUBMIRROR_MIRROR_NETLOC")]
    pub mirror_netloc: Option<String>,
    #[arg(long = "mirror-lfs-netloc", env = "HUBMIRROR_MIRROR_LFS_NETLOC")]
    pub mirror_lfs_netloc: Option<String>,
    /// Serve exclusively from the local cache.
    #[arg(long, env = "HUBMIRROR_OFFLINE")]
    pub offline: bool,
}

/// The JSON config file; every field optional, same names as the flags.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ssl_key: Option<PathBuf>,
    pub ssl_cert: Option<PathBuf>,
    pub repos_path: Option<PathBuf>,
    pub cache_size_limit: Option<String>,
    pub cache_clean_strategy: Option<String>,
    pub hf_scheme: Option<String>,
    pub hf_netloc: Option<String>,
    pub hf_lfs_netloc: Option<String>,
    pub mirror_scheme: Option<String>,
    pub mirror_netloc: Option<String>,
    pub mirror_lfs_netloc: Option<String>,
    pub offline: Option<bool>,
    pub proxy: Option<Vec<RuleConfig>>,
    pub cache: Option<Vec<RuleConfig>>,
    pub mirrors_path: Option<Vec<PathBuf>>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid rule pattern: {0}")]
    Rule(#[from] regex::Error),
    #[error("invalid cache-size-limit: {0}")]
    BadSizeLimit(String),
    #[error("invalid cache-clean-strategy: {0}")]
    BadStrategy(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub ssl_key: Option<PathBuf>,
    pub ssl_cert: Option<PathBuf>,
    pub repos_path: PathBuf,
    pub cache_size_limit: Option<u64>,
    pub cache_clean_strategy: CleanStrategy,
    pub hf_scheme: String,
    pub hf_netloc: String,
    pub hf_lfs_netloc: String,
    pub mirror_scheme: String,
    pub mirror_netloc: String,
    pub mirror_lfs_netloc: String,
    pub offline: bool,
    pub proxy_rules: RuleList,
    pub cache_rules: RuleList,
    /// Roots of local bare mirrors; accepted for compatibility, the
    /// mirror fallback itself is served by an external collaborator.
    pub mirrors_path: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8090,
            ssl_key: None,
            ssl_cert: None,
            repos_path: PathBuf::from("./repos"),
            cache_size_limit: None,
            cache_clean_strategy: CleanStrategy::Lru,
            hf_scheme: "https".to_string(),
            hf_netloc: "huggingface.co".to_string(),
            hf_lfs_netloc: "cdn-lfs.huggingface.co".to_string(),
            mirror_scheme: "http".to_string(),
            mirror_netloc: "localhost:8090".to_string(),
            mirror_lfs_netloc: "localhost:8090".to_string(),
            offline: false,
            proxy_rules: RuleList::allow_all(),
            cache_rules: RuleList::allow_all(),
            mirrors_path: Vec::new(),
        }
    }
}

fn is_specific_addr(host: &str) -> bool {
    !matches!(host, "0.0.0.0" | "::")
}

impl Config {
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => serde_json::from_slice(&std::fs::read(path)?)?,
            None => FileConfig::default(),
        };
        Self::resolve(args, file)
    }

    pub fn resolve(args: &Args, file: FileConfig) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let host = args
            .host
            .clone()
            .or(file.host)
            .unwrap_or(defaults.host);
        let port = args.port.or(file.port).unwrap_or(defaults.port);
        let ssl_key = args.ssl_key.clone().or(file.ssl_key);
        let ssl_cert = args.ssl_cert.clone().or(file.ssl_cert);

        let mirror_scheme = args
            .mirror_scheme
            .clone()
            .or(file.mirror_scheme)
            .unwrap_or_else(|| if ssl_key.is_some() { "https" } else { "http" }.to_string());
        let default_mirror_netloc = format!(
            "{}:{}",
            if is_specific_addr(&host) { host.as_str() } else { "localhost" },
            port
        );
        let mirror_netloc = args
            .mirror_netloc
            .clone()
            .or(file.mirror_netloc)
            .unwrap_or_else(|| default_mirror_netloc.clone());
        let mirror_lfs_netloc = args
            .mirror_lfs_netloc
            .clone()
            .or(file.mirror_lfs_netloc)
            .unwrap_or(default_mirror_netloc);

        let cache_size_limit = match args.cache_size_limit.clone().or(file.cache_size_limit) {
            Some(raw) => Some(
                parse_size_limit(&raw).ok_or(ConfigError::BadSizeLimit(raw))?,
            ),
            None => None,
        };
        let cache_clean_strategy = match args
            .cache_clean_strategy
            .clone()
            .or(file.cache_clean_strategy)
        {
            Some(raw) => raw.parse().map_err(ConfigError::BadStrategy)?,
            None => defaults.cache_clean_strategy,
        };

        let proxy_rules = match &file.proxy {
            Some(configs) => RuleList::from_configs(configs)?,
            None => RuleList::allow_all(),
        };
        let cache_rules = match &file.cache {
            Some(configs) => RuleList::from_configs(configs)?,
            None => RuleList::allow_all(),
        };

        Ok(Self {
            host,
            port,
            ssl_key,
            ssl_cert,
            repos_path: args
                .repos_path
                .clone()
                .or(file.repos_path)
                .unwrap_or(defaults.repos_path),
            cache_size_limit,
            cache_clean_strategy,
            hf_scheme: args
                .hf_scheme
                .clone()
                .or(file.hf_scheme)
                .unwrap_or(defaults.hf_scheme),
            hf_netloc: args
                .hf_netloc
                .clone()
                .or(file.hf_netloc)
                .unwrap_or(defaults.hf_netloc),
            hf_lfs_netloc: args
                .hf_lfs_netloc
                .clone()
                .or(file.hf_lfs_netloc)
                .unwrap_or(defaults.hf_lfs_netloc),
            mirror_scheme,
            mirror_netloc,
            mirror_lfs_netloc,
            offline: args.offline || file.offline.unwrap_or(false),
            proxy_rules,
            cache_rules,
            mirrors_path: file.mirrors_path.unwrap_or_default(),
        })
    }

    pub fn hf_url_base(&self) -> String {
        format!("{}://{}", self.hf_scheme, self.hf_netloc)
    }

    pub fn hf_lfs_url_base(&self) -> String {
        format!("{}://{}", self.hf_scheme, self.hf_lfs_netloc)
    }

    pub fn mirror_url_base(&self) -> String {
        format!("{}://{}", self.mirror_scheme, self.mirror_netloc)
    }

    pub fn mirror_lfs_url_base(&self) -> String {
        format!("{}://{}", self.mirror_scheme, self.mirror_lfs_netloc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_args() -> Args {
        Args {
            config: None,
            host: None,
            port: None,
            ssl_key: None,
            ssl_cert: None,
            repos_path: None,
            cache_size_limit: None,
            cache_clean_strategy: None,
            hf_scheme: None,
            hf_netloc: None,
            hf_lfs_netloc: None,
            mirror_scheme: None,
            mirror_netloc: None,
            mirror_lfs_netloc: None,
            offline: false,
        }
    }

    #[test]
    fn defaults_match_the_upstream_hub() {
        let config = Config::resolve(&bare_args(), FileConfig::default()).unwrap();
        assert_eq!(config.port, 8090);
        assert_eq!(config.hf_url_base(), "https://huggingface.co");
        assert_eq!(config.hf_lfs_url_base(), "https://cdn-lfs.huggingface.co");
        assert_eq!(config.mirror_url_base(), "http://localhost:8090");
        assert!(config.proxy_rules.allow("openai/gpt2"));
        assert!(config.cache_rules.allow("gpt2"));
        assert!(!config.offline);
    }

    #[test]
    fn cli_overrides_file_overrides_defaults() {
        let file: FileConfig = serde_json::from_str(
            r#"{
                "port": 9000,
                "hf-netloc": "hub.example",
                "cache-size-limit": "4K",
                "cache-clean-strategy": "LARGE_FIRST",
                "proxy": [{"repo": "allowed/*", "allow": true}]
            }"#,
        )
        .unwrap();
        let mut args = bare_args();
        args.port = Some(9100);
        let config = Config::resolve(&args, file).unwrap();

        assert_eq!(config.port, 9100);
        assert_eq!(config.hf_netloc, "hub.example");
        assert_eq!(config.cache_size_limit, Some(4096));
        assert_eq!(
            config.cache_clean_strategy,
            hubmirror_cache::CleanStrategy::LargeFirst
        );
        assert!(config.proxy_rules.allow("allowed/model"));
        assert!(!config.proxy_rules.allow("denied/model"));
        // Cache rules were not configured and stay allow-all.
        assert!(config.cache_rules.allow("denied/model"));
    }

    #[test]
    fn wildcard_bind_addr_maps_mirror_netloc_to_localhost() {
        let mut args = bare_args();
        args.host = Some("0.0.0.0".to_string());
        args.port = Some(8090);
        let config = Config::resolve(&args, FileConfig::default()).unwrap();
        assert_eq!(config.mirror_netloc, "localhost:8090");
    }

    #[test]
    fn bad_values_are_rejected() {
        let mut args = bare_args();
        args.cache_size_limit = Some("huge".to_string());
        assert!(matches!(
            Config::resolve(&args, FileConfig::default()),
            Err(ConfigError::BadSizeLimit(_))
        ));

        let mut args = bare_args();
        args.cache_clean_strategy = Some("NEWEST".to_string());
        assert!(matches!(
            Config::resolve(&args, FileConfig::default()),
            Err(ConfigError::BadStrategy(_))
        ));
    }
}
