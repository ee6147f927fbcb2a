use crate::domain_filter::Blocklist;
use crate::error::{ProxyError, ProxyResult};
use crate::forward::CacheMode;
use crate::resolver::{DomainRule, RewriteTarget};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CACHE_FILE: &str = "proxy_cache.db";
pub const DEFAULT_CACHE_SIZE: usize = 1000;

/// On-disk JSON configuration. Key names follow the long-standing
/// `Config.json` layout so existing files keep working.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    #[serde(rename = "MAX_CACHE_SIZE")]
    pub max_cache_size: Option<usize>,
    #[serde(rename = "CACHE_FILE")]
    pub cache_file: Option<PathBuf>,
    #[serde(rename = "BlockSites")]
    pub block_sites: Vec<String>,
    #[serde(rename = "BlockCaseSensitive")]
    pub block_case_sensitive: Option<bool>,
    #[serde(rename = "CustomDomains")]
    pub custom_domains: Vec<CustomDomainEntry>,
    #[serde(rename = "Revalidate")]
    pub revalidate: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomDomainEntry {
    pub name: String,
    pub to: String,
    pub port: u16,
}

impl FileConfig {
    pub fn load(path: impl AsRef<Path>) -> ProxyResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("cannot read {:?}: {}", path, e)))?;
        let config = Self::parse(&content)
            .map_err(|e| ProxyError::Config(format!("{:?}: {}", path, e)))?;
        tracing::info!("Configuration loaded from {:?}", path);
        Ok(config)
    }

    pub fn parse(content: &str) -> ProxyResult<Self> {
        serde_json::from_str(content).map_err(|e| ProxyError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub path: PathBuf,
    pub max_entries: usize,
}

/// Validated settings shared read-only by every proxy instance.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
    pub instances: usize,
    pub blocklist: Blocklist,
    pub rules: Vec<DomainRule>,
    /// `None` disables caching entirely.
    pub cache: Option<CacheSettings>,
    pub cache_mode: CacheMode,
    pub connect_timeout: Option<Duration>,
    /// Limit on one plain-request exchange with the origin.
    pub upstream_timeout: Option<Duration>,
    /// Limit on a CONNECT tunnel's lifetime.
    pub tunnel_timeout: Option<Duration>,
    /// Upper bound for receiving a complete request head from a client.
    pub request_timeout: Duration,
    pub grace_period: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8100,
            instances: 1,
            blocklist: Blocklist::new(false),
            rules: Vec::new(),
            cache: Some(CacheSettings {
                path: PathBuf::from(DEFAULT_CACHE_FILE),
                max_entries: DEFAULT_CACHE_SIZE,
            }),
            cache_mode: CacheMode::ServeStored,
            connect_timeout: Some(Duration::from_secs(10)),
            upstream_timeout: Some(Duration::from_secs(30)),
            tunnel_timeout: None,
            request_timeout: Duration::from_secs(5),
            grace_period: Duration::from_secs(5),
        }
    }
}

impl ProxySettings {
    /// Merges a file configuration into these settings.
    pub fn apply_file(&mut self, file: FileConfig) -> ProxyResult<()> {
        if let Some(case_sensitive) = file.block_case_sensitive {
            let mut blocklist = Blocklist::new(case_sensitive);
            for entry in self.blocklist.entries() {
                blocklist.add(entry);
            }
            self.blocklist = blocklist;
        }
        for site in &file.block_sites {
            self.blocklist.add(site);
        }

        for entry in file.custom_domains {
            self.rules.push(DomainRule {
                match_prefix: entry.name,
                rewrite_target: RewriteTarget::parse(&entry.to),
                rewrite_port: entry.port,
            });
        }

        if let Some(cache) = self.cache.as_mut() {
            if let Some(size) = file.max_cache_size {
                cache.max_entries = size;
            }
            if let Some(path) = file.cache_file {
                cache.path = path;
            }
        }

        if let Some(revalidate) = file.revalidate {
            self.cache_mode = if revalidate {
                CacheMode::Revalidate
            } else {
                CacheMode::ServeStored
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> ProxyResult<()> {
        if self.instances == 0 {
            return Err(ProxyError::Config("at least one instance is required".into()));
        }
        if usize::from(self.port) + self.instances - 1 > usize::from(u16::MAX) {
            return Err(ProxyError::Config(format!(
                "{} instances starting at port {} exceed the port range",
                self.instances, self.port
            )));
        }
        if let Some(cache) = &self.cache {
            if cache.max_entries == 0 {
                return Err(ProxyError::Config(
                    "cache size must be positive (disable the cache instead)".into(),
                ));
            }
        }
        for rule in &self.rules {
            if rule.match_prefix.trim().is_empty() {
                return Err(ProxyError::Config("custom domain rule with empty name".into()));
            }
            if rule.rewrite_port == 0 {
                return Err(ProxyError::Config(format!(
                    "custom domain rule {:?} has port 0",
                    rule.match_prefix
                )));
            }
            if let RewriteTarget::Host(h) = &rule.rewrite_target {
                if h.is_empty() {
                    return Err(ProxyError::Config(format!(
                        "custom domain rule {:?} has an empty target",
                        rule.match_prefix
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn needs_own_address(&self) -> bool {
        self.rules
            .iter()
            .any(|r| r.rewrite_target == RewriteTarget::OwnAddress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "MAX_CACHE_SIZE": 25,
        "CACHE_FILE": "cache/proxy.db",
        "BlockSites": ["facebook", "tiktok"],
        "CustomDomains": [
            {"name": "site", "to": "0.0.0.0", "port": 3000},
            {"name": "api.internal", "to": "10.0.0.5", "port": 9000}
        ]
    }"#;

    #[test]
    fn test_parse_legacy_layout() {
        let file = FileConfig::parse(SAMPLE).unwrap();
        assert_eq!(file.max_cache_size, Some(25));
        assert_eq!(file.block_sites.len(), 2);
        assert_eq!(file.custom_domains[1].port, 9000);

        let mut settings = ProxySettings::default();
        settings.apply_file(file).unwrap();
        settings.validate().unwrap();

        assert_eq!(
            settings.cache,
            Some(CacheSettings {
                path: PathBuf::from("cache/proxy.db"),
                max_entries: 25
            })
        );
        assert_eq!(settings.rules[0].rewrite_target, RewriteTarget::OwnAddress);
        assert_eq!(
            settings.rules[1].rewrite_target,
            RewriteTarget::Host("10.0.0.5".into())
        );
        assert!(settings.needs_own_address());
        assert!(settings.blocklist.is_blocked("www.TikTok.com"));
    }

    #[test]
    fn test_missing_keys_use_defaults() {
        let file = FileConfig::parse("{}").unwrap();
        let mut settings = ProxySettings::default();
        settings.apply_file(file).unwrap();
        assert_eq!(settings.cache.unwrap().max_entries, DEFAULT_CACHE_SIZE);
        assert_eq!(settings.cache_mode, CacheMode::ServeStored);
        assert!(settings.rules.is_empty());
    }

    #[test]
    fn test_case_sensitive_blocklist_and_revalidate() {
        let file = FileConfig::parse(
            r#"{"BlockSites": ["Tracker"], "BlockCaseSensitive": true, "Revalidate": true}"#,
        )
        .unwrap();
        let mut settings = ProxySettings::default();
        settings.blocklist.add("ads");
        settings.apply_file(file).unwrap();

        assert!(settings.blocklist.is_blocked("Tracker.io"));
        assert!(!settings.blocklist.is_blocked("tracker.io"));
        assert!(settings.blocklist.is_blocked("ads.example"));
        assert_eq!(settings.cache_mode, CacheMode::Revalidate);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        assert!(matches!(
            FileConfig::parse("{\"MAX_CACHE_SIZE\": \"lots\"}"),
            Err(ProxyError::Config(_))
        ));
    }

    #[test]
    fn test_validation() {
        let mut settings = ProxySettings::default();
        settings.cache.as_mut().unwrap().max_entries = 0;
        assert!(settings.validate().is_err());

        let mut settings = ProxySettings::default();
        settings.rules.push(DomainRule {
            match_prefix: "x".into(),
            rewrite_target: RewriteTarget::Host("y".into()),
            rewrite_port: 0,
        });
        assert!(settings.validate().is_err());

        let mut settings = ProxySettings::default();
        settings.port = u16::MAX;
        settings.instances = 2;
        assert!(settings.validate().is_err());

        let mut settings = ProxySettings::default();
        settings.cache = None;
        assert!(settings.validate().is_ok());
    }
}
