//! Redirect rule set.
//!
//! A [`RuleSet`] is built once at startup (from `config.json` or through the
//! `with_*` builders) and then shared read-only as `Arc<RuleSet>` by every
//! proxy session. There is no mutation API on a shared rule set.
//!
//! ## Matching rules
//!
//! - `redirect_domains` and `always_ignore_domains` are plain suffixes:
//!   `"mihoyo.com"` matches `"evilnotmihoyo.com"` as well as
//!   `"api.mihoyo.com"`. Use a leading dot (`".mihoyo.com"`) to require a
//!   label boundary.
//! - `always_ignore_domains` always wins over `redirect_domains`.
//! - `force_redirect_on_url_contains` entries are substrings of the URL path.
//! - `block_urls` entries are exact paths.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Rules deciding which traffic is redirected, and where to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuleSet {
    destination_host: String,
    destination_port: u16,
    #[serde(default, rename = "EnableSsl", alias = "EnableTargetSsl")]
    enable_target_ssl: bool,
    #[serde(default)]
    validate_server_certificate: bool,
    #[serde(default)]
    proxy_bind_port: u16,
    #[serde(default)]
    redirect_domains: Vec<String>,
    #[serde(default)]
    always_ignore_domains: Vec<String>,
    #[serde(default)]
    force_redirect_on_url_contains: Vec<String>,
    #[serde(default)]
    block_urls: HashSet<String>,
}

impl RuleSet {
    /// Creates an empty rule set redirecting to `host:port` over plain HTTP.
    pub fn new(destination_host: impl Into<String>, destination_port: u16) -> Self {
        Self {
            destination_host: destination_host.into(),
            destination_port,
            enable_target_ssl: false,
            validate_server_certificate: false,
            proxy_bind_port: 0,
            redirect_domains: Vec::new(),
            always_ignore_domains: Vec::new(),
            force_redirect_on_url_contains: Vec::new(),
            block_urls: HashSet::new(),
        }
    }

    /// Use HTTPS when talking to the destination.
    pub fn with_target_ssl(mut self, enabled: bool) -> Self {
        self.enable_target_ssl = enabled;
        self
    }

    /// Require the destination certificate to pass standard validation.
    pub fn with_server_certificate_validation(mut self, enabled: bool) -> Self {
        self.validate_server_certificate = enabled;
        self
    }

    /// Sets the proxy listening port (0 picks a random free port).
    pub fn with_proxy_bind_port(mut self, port: u16) -> Self {
        self.proxy_bind_port = port;
        self
    }

    /// Adds domain suffixes to redirect.
    pub fn with_redirect_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.redirect_domains
            .extend(domains.into_iter().map(Into::into));
        self
    }

    /// Adds domain suffixes that are never redirected.
    pub fn with_always_ignore_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.always_ignore_domains
            .extend(domains.into_iter().map(Into::into));
        self
    }

    /// Adds path keywords that force a redirect regardless of domain.
    pub fn with_force_redirect_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.force_redirect_on_url_contains
            .extend(keywords.into_iter().map(Into::into));
        self
    }

    /// Adds exact paths answered with a block response once redirected.
    pub fn with_block_urls<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.block_urls.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Redirect destination host.
    pub fn destination_host(&self) -> &str {
        &self.destination_host
    }

    /// Redirect destination port.
    pub fn destination_port(&self) -> u16 {
        self.destination_port
    }

    /// Whether the destination is reached over HTTPS.
    pub fn enable_target_ssl(&self) -> bool {
        self.enable_target_ssl
    }

    /// Scheme used for rewritten requests.
    pub fn target_scheme(&self) -> &'static str {
        if self.enable_target_ssl {
            "https"
        } else {
            "http"
        }
    }

    /// Whether the destination certificate must pass standard validation.
    pub fn validate_server_certificate(&self) -> bool {
        self.validate_server_certificate
    }

    /// Configured proxy port (0 = pick one).
    pub fn proxy_bind_port(&self) -> u16 {
        self.proxy_bind_port
    }

    /// Domain suffixes that trigger redirection.
    pub fn redirect_domains(&self) -> &[String] {
        &self.redirect_domains
    }

    /// Domain suffixes that veto redirection.
    pub fn always_ignore_domains(&self) -> &[String] {
        &self.always_ignore_domains
    }

    /// Path substrings forcing redirection.
    pub fn force_redirect_on_url_contains(&self) -> &[String] {
        &self.force_redirect_on_url_contains
    }

    /// Exact paths that get blocked.
    pub fn block_urls(&self) -> &HashSet<String> {
        &self.block_urls
    }

    /// Checks values that deserialize fine but cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.destination_host.trim().is_empty() {
            return Err(ConfigError::Invalid("DestinationHost must not be empty".into()));
        }
        if self.destination_port == 0 {
            return Err(ConfigError::Invalid("DestinationPort must not be 0".into()));
        }
        Ok(())
    }
}
