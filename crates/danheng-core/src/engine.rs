//! Traffic decision engine.
//!
//! Pure predicates over a shared [`RuleSet`]. Nothing here performs IO or
//! holds mutable state, so a single engine can be cloned into every proxy
//! session.
//!
//! ## Evaluation Order
//!
//! 1. `always_ignore_domains` suffix match - never redirect
//! 2. `redirect_domains` suffix match, or a `force_redirect_on_url_contains`
//!    keyword in the path - redirect
//! 3. Only for redirected requests: exact `block_urls` match - block
//! 4. Default pass through

use std::sync::Arc;

use url::Url;

use crate::error::RewriteError;
use crate::rules::RuleSet;
use crate::trust::{certificate_trust, CertificateTrust, CertificateValidation};

/// Outcome of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Forward the request unmodified.
    PassThrough,
    /// Forward the request to the rewritten URL.
    Redirect {
        /// Rewritten absolute URL.
        target: String,
    },
    /// Answer with a block response instead of forwarding.
    Block {
        /// The path that matched `block_urls`.
        path: String,
    },
}

impl Decision {
    /// Returns a human-readable name for this decision.
    pub fn name(&self) -> &'static str {
        match self {
            Decision::PassThrough => "PassThrough",
            Decision::Redirect { .. } => "Redirect",
            Decision::Block { .. } => "Block",
        }
    }
}

/// Evaluates requests against a shared rule set.
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    rules: Arc<RuleSet>,
}

impl DecisionEngine {
    /// Creates an engine over the given rules.
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self { rules }
    }

    /// Returns the rule set this engine reads.
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Returns whether requests to `hostname` should be redirected.
    ///
    /// A trailing `:port` is ignored. Ignore rules are checked first and win.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use danheng_core::{DecisionEngine, RuleSet};
    ///
    /// let rules = RuleSet::new("127.0.0.1", 21000)
    ///     .with_redirect_domains([".mihoyo.com"])
    ///     .with_always_ignore_domains(["update.mihoyo.com"]);
    /// let engine = DecisionEngine::new(Arc::new(rules));
    ///
    /// assert!(engine.should_redirect("api.mihoyo.com:443"));
    /// assert!(!engine.should_redirect("update.mihoyo.com"));
    /// assert!(!engine.should_redirect("example.com"));
    /// ```
    pub fn should_redirect(&self, hostname: &str) -> bool {
        let host = strip_port(hostname);

        if self
            .rules
            .always_ignore_domains()
            .iter()
            .any(|domain| host.ends_with(domain.as_str()))
        {
            return false;
        }

        self.rules
            .redirect_domains()
            .iter()
            .any(|domain| host.ends_with(domain.as_str()))
    }

    /// Returns whether `path` contains one of the force-redirect keywords.
    pub fn should_force_redirect(&self, path: &str) -> bool {
        self.rules
            .force_redirect_on_url_contains()
            .iter()
            .any(|keyword| path.contains(keyword.as_str()))
    }

    /// Returns whether `path` is one of the blocked paths.
    ///
    /// The comparison is on the raw path: dot segments are not removed, so
    /// `/x/../log` does not match a `/log` rule.
    pub fn should_block(&self, path: &str) -> bool {
        self.rules.block_urls().contains(path)
    }

    /// Decides whether a tunnel to `hostname` must be decrypted.
    ///
    /// Only redirect candidates are unwrapped; every other tunnel stays
    /// opaque end to end.
    pub fn should_decrypt_tunnel(&self, hostname: &str) -> bool {
        self.should_redirect(hostname)
    }

    /// Applies the certificate-trust gate to an upstream validation outcome.
    pub fn certificate_trust(&self, validation: &CertificateValidation) -> CertificateTrust {
        certificate_trust(self.rules.validate_server_certificate(), validation)
    }

    /// Rewrites the scheme and authority of `original_url` to the destination.
    ///
    /// Everything after the authority (path, query, fragment) is copied
    /// verbatim. The port is omitted when it is the scheme default.
    pub fn build_redirect_target(&self, original_url: &str) -> Result<String, RewriteError> {
        Url::parse(original_url).map_err(|e| RewriteError::InvalidUrl {
            url: original_url.to_string(),
            reason: e.to_string(),
        })?;

        let tail = url_tail(original_url)
            .ok_or_else(|| RewriteError::MissingAuthority(original_url.to_string()))?;

        let scheme = self.rules.target_scheme();
        let target = format!("{}://{}{}", scheme, self.target_authority(), tail);

        match Url::parse(&target) {
            Ok(parsed) if parsed.has_host() => Ok(target),
            Ok(_) => Err(RewriteError::InvalidTarget {
                target,
                reason: "no host".into(),
            }),
            Err(e) => Err(RewriteError::InvalidTarget {
                reason: e.to_string(),
                target,
            }),
        }
    }

    /// Authority of the destination as it appears in rewritten URLs.
    pub fn target_authority(&self) -> String {
        let host = self.rules.destination_host();
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };

        let port = self.rules.destination_port();
        match (self.rules.target_scheme(), port) {
            ("http", 80) | ("https", 443) => host,
            _ => format!("{}:{}", host, port),
        }
    }

    /// Evaluates one request.
    ///
    /// `hostname` and `path` are the request's host and URL path, `url` the
    /// absolute request URL used for the rewrite.
    pub fn decide(&self, hostname: &str, path: &str, url: &str) -> Result<Decision, RewriteError> {
        if !self.should_redirect(hostname) && !self.should_force_redirect(path) {
            return Ok(Decision::PassThrough);
        }

        let target = self.build_redirect_target(url)?;
        let target_path = url_path(&target);

        if self.should_block(target_path) {
            return Ok(Decision::Block {
                path: target_path.to_string(),
            });
        }

        Ok(Decision::Redirect { target })
    }
}

/// Removes a trailing `:port` from a host or authority.
///
/// Bracketed IPv6 literals keep their brackets. Strings with more than one
/// colon outside brackets are returned unchanged.
pub fn strip_port(hostname: &str) -> &str {
    if hostname.starts_with('[') {
        return match hostname.find(']') {
            Some(end) => &hostname[..=end],
            None => hostname,
        };
    }

    match hostname.split_once(':') {
        Some((host, port))
            if !port.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            host
        }
        _ => hostname,
    }
}

/// Everything after `scheme://authority`, verbatim.
fn url_tail(url: &str) -> Option<&str> {
    let (_, rest) = url.split_once("://")?;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    Some(&rest[end..])
}

/// Raw path component of an absolute URL.
fn url_path(url: &str) -> &str {
    let tail = url_tail(url).unwrap_or("");
    let end = tail.find(['?', '#']).unwrap_or(tail.len());
    &tail[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(rules: RuleSet) -> DecisionEngine {
        DecisionEngine::new(Arc::new(rules))
    }

    fn mihoyo() -> DecisionEngine {
        engine(
            RuleSet::new("127.0.0.1", 21000)
                .with_redirect_domains([".mihoyo.com", ".hoyoverse.com"])
                .with_always_ignore_domains(["update.mihoyo.com"])
                .with_force_redirect_keywords(["/sdk/"])
                .with_block_urls(["/log/report"]),
        )
    }

    // ==================== should_redirect ====================

    #[test]
    fn redirects_matching_suffix() {
        assert!(mihoyo().should_redirect("api.mihoyo.com"));
        assert!(mihoyo().should_redirect("sdk.hoyoverse.com"));
    }

    #[test]
    fn ignore_list_wins() {
        assert!(!mihoyo().should_redirect("update.mihoyo.com"));
        assert!(!mihoyo().should_redirect("cdn.update.mihoyo.com"));
    }

    #[test]
    fn ignore_list_wins_even_when_identical_to_redirect_rule() {
        let engine = engine(
            RuleSet::new("h", 1)
                .with_redirect_domains(["example.com"])
                .with_always_ignore_domains(["example.com"]),
        );
        assert!(!engine.should_redirect("example.com"));
        assert!(!engine.should_redirect("www.example.com"));
    }

    #[test]
    fn unmatched_host_passes() {
        assert!(!mihoyo().should_redirect("cdn.example.com"));
    }

    #[test]
    fn port_is_stripped_before_matching() {
        assert!(mihoyo().should_redirect("api.mihoyo.com:443"));
        assert!(!mihoyo().should_redirect("update.mihoyo.com:443"));
    }

    #[test]
    fn matching_is_plain_suffix() {
        let engine = engine(RuleSet::new("h", 1).with_redirect_domains(["mihoyo.com"]));
        assert!(engine.should_redirect("mihoyo.com"));
        assert!(engine.should_redirect("evilnotmihoyo.com"));
    }

    #[test]
    fn leading_dot_rule_does_not_match_bare_domain() {
        assert!(!mihoyo().should_redirect("mihoyo.com"));
    }

    #[test]
    fn matching_is_case_sensitive() {
        assert!(!mihoyo().should_redirect("API.MIHOYO.COM"));
    }

    #[test]
    fn malformed_hosts_are_matched_literally() {
        let engine = engine(RuleSet::new("h", 1).with_redirect_domains(["host"]));
        assert!(engine.should_redirect("localhost"));
        assert!(!engine.should_redirect(""));

        let catch_all = DecisionEngine::new(Arc::new(RuleSet::new("h", 1).with_redirect_domains([""])));
        assert!(catch_all.should_redirect(""));
        assert!(catch_all.should_redirect("anything"));
    }

    #[test]
    fn empty_rules_never_redirect() {
        let engine = engine(RuleSet::new("h", 1));
        assert!(!engine.should_redirect("api.mihoyo.com"));
        assert!(!engine.should_force_redirect("/sdk/login"));
        assert!(!engine.should_block("/log/report"));
    }

    // ==================== strip_port ====================

    #[test]
    fn strip_port_variants() {
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
        assert_eq!(strip_port("::1"), "::1");
        assert_eq!(strip_port("example.com:https"), "example.com:https");
        assert_eq!(strip_port(""), "");
    }

    // ==================== should_force_redirect / should_block ====================

    #[test]
    fn force_redirect_on_substring() {
        assert!(mihoyo().should_force_redirect("/api/sdk/login"));
        assert!(!mihoyo().should_force_redirect("/api/sdklogin"));
    }

    #[test]
    fn block_requires_exact_path() {
        assert!(mihoyo().should_block("/log/report"));
        assert!(!mihoyo().should_block("/log/report/"));
        assert!(!mihoyo().should_block("/log"));
        assert!(!mihoyo().should_block("/api/log/report"));
        assert!(!mihoyo().should_block("/x/../log/report"));
    }

    // ==================== tunnel gate ====================

    #[test]
    fn decrypts_only_redirect_candidates() {
        assert!(mihoyo().should_decrypt_tunnel("api.mihoyo.com:443"));
        assert!(!mihoyo().should_decrypt_tunnel("update.mihoyo.com:443"));
        assert!(!mihoyo().should_decrypt_tunnel("cdn.example.com:443"));
    }

    // ==================== build_redirect_target ====================

    #[test]
    fn rewrite_replaces_authority_only() {
        let target = mihoyo()
            .build_redirect_target("https://api.mihoyo.com/query_dispatch?version=CNPRODWin2.0.0&t=1#top")
            .unwrap();
        assert_eq!(
            target,
            "http://127.0.0.1:21000/query_dispatch?version=CNPRODWin2.0.0&t=1#top"
        );
    }

    #[test]
    fn rewrite_keeps_tail_bytes_verbatim() {
        let target = mihoyo()
            .build_redirect_target("http://api.mihoyo.com:8080/a/../b%2Fc?q=%20x&&y")
            .unwrap();
        assert_eq!(target, "http://127.0.0.1:21000/a/../b%2Fc?q=%20x&&y");
    }

    #[test]
    fn rewrite_without_path() {
        let target = mihoyo().build_redirect_target("http://api.mihoyo.com").unwrap();
        assert_eq!(target, "http://127.0.0.1:21000");

        let target = mihoyo().build_redirect_target("http://api.mihoyo.com?x=1").unwrap();
        assert_eq!(target, "http://127.0.0.1:21000?x=1");
    }

    #[test]
    fn rewrite_uses_https_and_drops_default_port() {
        let engine = engine(RuleSet::new("ps.example.net", 443).with_target_ssl(true));
        let target = engine.build_redirect_target("http://api.mihoyo.com/x").unwrap();
        assert_eq!(target, "https://ps.example.net/x");

        let engine = self::engine(RuleSet::new("ps.example.net", 80));
        let target = engine.build_redirect_target("https://api.mihoyo.com/x").unwrap();
        assert_eq!(target, "http://ps.example.net/x");
    }

    #[test]
    fn rewrite_keeps_non_default_https_port() {
        let engine = engine(RuleSet::new("ps.example.net", 8443).with_target_ssl(true));
        let target = engine.build_redirect_target("http://api.mihoyo.com/x").unwrap();
        assert_eq!(target, "https://ps.example.net:8443/x");
    }

    #[test]
    fn rewrite_brackets_ipv6_destination() {
        let engine = engine(RuleSet::new("::1", 21000));
        let target = engine.build_redirect_target("http://api.mihoyo.com/x").unwrap();
        assert_eq!(target, "http://[::1]:21000/x");
    }

    #[test]
    fn rewrite_drops_userinfo() {
        let target = mihoyo()
            .build_redirect_target("http://user:pw@api.mihoyo.com/x")
            .unwrap();
        assert_eq!(target, "http://127.0.0.1:21000/x");
    }

    #[test]
    fn rewrite_rejects_malformed_url() {
        let err = mihoyo().build_redirect_target("not a url").unwrap_err();
        assert!(matches!(err, RewriteError::InvalidUrl { .. }));

        let err = mihoyo().build_redirect_target("/relative/path").unwrap_err();
        assert!(matches!(err, RewriteError::InvalidUrl { .. }));
    }

    #[test]
    fn rewrite_rejects_url_without_authority() {
        let err = mihoyo().build_redirect_target("http:api.mihoyo.com/x").unwrap_err();
        assert!(matches!(err, RewriteError::MissingAuthority(_)));
    }

    #[test]
    fn rewrite_rejects_invalid_destination() {
        let engine = engine(RuleSet::new("bad host", 21000));
        let err = engine.build_redirect_target("http://api.mihoyo.com/x").unwrap_err();
        assert!(matches!(err, RewriteError::InvalidTarget { .. }));
    }

    // ==================== decide ====================

    #[test]
    fn decide_redirects_matching_domain() {
        let decision = mihoyo()
            .decide("api.mihoyo.com", "/query", "https://api.mihoyo.com/query")
            .unwrap();
        assert_eq!(
            decision,
            Decision::Redirect {
                target: "http://127.0.0.1:21000/query".into()
            }
        );
    }

    #[test]
    fn decide_passes_ignored_domain() {
        let decision = mihoyo()
            .decide("update.mihoyo.com", "/pkg", "https://update.mihoyo.com/pkg")
            .unwrap();
        assert_eq!(decision, Decision::PassThrough);
    }

    #[test]
    fn decide_force_redirects_on_keyword() {
        let decision = mihoyo()
            .decide("cdn.example.com", "/api/sdk/login", "https://cdn.example.com/api/sdk/login")
            .unwrap();
        assert_eq!(decision.name(), "Redirect");
    }

    #[test]
    fn decide_force_redirect_beats_ignore_list() {
        let decision = mihoyo()
            .decide("update.mihoyo.com", "/sdk/x", "https://update.mihoyo.com/sdk/x")
            .unwrap();
        assert_eq!(decision.name(), "Redirect");
    }

    #[test]
    fn decide_blocks_redirected_path() {
        let decision = mihoyo()
            .decide("log.mihoyo.com", "/log/report", "https://log.mihoyo.com/log/report?id=3")
            .unwrap();
        assert_eq!(
            decision,
            Decision::Block {
                path: "/log/report".into()
            }
        );
    }

    #[test]
    fn decide_never_blocks_unredirected_path() {
        let decision = mihoyo()
            .decide("cdn.example.com", "/log/report", "https://cdn.example.com/log/report")
            .unwrap();
        assert_eq!(decision, Decision::PassThrough);
    }

    #[test]
    fn decide_surfaces_rewrite_errors() {
        assert!(mihoyo().decide("api.mihoyo.com", "/x", "garbage").is_err());
    }

    #[test]
    fn force_redirect_without_domain_rules() {
        let engine = engine(RuleSet::new("h", 1).with_force_redirect_keywords(["/sdk/"]));
        assert!(!engine.should_redirect("api.mihoyo.com"));
        let decision = engine
            .decide("api.mihoyo.com", "/sdk/a", "http://api.mihoyo.com/sdk/a")
            .unwrap();
        assert_eq!(decision, Decision::Redirect { target: "http://h:1/sdk/a".into() });
    }

    // ==================== certificate gate ====================

    #[test]
    fn certificate_gate_follows_rules() {
        let lenient = mihoyo();
        let strict = engine(RuleSet::new("h", 1).with_server_certificate_validation(true));
        let broken = CertificateValidation::Invalid("UnknownIssuer".into());

        assert_eq!(lenient.certificate_trust(&broken), CertificateTrust::Trusted);
        assert_eq!(strict.certificate_trust(&broken), CertificateTrust::Untrusted);
        assert_eq!(
            strict.certificate_trust(&CertificateValidation::Valid),
            CertificateTrust::Trusted
        );
    }
}
