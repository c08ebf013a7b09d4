// src/utils/security.rs

//! Input validation for storage keys and outbound image URLs.

use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::IpNet;
use thiserror::Error;

/// Longest key accepted by the storage layer.
const MAX_KEY_LEN: usize = 200;

/// Reasons a key or URL is refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    #[error("invalid key '{0}': {1}")]
    InvalidKey(String, &'static str),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("scheme '{0}' not allowed")]
    DisallowedScheme(String),

    #[error("URL has no host")]
    NoHost,

    #[error("host '{0}' is blocked")]
    BlockedHost(String),

    #[error("address {0} is in a blocked range")]
    BlockedAddress(String),

    #[error("DNS resolution failed: {0}")]
    DnsResolution(String),
}

/// Check a storage key against the safe character set.
///
/// Keys are rejected rather than rewritten: a key that needs rewriting is
/// either a bug or an injection attempt.
pub fn sanitize_key(key: &str) -> Result<&str, SecurityError> {
    let reject = |why| Err(SecurityError::InvalidKey(key.to_string(), why));

    if key.is_empty() {
        return reject("empty");
    }
    if key.len() > MAX_KEY_LEN {
        return reject("too long");
    }
    if key.contains("..") {
        return reject("traversal sequence");
    }
    if key.starts_with('.') {
        return reject("leading dot");
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return reject("unsafe character");
    }
    Ok(key)
}

/// SSRF policy for image fetches.
///
/// Refuses non-HTTP schemes, loopback and private hosts, link-local ranges and
/// cloud metadata addresses.
#[derive(Debug, Clone)]
pub struct UrlValidator {
    allowed_schemes: HashSet<String>,
    blocked_hosts: HashSet<String>,
    blocked_cidrs: Vec<IpNet>,
    allowed_hosts: HashSet<String>,
}

impl Default for UrlValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl UrlValidator {
    pub fn new() -> Self {
        let blocked_cidrs = [
            "127.0.0.0/8",
            "10.0.0.0/8",
            "172.16.0.0/12",
            "192.168.0.0/16",
            "169.254.0.0/16",
            "100.64.0.0/10",
            "0.0.0.0/8",
            "::1/128",
            "fc00::/7",
            "fe80::/10",
        ]
        .iter()
        .filter_map(|cidr| cidr.parse().ok())
        .collect();

        Self {
            allowed_schemes: ["http", "https"].into_iter().map(String::from).collect(),
            blocked_hosts: [
                "localhost",
                "0.0.0.0",
                "metadata.google.internal",
                "instance-data",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            blocked_cidrs,
            allowed_hosts: HashSet::new(),
        }
    }

    /// Exempt a host from the host and address checks.
    pub fn allow_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts.insert(host.into().to_lowercase());
        self
    }

    /// Normalize a protocol-relative URL to https.
    pub fn normalize(url: &str) -> String {
        let url = url.trim();
        if url.starts_with("//") {
            format!("https:{url}")
        } else {
            url.to_string()
        }
    }

    /// Validate a URL without network access.
    pub fn validate(&self, url: &str) -> Result<url::Url, SecurityError> {
        let parsed =
            url::Url::parse(url).map_err(|e| SecurityError::InvalidUrl(e.to_string()))?;

        if !self.allowed_schemes.contains(parsed.scheme()) {
            return Err(SecurityError::DisallowedScheme(parsed.scheme().to_string()));
        }

        let host = match parsed.host() {
            // "localhost." names the same host as "localhost"
            Some(url::Host::Domain(d)) => d.trim_end_matches('.').to_lowercase(),
            Some(url::Host::Ipv4(ip)) => ip.to_string(),
            Some(url::Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(SecurityError::NoHost),
        };

        if self.allowed_hosts.contains(&host) {
            return Ok(parsed);
        }
        if self.blocked_hosts.contains(&host) || host.ends_with(".localhost") {
            return Err(SecurityError::BlockedHost(host));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            self.check_address(ip)?;
        }
        Ok(parsed)
    }

    /// Validate a URL and check every address its hostname resolves to.
    ///
    /// Catches hostnames pointing at internal addresses. The HTTP client
    /// resolves the name again when it connects, so a record that changes
    /// between the two lookups is not caught here; the redirect policy and
    /// response size limit still apply to whatever answers.
    pub async fn validate_with_dns(&self, url: &str) -> Result<url::Url, SecurityError> {
        let parsed = self.validate(url)?;

        let Some(url::Host::Domain(domain)) = parsed.host() else {
            return Ok(parsed);
        };
        if self
            .allowed_hosts
            .contains(&domain.trim_end_matches('.').to_lowercase())
        {
            return Ok(parsed);
        }

        let port = parsed.port_or_known_default().unwrap_or(443);
        let addrs = tokio::net::lookup_host((domain, port))
            .await
            .map_err(|e| SecurityError::DnsResolution(e.to_string()))?;

        for addr in addrs {
            self.check_address(addr.ip())?;
        }
        Ok(parsed)
    }

    fn check_address(&self, ip: IpAddr) -> Result<(), SecurityError> {
        // IPv4-mapped IPv6 addresses are checked as IPv4.
        let ip = match ip {
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map(IpAddr::V4)
                .unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        };
        if self.blocked_cidrs.iter().any(|cidr| cidr.contains(&ip)) {
            return Err(SecurityError::BlockedAddress(ip.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_accepts_plain_names() {
        assert!(sanitize_key("events.json").is_ok());
        assert!(sanitize_key("cache-torch.json").is_ok());
        assert!(sanitize_key("0a1b2c_x").is_ok());
    }

    #[test]
    fn test_sanitize_rejects_unsafe_keys() {
        assert!(sanitize_key("").is_err());
        assert!(sanitize_key("../secret").is_err());
        assert!(sanitize_key("a/b").is_err());
        assert!(sanitize_key("a\\b").is_err());
        assert!(sanitize_key(".status").is_err());
        assert!(sanitize_key("name with space").is_err());
        assert!(sanitize_key("x%2e").is_err());
        assert!(sanitize_key(&"a".repeat(201)).is_err());
    }

    #[test]
    fn test_rejects_private_and_loopback_targets() {
        let validator = UrlValidator::new();
        for url in [
            "http://127.0.0.1/pic.jpg",
            "http://10.0.0.5/pic.jpg",
            "http://192.168.1.1/pic.jpg",
            "http://169.254.169.254/latest/meta-data",
            "http://localhost/pic.jpg",
            "http://172.20.0.1/pic.jpg",
            "http://[::1]/pic.jpg",
            "http://[fe80::1]/pic.jpg",
            "http://[::ffff:127.0.0.1]/pic.jpg",
            "http://100.64.0.1/pic.jpg",
            "http://100.127.255.254/pic.jpg",
            "http://0.1.2.3/pic.jpg",
            "http://localhost./pic.jpg",
            "http://LOCALHOST../pic.jpg",
            "http://metadata.google.internal./computeMetadata/v1/",
        ] {
            assert!(validator.validate(url).is_err(), "{url} should be rejected");
        }
    }

    #[test]
    fn test_rejects_other_schemes() {
        let validator = UrlValidator::new();
        assert_eq!(
            validator.validate("file:///etc/passwd").unwrap_err(),
            SecurityError::DisallowedScheme("file".to_string())
        );
        assert!(validator.validate("ftp://example.com/x.jpg").is_err());
        assert!(validator.validate("not a url").is_err());
    }

    #[test]
    fn test_accepts_public_url() {
        let validator = UrlValidator::new();
        assert!(validator.validate("https://example.com/pic.jpg").is_ok());
        assert!(validator.validate("http://172.32.0.1/pic.jpg").is_ok());
        assert!(validator.validate("http://100.128.0.1/pic.jpg").is_ok());
        assert!(validator.validate("https://example.com./pic.jpg").is_ok());
    }

    #[test]
    fn test_allow_host_bypasses_checks() {
        let validator = UrlValidator::new().allow_host("127.0.0.1");
        assert!(validator.validate("http://127.0.0.1:8080/pic.jpg").is_ok());
    }

    #[tokio::test]
    async fn test_dns_check_rejects_names_resolving_to_loopback() {
        let mut validator = UrlValidator::new();
        // Let the name through the static check so only resolution can stop it
        validator.blocked_hosts.clear();
        assert!(validator.validate("http://localhost/pic.jpg").is_ok());

        let err = validator
            .validate_with_dns("http://localhost/pic.jpg")
            .await
            .unwrap_err();
        assert!(
            matches!(err, SecurityError::BlockedAddress(_)),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn test_dns_check_skips_literal_and_allowed_hosts() {
        let validator = UrlValidator::new().allow_host("localhost");
        assert!(validator
            .validate_with_dns("http://localhost:9/pic.jpg")
            .await
            .is_ok());
        assert!(UrlValidator::new()
            .validate_with_dns("http://93.184.216.34/pic.jpg")
            .await
            .is_ok());
    }

    #[test]
    fn test_normalize_protocol_relative() {
        assert_eq!(
            UrlValidator::normalize("//cdn.example.com/a.png"),
            "https://cdn.example.com/a.png"
        );
        assert_eq!(
            UrlValidator::normalize("https://cdn.example.com/a.png"),
            "https://cdn.example.com/a.png"
        );
    }
}
