//! Egress guard for the `http.request` tool: scheme and method checks,
//! private/reserved address blocking, cloud metadata endpoint blocking, and
//! domain allow/deny lists.
//!
//! The address check is best-effort on the literal host: raw IPs are matched
//! against the reserved tables, hostnames are not resolved here (a DNS
//! lookup would be slow and TOCTOU-prone; unroutable answers fail at the
//! connector anyway). Metadata hostnames are blocked by name as well.

use crate::config::HttpConfig;
use crate::error::ToolError;
use ipnet::IpNet;
use once_cell::sync::Lazy;
use std::net::IpAddr;
use url::Url;

static PRIVATE_NETWORKS: Lazy<Vec<IpNet>> = Lazy::new(|| {
    [
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "127.0.0.0/8",
        "::1/128",
        "fc00::/7",
        "fe80::/10",
        "100.64.0.0/10",
        "0.0.0.0/8",
        "169.254.0.0/16",
        "192.0.0.0/24",
        "192.0.2.0/24",
        "198.18.0.0/15",
        "198.51.100.0/24",
        "203.0.113.0/24",
        "240.0.0.0/4",
        "255.255.255.255/32",
    ]
    .iter()
    .map(|net| net.parse().expect("static CIDR"))
    .collect()
});

const METADATA_HOSTNAMES: &[&str] = &[
    "169.254.169.254",
    "metadata.google.internal",
    "169.254.170.2",
];

pub const ALLOWED_METHODS: &[&str] =
    &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

fn is_private_ip(host: &str) -> bool {
    match host.parse::<IpAddr>() {
        Ok(addr) => PRIVATE_NETWORKS.iter().any(|net| net.contains(&addr)),
        Err(_) => false,
    }
}

/// Exact match or `*.example.com` wildcard; a bare `example.com` pattern
/// also covers its subdomains, matching the configured-domain convention.
fn domain_matches(host: &str, pattern: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let pattern = pattern.trim_start_matches("*.");
    let host = host.to_ascii_lowercase();
    host == pattern || host.ends_with(&format!(".{pattern}"))
}

pub fn check_method(method: &str) -> Result<String, ToolError> {
    let upper = method.to_ascii_uppercase();
    if ALLOWED_METHODS.contains(&upper.as_str()) {
        Ok(upper)
    } else {
        Err(ToolError::invalid(format!(
            "HTTP method '{upper}' is not allowed. Allowed methods: {}",
            ALLOWED_METHODS.join(", ")
        )))
    }
}

/// Validate a URL against the egress rules. Returns the parsed URL so the
/// caller does not re-parse.
pub fn check_url(raw_url: &str, cfg: &HttpConfig) -> Result<Url, ToolError> {
    let url = Url::parse(raw_url)
        .map_err(|e| ToolError::invalid(format!("Invalid URL '{raw_url}': {e}")))?;
    let scheme = url.scheme().to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return Err(ToolError::security(format!(
            "Unsupported scheme '{scheme}'. Only http and https are allowed."
        )));
    }
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    // IPv6 hosts come back bracketed; strip so the address parse sees them.
    let host = host
        .trim_end_matches('.')
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();

    if cfg.block_metadata_endpoints && METADATA_HOSTNAMES.contains(&host.as_str()) {
        return Err(ToolError::security(format!(
            "Requests to '{host}' are blocked. Cloud metadata endpoints are not allowed."
        )));
    }
    if cfg.block_private_ips && is_private_ip(&host) {
        return Err(ToolError::security(format!(
            "Requests to private/reserved IP address '{host}' are blocked (SSRF protection)."
        )));
    }
    if !cfg.allow_domains.is_empty()
        && !cfg
            .allow_domains
            .iter()
            .any(|pattern| domain_matches(&host, pattern))
    {
        return Err(ToolError::blocked(format!(
            "Domain '{host}' is not in the allowlist. Allowed domains: {}",
            cfg.allow_domains.join(", ")
        )));
    }
    if cfg
        .block_domains
        .iter()
        .any(|pattern| domain_matches(&host, pattern))
    {
        return Err(ToolError::blocked(format!(
            "Domain '{host}' is blocked by policy."
        )));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostbridge_protocol::ErrorKind;

    fn cfg() -> HttpConfig {
        HttpConfig::default()
    }

    #[test]
    fn private_and_metadata_addresses_are_rejected() {
        for url in [
            "http://127.0.0.1/",
            "http://10.0.0.1/x",
            "http://192.168.1.1:8080/",
            "http://169.254.169.254/latest/meta-data/",
            "http://[::1]/",
        ] {
            let err = check_url(url, &cfg()).unwrap_err();
            assert_eq!(err.kind, ErrorKind::Security, "{url}");
        }
        let err = check_url("http://metadata.google.internal/computeMetadata", &cfg())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Security);
    }

    #[test]
    fn public_hosts_pass_by_default() {
        check_url("https://example.com/api", &cfg()).unwrap();
        check_url("http://8.8.8.8/", &cfg()).unwrap();
    }

    #[test]
    fn disabling_protection_allows_private_ips() {
        let mut c = cfg();
        c.block_private_ips = false;
        check_url("http://127.0.0.1:9000/", &c).unwrap();
        // Metadata hostnames are still governed by their own flag.
        let err = check_url("http://169.254.169.254/", &c).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Security);
    }

    #[test]
    fn scheme_restriction() {
        let err = check_url("ftp://example.com/file", &cfg()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Security);
        let err = check_url("file:///etc/passwd", &cfg()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Security);
    }

    #[test]
    fn allowlist_limits_domains() {
        let mut c = cfg();
        c.allow_domains = vec!["*.example.com".into(), "api.test.io".into()];
        check_url("https://sub.example.com/x", &c).unwrap();
        check_url("https://api.test.io/x", &c).unwrap();
        let err = check_url("https://other.org/", &c).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Blocked);
    }

    #[test]
    fn blocklist_applies_after_allowlist() {
        let mut c = cfg();
        c.allow_domains = vec!["example.com".into()];
        c.block_domains = vec!["bad.example.com".into()];
        check_url("https://good.example.com/", &c).unwrap();
        let err = check_url("https://bad.example.com/", &c).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Blocked);
    }

    #[test]
    fn method_allowlist() {
        assert_eq!(check_method("get").unwrap(), "GET");
        assert!(check_method("TRACE").is_err());
        assert!(check_method("CONNECT").is_err());
    }
}
