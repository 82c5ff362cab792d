//! Secure-origin policy for worker registration.
//!
//! Scripts and scopes must be served over HTTPS unless the script comes from a
//! trusted local host (`localhost`, loopback addresses, `*.localhost`, plus
//! anything configured).

use url::{Host, Url};

use crate::error::{Result, ServiceWorkerError};

/// Schemes that count as secure transport.
const SECURE_SCHEMES: &[&str] = &["https"];

#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    trusted_hosts: Vec<String>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::new(vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
            "::1".to_string(),
        ])
    }
}

impl SecurityPolicy {
    pub fn new(trusted_hosts: Vec<String>) -> Self {
        Self {
            trusted_hosts: trusted_hosts
                .into_iter()
                .map(|h| h.trim_matches(|c| c == '[' || c == ']').to_ascii_lowercase())
                .collect(),
        }
    }

    /// Is `url` served from a trusted local origin?
    pub fn is_trusted_local(&self, url: &Url) -> bool {
        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_ascii_lowercase(),
            Some(Host::Ipv4(addr)) => {
                if addr.is_loopback() {
                    return true;
                }
                addr.to_string()
            }
            Some(Host::Ipv6(addr)) => {
                if addr.is_loopback() {
                    return true;
                }
                addr.to_string()
            }
            None => return false,
        };

        host.ends_with(".localhost") || self.trusted_hosts.iter().any(|h| *h == host)
    }

    fn is_secure_scheme(url: &Url) -> bool {
        SECURE_SCHEMES.contains(&url.scheme())
    }

    /// Check a script URL and scope before anything is persisted.
    pub fn check(&self, url: &Url, scope: &Url) -> Result<()> {
        if self.is_trusted_local(url) {
            return Ok(());
        }

        if !Self::is_secure_scheme(url) {
            return Err(ServiceWorkerError::policy(format!(
                "script {} must be served over HTTPS",
                url
            )));
        }

        if !Self::is_secure_scheme(scope) {
            return Err(ServiceWorkerError::policy(format!(
                "scope {} must be HTTPS",
                scope
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_https_is_allowed() {
        let policy = SecurityPolicy::default();
        assert!(policy
            .check(&url("https://example.com/sw.js"), &url("https://example.com/"))
            .is_ok());
    }

    #[test]
    fn test_http_script_is_rejected() {
        let policy = SecurityPolicy::default();
        let result = policy.check(&url("http://example.com/sw.js"), &url("https://example.com/"));
        assert!(matches!(result, Err(ServiceWorkerError::PolicyViolation(_))));
    }

    #[test]
    fn test_http_scope_is_rejected() {
        let policy = SecurityPolicy::default();
        let result = policy.check(&url("https://example.com/sw.js"), &url("http://example.com/"));
        assert!(matches!(result, Err(ServiceWorkerError::PolicyViolation(_))));
    }

    #[test]
    fn test_localhost_may_use_http() {
        let policy = SecurityPolicy::default();
        assert!(policy
            .check(&url("http://localhost:8080/sw.js"), &url("http://localhost:8080/"))
            .is_ok());
        assert!(policy
            .check(&url("http://127.0.0.1/sw.js"), &url("http://127.0.0.1/"))
            .is_ok());
        assert!(policy
            .check(&url("http://[::1]/sw.js"), &url("http://[::1]/"))
            .is_ok());
        assert!(policy
            .check(&url("http://app.localhost/sw.js"), &url("http://app.localhost/"))
            .is_ok());
    }

    #[test]
    fn test_configured_host_is_trusted() {
        let policy = SecurityPolicy::new(vec!["dev.internal".to_string()]);
        assert!(policy
            .check(&url("http://dev.internal/sw.js"), &url("http://dev.internal/"))
            .is_ok());
        assert!(!policy.is_trusted_local(&url("http://example.com/")));
    }
}
