//! Page-url referer checks

use crate::error::AuthError;

/// Host part of a page url
///
/// `http://www.example.com:8080/player.html` gives `www.example.com`.
fn page_host(page_url: &str) -> Option<&str> {
    let (_, rest) = page_url.split_once("://")?;
    let authority = rest.split('/').next().unwrap_or(rest);
    let host = authority.split(':').next().unwrap_or(authority);
    (!host.is_empty()).then_some(host)
}

/// Whether `host` is `domain` or one of its subdomains
fn host_matches(host: &str, domain: &str) -> bool {
    let domain = domain.trim_start_matches('.');
    !domain.is_empty()
        && host
            .strip_suffix(domain)
            .is_some_and(|rest| rest.is_empty() || rest.ends_with('.'))
}

/// Check `page_url` against allowed domains
///
/// The page host must be one of the domains or a subdomain of one. An empty
/// list allows everything.
pub fn check(page_url: &str, domains: &[String]) -> Result<(), AuthError> {
    if domains.is_empty() {
        return Ok(());
    }

    let allowed = page_host(page_url)
        .is_some_and(|host| domains.iter().any(|domain| host_matches(host, domain)));

    if allowed {
        Ok(())
    } else {
        tracing::warn!(page_url = %page_url, domains = ?domains, "Referer denied");
        Err(AuthError::RefererDenied(page_url.to_string()))
    }
}
