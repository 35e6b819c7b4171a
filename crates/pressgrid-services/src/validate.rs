//! Input normalization and derived names.

use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{ServiceError, ServiceResult};

static SLUG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").expect("slug pattern compiles"));

/// Trimmed, non-empty display name.
pub fn normalize_name(name: &str) -> ServiceResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ServiceError::InvalidInput("name is required".into()));
    }
    Ok(name.to_string())
}

/// Trimmed, lowercased slug matching `^[a-z0-9]+(-[a-z0-9]+)*$`.
pub fn normalize_slug(slug: &str) -> ServiceResult<String> {
    let slug = slug.trim().to_lowercase();
    if slug.is_empty() {
        return Err(ServiceError::InvalidInput("slug is required".into()));
    }
    if !SLUG_RE.is_match(&slug) {
        return Err(ServiceError::InvalidInput(format!("invalid slug: {slug}")));
    }
    Ok(slug)
}

/// Trimmed, lowercased DNS hostname suitable for a custom domain.
pub fn normalize_hostname(hostname: &str) -> ServiceResult<String> {
    let host = hostname.trim().to_lowercase();
    let invalid = |why: &str| Err(ServiceError::InvalidInput(format!("invalid hostname {host:?}: {why}")));

    if host.is_empty() {
        return invalid("empty");
    }
    if host.chars().any(char::is_whitespace) {
        return invalid("contains whitespace");
    }
    if host.parse::<IpAddr>().is_ok() {
        return invalid("ip literal");
    }
    if !host.contains('.') {
        return invalid("not fully qualified");
    }
    if host.len() > 253 {
        return invalid("longer than 253 characters");
    }
    for label in host.split('.') {
        if label.is_empty() || label.len() > 63 {
            return invalid("label length must be 1..63");
        }
        if label.starts_with('-') || label.ends_with('-') {
            return invalid("label starts or ends with '-'");
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return invalid("label has invalid characters");
        }
    }
    Ok(host)
}

/// First eight characters of an id, used as a DNS label.
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// `http://<id8>.<dash-ip>.sslip.io`
pub fn sslip_preview_url(environment_id: &str, public_ip: &str) -> String {
    let dashed: String = public_ip
        .trim()
        .chars()
        .map(|c| if c == '.' || c == ':' { '-' } else { c })
        .collect();
    format!("http://{}.{dashed}.sslip.io", short_id(environment_id))
}

/// Host part of an `http(s)://host[:port][/path]` URL.
pub fn url_host(url: &str) -> Option<&str> {
    let rest = url.trim();
    let rest = rest
        .strip_prefix("https://")
        .or_else(|| rest.strip_prefix("http://"))?;
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.rsplit('@').next()?;
    let host = host.split(':').next()?;
    (!host.is_empty()).then_some(host)
}

/// Accept only absolute http(s) URLs with a host.
pub fn require_http_url(url: &str) -> ServiceResult<String> {
    let url = url.trim();
    match url_host(url) {
        Some(_) => Ok(url.to_string()),
        None => Err(ServiceError::InvalidInput(format!("not an http(s) url: {url:?}"))),
    }
}
