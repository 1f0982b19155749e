//! Endpoint URL validation
//!
//! Every collaborator endpoint (token minting, SDP handshake, tool proxy)
//! receives a bearer credential or conversation content, so the URLs are
//! checked before any request is built:
//! - Scheme must be HTTPS, except for loopback hosts used in development
//! - A host is required
//! - Credentials embedded in the URL are rejected

use std::net::IpAddr;
use thiserror::Error;
use tracing::warn;
use url::{Host, Url};

/// Errors that can occur during URL validation
#[derive(Debug, Error)]
pub enum UrlValidationError {
    #[error("Invalid URL format: {0}")]
    InvalidFormat(#[from] url::ParseError),

    #[error("URL scheme must be HTTPS, got: {0}")]
    HttpsRequired(String),

    #[error("URL must have a host")]
    MissingHost,

    #[error("URL must not embed credentials")]
    EmbeddedCredentials,
}

/// Whether the parsed host points at the local machine.
pub fn is_loopback_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(domain) => domain.eq_ignore_ascii_case("localhost"),
        Host::Ipv4(ip) => IpAddr::V4(*ip).is_loopback(),
        Host::Ipv6(ip) => IpAddr::V6(*ip).is_loopback(),
    }
}

/// Validate a collaborator endpoint and return the parsed URL.
///
/// # Example
/// ```rust
/// use waav_voice_session::utils::url_validation::validate_endpoint_url;
///
/// assert!(validate_endpoint_url("https://api.example.com/v1/realtime").is_ok());
/// assert!(validate_endpoint_url("http://localhost:3000/api/session").is_ok());
/// assert!(validate_endpoint_url("http://api.example.com/v1/realtime").is_err());
/// ```
pub fn validate_endpoint_url(url: &str) -> Result<Url, UrlValidationError> {
    let parsed = Url::parse(url)?;

    let host = parsed.host().ok_or(UrlValidationError::MissingHost)?;

    if !parsed.username().is_empty() || parsed.password().is_some() {
        warn!(url = %parsed.host_str().unwrap_or_default(), "Endpoint URL embeds credentials");
        return Err(UrlValidationError::EmbeddedCredentials);
    }

    match parsed.scheme() {
        "https" => {}
        "http" if is_loopback_host(&host) => {}
        other => return Err(UrlValidationError::HttpsRequired(other.to_string())),
    }

    Ok(parsed)
}
