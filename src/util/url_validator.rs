use std::net::IpAddr;
use thiserror::Error;
use url::{Host, Url};

/// Errors that can occur while validating a feed URL.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
    /// The URL points to a private/internal IP address.
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    #[error("Localhost not allowed")]
    Localhost,
}

/// Validates a feed URL before it is fetched or stored.
///
/// Rejects non-HTTP(S) schemes and URLs without a host. When
/// `allow_private_hosts` is false, loopback and private-range hosts are
/// rejected too so an owner cannot point the sync engine at the internal
/// network.
///
/// # Examples
///
/// ```
/// use feedfan::util::validate_feed_url;
///
/// let url = validate_feed_url("https://example.com/feed.xml", false).unwrap();
/// assert_eq!(url.host_str(), Some("example.com"));
///
/// assert!(validate_feed_url("http://localhost/feed", false).is_err());
/// assert!(validate_feed_url("http://localhost/feed", true).is_ok());
/// assert!(validate_feed_url("file:///etc/passwd", true).is_err());
/// ```
pub fn validate_feed_url(
    url_str: &str,
    allow_private_hosts: bool,
) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    let host = url.host().ok_or(UrlValidationError::MissingHost)?;
    if allow_private_hosts {
        return Ok(url);
    }

    let ip = match host {
        Host::Domain(domain) => {
            // `localhost.` resolves like `localhost`
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            if domain == "localhost" || domain.ends_with(".localhost") {
                return Err(UrlValidationError::Localhost);
            }
            return Ok(url);
        }
        Host::Ipv4(v4) => IpAddr::V4(v4),
        // Judge IPv4-mapped addresses (::ffff:a.b.c.d) by their IPv4 part
        Host::Ipv6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
    };

    if ip.is_loopback() {
        return Err(UrlValidationError::Localhost);
    }
    if is_private_ip(&ip) {
        return Err(UrlValidationError::PrivateIp(ip.to_string()));
    }

    Ok(url)
}

/// Reduce a URL to `scheme://host[:port]`.
///
/// Returns `None` for URLs without a tuple origin (e.g. `data:`).
pub fn site_origin(url: &Url) -> Option<String> {
    let origin = url.origin();
    if origin.is_tuple() {
        Some(origin.ascii_serialization())
    } else {
        None
    }
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() || ipv6.is_unspecified() {
                return true;
            }
            let segments = ipv6.segments();
            // Unique Local (fc00::/7)
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // Link-Local (fe80::/10)
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
    }
}
