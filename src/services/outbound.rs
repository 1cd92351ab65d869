use reqwest::redirect::Policy;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use url::Url;

/// Build a client for a caller-supplied URL that connects only to the
/// address pinned at validation time and never follows redirects.
pub fn pinned_client(
    url: &str,
    pinned_addr: &str,
    timeout: Duration,
    user_agent: &str,
) -> Result<reqwest::Client, OutboundError> {
    let parsed = Url::parse(url).map_err(|e| OutboundError::Target(e.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| OutboundError::Target("URL has no host".to_string()))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| OutboundError::Target("URL has no port".to_string()))?;
    let ip: IpAddr = pinned_addr
        .parse()
        .map_err(|_| OutboundError::Target(format!("invalid pinned address '{pinned_addr}'")))?;

    Ok(reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .redirect(Policy::none())
        .resolve(host, SocketAddr::new(ip, port))
        .build()?)
}

#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
    #[error("Invalid target: {0}")]
    Target(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}
