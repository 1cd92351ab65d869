use async_trait::async_trait;
use garde::Validate;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use url::{Host, Url};

use crate::config::GenerationLimits;
use crate::models::generation::GenerateRequest;
use crate::models::job::{GenerationParams, ImageSource, WebhookTarget};

/// Hostnames rejected without resolving them.
const BLOCKED_HOSTNAMES: &[&str] = &[
    "localhost",
    "0.0.0.0",
    "metadata",
    "metadata.google.internal",
];

/// Accepted aspect ratio range (width / height).
const MIN_ASPECT: f64 = 0.5;
const MAX_ASPECT: f64 = 3.0;

const MIN_DIMENSION: i64 = 256;
const MIN_FRAMES: i64 = 25;

/// Validated submission, ready to be persisted.
#[derive(Debug, Clone)]
pub struct ValidatedInput {
    pub job_id: Option<String>,
    pub params: GenerationParams,
    pub webhook: Option<WebhookTarget>,
}

/// Resolves hostnames to addresses.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the system's DNS configuration.
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn lookup(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        Ok(tokio::net::lookup_host((host, port))
            .await?
            .map(|addr| addr.ip())
            .collect())
    }
}

/// Whether an address may be contacted on behalf of a caller.
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_public_v4(v4),
            None => is_public_v6(v6),
        },
    }
}

fn is_public_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    let shared_cgnat = a == 100 && (64..128).contains(&b);
    let this_network = a == 0;
    !(ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || shared_cgnat
        || this_network)
}

fn is_public_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let unique_local = (first & 0xfe00) == 0xfc00;
    let link_local = (first & 0xffc0) == 0xfe80;
    !(ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() || unique_local || link_local)
}

/// Validates generation requests before any job is created.
pub struct InputValidator {
    limits: GenerationLimits,
    image_root: Option<PathBuf>,
    resolver: Arc<dyn HostResolver>,
}

impl InputValidator {
    pub fn new(
        limits: GenerationLimits,
        image_root: Option<PathBuf>,
        resolver: Arc<dyn HostResolver>,
    ) -> Self {
        Self {
            limits,
            image_root,
            resolver,
        }
    }

    /// Validate a request. The first violation is reported.
    pub async fn validate(&self, req: &GenerateRequest) -> Result<ValidatedInput, ValidationError> {
        if let Err(report) = req.validate() {
            if let Some((path, error)) = report.iter().next() {
                return Err(ValidationError::new(&path.to_string(), error.message()));
            }
        }

        let prompt = req.prompt.trim();
        if prompt.is_empty() {
            return Err(ValidationError::new("prompt", "must not be blank"));
        }
        if prompt.contains('\0') {
            return Err(ValidationError::new("prompt", "contains invalid characters"));
        }

        let image = self.validate_image(&req.image).await?;

        let width = req.width.unwrap_or(i64::from(self.limits.default_width));
        let height = req.height.unwrap_or(i64::from(self.limits.default_height));
        check_dimension("width", width, self.limits.max_width)?;
        check_dimension("height", height, self.limits.max_height)?;
        let aspect = width as f64 / height as f64;
        if !(MIN_ASPECT..=MAX_ASPECT).contains(&aspect) {
            return Err(ValidationError::new(
                "width",
                format!("aspect ratio {aspect:.2} must be between {MIN_ASPECT} and {MAX_ASPECT}"),
            ));
        }

        let num_frames = req
            .num_frames
            .unwrap_or(i64::from(self.limits.default_num_frames));
        check_range("num_frames", num_frames, MIN_FRAMES, i64::from(self.limits.max_frames))?;
        if num_frames % 2 == 0 {
            return Err(ValidationError::new("num_frames", "must be odd"));
        }

        let num_steps = req
            .num_steps
            .unwrap_or(i64::from(self.limits.default_num_steps));
        check_range("num_steps", num_steps, 1, i64::from(self.limits.max_steps))?;

        let seed = req.seed.unwrap_or(i64::from(self.limits.default_seed));
        check_range("seed", seed, 0, i64::from(u32::MAX))?;

        let webhook = match &req.webhook_url {
            Some(raw) => {
                let (url, addr) = self.validate_url("webhook_url", raw).await?;
                Some(WebhookTarget {
                    url,
                    pinned_addr: addr.to_string(),
                })
            }
            None => None,
        };

        Ok(ValidatedInput {
            job_id: req.job_id.clone(),
            params: GenerationParams {
                prompt: prompt.to_string(),
                image,
                seed: seed as u32,
                width: width as u32,
                height: height as u32,
                num_frames: num_frames as u32,
                num_steps: num_steps as u32,
            },
            webhook,
        })
    }

    async fn validate_image(&self, raw: &str) -> Result<ImageSource, ValidationError> {
        match Url::parse(raw) {
            Ok(_) => {
                let (url, addr) = self.validate_url("image", raw).await?;
                Ok(ImageSource::Remote {
                    url,
                    pinned_addr: addr.to_string(),
                })
            }
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let path = self.validate_path("image", raw)?;
                Ok(ImageSource::Local {
                    path: path.to_string_lossy().into_owned(),
                })
            }
            Err(e) => Err(ValidationError::new("image", format!("invalid URL: {e}"))),
        }
    }

    /// Check scheme and host, resolve the host and return the address the
    /// request must later be sent to.
    async fn validate_url(&self, field: &str, raw: &str) -> Result<(String, IpAddr), ValidationError> {
        let url = Url::parse(raw).map_err(|e| ValidationError::new(field, format!("invalid URL: {e}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ValidationError::new(
                field,
                format!("scheme '{}' not allowed, use http or https", url.scheme()),
            ));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(ValidationError::new(field, "credentials in URL are not allowed"));
        }

        let port = url
            .port_or_known_default()
            .ok_or_else(|| ValidationError::new(field, "URL has no port"))?;

        let addrs = match url.host() {
            Some(Host::Ipv4(ip)) => vec![IpAddr::V4(ip)],
            Some(Host::Ipv6(ip)) => vec![IpAddr::V6(ip)],
            Some(Host::Domain(name)) => {
                let name = name.trim_end_matches('.').to_ascii_lowercase();
                if BLOCKED_HOSTNAMES.contains(&name.as_str()) || name.ends_with(".localhost") {
                    return Err(ValidationError::new(field, format!("host '{name}' is blocked")));
                }
                self.resolver.lookup(&name, port).await.map_err(|e| {
                    ValidationError::new(field, format!("could not resolve host '{name}': {e}"))
                })?
            }
            None => return Err(ValidationError::new(field, "URL must have a host")),
        };

        let Some(pinned) = addrs.first().copied() else {
            return Err(ValidationError::new(field, "host resolved to no addresses"));
        };
        if let Some(blocked) = addrs.iter().find(|ip| !is_public_ip(**ip)) {
            return Err(ValidationError::new(
                field,
                format!("address {blocked} is private or internal"),
            ));
        }

        Ok((url.to_string(), pinned))
    }

    /// Resolve a path reference under the image root without touching the
    /// filesystem.
    fn validate_path(&self, field: &str, raw: &str) -> Result<PathBuf, ValidationError> {
        let root = self
            .image_root
            .as_ref()
            .ok_or_else(|| ValidationError::new(field, "local image paths are not enabled"))?;

        if raw.contains('\0') || raw.contains('\\') {
            return Err(ValidationError::new(field, "path contains invalid characters"));
        }

        let path = Path::new(raw);
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(ValidationError::new(field, "path traversal is not allowed"));
        }

        let resolved = if path.is_absolute() {
            if !path.starts_with(root) {
                return Err(ValidationError::new(field, "path is outside the image root"));
            }
            path.to_path_buf()
        } else {
            root.join(path)
        };

        if resolved == *root {
            return Err(ValidationError::new(field, "path must name a file"));
        }
        Ok(resolved)
    }
}

fn check_range(field: &str, value: i64, min: i64, max: i64) -> Result<(), ValidationError> {
    if value < min || value > max {
        return Err(ValidationError::new(
            field,
            format!("must be between {min} and {max}, got {value}"),
        ));
    }
    Ok(())
}

fn check_dimension(field: &str, value: i64, max: u32) -> Result<(), ValidationError> {
    check_range(field, value, MIN_DIMENSION, i64::from(max))?;
    if value % 8 != 0 {
        return Err(ValidationError::new(
            field,
            format!("must be a multiple of 8, got {value}"),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}
