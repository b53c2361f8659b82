//! Configuration management for the boot server
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use metalboot_metal::{MetalConfig, RedfishBootTarget};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind host
    pub http_host: String,

    /// HTTP port
    pub http_port: u16,

    /// URL booting machines use to reach this server
    pub base_url: String,

    /// Whether to start the TFTP service
    pub tftp_enabled: bool,

    /// TFTP UDP port
    pub tftp_port: u16,

    /// Redis connection string; in-memory storage when unset
    pub redis_url: Option<String>,

    /// Root of extracted images, one directory per image ID
    pub images_dir: PathBuf,

    /// Static bootstrap loaders (iPXE binaries)
    pub ipxe_dir: PathBuf,

    /// Resolution cache capacity
    pub cache_capacity: usize,

    /// Resolution cache time-to-live
    pub cache_ttl: Duration,

    /// Delay before the post-completion power action
    pub power_delay: Duration,

    /// Default installation validity for deploy requests
    pub install_duration: Duration,

    pub redfish_boot_target: RedfishBootTarget,

    /// Whether to receive installer logs over syslog
    pub syslog_enabled: bool,

    /// Syslog UDP/TCP port, also handed to installers
    pub syslog_port: u16,

    /// Per-host installer log files
    pub logs_dir: PathBuf,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var_or(name, default)
        .parse()
        .with_context(|| format!("Invalid {}", name))
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        let http_host = var_or("HTTP_HOST", "0.0.0.0");
        let http_port: u16 = parse_var("HTTP_PORT", "8000")?;
        let base_url = env::var("BASE_URL")
            .unwrap_or_else(|_| format!("http://{}:{}", http_host, http_port));

        let config = Config {
            http_host,
            http_port,
            base_url: base_url.trim_end_matches('/').to_string(),
            tftp_enabled: parse_var("TFTP_ENABLED", "true")?,
            tftp_port: parse_var("TFTP_PORT", "6969")?,
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            images_dir: var_or("IMAGES_DIR", "./images").into(),
            ipxe_dir: var_or("IPXE_DIR", "/usr/share/ipxe").into(),
            cache_capacity: parse_var("CACHE_CAPACITY", "512")?,
            cache_ttl: Duration::from_secs(parse_var("CACHE_TTL_SECS", "30")?),
            power_delay: Duration::from_secs(parse_var("POWER_DELAY_SECS", "30")?),
            install_duration: Duration::from_secs(parse_var("INSTALL_DURATION_SECS", "3600")?),
            redfish_boot_target: var_or("REDFISH_BOOT_TARGET", "http")
                .parse()
                .context("Invalid REDFISH_BOOT_TARGET")?,
            syslog_enabled: parse_var("SYSLOG_ENABLED", "true")?,
            syslog_port: parse_var("SYSLOG_PORT", "5514")?,
            logs_dir: var_or("LOGS_DIR", "./logs").into(),
        };

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.http_port == 0 {
            anyhow::bail!("HTTP_PORT must be greater than 0");
        }

        if self.tftp_enabled && self.tftp_port == 0 {
            anyhow::bail!("TFTP_PORT must be greater than 0");
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            anyhow::bail!("BASE_URL must be an http(s) URL");
        }

        if self.syslog_enabled && self.syslog_port == 0 {
            anyhow::bail!("SYSLOG_PORT must be greater than 0");
        }

        if self.install_duration.is_zero() {
            anyhow::bail!("INSTALL_DURATION_SECS must be greater than 0");
        }

        Ok(())
    }

    /// Get the HTTP server address
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    /// Get the TFTP server address
    pub fn tftp_address(&self) -> String {
        format!("{}:{}", self.http_host, self.tftp_port)
    }

    /// Get the syslog server address
    pub fn syslog_address(&self) -> String {
        format!("{}:{}", self.http_host, self.syslog_port)
    }

    /// Redis endpoint without credentials, safe to log
    pub fn redis_endpoint(&self) -> Option<String> {
        let url = self.redis_url.as_deref()?;
        let endpoint = match redis::parse_redis_url(url) {
            Some(parsed) => match parsed.host_str() {
                Some(host) => format!("{}:{}", host, parsed.port().unwrap_or(6379)),
                None => parsed.path().to_string(),
            },
            None => "<unparsable>".to_string(),
        };
        Some(endpoint)
    }

    /// Host part of the base URL, used by installer templates
    pub fn base_host(&self) -> &str {
        let without_scheme = self
            .base_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.base_url);
        let authority = without_scheme.split('/').next().unwrap_or_default();
        match authority.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => authority,
        }
    }

    /// On-disk boot directory of an image
    pub fn boot_path(&self, image_id: i64) -> PathBuf {
        self.images_dir.join(image_id.to_string())
    }

    pub fn metal(&self) -> MetalConfig {
        MetalConfig {
            base_url: self.base_url.clone(),
            redfish_boot_target: self.redfish_boot_target,
        }
    }

    /// Configuration rooted at `images_dir`, used by tests and tooling
    pub fn for_images(images_dir: impl Into<PathBuf>) -> Self {
        let images_dir = images_dir.into();
        Config {
            http_host: "127.0.0.1".to_string(),
            http_port: 8000,
            base_url: "http://127.0.0.1:8000".to_string(),
            tftp_enabled: false,
            tftp_port: 6969,
            redis_url: None,
            logs_dir: images_dir.join("logs"),
            images_dir,
            ipxe_dir: PathBuf::from("/usr/share/ipxe"),
            cache_capacity: 512,
            cache_ttl: Duration::from_secs(30),
            power_delay: Duration::from_secs(30),
            install_duration: Duration::from_secs(3600),
            redfish_boot_target: RedfishBootTarget::Http,
            syslog_enabled: false,
            syslog_port: 5514,
        }
    }

    /// Ensure the image and log roots exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.images_dir).with_context(|| {
            format!(
                "Failed to create images directory: {}",
                self.images_dir.display()
            )
        })?;

        std::fs::create_dir_all(&self.logs_dir).with_context(|| {
            format!("Failed to create logs directory: {}", self.logs_dir.display())
        })?;

        // iPXE loaders are optional, bootstrap requests will fail without them
        if !self.ipxe_dir.exists() {
            tracing::warn!(
                "iPXE directory does not exist: {}",
                self.ipxe_dir.display()
            );
        }

        Ok(())
    }
}
