//! Hypervisor access through the `virsh` command line client

use async_trait::async_trait;
use metalboot_common::{Error, Result};
use reqwest::Url;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// Operations needed from a connected hypervisor
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// UUIDs of all defined domains, running or not
    async fn list_domains(&self) -> Result<Vec<String>>;

    async fn domain_xml(&self, uuid: &str) -> Result<String>;

    /// Define (or redefine) a domain from its descriptor
    async fn define_xml(&self, xml: &str) -> Result<()>;

    async fn is_running(&self, uuid: &str) -> Result<bool>;

    /// Hard reset of a running domain
    async fn reset(&self, uuid: &str) -> Result<()>;

    /// Start a domain that is not running
    async fn start(&self, uuid: &str) -> Result<()>;
}

/// Opens hypervisor sessions for appliance URIs
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, appliance_uri: &str) -> Result<Box<dyn Hypervisor>>;
}

/// Translate an appliance URI into a libvirt connection URI.
///
/// `unix:///path` uses a local socket, `tcp://host:port` a remote daemon,
/// and native `qemu` URIs are passed through.
pub fn connection_uri(appliance_uri: &str) -> Result<String> {
    let parsed = Url::parse(appliance_uri)
        .map_err(|e| Error::Configuration(format!("cannot parse '{}': {}", appliance_uri, e)))?;

    match parsed.scheme() {
        scheme if scheme == "qemu" || scheme.starts_with("qemu+") => Ok(appliance_uri.to_string()),
        "unix" => {
            if parsed.path().is_empty() || parsed.path() == "/" {
                return Err(Error::Configuration(format!(
                    "no socket path in '{}'",
                    appliance_uri
                )));
            }
            Ok(format!("qemu:///system?socket={}", parsed.path()))
        }
        "tcp" => {
            let host = parsed.host_str().ok_or_else(|| {
                Error::Configuration(format!("no host in '{}'", appliance_uri))
            })?;
            match parsed.port() {
                Some(port) => Ok(format!("qemu+tcp://{}:{}/system", host, port)),
                None => Ok(format!("qemu+tcp://{}/system", host)),
            }
        }
        other => Err(Error::UnsupportedUriScheme(other.to_string())),
    }
}

/// Runs `virsh` against the connection derived from the appliance URI
pub struct VirshConnector {
    program: PathBuf,
}

impl VirshConnector {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for VirshConnector {
    fn default() -> Self {
        Self::new("virsh")
    }
}

#[async_trait]
impl Connector for VirshConnector {
    async fn connect(&self, appliance_uri: &str) -> Result<Box<dyn Hypervisor>> {
        let uri = connection_uri(appliance_uri)?;
        debug!(uri = %uri, "connecting to libvirt");
        Ok(Box::new(Virsh {
            program: self.program.clone(),
            uri,
        }))
    }
}

struct Virsh {
    program: PathBuf,
    uri: String,
}

impl Virsh {
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.program)
            .arg("--quiet")
            .arg("--connect")
            .arg(&self.uri)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                Error::ApplianceUnreachable(format!(
                    "cannot execute {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("failed to connect") {
                return Err(Error::ApplianceUnreachable(stderr));
            }
            return Err(Error::ApplianceProtocol(format!(
                "virsh {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Hypervisor for Virsh {
    async fn list_domains(&self) -> Result<Vec<String>> {
        let out = self.run(&["list", "--all", "--uuid"]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn domain_xml(&self, uuid: &str) -> Result<String> {
        self.run(&["dumpxml", "--inactive", uuid]).await
    }

    async fn define_xml(&self, xml: &str) -> Result<()> {
        let file = tempfile::Builder::new()
            .prefix("domain-")
            .suffix(".xml")
            .tempfile()?;
        tokio::fs::write(file.path(), xml).await?;

        let path = file.path().to_string_lossy().into_owned();
        self.run(&["define", &path]).await?;
        Ok(())
    }

    async fn is_running(&self, uuid: &str) -> Result<bool> {
        let out = self.run(&["domstate", uuid]).await?;
        Ok(out.trim() == "running")
    }

    async fn reset(&self, uuid: &str) -> Result<()> {
        self.run(&["reset", uuid]).await?;
        Ok(())
    }

    async fn start(&self, uuid: &str) -> Result<()> {
        self.run(&["start", uuid]).await?;
        Ok(())
    }
}
