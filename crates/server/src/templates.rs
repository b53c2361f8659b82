//! Plain-text templates for boot scripts and kickstarts

use askama::Template;
use metalboot_common::{Error, Result};
use std::fmt;

use crate::config::Config;

/// Fields every template receives
#[derive(Debug, Clone)]
pub struct CommonParams {
    pub base_host: String,
    pub base_url: String,
    pub syslog_port: u16,
    pub version: &'static str,
}

impl CommonParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_host: config.base_host().to_string(),
            base_url: config.base_url.clone(),
            syslog_port: config.syslog_port,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Final kickstart command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastAction {
    Reboot,
    Shutdown,
}

impl fmt::Display for LastAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LastAction::Reboot => f.write_str("reboot"),
            LastAction::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Parameters of a rendered kernel script
#[derive(Debug, Clone)]
pub struct KernelParams {
    pub system_id: i64,
    pub image_id: i64,
    pub install_uuid: String,
    pub linux_cmd: &'static str,
    pub initrd_cmd: &'static str,
    /// Artifact prefix as seen by the loader
    pub root: String,
    /// Same prefix as an absolute URL
    pub http_root: String,
}

#[derive(Debug, Clone)]
pub struct KickstartParams {
    pub system_id: i64,
    pub system_name: String,
    pub hostname: String,
    pub image_id: i64,
    pub image_root: String,
    pub liveimg_sha256: String,
    pub install_uuid: String,
    pub snippet_text: String,
    pub last_action: LastAction,
}

#[derive(Template)]
#[template(path = "grub_bootstrap.txt")]
struct GrubBootstrap<'a> {
    common: &'a CommonParams,
}

#[derive(Template)]
#[template(path = "ipxe_bootstrap.txt")]
struct IpxeBootstrap<'a> {
    common: &'a CommonParams,
}

#[derive(Template)]
#[template(path = "grub_kernel.txt")]
struct GrubKernel<'a> {
    common: &'a CommonParams,
    system_id: i64,
    image_id: i64,
    install_uuid: &'a str,
    linux_cmd: &'a str,
    initrd_cmd: &'a str,
    root: &'a str,
    http_root: &'a str,
}

#[derive(Template)]
#[template(path = "ipxe_kernel.txt")]
struct IpxeKernel<'a> {
    common: &'a CommonParams,
    system_id: i64,
    image_id: i64,
    install_uuid: &'a str,
    linux_cmd: &'a str,
    initrd_cmd: &'a str,
    http_root: &'a str,
}

#[derive(Template)]
#[template(path = "grub_error.txt")]
struct GrubError<'a> {
    common: &'a CommonParams,
    message: &'a str,
}

#[derive(Template)]
#[template(path = "ipxe_error.txt")]
struct IpxeError<'a> {
    common: &'a CommonParams,
    message: &'a str,
}

#[derive(Template)]
#[template(path = "ks_install.txt")]
struct KickstartInstall<'a> {
    common: &'a CommonParams,
    system_id: i64,
    system_name: &'a str,
    hostname: &'a str,
    image_id: i64,
    image_root: &'a str,
    liveimg_sha256: &'a str,
    install_uuid: &'a str,
    snippet_text: &'a str,
    last_action: LastAction,
}

#[derive(Template)]
#[template(path = "ks_discover.txt")]
struct KickstartDiscover<'a> {
    common: &'a CommonParams,
    system_id: i64,
    install_uuid: &'a str,
    last_action: LastAction,
}

#[derive(Template)]
#[template(path = "ks_error.txt")]
struct KickstartError<'a> {
    common: &'a CommonParams,
    message: &'a str,
}

/// Renders every template with the shared parameters filled in
#[derive(Debug, Clone)]
pub struct Renderer {
    common: CommonParams,
}

fn render<T: Template>(name: &str, template: T) -> Result<String> {
    let rendered = template
        .render()
        .map_err(|e| Error::Template(format!("{}: {}", name, e)))?;
    tracing::debug!(template = name, bytes = rendered.len(), "rendered template");
    Ok(rendered)
}

// error messages end up inside quoted loader strings
fn single_line(message: &str) -> String {
    message
        .chars()
        .map(|c| match c {
            '\n' | '\r' => ' ',
            '"' => '\'',
            c => c,
        })
        .collect()
}

impl Renderer {
    pub fn new(common: CommonParams) -> Self {
        Self { common }
    }

    pub fn common(&self) -> &CommonParams {
        &self.common
    }

    pub fn grub_bootstrap(&self) -> Result<String> {
        render("grub_bootstrap", GrubBootstrap { common: &self.common })
    }

    pub fn ipxe_bootstrap(&self) -> Result<String> {
        render("ipxe_bootstrap", IpxeBootstrap { common: &self.common })
    }

    pub fn grub_kernel(&self, params: &KernelParams) -> Result<String> {
        render(
            "grub_kernel",
            GrubKernel {
                common: &self.common,
                system_id: params.system_id,
                image_id: params.image_id,
                install_uuid: &params.install_uuid,
                linux_cmd: params.linux_cmd,
                initrd_cmd: params.initrd_cmd,
                root: &params.root,
                http_root: &params.http_root,
            },
        )
    }

    pub fn ipxe_kernel(&self, params: &KernelParams) -> Result<String> {
        render(
            "ipxe_kernel",
            IpxeKernel {
                common: &self.common,
                system_id: params.system_id,
                image_id: params.image_id,
                install_uuid: &params.install_uuid,
                linux_cmd: params.linux_cmd,
                initrd_cmd: params.initrd_cmd,
                http_root: &params.http_root,
            },
        )
    }

    pub fn grub_error(&self, message: &str) -> Result<String> {
        let message = single_line(message);
        render(
            "grub_error",
            GrubError {
                common: &self.common,
                message: &message,
            },
        )
    }

    pub fn ipxe_error(&self, message: &str) -> Result<String> {
        let message = single_line(message);
        render(
            "ipxe_error",
            IpxeError {
                common: &self.common,
                message: &message,
            },
        )
    }

    pub fn kickstart_install(&self, params: &KickstartParams) -> Result<String> {
        render(
            "ks_install",
            KickstartInstall {
                common: &self.common,
                system_id: params.system_id,
                system_name: &params.system_name,
                hostname: &params.hostname,
                image_id: params.image_id,
                image_root: &params.image_root,
                liveimg_sha256: &params.liveimg_sha256,
                install_uuid: &params.install_uuid,
                snippet_text: &params.snippet_text,
                last_action: params.last_action,
            },
        )
    }

    pub fn kickstart_discover(&self, system_id: i64, install_uuid: &str) -> Result<String> {
        render(
            "ks_discover",
            KickstartDiscover {
                common: &self.common,
                system_id,
                install_uuid,
                last_action: LastAction::Shutdown,
            },
        )
    }

    pub fn kickstart_error(&self, message: &str) -> Result<String> {
        let message = single_line(message);
        render(
            "ks_error",
            KickstartError {
                common: &self.common,
                message: &message,
            },
        )
    }
}
