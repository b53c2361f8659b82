//! Boot path grammar shared by the TFTP and HTTP transports
//!
//! ```text
//! [boot/]grub.cfg                         grub bootstrap
//! [boot/]bootstrap/ipxe/chain.ipxe        iPXE bootstrap script
//! [boot/]bootstrap/ipxe/<file>            static loader
//! [boot/]<platform>[/<mac>]/<artifact>    machine request
//! ```
//!
//! An artifact of `grub.cfg*` or `script.ipxe` is a rendered script, anything
//! else is a file under the resolved image's boot directory.

use metalboot_common::{Error, HwAddr, Result};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Bios,
    Efi,
    IpxeScript,
    IpxeBinary,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Bios => "bios",
            Platform::Efi => "efi",
            Platform::IpxeScript => "ipxe",
            Platform::IpxeBinary => "ipxe-bin",
        }
    }

    /// Loader command for the kernel
    pub fn linux_cmd(self) -> &'static str {
        match self {
            Platform::Bios => "linux",
            Platform::Efi => "linuxefi",
            Platform::IpxeScript | Platform::IpxeBinary => "kernel",
        }
    }

    /// Loader command for the initial ramdisk
    pub fn initrd_cmd(self) -> &'static str {
        match self {
            Platform::Bios => "initrd",
            Platform::Efi => "initrdefi",
            Platform::IpxeScript | Platform::IpxeBinary => "initrd",
        }
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            // grub reports "pc" in $grub_platform on legacy firmware
            "bios" | "pc" => Ok(Platform::Bios),
            "efi" | "efi64" => Ok(Platform::Efi),
            "ipxe" | "ipxe-script" => Ok(Platform::IpxeScript),
            "ipxe-bin" | "ipxe-binary" => Ok(Platform::IpxeBinary),
            other => Err(Error::MalformedPath(format!("unknown platform '{}'", other))),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    Grub,
    Ipxe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Script(ScriptKind),
    File(String),
}

impl Artifact {
    fn parse(rest: &str) -> Self {
        if rest.starts_with("grub.cfg") {
            Artifact::Script(ScriptKind::Grub)
        } else if rest == "script.ipxe" {
            Artifact::Script(ScriptKind::Ipxe)
        } else {
            Artifact::File(rest.to_string())
        }
    }
}

/// A machine's request for a boot artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootRequest {
    pub platform: Platform,
    /// Absent means the machine did not identify itself
    pub mac: Option<HwAddr>,
    pub artifact: Artifact,
}

impl BootRequest {
    /// Path prefix the loader uses to fetch further artifacts
    pub fn root(&self) -> String {
        match &self.mac {
            Some(mac) => format!("/boot/{}/{}", self.platform, mac.to_dashed()),
            None => format!("/boot/{}", self.platform),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootTarget {
    GrubBootstrap,
    IpxeBootstrap,
    /// File under the static loader directory
    Loader(String),
    Machine(BootRequest),
}

impl BootTarget {
    pub fn parse(path: &str) -> Result<Self> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let segments = match segments.split_first() {
            Some((&"boot", rest)) => rest,
            _ => &segments[..],
        };

        match segments {
            [] => Err(Error::MalformedPath(path.to_string())),
            ["grub.cfg"] => Ok(BootTarget::GrubBootstrap),
            ["bootstrap", "ipxe", "chain.ipxe"] => Ok(BootTarget::IpxeBootstrap),
            ["bootstrap", "ipxe", rest @ ..] if !rest.is_empty() => {
                Ok(BootTarget::Loader(rest.join("/")))
            }
            [platform, rest @ ..] => {
                let platform: Platform = platform.parse()?;
                let (mac, rest) = match rest.split_first() {
                    Some((first, tail)) => match first.parse::<HwAddr>() {
                        Ok(mac) => (Some(mac), tail),
                        Err(_) => (None, rest),
                    },
                    None => (None, rest),
                };
                if rest.is_empty() {
                    return Err(Error::MalformedPath(path.to_string()));
                }

                Ok(BootTarget::Machine(BootRequest {
                    platform,
                    mac,
                    artifact: Artifact::parse(&rest.join("/")),
                }))
            }
        }
    }
}

/// Join an untrusted relative path under `root`, refusing anything that
/// would leave it.
pub fn resolve_under(root: &Path, relative: &str) -> Result<PathBuf> {
    let mut resolved = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::OutsideRoot(relative.to_string()));
            }
        }
    }
    Ok(resolved)
}
