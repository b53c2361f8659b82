//! Domain descriptor handling
//!
//! Only the handful of elements needed for enlistment and boot device
//! selection are interpreted; everything else is copied through untouched.

use metalboot_common::{Error, Facts, Result};
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use std::fmt;

/// Device the domain should boot from next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDevice {
    Network,
    Disk,
}

impl BootDevice {
    pub fn as_str(self) -> &'static str {
        match self {
            BootDevice::Network => "network",
            BootDevice::Disk => "hd",
        }
    }
}

impl fmt::Display for BootDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The parts of a domain descriptor reported during enlistment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainDescriptor {
    pub name: String,
    pub uuid: String,
    pub title: String,
    pub bootloader: String,
    pub emulator: String,
    pub memory: String,
    pub memory_unit: String,
    pub vcpu: String,
    pub arch: String,
    pub hw_addrs: Vec<String>,
}

fn xml_error(err: impl fmt::Display) -> Error {
    Error::ApplianceProtocol(format!("domain XML: {}", err))
}

fn attribute(element: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attr in element.attributes() {
        let attr = attr.map_err(xml_error)?;
        if attr.key.as_ref() == key {
            return Ok(Some(attr.unescape_value().map_err(xml_error)?.into_owned()));
        }
    }
    Ok(None)
}

impl DomainDescriptor {
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        let mut path: Vec<String> = Vec::new();
        let mut domain = DomainDescriptor::default();

        loop {
            match reader.read_event().map_err(xml_error)? {
                Event::Eof => break,
                Event::Start(e) => {
                    domain.visit_element(&path, &e)?;
                    path.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                }
                Event::Empty(e) => domain.visit_element(&path, &e)?,
                Event::End(_) => {
                    path.pop();
                }
                Event::Text(t) => {
                    let text = t.unescape().map_err(xml_error)?;
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    let target = match path.join("/").as_str() {
                        "domain/name" => &mut domain.name,
                        "domain/uuid" => &mut domain.uuid,
                        "domain/title" => &mut domain.title,
                        "domain/bootloader" => &mut domain.bootloader,
                        "domain/memory" => &mut domain.memory,
                        "domain/vcpu" => &mut domain.vcpu,
                        "domain/devices/emulator" => &mut domain.emulator,
                        _ => continue,
                    };
                    target.push_str(text);
                }
                _ => {}
            }
        }

        if domain.name.is_empty() {
            return Err(Error::ApplianceProtocol(
                "domain XML has no <name> element".to_string(),
            ));
        }
        Ok(domain)
    }

    fn visit_element(&mut self, path: &[String], element: &BytesStart<'_>) -> Result<()> {
        let parent = path.join("/");
        match (parent.as_str(), element.name().as_ref()) {
            ("domain/devices/interface", b"mac") => {
                if let Some(address) = attribute(element, b"address")? {
                    self.hw_addrs.push(address);
                }
            }
            ("domain", b"memory") => {
                if let Some(unit) = attribute(element, b"unit")? {
                    self.memory_unit = unit;
                }
            }
            ("domain/os", b"type") => {
                if let Some(arch) = attribute(element, b"arch")? {
                    self.arch = arch;
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn facts(&self) -> Facts {
        let mut facts = Facts::new();
        facts.push("vm_title", self.title.as_str());
        facts.push("vm_emulator", self.emulator.as_str());
        facts.push("vm_bootloader", self.bootloader.as_str());
        if !self.memory.is_empty() {
            let unit = if self.memory_unit.is_empty() {
                "KiB"
            } else {
                self.memory_unit.as_str()
            };
            facts.push("vm_memory", format!("{} {}", self.memory, unit));
        }
        if !self.vcpu.is_empty() {
            facts.push("vm_vcpu", self.vcpu.as_str());
        }
        if !self.arch.is_empty() {
            facts.push("vm_arch", self.arch.as_str());
        }
        facts
    }
}

/// Per-device `<boot>` elements cannot be mixed with `<os><boot>`.
fn is_boot_entry(element: &BytesStart<'_>, path: &[Vec<u8>]) -> bool {
    if element.name().as_ref() != b"boot" {
        return false;
    }
    matches!(
        path.last().map(Vec::as_slice),
        Some(b"os") | Some(b"disk") | Some(b"interface") | Some(b"hostdev") | Some(b"redirdev")
    )
}

fn boot_element(device: BootDevice) -> BytesStart<'static> {
    let mut boot = BytesStart::new("boot");
    boot.push_attribute(("dev", device.as_str()));
    boot
}

/// Rewrite a domain descriptor so that its only boot entry is `device`.
pub fn set_boot_device(xml: &str, device: BootDevice) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len()));
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut skipping = 0usize;
    let mut os_found = false;

    loop {
        let event = reader.read_event().map_err(xml_error)?;

        if skipping > 0 {
            match event {
                Event::Start(_) => skipping += 1,
                Event::End(_) => skipping -= 1,
                Event::Eof => return Err(xml_error("unexpected end of document")),
                _ => {}
            }
            continue;
        }

        match event {
            Event::Eof => break,
            Event::Start(e) => {
                if is_boot_entry(&e, &path) {
                    skipping = 1;
                    continue;
                }
                path.push(e.name().as_ref().to_vec());
                writer.write_event(Event::Start(e)).map_err(xml_error)?;
            }
            Event::Empty(e) => {
                if is_boot_entry(&e, &path) {
                    continue;
                }
                if e.name().as_ref() == b"os" && path.len() == 1 {
                    os_found = true;
                    writer.write_event(Event::Start(e)).map_err(xml_error)?;
                    writer
                        .write_event(Event::Empty(boot_element(device)))
                        .map_err(xml_error)?;
                    writer
                        .write_event(Event::End(BytesEnd::new("os")))
                        .map_err(xml_error)?;
                    continue;
                }
                writer.write_event(Event::Empty(e)).map_err(xml_error)?;
            }
            Event::End(e) => {
                path.pop();
                if e.name().as_ref() == b"os" && path.len() == 1 {
                    os_found = true;
                    writer
                        .write_event(Event::Empty(boot_element(device)))
                        .map_err(xml_error)?;
                }
                writer.write_event(Event::End(e)).map_err(xml_error)?;
            }
            other => writer.write_event(other).map_err(xml_error)?,
        }
    }

    if !os_found {
        return Err(Error::ApplianceProtocol(
            "domain XML has no <os> element".to_string(),
        ));
    }

    String::from_utf8(writer.into_inner()).map_err(xml_error)
}
