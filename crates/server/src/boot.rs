//! Boot protocol service
//!
//! Transport-independent answers to "what do I boot". The TFTP and HTTP
//! adapters parse their request into a [`BootTarget`] and hand it here, so
//! both transports resolve and render identically.

use metalboot_common::{Error, HwAddr, InstallState, Result};
use metalboot_metal::Drivers;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::hostname::system_hostname;
use crate::lifecycle::{Lifecycle, Transition};
use crate::request::{resolve_under, Artifact, BootRequest, BootTarget, Platform, ScriptKind};
use crate::resolver::{Resolution, Resolver};
use crate::templates::{KernelParams, KickstartParams, LastAction, Renderer};

/// What to send back to the loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootResponse {
    /// Rendered script, possibly an inline error message
    Script(String),
    /// File on disk
    File(PathBuf),
    /// Nothing sensible to send; carries the reason
    NotFound(String),
}

pub struct BootService {
    config: Arc<Config>,
    resolver: Arc<Resolver>,
    lifecycle: Arc<Lifecycle>,
    renderer: Renderer,
    drivers: Drivers,
}

/// Parse one `X-RHN-Provisioning-MAC-<n>` value: `<iface> <mac>`.
pub fn parse_provisioning_mac(value: &str) -> Result<HwAddr> {
    let (_, mac) = value
        .trim()
        .split_once(' ')
        .ok_or_else(|| Error::InvalidHwAddr(format!("invalid format of RHN MAC header '{}'", value)))?;
    mac.trim().parse()
}

impl BootService {
    pub fn new(
        config: Arc<Config>,
        resolver: Arc<Resolver>,
        lifecycle: Arc<Lifecycle>,
        renderer: Renderer,
        drivers: Drivers,
    ) -> Self {
        Self {
            config,
            resolver,
            lifecycle,
            renderer,
            drivers,
        }
    }

    /// Answer a raw path from either transport
    pub async fn serve_path(&self, path: &str) -> BootResponse {
        match BootTarget::parse(path) {
            Ok(target) => self.serve(target).await,
            Err(e) => {
                info!(path, error = %e, "rejecting boot path");
                BootResponse::NotFound(e.to_string())
            }
        }
    }

    pub async fn serve(&self, target: BootTarget) -> BootResponse {
        match target {
            BootTarget::GrubBootstrap => {
                self.script_or_error(ScriptKind::Grub, self.renderer.grub_bootstrap())
            }
            BootTarget::IpxeBootstrap => {
                self.script_or_error(ScriptKind::Ipxe, self.renderer.ipxe_bootstrap())
            }
            BootTarget::Loader(relative) => match resolve_under(&self.config.ipxe_dir, &relative) {
                Ok(path) => self.existing_file(path).await,
                Err(e) => {
                    warn!(path = %relative, error = %e, "rejecting loader path");
                    BootResponse::NotFound(e.to_string())
                }
            },
            BootTarget::Machine(request) => self.serve_machine(request).await,
        }
    }

    async fn serve_machine(&self, request: BootRequest) -> BootResponse {
        // the installer keeps pulling stage2 and liveimg after it fetched
        // the kickstart, so files stay on the deployed image until Finished
        let threshold = match request.artifact {
            Artifact::Script(_) => InstallState::Booting,
            Artifact::File(_) => InstallState::Installing,
        };
        let resolution = self.resolver.resolve(request.mac.as_ref(), threshold).await;

        match (&request.artifact, resolution) {
            (Artifact::Script(kind), Ok(resolution)) => {
                let rendered = self.render_kernel(&request, *kind, &resolution);
                if rendered.is_ok() {
                    self.lifecycle
                        .observe(&resolution, &[Transition::Start, Transition::Boot])
                        .await;
                }
                self.script_or_error(*kind, rendered)
            }
            (Artifact::Script(kind), Err(e)) => self.script_or_error(*kind, Err(e)),
            (Artifact::File(relative), Ok(resolution)) => {
                let root = self.config.boot_path(resolution.installation.image_id);
                match resolve_under(&root, relative) {
                    Ok(path) => {
                        let response = self.existing_file(path).await;
                        if matches!(response, BootResponse::File(_)) {
                            self.lifecycle.observe(&resolution, &[Transition::Start]).await;
                        }
                        response
                    }
                    Err(e) => {
                        warn!(path = %relative, error = %e, "rejecting boot file path");
                        BootResponse::NotFound(e.to_string())
                    }
                }
            }
            (Artifact::File(relative), Err(e)) => {
                warn!(path = %relative, error = %e, "cannot resolve boot file");
                BootResponse::NotFound(e.to_string())
            }
        }
    }

    fn render_kernel(
        &self,
        request: &BootRequest,
        kind: ScriptKind,
        resolution: &Resolution,
    ) -> Result<String> {
        let root = request.root();
        let params = KernelParams {
            system_id: resolution.system.id,
            image_id: resolution.installation.image_id,
            install_uuid: resolution.installation.uuid.to_string(),
            linux_cmd: request.platform.linux_cmd(),
            initrd_cmd: request.platform.initrd_cmd(),
            http_root: format!("{}{}", self.config.base_url, root),
            root,
        };

        debug!(
            system_id = params.system_id,
            image_id = params.image_id,
            install_uuid = %params.install_uuid,
            platform = %request.platform,
            discovery = resolution.discovery,
            "rendering boot script"
        );
        match kind {
            ScriptKind::Grub => self.renderer.grub_kernel(&params),
            ScriptKind::Ipxe => self.renderer.ipxe_kernel(&params),
        }
    }

    async fn existing_file(&self, path: PathBuf) -> BootResponse {
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => BootResponse::File(path),
            Ok(_) => BootResponse::NotFound(format!("{} is not a file", path.display())),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "boot file not available");
                BootResponse::NotFound(format!("{}: {}", path.display(), e))
            }
        }
    }

    /// Turn a rendering outcome into a script the loader can display.
    fn script_or_error(&self, kind: ScriptKind, rendered: Result<String>) -> BootResponse {
        let err = match rendered {
            Ok(script) => return BootResponse::Script(script),
            Err(err) => err,
        };

        error!(error = %err, "rendering error as boot script message");
        let message = err.to_string();
        let fallback = match kind {
            ScriptKind::Grub => self.renderer.grub_error(&message),
            ScriptKind::Ipxe => self.renderer.ipxe_error(&message),
        };
        match fallback {
            Ok(script) => BootResponse::Script(script),
            Err(e) => {
                error!(error = %e, "cannot render error template");
                BootResponse::Script(format!("echo \"metalboot error: {}\"\n", message))
            }
        }
    }

    /// Render a kickstart for the addresses an installer reported. Always
    /// produces a document; failures become a kickstart error.
    pub async fn kickstart(&self, header_values: &[String]) -> String {
        let rendered = match header_values
            .iter()
            .map(|v| parse_provisioning_mac(v))
            .collect::<Result<Vec<_>>>()
        {
            Ok(macs) => self.render_kickstart(&macs).await,
            Err(e) => Err(e),
        };

        match rendered {
            Ok(kickstart) => kickstart,
            Err(err) => {
                error!(error = %err, "rendering error as kickstart comment");
                let message = err.to_string();
                self.renderer
                    .kickstart_error(&message)
                    .unwrap_or_else(|_| format!("# metalboot error: {}\n", message))
            }
        }
    }

    async fn render_kickstart(&self, macs: &[HwAddr]) -> Result<String> {
        for mac in macs {
            debug!(mac = %mac, "searching for system");
            match self.resolver.resolve(Some(mac), InstallState::Installing).await {
                Ok(resolution) if !resolution.discovery => {
                    return self.render_install(mac, &resolution).await;
                }
                Ok(_) => debug!(mac = %mac, "no installation for address"),
                Err(e) if e.is_not_found() => debug!(mac = %mac, "unknown system"),
                Err(e) => return Err(e),
            }
        }

        debug!(reported = macs.len(), "no installable system, rendering discovery");
        let discovery = self
            .resolver
            .resolve(None, InstallState::Installing)
            .await
            .map_err(|e| Error::NotFound(format!("no discovery system: {}", e)))?;
        self.renderer.kickstart_discover(
            discovery.system.id,
            &discovery.installation.uuid.to_string(),
        )
    }

    async fn render_install(&self, mac: &HwAddr, resolution: &Resolution) -> Result<String> {
        let installation = &resolution.installation;
        let system = &resolution.system;

        let kickstart = if !installation.kickstart_override.is_empty() {
            info!(install_uuid = %installation.uuid, "serving kickstart override");
            installation.kickstart_override.clone()
        } else {
            let store = self.resolver.store();
            let image = store
                .find_image_by_id(installation.image_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("image {}", installation.image_id)))?;

            let appliance = match system.appliance_id {
                Some(id) => store.find_appliance_by_id(id).await?,
                None => {
                    debug!(system_id = system.id, "installing a system without appliance");
                    None
                }
            };
            let last_action = if self.drivers.controls_power(appliance.as_ref()) {
                LastAction::Shutdown
            } else {
                LastAction::Reboot
            };

            self.renderer.kickstart_install(&KickstartParams {
                system_id: system.id,
                system_name: system.name.clone(),
                hostname: system_hostname(&system.name, system.id),
                image_id: installation.image_id,
                image_root: format!(
                    "{}/boot/{}/{}",
                    self.config.base_url,
                    Platform::Efi,
                    mac.to_dashed()
                ),
                liveimg_sha256: image.liveimg_sha256.unwrap_or_default(),
                install_uuid: installation.uuid.to_string(),
                snippet_text: installation.snippet_text.clone(),
                last_action,
            })?
        };

        info!(
            mac = %mac,
            system_id = system.id,
            install_uuid = %installation.uuid,
            "serving installation kickstart"
        );
        self.lifecycle
            .observe(
                resolution,
                &[Transition::Start, Transition::Boot, Transition::Install],
            )
            .await;
        Ok(kickstart)
    }
}
