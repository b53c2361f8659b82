//! Installation lifecycle
//!
//! Every state write goes through here as a conditional update, so two
//! racing requests can never both move the same installation forward.

use chrono::{DateTime, Utc};
use metalboot_common::{Error, InstallState, Installation, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::resolver::{Resolution, Resolver};

/// A forward move of the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// First artifact requested
    Start,
    /// Boot script served
    Boot,
    /// Kickstart served
    Install,
    /// Completion signal received
    Finish,
}

impl Transition {
    /// Highest state the installation may be in for the move to apply
    pub fn source(self) -> InstallState {
        match self {
            Transition::Start => InstallState::Queued,
            Transition::Boot => InstallState::Started,
            Transition::Install => InstallState::Booting,
            Transition::Finish => InstallState::Installing,
        }
    }

    pub fn target(self) -> InstallState {
        match self {
            Transition::Start => InstallState::Started,
            Transition::Boot => InstallState::Booting,
            Transition::Install => InstallState::Installing,
            Transition::Finish => InstallState::Finished,
        }
    }
}

pub struct Lifecycle {
    resolver: Arc<Resolver>,
}

impl Lifecycle {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        Self { resolver }
    }

    /// Apply `transition` to `uuid`. Returns false when the installation is
    /// unknown, expired or already past the transition's source state.
    pub async fn apply(&self, uuid: Uuid, transition: Transition) -> Result<bool> {
        let updated = self
            .resolver
            .store()
            .update_installation_state(uuid, transition.source(), transition.target(), Utc::now())
            .await?;

        if updated {
            let dropped = self.resolver.cache().invalidate_installation(uuid);
            info!(
                install_uuid = %uuid,
                state = %transition.target(),
                cache_entries_dropped = dropped,
                "installation state changed"
            );
        }
        Ok(updated)
    }

    /// Record progress observed on the serving path. Discovery answers never
    /// move the shared discovery installation, and failures are only logged
    /// so the artifact is served regardless.
    pub async fn observe(&self, resolution: &Resolution, transitions: &[Transition]) {
        if resolution.discovery {
            return;
        }

        let uuid = resolution.installation.uuid;
        for &transition in transitions {
            if resolution.installation.state > transition.source() {
                continue;
            }
            match self.apply(uuid, transition).await {
                Ok(true) => {}
                Ok(false) => debug!(install_uuid = %uuid, ?transition, "transition not applicable"),
                Err(e) => warn!(install_uuid = %uuid, ?transition, error = %e, "cannot record transition"),
            }
        }
    }

    /// Move an installation to `Finished`.
    ///
    /// Unknown installations are not found and expired ones are reported as
    /// such; one that has already finished, or that loses a concurrent race,
    /// is a state conflict.
    pub async fn finish(&self, uuid: Uuid) -> Result<Installation> {
        // look past expiry so an expired row can be told apart from a missing one
        let current = self
            .resolver
            .store()
            .find_installation_by_uuid(uuid, InstallState::Finished, DateTime::<Utc>::MIN_UTC)
            .await?
            .ok_or_else(|| Error::NotFound(format!("installation {}", uuid)))?;

        if current.is_expired(Utc::now()) {
            return Err(Error::Expired(uuid));
        }

        let conflict = |state| Error::StateConflict {
            uuid,
            state,
            target: InstallState::Finished,
        };

        if !current.state.within(Transition::Finish.source()) {
            return Err(conflict(current.state));
        }

        if !self.apply(uuid, Transition::Finish).await? {
            return Err(conflict(InstallState::Finished));
        }

        Ok(Installation {
            state: InstallState::Finished,
            ..current
        })
    }
}
