//! Shared types for the metalboot provisioning services.

pub mod error;
pub mod hwaddr;
pub mod models;
pub mod state;

pub use error::{Error, Result};
pub use hwaddr::{canonicalize, HwAddr};
pub use models::{
    Appliance, ApplianceKind, Fact, Facts, Image, ImageKind, Installation, NewAppliance,
    NewImage, NewInstallation, NewSystem, System,
};
pub use state::InstallState;
