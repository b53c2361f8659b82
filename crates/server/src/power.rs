//! Deferred power worker
//!
//! Power actions triggered by HTTP requests are queued here and executed
//! off the request path. A failed action is logged once and never retried.

use metalboot_common::{Error, Result};
use metalboot_metal::{Drivers, SystemAppliance};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::storage::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    BootNetwork,
    BootLocal,
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerAction::BootNetwork => f.write_str("boot_network"),
            PowerAction::BootLocal => f.write_str("boot_local"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PowerTask {
    pub action: PowerAction,
    pub system_id: i64,
    pub delay: Duration,
}

/// Sending half, cloned into request handlers
#[derive(Clone)]
pub struct PowerQueue {
    sender: mpsc::UnboundedSender<PowerTask>,
    scheduled: Arc<AtomicU64>,
}

impl PowerQueue {
    pub fn schedule(&self, action: PowerAction, system_id: i64, delay: Duration) -> Result<()> {
        self.sender
            .send(PowerTask {
                action,
                system_id,
                delay,
            })
            .map_err(|_| Error::Other(anyhow::anyhow!("power worker is not running")))?;

        let total = self.scheduled.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            system_id,
            %action,
            delay_secs = delay.as_secs(),
            scheduled_total = total,
            "power action scheduled"
        );
        Ok(())
    }

    /// Number of actions accepted so far
    pub fn scheduled(&self) -> u64 {
        self.scheduled.load(Ordering::SeqCst)
    }
}

/// Receiving half, executes each task in its own tokio task
pub struct PowerWorker {
    receiver: mpsc::UnboundedReceiver<PowerTask>,
    store: Arc<dyn Store>,
    drivers: Drivers,
}

pub fn channel(store: Arc<dyn Store>, drivers: Drivers) -> (PowerQueue, PowerWorker) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        PowerQueue {
            sender,
            scheduled: Arc::new(AtomicU64::new(0)),
        },
        PowerWorker {
            receiver,
            store,
            drivers,
        },
    )
}

/// Load a system together with its appliance
pub async fn load_target(store: &dyn Store, system_id: i64) -> Result<SystemAppliance> {
    let system = store
        .find_system_by_id(system_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("system {}", system_id)))?;

    let appliance = match system.appliance_id {
        Some(id) => store.find_appliance_by_id(id).await?,
        None => None,
    };
    Ok(SystemAppliance::new(system, appliance))
}

impl PowerWorker {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until every queue handle is dropped
    pub async fn run(mut self) {
        info!("Power worker started");

        while let Some(task) = self.receiver.recv().await {
            let store = self.store.clone();
            let drivers = self.drivers.clone();
            let action = task.action;
            let system_id = task.system_id;

            let handle = tokio::spawn(async move {
                if !task.delay.is_zero() {
                    tokio::time::sleep(task.delay).await;
                }
                execute(store.as_ref(), &drivers, &task).await
            });

            // a panicking driver must not take the worker down
            tokio::spawn(async move {
                match handle.await {
                    Ok(Ok(())) => info!(system_id, %action, "power action completed"),
                    Ok(Err(e)) => error!(system_id, %action, error = %e, "power action failed"),
                    Err(e) => error!(system_id, %action, error = %e, "power action panicked"),
                }
            });
        }

        warn!("Power worker stopped, queue closed");
    }
}

async fn execute(store: &dyn Store, drivers: &Drivers, task: &PowerTask) -> Result<()> {
    let target = load_target(store, task.system_id).await?;
    info!(system_id = task.system_id, action = %task.action, "executing power action");

    match task.action {
        PowerAction::BootNetwork => drivers.boot_network(&target).await,
        PowerAction::BootLocal => drivers.boot_local(&target).await,
    }
}
