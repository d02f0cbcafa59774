//! Process-wide record of which stack owns each accelerator.
//!
//! A training/export framework and an inference runtime must not hold the same
//! device at once. Claims are scoped values: dropping the last claim of an owner
//! frees the device for the other one.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use once_cell::sync::Lazy;
use tracing::{debug, info};

use crate::{Device, InterchangeArtifact, SessionError, SessionResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceOwner {
    Framework,
    InferenceRuntime,
}

impl fmt::Display for DeviceOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceOwner::Framework => f.write_str("the export framework"),
            DeviceOwner::InferenceRuntime => f.write_str("the inference runtime"),
        }
    }
}

static CLAIMS: Lazy<Mutex<HashMap<Device, (DeviceOwner, usize)>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug)]
pub struct DeviceClaim {
    device: Device,
    owner: DeviceOwner,
    tracked: bool,
}

impl DeviceClaim {
    /// Claims `device` for `owner`. Claims by one owner kind stack; other owners are refused.
    pub fn acquire(device: Device, owner: DeviceOwner) -> SessionResult<Self> {
        if device == Device::Host {
            return Ok(Self {
                device,
                owner,
                tracked: false,
            });
        }

        let mut claims = CLAIMS.lock().unwrap_or_else(PoisonError::into_inner);
        match claims.get_mut(&device) {
            Some((holder, _)) if *holder != owner => {
                return Err(SessionError::DeviceBusy {
                    device,
                    holder: *holder,
                    requested: owner,
                });
            }
            Some((_, count)) => *count += 1,
            None => {
                claims.insert(device, (owner, 1));
            }
        }
        debug!(%device, %owner, "device claimed");

        Ok(Self {
            device,
            owner,
            tracked: true,
        })
    }

    pub fn holder(device: Device) -> Option<DeviceOwner> {
        let claims = CLAIMS.lock().unwrap_or_else(PoisonError::into_inner);
        claims.get(&device).map(|(owner, _)| *owner)
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn owner(&self) -> DeviceOwner {
        self.owner
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        if !self.tracked {
            return;
        }
        let mut claims = CLAIMS.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, count)) = claims.get_mut(&self.device) {
            *count -= 1;
            if *count == 0 {
                claims.remove(&self.device);
                debug!(device = %self.device, owner = %self.owner, "device released");
            }
        }
    }
}

/// Holds a framework claim on a device while a model is exported from it.
#[derive(Debug)]
pub struct ExportScope {
    claim: DeviceClaim,
}

impl ExportScope {
    pub fn enter(device: Device) -> SessionResult<Self> {
        let claim = DeviceClaim::acquire(device, DeviceOwner::Framework)?;
        info!(%device, "export scope entered");
        Ok(Self { claim })
    }

    pub fn device(&self) -> Device {
        self.claim.device()
    }

    /// Ends the scope, releasing the framework's hold on the device.
    pub fn finish(self, artifact: InterchangeArtifact) -> InterchangeArtifact {
        let device = self.claim.device();
        drop(self.claim);
        info!(%device, interchange = %artifact.path.display(), "export scope released");
        artifact
    }
}
