//! Cached remote-device state shared between the public API and the drain
//! thread.

use std::fmt::{Display, Formatter};

use crate::errors::Error;
use crate::pins::{grow_to, InterruptRegistration, PinCapability, PinState};

/// Firmware version triplet reported during attach.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SemanticVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Display for SemanticVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Firmware name and version, populated from REPORT_FIRMWARE.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareIdentity {
    pub name: String,
    pub version: SemanticVersion,
}

/// Everything the engine knows about the remote device.
///
/// Lives behind an `Arc<RwLock<_>>` shared by API callers and the drain
/// thread. Locking order throughout the crate: this lock first, the
/// transport lock second.
#[derive(Debug, Default)]
pub struct DeviceData {
    /// Survey results, replaced wholesale on each capability response.
    pub capabilities: Vec<PinCapability>,
    /// Per-pin usage and last known value. May grow lazily before the first
    /// survey completes.
    pub states: Vec<PinState>,
    /// Pseudo-interrupt registrations, indexed by pin.
    pub interrupts: Vec<Option<InterruptRegistration>>,
    /// Firmware identity, populated during attach.
    pub firmware: Option<FirmwareIdentity>,
    /// Protocol version from REPORT_VERSION, when the device volunteered one.
    pub protocol_version: Option<(u8, u8)>,
    /// When set, pins found in input modes during a refresh keep reporting;
    /// when clear they are released back to `Unset` and their reporting
    /// disabled. Cleared at the end of every refresh cycle.
    pub report_on_query: bool,
    pub connected: bool,
}

impl DeviceData {
    /// Grows the state and interrupt caches so `pin` is addressable.
    ///
    /// Capability records are never invented here: before a survey the
    /// capability cache stays shorter than the state cache.
    pub fn grow_pin_caches(&mut self, pin: u8) -> Result<(), Error> {
        grow_to(&mut self.states, pin as usize)?;
        grow_to(&mut self.interrupts, pin as usize)?;
        Ok(())
    }

    /// The capability record for `pin`, once a survey has reported one.
    pub fn capability(&self, pin: u8) -> Result<&PinCapability, Error> {
        self.capabilities
            .get(pin as usize)
            .ok_or(Error::NoSuchPin { pin })
    }

    /// The pin owning analog channel `channel`, per the analog mapping.
    pub fn pin_for_channel(&self, channel: u8) -> Option<u8> {
        self.capabilities
            .iter()
            .position(|capability| capability.channel == Some(channel))
            .map(|pin| pin as u8)
    }
}
