//! Per-pin capability and state caches.
//!
//! [`PinCapability`] records are immutable between surveys and are replaced
//! wholesale whenever a capability response is decoded. [`PinState`] records
//! are volatile: they grow lazily when an operation references a pin that has
//! not been seen yet, and are mutated both by inbound value reports and by
//! local write calls (optimistic update before confirmation).

use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use crate::errors::Error;

/// What a pin is currently being used for.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PinUsage {
    /// No commitment yet. `pin_mode(_, Output)` on a pin supporting both
    /// analog and digital write deliberately stays here until the first
    /// write call decides.
    #[default]
    Unset,
    AnalogRead,
    AnalogWrite,
    DigitalRead,
    DigitalReadPullup,
    DigitalWrite,
}

impl Display for PinUsage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Requested direction for [`pin_mode`](crate::Device::pin_mode).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDirection {
    Output,
    Input,
    InputPullup,
}

/// Condition under which a registered pseudo-interrupt fires.
///
/// Interrupts are emulated from polled digital-port reports: `Change` matches
/// every report, `High`/`Rising` match a reported 1, `Low`/`Falling` match a
/// reported 0.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Low,
    High,
    Change,
    Rising,
    Falling,
}

impl Trigger {
    /// Whether a reported digital level satisfies this trigger.
    pub fn matches(&self, level: bool) -> bool {
        match self {
            Trigger::Change => true,
            Trigger::High | Trigger::Rising => level,
            Trigger::Low | Trigger::Falling => !level,
        }
    }
}

/// Immutable description of what a pin can do, as reported by the device
/// during the capability survey.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PinCapability {
    /// Bitset of supported operations (see the associated constants).
    pub supported: u8,
    /// Analog read precision in bits (0 when analog read is unsupported).
    pub analog_read_resolution: u8,
    /// Analog write (PWM) precision in bits (0 when unsupported).
    pub analog_write_resolution: u8,
    /// Device-assigned analog channel used on the wire for analog value
    /// reports, distinct from the pin number.
    pub channel: Option<u8>,
}

impl PinCapability {
    pub const ANALOG_READ: u8 = 0x01;
    pub const ANALOG_WRITE: u8 = 0x02;
    pub const DIGITAL_READ: u8 = 0x04;
    pub const DIGITAL_READ_PULLUP: u8 = 0x08;
    pub const DIGITAL_WRITE: u8 = 0x10;

    pub fn analog_read_available(&self) -> bool {
        self.supported & Self::ANALOG_READ != 0
    }

    pub fn analog_write_available(&self) -> bool {
        self.supported & Self::ANALOG_WRITE != 0
    }

    pub fn digital_read_available(&self) -> bool {
        self.supported & Self::DIGITAL_READ != 0
    }

    pub fn digital_read_pullup_available(&self) -> bool {
        self.supported & Self::DIGITAL_READ_PULLUP != 0
    }

    pub fn digital_write_available(&self) -> bool {
        self.supported & Self::DIGITAL_WRITE != 0
    }
}

/// Volatile per-pin state: current usage and last known value.
///
/// Analog values need up to 14 bits on the wire; digital values are 0/1.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PinState {
    pub usage: PinUsage,
    pub value: u16,
}

/// A registered pseudo-interrupt for one pin.
#[derive(Clone)]
pub struct InterruptRegistration {
    pub(crate) isr: Arc<dyn Fn() + Send + Sync>,
    pub trigger: Trigger,
}

impl Debug for InterruptRegistration {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptRegistration")
            .field("trigger", &self.trigger)
            .finish()
    }
}

/// Grows `cache` so that `index` becomes addressable, filling new slots with
/// `T::default()`.
///
/// Allocation failure is reported as [`Error::OutOfMemory`] and leaves the
/// cache untouched.
pub(crate) fn grow_to<T: Default + Clone>(cache: &mut Vec<T>, index: usize) -> Result<(), Error> {
    if index < cache.len() {
        return Ok(());
    }
    cache.try_reserve(index + 1 - cache.len())?;
    cache.resize(index + 1, T::default());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_bits() {
        let capability = PinCapability {
            supported: PinCapability::ANALOG_READ | PinCapability::DIGITAL_WRITE,
            analog_read_resolution: 10,
            analog_write_resolution: 0,
            channel: Some(0),
        };
        assert!(capability.analog_read_available());
        assert!(capability.digital_write_available());
        assert!(!capability.analog_write_available());
        assert!(!capability.digital_read_available());
        assert!(!capability.digital_read_pullup_available());
    }

    #[test]
    fn test_trigger_matches() {
        assert!(Trigger::Change.matches(true));
        assert!(Trigger::Change.matches(false));
        assert!(Trigger::High.matches(true));
        assert!(!Trigger::High.matches(false));
        assert!(Trigger::Rising.matches(true));
        assert!(!Trigger::Rising.matches(false));
        assert!(Trigger::Low.matches(false));
        assert!(!Trigger::Low.matches(true));
        assert!(Trigger::Falling.matches(false));
        assert!(!Trigger::Falling.matches(true));
    }

    #[test]
    fn test_grow_to() {
        let mut cache: Vec<PinState> = vec![];
        grow_to(&mut cache, 5).unwrap();
        assert_eq!(cache.len(), 6);
        assert_eq!(cache[5], PinState::default());

        // Growing below the current length is a no-op.
        cache[2].value = 42;
        grow_to(&mut cache, 2).unwrap();
        assert_eq!(cache.len(), 6);
        assert_eq!(cache[2].value, 42);
    }

    #[test]
    fn test_pin_usage_display() {
        assert_eq!(format!("{}", PinUsage::DigitalReadPullup), "DigitalReadPullup");
        assert_eq!(format!("{}", PinUsage::Unset), "Unset");
    }
}
