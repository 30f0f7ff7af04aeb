#![doc(html_root_url = "https://docs.rs/telewire/0.1.0")]

//! <h1 align="center">TELEWIRE - Wiring over the wire</h1>
//! <div style="text-align:center;font-style:italic;">Telewire remote-controls the pins and I2C bus of a Firmata-speaking microcontroller.</div>
//! <br/>
//!
//! # Features
//!
//! **Telewire** exposes the familiar Wiring pin API (`pin_mode`, `digital_write`,
//! `analog_read`, ...) for a microcontroller that sits on the far side of a
//! serial link and runs a [Firmata](https://github.com/firmata/protocol)
//! firmware, such as the StandardFirmata sketch shipped with the Arduino IDE.
//!
//! - [`Device`]: attach to the remote board, survey its pin capabilities and
//!   read/write pins through a local cache kept fresh by a background drain
//!   thread
//! - Pseudo-interrupts: closures fired from polled digital reports
//!   ([`Device::attach_interrupt`])
//! - [`I2cBus`]: master and slave I2C transactions tunneled through the
//!   Firmata sysex channel
//! - Blocking and callback completion styles for every lifecycle operation
//!   (attach, survey, refresh, reset)
//!
//! # Getting Started
//!
//! - Install a [Firmata firmware](https://github.com/firmata/arduino) on the board.
//!
//! - Add the following to your `Cargo.toml`:
//! ```toml
//! [dependencies]
//! telewire = "0.1.0"
//! ```
//!
//! ```no_run
//! use telewire::transport::serial::Serial;
//! use telewire::{Device, PinDirection};
//!
//! fn main() -> Result<(), telewire::Error> {
//!     let device = Device::new(Serial::new("/dev/ttyACM0"));
//!     device.attach(None)?;
//!     device.survey(None)?;
//!
//!     device.pin_mode(13, PinDirection::Output)?;
//!     device.digital_write(13, true)?;
//!     Ok(())
//! }
//! ```
//!
//! # Feature flags
//!
//! - **libudev** -- (enabled by default) Activates `serialport` crate _libudev_ feature under-the-hood (required on Linux only for port listing).
//! - **serde** -- Enables serialize/deserialize capabilities for plain data types.
//! - **mocks** -- Exposes the scripted [`mocks::MockTransport`] (useful for tests mostly).

pub mod bridge;
pub mod device;
pub mod errors;
pub mod i2c;
#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
pub mod pins;
pub mod transport;

pub use crate::bridge::Signal;
pub use crate::device::{
    Device, DeviceData, FirmwareIdentity, SemanticVersion, ANALOG_NOT_READY, DEFAULT_TIMEOUT,
};
pub use crate::errors::Error;
pub use crate::i2c::I2cBus;
pub use crate::pins::{PinCapability, PinDirection, PinState, PinUsage, Trigger};
