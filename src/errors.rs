use std::collections::TryReserveError;

use log::error;
use snafu::Snafu;

pub use crate::errors::Error::*;
use crate::pins::PinUsage;

/// Builds the [`Error::NotPermitted`] payload for a pin already committed to
/// a conflicting usage.
pub(crate) fn committed(pin: u8, usage: PinUsage) -> Error {
    NotPermitted {
        info: format!("pin {} is committed to {}", pin, usage),
    }
}

/// Errors surfaced by every fallible operation of the crate.
///
/// Validation failures are raised before any wire traffic is generated;
/// failures reported by the remote device after the fact are logged through
/// the [`log`] facade instead, so a single bad message never aborts the
/// inbound drain loop.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Invalid argument: {info}.
    InvalidArgument { info: String },
    /// No such pin: {pin}.
    NoSuchPin { pin: u8 },
    /// Operation not supported: {operation}.
    Unsupported { operation: &'static str },
    /// Operation not permitted: {info}.
    NotPermitted { info: String },
    /// Out of memory while {context}.
    OutOfMemory { context: &'static str },
    /// Timed out after {after_ms}ms.
    Timeout { after_ms: u64 },
    /// Wait primitive reported a non-ready, non-timeout state.
    WouldBlock,
    /// Wire protocol error: {source}.
    WireProtocol { source: WireError },
    /// I/O error: {info}.
    Io { info: String },
}

/// Malformed or unexpected payloads received from the device.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WireError {
    /// Not enough bytes received - '{operation}' expected {expected} bytes, {received} received
    MessageTooShort {
        operation: &'static str,
        expected: usize,
        received: usize,
    },
    /// Unknown pin mode byte: {value:#04x}
    UnknownMode { value: u8 },
    /// 10-bit I2C addressing is not supported
    TenBitAddress,
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        error!("std::io error {:?}", error);
        let info = match error.kind() {
            std::io::ErrorKind::NotFound => String::from("Device not found or already in use"),
            std::io::ErrorKind::PermissionDenied => String::from("Device connection lost"),
            _ => error.to_string(),
        };
        Self::Io { info }
    }
}

impl From<WireError> for Error {
    fn from(value: WireError) -> Self {
        Self::WireProtocol { source: value }
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory {
            context: "growing a pin cache",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::pins::PinUsage;

    #[test]
    fn test_error_display() {
        let error = InvalidArgument {
            info: "sampling interval must be >= 1".to_string(),
        };
        assert_eq!(
            format!("{}", error),
            "Invalid argument: sampling interval must be >= 1."
        );

        let error = NoSuchPin { pin: 66 };
        assert_eq!(format!("{}", error), "No such pin: 66.");

        let error = committed(3, PinUsage::DigitalWrite);
        assert_eq!(
            format!("{}", error),
            "Operation not permitted: pin 3 is committed to DigitalWrite."
        );

        let error = Timeout { after_ms: 50 };
        assert_eq!(format!("{}", error), "Timed out after 50ms.");
    }

    #[test]
    fn test_wire_error_display() {
        let error = Error::from(WireError::MessageTooShort {
            operation: "handle_pin_state",
            expected: 3,
            received: 1,
        });
        assert_eq!(
            format!("{}", error),
            "Wire protocol error: Not enough bytes received - 'handle_pin_state' expected 3 bytes, 1 received."
        );

        let error = Error::from(WireError::TenBitAddress);
        assert_eq!(
            format!("{}", error),
            "Wire protocol error: 10-bit I2C addressing is not supported."
        );
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "port not found");
        let error: Error = io_error.into();
        assert_eq!(
            format!("{}", error),
            "I/O error: Device not found or already in use."
        );
    }
}
