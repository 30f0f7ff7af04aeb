use std::fmt::{Display, Formatter};
use std::io::{Read, Write};
use std::time::Duration;

use log::trace;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::errors::Error;
use crate::transport::Transport;

/// Serial transport: 57600 baud, 8 data bits, no parity, 1 stop bit, no flow
/// control (the standard Firmata link configuration).
#[derive(Debug)]
pub struct Serial {
    /// The connection port.
    port: String,
    /// A Read/Write io object.
    io: Option<Box<dyn SerialPort>>,
}

impl Serial {
    /// Constructs a new `Serial` transport for communication through the specified port.
    ///
    /// # Example
    /// ```no_run
    /// use telewire::transport::serial::Serial;
    /// use telewire::Device;
    ///
    /// let device = Device::new(Serial::new("/dev/ttyACM0"));
    /// ```
    pub fn new<P: Into<String>>(port: P) -> Self {
        Self {
            port: port.into(),
            io: None,
        }
    }

    /// Retrieves the configured port.
    pub fn get_port(&self) -> String {
        self.port.clone()
    }
}

impl Default for Serial {
    /// Creates a serial transport on the first available port, or an empty
    /// port name (which will fail during open) when none exists.
    fn default() -> Self {
        let ports = serialport::available_ports().unwrap_or_else(|_| vec![]);
        match ports.first() {
            Some(port) => Self::new(&port.port_name),
            None => Self::new(""),
        }
    }
}

impl Display for Serial {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Serial({})", self.port)
    }
}

impl Transport for Serial {
    fn open(&mut self) -> Result<(), Error> {
        let connexion = serialport::new(self.port.clone(), 57_600)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_secs(10))
            .open_native()?;
        trace!("Serial port is now opened: {:?}", connexion);

        self.io = Some(Box::new(connexion));

        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.io = None;
        Ok(())
    }

    fn available(&mut self) -> Result<usize, Error> {
        match self.io.as_mut() {
            Some(io) => Ok(io.bytes_to_read()? as usize),
            None => Ok(0),
        }
    }

    fn read_byte(&mut self) -> Result<u8, Error> {
        let mut buf = [0u8; 1];
        self.io
            .as_mut()
            .ok_or(Error::Io {
                info: String::from("Transport is not opened"),
            })?
            .read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.io
            .as_mut()
            .ok_or(Error::Io {
                info: String::from("Transport is not opened"),
            })?
            .write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.io
            .as_mut()
            .ok_or(Error::Io {
                info: String::from("Transport is not opened"),
            })?
            .flush()?;
        Ok(())
    }
}

impl From<serialport::Error> for Error {
    fn from(value: serialport::Error) -> Self {
        std::io::Error::from(value).into()
    }
}

#[cfg(test)]
mod tests {
    use serialport::ErrorKind;

    use super::*;

    #[test]
    fn test_new_serial_transport() {
        let transport = Serial::new("/dev/ttyACM0");
        assert_eq!(transport.get_port(), "/dev/ttyACM0");
        assert!(transport.io.is_none());
    }

    #[test]
    fn test_display_serial_transport() {
        let transport = Serial::new("/dev/ttyACM0");
        assert_eq!(format!("{}", transport), "Serial(/dev/ttyACM0)");
    }

    #[test]
    fn test_unopened_serial_transport() {
        let mut transport = Serial::new("/dev/ttyACM0");
        assert_eq!(transport.available().unwrap(), 0);
        assert!(transport.read_byte().is_err());
        assert!(transport.write(&[0xF9]).is_err());
        assert!(transport.flush().is_err());
        assert!(transport.close().is_ok());
    }

    #[test]
    fn test_from_serial_error() {
        let serial_error = serialport::Error {
            kind: ErrorKind::Unknown,
            description: String::from("test error"),
        };
        let custom_error: Error = serial_error.into();
        assert_eq!(custom_error.to_string(), "I/O error: test error.");

        let serial_error = serialport::Error {
            kind: ErrorKind::Io(std::io::ErrorKind::NotFound),
            description: String::from("IO error"),
        };
        let custom_error: Error = serial_error.into();
        assert_eq!(
            custom_error.to_string(),
            "I/O error: Device not found or already in use."
        );
    }
}
