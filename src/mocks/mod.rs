//! Mock transport used throughout the crate's tests.

use std::fmt::{Display, Formatter};

use crate::errors::Error;
use crate::transport::Transport;

/// A scripted transport: reads come from `read_buf`, writes accumulate in
/// `write_buf` for later assertion.
#[derive(Clone, Debug, Default)]
pub struct MockTransport {
    pub connected: bool,
    pub read_buf: Vec<u8>,
    pub read_index: usize,
    pub write_buf: Vec<u8>,
}

impl MockTransport {
    /// A mock whose inbound stream is pre-loaded with `bytes`.
    pub fn with_bytes(bytes: &[u8]) -> Self {
        Self {
            read_buf: bytes.to_vec(),
            ..Default::default()
        }
    }

    /// Appends bytes to the inbound stream.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.read_buf.extend_from_slice(bytes);
    }
}

impl Display for MockTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MockTransport")
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> Result<(), Error> {
        self.connected = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.connected = false;
        Ok(())
    }

    fn available(&mut self) -> Result<usize, Error> {
        Ok(self.read_buf.len() - self.read_index)
    }

    fn read_byte(&mut self) -> Result<u8, Error> {
        match self.read_buf.get(self.read_index) {
            Some(byte) => {
                self.read_index += 1;
                Ok(*byte)
            }
            None => Err(Error::Io {
                info: String::from("Mock read underrun"),
            }),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.write_buf.extend_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_transport_read() {
        let mut mock = MockTransport::with_bytes(&[0xF9, 0x02, 0x05]);
        assert_eq!(mock.available().unwrap(), 3);
        assert_eq!(mock.read_byte().unwrap(), 0xF9);
        assert_eq!(mock.read_byte().unwrap(), 0x02);
        assert_eq!(mock.available().unwrap(), 1);
        assert_eq!(mock.read_byte().unwrap(), 0x05);
        assert!(mock.read_byte().is_err());
    }

    #[test]
    fn test_mock_transport_write() {
        let mut mock = MockTransport::default();
        mock.write(&[0xF4, 0x0D]).unwrap();
        mock.write(&[0x01]).unwrap();
        assert_eq!(mock.write_buf, vec![0xF4, 0x0D, 0x01]);
    }
}
