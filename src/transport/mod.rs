//! Byte-stream boundary between the protocol engine and the outside world.
//!
//! The engine only ever talks to a [`Transport`]: open/close lifecycle,
//! non-blocking `available`/`read_byte` on the inbound side, `write`/`flush`
//! on the outbound side. "Data arrived" notification is realized by the
//! engine's drain thread polling [`Transport::available`].

use std::fmt::{Debug, Display};

use crate::errors::Error;
use crate::transport::private::TraitToAny;

pub mod serial;

pub(crate) mod private {
    use std::any::Any;

    pub trait TraitToAny: 'static {
        fn as_any(&self) -> &dyn Any;
        fn as_any_mut(&mut self) -> &mut dyn Any;
    }

    impl<T: 'static> TraitToAny for T {
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }
}

/// The engine and its I2C handle share one exclusively locked transport.
pub(crate) type SharedTransport = std::sync::Arc<parking_lot::Mutex<Box<dyn Transport>>>;

pub trait Transport: Debug + Display + Send + TraitToAny {
    /// Opens communication (in a blocking way) using the transport layer.
    fn open(&mut self) -> Result<(), Error>;

    /// Gracefully shuts down the transport layer.
    fn close(&mut self) -> Result<(), Error>;

    /// Number of bytes ready to be read without blocking.
    fn available(&mut self) -> Result<usize, Error>;

    /// Reads a single byte from the internal connection.
    ///
    /// # Notes
    /// Only call after [`Transport::available`] reported at least one byte,
    /// otherwise this may block depending on the implementation.
    fn read_byte(&mut self) -> Result<u8, Error>;

    /// Writes bytes to the internal connection. For more details see [`std::io::Write::write`].
    ///
    /// # Notes
    /// This function blocks until the write operation is complete.
    fn write(&mut self, buf: &[u8]) -> Result<(), Error>;

    /// Flushes any buffered outbound bytes.
    fn flush(&mut self) -> Result<(), Error>;
}
