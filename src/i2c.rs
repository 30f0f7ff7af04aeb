//! I2C master/slave sub-protocol, tunneled through sysex frames.
//!
//! [`I2cBus`] is a typed, clonable handle obtained from
//! [`Device::i2c`](crate::Device::i2c). All queue state lives behind its own
//! mutex, separate from the pin caches; the engine's dispatch feeds inbound
//! I2C frames into it from the drain thread.

use std::collections::VecDeque;
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use log::{trace, warn};
use parking_lot::Mutex;

use crate::device::codec::{
    pack_14bit, unpack_14bit, unpack_7bit_pairs, END_SYSEX, I2C_CONFIG, I2C_READ, I2C_REPLY,
    I2C_REQUEST, I2C_RESTART_TX_MASK, I2C_WRITE, START_SYSEX,
};
use crate::errors::{Error, WireError};
use crate::transport::SharedTransport;

/// Reserved I2C addresses (0x00-0x07 and 0x78-0x7F) are rejected.
const FIRST_VALID_ADDRESS: u8 = 0x08;
const LAST_VALID_ADDRESS: u8 = 0x77;

type ReceiveHandler = Arc<dyn Fn(usize) + Send + Sync>;
type RequestHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct I2cShared {
    /// Bus started via [`I2cBus::begin`].
    enabled: bool,
    /// `Some` when operating as a slave at that address.
    slave_address: Option<u8>,
    /// Bytes received and not yet consumed by [`I2cBus::read`].
    rx: VecDeque<u8>,
    /// Outbound bytes queued between begin_transmission and end_transmission
    /// (master), or awaiting flush (slave).
    tx: Vec<u8>,
    /// Target of the transmission being built.
    tx_address: u8,
    /// Completion slot for the single outstanding blocking read request.
    pending: Option<SyncSender<usize>>,
    on_receive: Option<ReceiveHandler>,
    on_request: Option<RequestHandler>,
}

/// Handle onto the remote device's I2C bus.
///
/// Clones share the same queues and transport. Only one blocking
/// [`request_from`](I2cBus::request_from) may be outstanding at a time; a
/// second one fails with [`Error::WouldBlock`] instead of interleaving
/// replies.
#[derive(Clone)]
pub struct I2cBus {
    shared: Arc<Mutex<I2cShared>>,
    transport: SharedTransport,
    timeout: Duration,
}

impl std::fmt::Debug for I2cBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("I2cBus")
            .field("enabled", &shared.enabled)
            .field("slave_address", &shared.slave_address)
            .field("queued", &shared.rx.len())
            .finish()
    }
}

impl I2cBus {
    pub(crate) fn new(transport: SharedTransport, timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Mutex::new(I2cShared::default())),
            transport,
            timeout,
        }
    }

    pub(crate) fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Starts the bus, as a master (`None`) or as a slave at `address`.
    ///
    /// Sends an I2C_CONFIG frame enabling the remote device's I2C hardware
    /// with no read delay.
    pub fn begin(&self, address: Option<u8>) -> Result<(), Error> {
        if let Some(address) = address {
            validate_address(address)?;
        }
        {
            let mut shared = self.shared.lock();
            shared.enabled = true;
            shared.slave_address = address;
            // Leftovers from before the (re)start are not this bus's data.
            shared.rx.clear();
        }
        self.send(&[START_SYSEX, I2C_CONFIG, 0x00, 0x00, END_SYSEX])
    }

    /// Begins building a write transmission to `address`.
    pub fn begin_transmission(&self, address: u8) -> Result<(), Error> {
        validate_address(address)?;
        let mut shared = self.shared.lock();
        ensure_enabled(&shared)?;
        shared.tx.clear();
        shared.tx_address = address;
        Ok(())
    }

    /// Queues one byte for the transmission in progress (master) or the next
    /// flush (slave). Returns the number of bytes accepted.
    pub fn write(&self, byte: u8) -> Result<usize, Error> {
        let mut shared = self.shared.lock();
        ensure_enabled(&shared)?;
        shared.tx.try_reserve(1)?;
        shared.tx.push(byte);
        Ok(1)
    }

    /// Sends the queued transmission as an I2C_REQUEST write frame.
    ///
    /// With `stop == false` the frame asks for a repeated start instead of a
    /// stop condition after the transfer.
    pub fn end_transmission(&self, stop: bool) -> Result<(), Error> {
        let frame = {
            let mut shared = self.shared.lock();
            ensure_enabled(&shared)?;
            let mut frame = Vec::with_capacity(5 + shared.tx.len() * 2);
            frame.push(START_SYSEX);
            frame.push(I2C_REQUEST);
            frame.push(shared.tx_address & 0x7F);
            frame.push(I2C_WRITE | restart_bit(!stop));
            for byte in shared.tx.drain(..) {
                frame.extend_from_slice(&pack_14bit(byte as u16));
            }
            frame.push(END_SYSEX);
            frame
        };
        self.send(&frame)
    }

    /// Requests `quantity` bytes from the slave at `address` and blocks until
    /// the reply lands in the receive queue or the bus timeout elapses.
    ///
    /// The receive queue is emptied of stale bytes first. Returns the number
    /// of bytes the reply carried.
    pub fn request_from(&self, address: u8, quantity: u8, stop: bool) -> Result<usize, Error> {
        validate_address(address)?;
        let (sender, receiver) = mpsc::sync_channel::<usize>(1);
        let frame = {
            let mut shared = self.shared.lock();
            ensure_enabled(&shared)?;
            if shared.pending.is_some() {
                return Err(Error::WouldBlock);
            }
            shared.pending = Some(sender);
            shared.rx.clear();
            let mut frame = vec![
                START_SYSEX,
                I2C_REQUEST,
                address & 0x7F,
                I2C_READ | restart_bit(!stop),
            ];
            frame.extend_from_slice(&pack_14bit(quantity as u16));
            frame.push(END_SYSEX);
            frame
        };
        if let Err(error) = self.send(&frame) {
            self.shared.lock().pending = None;
            return Err(error);
        }
        match receiver.recv_timeout(self.timeout) {
            Ok(count) => Ok(count),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.shared.lock().pending = None;
                Err(Error::Timeout {
                    after_ms: self.timeout.as_millis() as u64,
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                self.shared.lock().pending = None;
                Err(Error::WouldBlock)
            }
        }
    }

    /// Bytes waiting in the receive queue.
    pub fn available(&self) -> usize {
        self.shared.lock().rx.len()
    }

    /// Pops the next received byte, oldest first.
    pub fn read(&self) -> Option<u8> {
        self.shared.lock().rx.pop_front()
    }

    /// Bus clock selection is not part of the wire protocol.
    pub fn set_clock(&self, _frequency: u32) -> Result<(), Error> {
        Err(Error::Unsupported {
            operation: "i2c clock selection",
        })
    }

    /// Registers the handler fired when inbound data lands in the receive
    /// queue, with the number of bytes received.
    pub fn on_receive<F>(&self, handler: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.shared.lock().on_receive = Some(Arc::new(handler));
    }

    /// Registers the handler fired when a master asks this slave for data.
    /// The handler typically queues bytes with [`write`](I2cBus::write) and
    /// calls [`flush`](I2cBus::flush).
    pub fn on_request<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.lock().on_request = Some(Arc::new(handler));
    }

    /// Pushes the queued slave response onto the wire as an I2C_REPLY.
    ///
    /// Only meaningful in slave mode; a master has nothing to flush.
    pub fn flush(&self) -> Result<(), Error> {
        let frame = {
            let mut shared = self.shared.lock();
            ensure_enabled(&shared)?;
            let address = shared.slave_address.ok_or(Error::NotPermitted {
                info: String::from("flush is a slave-mode operation"),
            })?;
            let mut frame = Vec::with_capacity(9 + shared.tx.len() * 2);
            frame.push(START_SYSEX);
            frame.push(I2C_REPLY);
            frame.extend_from_slice(&pack_14bit(address as u16));
            // Register echo slot, unused by slave responses.
            frame.extend_from_slice(&pack_14bit(0));
            for byte in shared.tx.drain(..) {
                frame.extend_from_slice(&pack_14bit(byte as u16));
            }
            frame.push(END_SYSEX);
            frame
        };
        self.send(&frame)
    }

    /// Stops the bus: drops handlers, abandons any outstanding request and
    /// releases queue memory.
    pub fn end(&self) {
        let mut shared = self.shared.lock();
        shared.enabled = false;
        shared.slave_address = None;
        shared.on_receive = None;
        shared.on_request = None;
        shared.pending = None;
        shared.rx = VecDeque::new();
        shared.tx = Vec::new();
    }

    /// Dispatch entry for an inbound I2C_REPLY sysex payload.
    ///
    /// Reply layout: address pair, register echo pair, then data pairs.
    /// Data bytes land in the receive queue; a blocked
    /// [`request_from`](I2cBus::request_from) is completed and `on_receive`
    /// fires, both outside the queue lock.
    pub(crate) fn handle_reply(&self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() < 4 {
            return Err(WireError::MessageTooShort {
                operation: "handle_reply",
                expected: 4,
                received: payload.len(),
            }
            .into());
        }
        let address = unpack_14bit(payload[0], payload[1]);
        if address > 0x7F {
            // No 10-bit support: keep the raw address bytes readable so the
            // caller can at least observe the frame happened.
            warn!("{}", Error::from(WireError::TenBitAddress));
            let (pending, queued) = {
                let mut shared = self.shared.lock();
                shared.rx.try_reserve(2)?;
                shared.rx.push_back(payload[0]);
                shared.rx.push_back(payload[1]);
                (shared.pending.take(), shared.rx.len())
            };
            // A blocked request still completes, with the degraded bytes.
            if let Some(sender) = pending {
                let _ = sender.send(queued);
            }
            return Ok(());
        }
        let data = unpack_7bit_pairs(&payload[4..]);
        trace!("i2c reply from {:#04x}: {} byte(s)", address, data.len());
        let (pending, handler) = {
            let mut shared = self.shared.lock();
            shared.rx.try_reserve(data.len())?;
            shared.rx.extend(&data);
            (shared.pending.take(), shared.on_receive.clone())
        };
        if let Some(sender) = pending {
            // The requester may have timed out already; that is fine.
            let _ = sender.send(data.len());
        }
        if let Some(handler) = handler {
            handler(data.len());
        }
        Ok(())
    }

    /// Dispatch entry for an inbound I2C_REQUEST addressed to this slave.
    ///
    /// Read requests fire `on_request`; write requests queue the carried
    /// data and fire `on_receive`. Frames for other addresses are ignored.
    pub(crate) fn handle_request(&self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() < 2 {
            return Err(WireError::MessageTooShort {
                operation: "handle_request",
                expected: 2,
                received: payload.len(),
            }
            .into());
        }
        let address = payload[0] & 0x7F;
        let header = payload[1];
        let (is_ours, read) = {
            let shared = self.shared.lock();
            (shared.slave_address == Some(address), header & I2C_READ != 0)
        };
        if !is_ours {
            trace!("i2c request for {:#04x} ignored", address);
            return Ok(());
        }
        if read {
            let handler = self.shared.lock().on_request.clone();
            if let Some(handler) = handler {
                handler();
            }
            return Ok(());
        }
        let data = unpack_7bit_pairs(&payload[2..]);
        let handler = {
            let mut shared = self.shared.lock();
            shared.rx.try_reserve(data.len())?;
            shared.rx.extend(&data);
            shared.on_receive.clone()
        };
        if let Some(handler) = handler {
            handler(data.len());
        }
        Ok(())
    }

    fn send(&self, frame: &[u8]) -> Result<(), Error> {
        trace!("i2c write: {:02X?}", frame);
        let mut transport = self.transport.lock();
        transport.write(frame)?;
        transport.flush()
    }
}

fn validate_address(address: u8) -> Result<(), Error> {
    if !(FIRST_VALID_ADDRESS..=LAST_VALID_ADDRESS).contains(&address) {
        return Err(Error::InvalidArgument {
            info: format!("i2c address {:#04x} is reserved", address),
        });
    }
    Ok(())
}

fn ensure_enabled(shared: &I2cShared) -> Result<(), Error> {
    if !shared.enabled {
        return Err(Error::NotPermitted {
            info: String::from("i2c bus has not been started"),
        });
    }
    Ok(())
}

fn restart_bit(restart: bool) -> u8 {
    if restart {
        I2C_RESTART_TX_MASK
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use super::*;
    use crate::mocks::MockTransport;
    use crate::transport::Transport;

    fn test_bus() -> I2cBus {
        let transport: SharedTransport = Arc::new(Mutex::new(Box::new(MockTransport::default())));
        I2cBus::new(transport, Duration::from_millis(10))
    }

    fn written(bus: &I2cBus) -> Vec<u8> {
        let transport = bus.transport.lock();
        transport
            .as_ref()
            .as_any()
            .downcast_ref::<MockTransport>()
            .unwrap()
            .write_buf
            .clone()
    }

    #[test]
    fn test_begin_sends_config() {
        let bus = test_bus();
        bus.begin(None).unwrap();
        assert_eq!(
            written(&bus),
            vec![START_SYSEX, I2C_CONFIG, 0x00, 0x00, END_SYSEX]
        );
    }

    #[test]
    fn test_begin_rejects_reserved_address() {
        let bus = test_bus();
        assert!(matches!(
            bus.begin(Some(0x03)),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            bus.begin(Some(0x78)),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(bus.begin(Some(0x42)).is_ok());
    }

    #[test]
    fn test_operations_require_begin() {
        let bus = test_bus();
        assert!(matches!(
            bus.begin_transmission(0x42),
            Err(Error::NotPermitted { .. })
        ));
        assert!(matches!(bus.write(0x01), Err(Error::NotPermitted { .. })));
        assert!(matches!(
            bus.request_from(0x42, 2, true),
            Err(Error::NotPermitted { .. })
        ));
    }

    #[test]
    fn test_write_transaction_framing() {
        let bus = test_bus();
        bus.begin(None).unwrap();
        bus.begin_transmission(0x42).unwrap();
        assert_eq!(bus.write(0xC8).unwrap(), 1);
        assert_eq!(bus.write(0x12).unwrap(), 1);
        bus.end_transmission(true).unwrap();

        let frames = written(&bus);
        // Skip the I2C_CONFIG frame emitted by begin.
        let frame = &frames[5..];
        assert_eq!(
            frame,
            [
                START_SYSEX,
                I2C_REQUEST,
                0x42,
                I2C_WRITE,
                0x48, // 0xC8 low 7 bits
                0x01, // 0xC8 bit 7
                0x12,
                0x00,
                END_SYSEX
            ]
        );
    }

    #[test]
    fn test_restart_bit_set_when_stop_withheld() {
        let bus = test_bus();
        bus.begin(None).unwrap();
        bus.begin_transmission(0x42).unwrap();
        bus.write(0x01).unwrap();
        bus.end_transmission(false).unwrap();
        bus.begin_transmission(0x42).unwrap();
        bus.write(0x02).unwrap();
        bus.end_transmission(true).unwrap();
        // The read request goes unanswered; only its frame matters here.
        let _ = bus.request_from(0x42, 4, false);

        let frames = written(&bus);
        // stop=false frames carry the restart bit, stop=true frames do not.
        assert_eq!(frames[8], I2C_WRITE | I2C_RESTART_TX_MASK);
        assert_eq!(frames[15], I2C_WRITE);
        assert_eq!(frames[22], I2C_READ | I2C_RESTART_TX_MASK);
    }

    #[test]
    fn test_all_256_values_round_trip() {
        let bus = test_bus();
        bus.begin(None).unwrap();
        bus.begin_transmission(0x42).unwrap();
        for value in 0..=255u8 {
            bus.write(value).unwrap();
        }
        bus.end_transmission(true).unwrap();

        let frames = written(&bus);
        let payload = &frames[9..frames.len() - 1];
        let decoded = unpack_7bit_pairs(payload);
        let expected: Vec<u8> = (0..=255).collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_request_from_times_out() {
        let bus = test_bus();
        bus.begin(None).unwrap();
        let start = Instant::now();
        let result = bus.request_from(0x42, 4, true);
        assert!(matches!(result, Err(Error::Timeout { after_ms: 10 })));
        assert!(start.elapsed() < Duration::from_millis(500));
        // The pending slot is released for the next request.
        assert!(bus.shared.lock().pending.is_none());
    }

    #[test]
    fn test_request_from_completed_by_reply() {
        let bus = test_bus();
        bus.begin(None).unwrap();

        let clone = bus.clone();
        let replier = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(2));
            // Reply from 0x42, register 0, data [0xC8, 0x12].
            clone
                .handle_reply(&[0x42, 0x00, 0x00, 0x00, 0x48, 0x01, 0x12, 0x00])
                .unwrap();
        });

        let count = bus.request_from(0x42, 2, true).unwrap();
        replier.join().unwrap();
        assert_eq!(count, 2);
        assert_eq!(bus.available(), 2);
        assert_eq!(bus.read(), Some(0xC8));
        assert_eq!(bus.read(), Some(0x12));
        assert_eq!(bus.read(), None);
    }

    #[test]
    fn test_reply_fires_on_receive() {
        let bus = test_bus();
        bus.begin(None).unwrap();
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        bus.on_receive(move |count| {
            counter.store(count, Ordering::SeqCst);
        });
        bus.handle_reply(&[0x42, 0x00, 0x00, 0x00, 0x01, 0x00, 0x02, 0x00, 0x03, 0x00])
            .unwrap();
        assert_eq!(received.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_ten_bit_reply_degrades() {
        let bus = test_bus();
        bus.begin(None).unwrap();
        // Address 0x142: msb byte carries bits above 7.
        bus.handle_reply(&[0x42, 0x02, 0x00, 0x00, 0x01, 0x00]).unwrap();
        // Data is not decoded; the raw address bytes are readable instead.
        assert_eq!(bus.available(), 2);
        assert_eq!(bus.read(), Some(0x42));
        assert_eq!(bus.read(), Some(0x02));
    }

    #[test]
    fn test_ten_bit_reply_still_completes_request() {
        let bus = test_bus();
        bus.begin(None).unwrap();

        let clone = bus.clone();
        let replier = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(2));
            clone
                .handle_reply(&[0x42, 0x02, 0x00, 0x00, 0x01, 0x00])
                .unwrap();
        });

        // The requester unblocks instead of riding out the timeout.
        let count = bus.request_from(0x42, 2, true).unwrap();
        replier.join().unwrap();
        assert_eq!(count, 2);
        assert_eq!(bus.read(), Some(0x42));
        assert_eq!(bus.read(), Some(0x02));
    }

    #[test]
    fn test_stale_bytes_discarded() {
        let bus = test_bus();
        bus.begin(None).unwrap();
        bus.handle_reply(&[0x42, 0x00, 0x00, 0x00, 0x09, 0x00]).unwrap();
        assert_eq!(bus.available(), 1);

        // begin drops anything left over from earlier traffic.
        bus.begin(None).unwrap();
        assert_eq!(bus.available(), 0);

        // So does a new read request: only the reply's bytes come back.
        bus.handle_reply(&[0x42, 0x00, 0x00, 0x00, 0x09, 0x00]).unwrap();
        let clone = bus.clone();
        let replier = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(2));
            clone
                .handle_reply(&[0x42, 0x00, 0x00, 0x00, 0x48, 0x01])
                .unwrap();
        });
        let count = bus.request_from(0x42, 1, true).unwrap();
        replier.join().unwrap();
        assert_eq!(count, 1);
        assert_eq!(bus.available(), 1);
        assert_eq!(bus.read(), Some(0xC8));
    }

    #[test]
    fn test_short_reply_rejected() {
        let bus = test_bus();
        assert!(matches!(
            bus.handle_reply(&[0x42, 0x00]),
            Err(Error::WireProtocol { .. })
        ));
    }

    #[test]
    fn test_slave_receives_write_request() {
        let bus = test_bus();
        bus.begin(Some(0x42)).unwrap();
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        bus.on_receive(move |count| {
            counter.store(count, Ordering::SeqCst);
        });

        // Write request for another address is ignored.
        bus.handle_request(&[0x17, I2C_WRITE, 0x05, 0x00]).unwrap();
        assert_eq!(bus.available(), 0);

        bus.handle_request(&[0x42, I2C_WRITE, 0x05, 0x00, 0x7F, 0x01])
            .unwrap();
        assert_eq!(received.load(Ordering::SeqCst), 2);
        assert_eq!(bus.read(), Some(0x05));
        assert_eq!(bus.read(), Some(0xFF));
    }

    #[test]
    fn test_slave_read_request_fires_on_request_and_flush_replies() {
        let bus = test_bus();
        bus.begin(Some(0x42)).unwrap();
        let asked = Arc::new(AtomicUsize::new(0));
        let counter = asked.clone();
        bus.on_request(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.handle_request(&[0x42, I2C_READ, 0x02, 0x00]).unwrap();
        assert_eq!(asked.load(Ordering::SeqCst), 1);

        bus.write(0xAB).unwrap();
        bus.flush().unwrap();
        let frames = written(&bus);
        let frame = &frames[5..];
        assert_eq!(
            frame,
            [
                START_SYSEX,
                I2C_REPLY,
                0x42,
                0x00, // address msb
                0x00,
                0x00, // register echo
                0x2B,
                0x01, // 0xAB split
                END_SYSEX
            ]
        );
    }

    #[test]
    fn test_flush_not_permitted_for_master() {
        let bus = test_bus();
        bus.begin(None).unwrap();
        assert!(matches!(bus.flush(), Err(Error::NotPermitted { .. })));
    }

    #[test]
    fn test_set_clock_unsupported() {
        let bus = test_bus();
        assert!(matches!(
            bus.set_clock(400_000),
            Err(Error::Unsupported { .. })
        ));
    }

    #[test]
    fn test_end_resets_bus() {
        let bus = test_bus();
        bus.begin(Some(0x42)).unwrap();
        bus.write(0x01).unwrap();
        bus.handle_request(&[0x42, I2C_WRITE, 0x09, 0x00]).unwrap();
        bus.end();
        assert_eq!(bus.available(), 0);
        assert!(matches!(bus.write(0x01), Err(Error::NotPermitted { .. })));
    }
}
