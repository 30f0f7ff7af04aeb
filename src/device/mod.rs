//! Protocol engine: the host-side model of one remote Firmata device.
//!
//! Official Firmata documentation: https://github.com/firmata/protocol
//!
//! The engine owns the transport, the pin caches and a background drain
//! thread. Public operations validate against the caches before generating
//! any wire traffic; inbound messages are decoded on the drain thread and
//! folded back into the caches.

pub(crate) mod codec;
mod data;

use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{trace, warn};
use parking_lot::{Mutex, RwLock};

use crate::bridge::{self, Gate, Signal};
use crate::device::codec::*;
use crate::errors::{committed, Error, WireError};
use crate::i2c::I2cBus;
use crate::pins::{InterruptRegistration, PinCapability, PinDirection, PinUsage, Trigger};
use crate::transport::{SharedTransport, Transport};

pub use crate::device::data::{DeviceData, FirmwareIdentity, SemanticVersion};

/// Sentinel returned by [`Device::analog_read`] until the first report for a
/// freshly enabled pin arrives. One above the largest 14-bit wire value.
pub const ANALOG_NOT_READY: u16 = 0x4000;

/// Default bound for blocking operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Completion slots for the in-flight lifecycle operations.
#[derive(Default)]
struct Pendings {
    attach: Option<Signal>,
    survey: Option<Signal>,
    refresh: Option<Signal>,
}

/// Host-side handle onto one remote device.
///
/// Clones share all state; the drain thread holds one.
#[derive(Clone)]
pub struct Device {
    transport: SharedTransport,
    data: Arc<RwLock<DeviceData>>,
    pendings: Arc<Mutex<Pendings>>,
    refresh_gate: Arc<Gate>,
    decoder: Arc<Mutex<Decoder>>,
    drain: Arc<Mutex<Option<JoinHandle<()>>>>,
    running: Arc<AtomicBool>,
    i2c: I2cBus,
    timeout: Duration,
    jit_input: bool,
}

impl Device {
    /// Wraps `transport` in a new, unattached engine.
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        let transport: SharedTransport = Arc::new(Mutex::new(Box::new(transport)));
        let data = DeviceData {
            report_on_query: true,
            ..Default::default()
        };
        Self {
            i2c: I2cBus::new(transport.clone(), DEFAULT_TIMEOUT),
            transport,
            data: Arc::new(RwLock::new(data)),
            pendings: Arc::new(Mutex::new(Pendings::default())),
            refresh_gate: Arc::new(Gate::default()),
            decoder: Arc::new(Mutex::new(Decoder::new())),
            drain: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            timeout: DEFAULT_TIMEOUT,
            jit_input: false,
        }
    }

    /// Rebinds the bound used by blocking operations (default 5 seconds).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.i2c = self.i2c.with_timeout(timeout);
        self
    }

    /// Just-in-time input: when enabled, pins discovered in input modes
    /// during a refresh are released instead of kept reporting.
    pub fn with_jit_input(mut self, jit_input: bool) -> Self {
        self.jit_input = jit_input;
        self.data.write().report_on_query = !jit_input;
        self
    }

    // ########################################
    // Lifecycle

    /// Opens the transport, starts the drain thread and queries the remote
    /// firmware. Completes once the firmware report arrives.
    pub fn attach(&self, signal: Option<Signal>) -> Result<(), Error> {
        bridge::invoke(self.timeout, signal, |signal| {
            self.data.write().connected = false;
            self.transport.lock().open()?;
            self.pendings.lock().attach = Some(signal);
            self.start_drain()?;
            let mut transport = self.transport.lock();
            transport.write(&[START_SYSEX, REPORT_FIRMWARE, END_SYSEX])?;
            transport.flush()
        })
    }

    /// Stops the drain thread and closes the transport. Pending completions
    /// are dropped, releasing their blocked callers.
    pub fn detach(&self) -> Result<(), Error> {
        self.stop_drain();
        {
            let mut pendings = self.pendings.lock();
            pendings.attach = None;
            pendings.survey = None;
            pendings.refresh = None;
        }
        self.data.write().connected = false;
        self.transport.lock().close()
    }

    /// Queries the remote pin capabilities. Completes after the capability
    /// and analog mapping responses have been folded in and the refresh they
    /// chain into has finished.
    pub fn survey(&self, signal: Option<Signal>) -> Result<(), Error> {
        bridge::invoke(self.timeout, signal, |signal| {
            self.pendings.lock().survey = Some(signal);
            let mut transport = self.transport.lock();
            transport.write(&[START_SYSEX, CAPABILITY_QUERY, END_SYSEX])?;
            transport.flush()
        })
    }

    /// Re-reads the volatile state of every surveyed pin. Completes when the
    /// state response for the last pin arrives.
    pub fn refresh(&self, signal: Option<Signal>) -> Result<(), Error> {
        bridge::invoke(self.timeout, signal, |signal| self.start_refresh(signal))
    }

    /// Asks the remote device to reset, then reinitializes the local caches
    /// to the device's known power-up behavior: analog-capable pins report,
    /// remaining output-capable pins are low outputs.
    pub fn reset(&self, signal: Option<Signal>) -> Result<(), Error> {
        bridge::invoke(self.timeout, signal, |signal| {
            {
                let mut transport = self.transport.lock();
                transport.write(&[SYSTEM_RESET])?;
                transport.flush()?;
            }
            {
                let mut data = self.data.write();
                data.report_on_query = !self.jit_input;
                for pin in 0..data.states.len() {
                    let usage = match data.capabilities.get(pin) {
                        Some(capability) if capability.analog_read_available() => {
                            PinUsage::AnalogRead
                        }
                        Some(capability) if capability.digital_write_available() => {
                            PinUsage::DigitalWrite
                        }
                        _ => PinUsage::Unset,
                    };
                    data.states[pin].usage = usage;
                    data.states[pin].value = 0;
                }
            }
            // The remote reset is fire-and-forget; local state is already
            // consistent, so complete right away.
            signal();
            Ok(())
        })
    }

    /// Sets the delay between input report batches, in milliseconds.
    pub fn sampling_interval(&self, interval_ms: u16) -> Result<(), Error> {
        if interval_ms == 0 {
            return Err(Error::InvalidArgument {
                info: String::from("sampling interval must be >= 1"),
            });
        }
        let [lsb, msb] = pack_14bit(interval_ms);
        let mut transport = self.transport.lock();
        transport.write(&[START_SYSEX, SAMPLING_INTERVAL, lsb, msb, END_SYSEX])?;
        transport.flush()
    }

    // ########################################
    // Pin operations

    /// Declares how `pin` will be used.
    ///
    /// `Output` on a pin supporting both analog and digital write stays
    /// uncommitted; the first `analog_write` or `digital_write` call decides.
    /// Before a survey the declaration is taken on faith and the state cache
    /// grows to cover the pin.
    pub fn pin_mode(&self, pin: u8, direction: PinDirection) -> Result<(), Error> {
        validate_pin(pin)?;
        let mut frame: Vec<u8> = vec![];
        {
            let mut data = self.data.write();
            if data.capabilities.is_empty() {
                data.grow_pin_caches(pin)?;
                match direction {
                    PinDirection::Output => {
                        data.states[pin as usize].usage = PinUsage::Unset;
                    }
                    PinDirection::Input => {
                        data.states[pin as usize].usage = PinUsage::DigitalRead;
                        frame = input_frame(pin, PIN_MODE_INPUT);
                    }
                    PinDirection::InputPullup => {
                        data.states[pin as usize].usage = PinUsage::DigitalReadPullup;
                        frame = input_frame(pin, PIN_MODE_PULLUP);
                    }
                }
            } else {
                let capability = *data.capability(pin)?;
                match direction {
                    PinDirection::Output => {
                        if capability.analog_write_available()
                            && capability.digital_write_available()
                        {
                            data.states[pin as usize].usage = PinUsage::Unset;
                        } else if capability.analog_write_available() {
                            data.states[pin as usize].usage = PinUsage::AnalogWrite;
                            frame = vec![SET_PIN_MODE, pin, PIN_MODE_PWM];
                        } else if capability.digital_write_available() {
                            data.states[pin as usize].usage = PinUsage::DigitalWrite;
                            frame = vec![SET_PIN_MODE, pin, PIN_MODE_OUTPUT];
                        } else {
                            return Err(Error::Unsupported { operation: "output" });
                        }
                    }
                    PinDirection::Input => {
                        if !capability.digital_read_available() {
                            return Err(Error::Unsupported { operation: "input" });
                        }
                        data.states[pin as usize].usage = PinUsage::DigitalRead;
                        frame = input_frame(pin, PIN_MODE_INPUT);
                    }
                    PinDirection::InputPullup => {
                        if !capability.digital_read_pullup_available() {
                            return Err(Error::Unsupported {
                                operation: "input with pull-up",
                            });
                        }
                        data.states[pin as usize].usage = PinUsage::DigitalReadPullup;
                        frame = input_frame(pin, PIN_MODE_PULLUP);
                    }
                }
            }
        }
        if frame.is_empty() {
            return Ok(());
        }
        let mut transport = self.transport.lock();
        transport.write(&frame)?;
        transport.flush()
    }

    /// Last reported value of an analog pin.
    ///
    /// The first call on a pin not yet reporting switches it to analog mode
    /// and returns [`ANALOG_NOT_READY`] until a report lands.
    pub fn analog_read(&self, pin: u8) -> Result<u16, Error> {
        validate_pin(pin)?;
        let frame;
        {
            let mut data = self.data.write();
            if data.capabilities.is_empty() {
                data.grow_pin_caches(pin)?;
            } else {
                let capability = *data.capability(pin)?;
                if !capability.analog_read_available() {
                    return Err(Error::Unsupported {
                        operation: "analog read",
                    });
                }
            }
            let state = &mut data.states[pin as usize];
            if state.usage == PinUsage::AnalogRead {
                return Ok(state.value);
            }
            state.usage = PinUsage::AnalogRead;
            state.value = ANALOG_NOT_READY;
            frame = [SET_PIN_MODE, pin, PIN_MODE_ANALOG];
        }
        let mut transport = self.transport.lock();
        transport.write(&frame)?;
        transport.flush()?;
        Ok(ANALOG_NOT_READY)
    }

    /// Drives a PWM-capable pin with an 8-bit duty value.
    ///
    /// The first write commits the pin to analog write mode on the wire.
    pub fn analog_write(&self, pin: u8, value: u8) -> Result<(), Error> {
        validate_pin(pin)?;
        let mut frame: Vec<u8> = vec![];
        {
            let mut data = self.data.write();
            if data.capabilities.is_empty() {
                if pin as usize >= data.states.len() {
                    return Err(Error::NoSuchPin { pin });
                }
            } else {
                let capability = *data.capability(pin)?;
                if !capability.analog_write_available() {
                    let usage = data.states[pin as usize].usage;
                    return Err(if usage == PinUsage::Unset {
                        Error::Unsupported {
                            operation: "analog write",
                        }
                    } else {
                        committed(pin, usage)
                    });
                }
            }
            let state = &mut data.states[pin as usize];
            if state.usage != PinUsage::AnalogWrite {
                state.usage = PinUsage::AnalogWrite;
                frame.extend_from_slice(&[SET_PIN_MODE, pin, PIN_MODE_PWM]);
            }
            state.value = value as u16;
            let [lsb, msb] = pack_14bit(value as u16);
            if pin > 15 {
                frame.extend_from_slice(&[START_SYSEX, EXTENDED_ANALOG, pin, lsb, msb, END_SYSEX]);
            } else {
                frame.extend_from_slice(&[ANALOG_MESSAGE | pin, lsb, msb]);
            }
        }
        let mut transport = self.transport.lock();
        transport.write(&frame)?;
        transport.flush()
    }

    /// Last reported level of a pin in an input mode.
    pub fn digital_read(&self, pin: u8) -> Result<bool, Error> {
        validate_pin(pin)?;
        let data = self.data.read();
        if data.capabilities.is_empty() {
            if pin as usize >= data.states.len() {
                return Err(Error::NoSuchPin { pin });
            }
        } else {
            let capability = data.capability(pin)?;
            if !capability.digital_read_available() {
                return Err(Error::Unsupported {
                    operation: "digital read",
                });
            }
        }
        let state = data.states[pin as usize];
        match state.usage {
            PinUsage::DigitalRead | PinUsage::DigitalReadPullup => Ok(state.value != 0),
            _ => Err(Error::NotPermitted {
                info: format!("pin {} has not been set to input", pin),
            }),
        }
    }

    /// Drives a digital output pin.
    ///
    /// An uncommitted pin (`pin_mode(_, Output)` on dual-capability
    /// hardware) is committed to digital write by the first call.
    pub fn digital_write(&self, pin: u8, level: bool) -> Result<(), Error> {
        validate_pin(pin)?;
        let mut frame: Vec<u8> = vec![];
        {
            let mut data = self.data.write();
            if data.capabilities.is_empty() {
                if pin as usize >= data.states.len() {
                    return Err(Error::NoSuchPin { pin });
                }
            } else {
                let capability = *data.capability(pin)?;
                if !capability.digital_write_available() {
                    return Err(Error::Unsupported {
                        operation: "digital write",
                    });
                }
            }
            let state = &mut data.states[pin as usize];
            match state.usage {
                PinUsage::Unset => {
                    state.usage = PinUsage::DigitalWrite;
                    frame.extend_from_slice(&[SET_PIN_MODE, pin, PIN_MODE_OUTPUT]);
                }
                PinUsage::DigitalWrite => {}
                usage => return Err(committed(pin, usage)),
            }
            data.states[pin as usize].value = u16::from(level);
            frame.extend_from_slice(&[SET_DIGITAL_PIN_VALUE, pin, u8::from(level)]);
        }
        let mut transport = self.transport.lock();
        transport.write(&frame)?;
        transport.flush()
    }

    /// Registers `isr` to run whenever a digital report for `pin` satisfies
    /// `trigger`. Interrupts are emulated from polled reports, so latency is
    /// bounded by the sampling interval, and the pin must be in an input
    /// mode to report at all.
    pub fn attach_interrupt<F>(&self, pin: u8, isr: F, trigger: Trigger) -> Result<(), Error>
    where
        F: Fn() + Send + Sync + 'static,
    {
        validate_pin(pin)?;
        let mut data = self.data.write();
        if data.capabilities.is_empty() {
            if pin as usize >= data.states.len() {
                return Err(Error::NoSuchPin { pin });
            }
        } else {
            let capability = data.capability(pin)?;
            if !capability.digital_read_available() {
                return Err(Error::Unsupported {
                    operation: "digital read",
                });
            }
        }
        data.grow_pin_caches(pin)?;
        data.interrupts[pin as usize] = Some(InterruptRegistration {
            isr: Arc::new(isr),
            trigger,
        });
        Ok(())
    }

    /// Unregisters the interrupt on `pin`, if any.
    pub fn detach_interrupt(&self, pin: u8) -> Result<(), Error> {
        let mut data = self.data.write();
        if pin as usize >= data.interrupts.len() {
            return Err(Error::NoSuchPin { pin });
        }
        data.interrupts[pin as usize] = None;
        Ok(())
    }

    // ########################################
    // Introspection

    /// Firmware identity reported during attach.
    pub fn firmware(&self) -> Option<FirmwareIdentity> {
        self.data.read().firmware.clone()
    }

    /// Firmware version reported during attach.
    pub fn version(&self) -> Option<SemanticVersion> {
        self.data.read().firmware.as_ref().map(|f| f.version)
    }

    /// Wire protocol version, when the device volunteered one.
    pub fn protocol_version(&self) -> Option<(u8, u8)> {
        self.data.read().protocol_version
    }

    pub fn is_connected(&self) -> bool {
        self.data.read().connected
    }

    /// Capability record for `pin`, once surveyed.
    pub fn capability(&self, pin: u8) -> Result<PinCapability, Error> {
        self.data.read().capability(pin).copied()
    }

    /// Handle onto the device's I2C bus.
    pub fn i2c(&self) -> I2cBus {
        self.i2c.clone()
    }

    // ########################################
    // Inbound path

    /// Drains every byte the transport currently has through the decoder and
    /// dispatches the completed messages. The drain thread's body; callable
    /// directly when no drain thread is running.
    pub fn pump(&self) -> Result<(), Error> {
        loop {
            let byte = {
                let mut transport = self.transport.lock();
                if transport.available()? == 0 {
                    break;
                }
                transport.read_byte()?
            };
            if let Some(message) = self.decoder.lock().push(byte) {
                if let Err(error) = self.dispatch(message) {
                    // One bad message never stops the drain.
                    warn!("inbound message dropped: {}", error);
                }
            }
        }
        Ok(())
    }

    fn dispatch(&self, message: Inbound) -> Result<(), Error> {
        trace!("dispatch: {:?}", message);
        match message {
            Inbound::ProtocolVersion { major, minor } => {
                self.data.write().protocol_version = Some((major, minor));
                Ok(())
            }
            Inbound::Analog { channel, value } => self.handle_analog(channel, value),
            Inbound::DigitalPort { port, bits } => self.handle_digital_port(port, bits),
            Inbound::Sysex { command, payload } => match command {
                REPORT_FIRMWARE => self.handle_firmware(&payload),
                CAPABILITY_RESPONSE => self.handle_capabilities(&payload),
                ANALOG_MAPPING_RESPONSE => self.handle_analog_mapping(&payload),
                PIN_STATE_RESPONSE => self.handle_pin_state(&payload),
                I2C_REPLY => self.i2c.handle_reply(&payload),
                I2C_REQUEST => self.i2c.handle_request(&payload),
                other => {
                    trace!("sysex command {:#04x} ignored", other);
                    Ok(())
                }
            },
        }
    }

    fn handle_analog(&self, channel: u8, value: u16) -> Result<(), Error> {
        let mut data = self.data.write();
        // Before the survey no mapping exists; the channel is taken as the
        // pin number.
        let pin = if data.capabilities.is_empty() {
            Some(channel)
        } else {
            data.pin_for_channel(channel)
        };
        if let Some(pin) = pin {
            if let Some(state) = data.states.get_mut(pin as usize) {
                state.value = value;
            }
        }
        Ok(())
    }

    fn handle_digital_port(&self, port: u8, bits: u8) -> Result<(), Error> {
        let mut triggered: Vec<Arc<dyn Fn() + Send + Sync>> = vec![];
        {
            let mut data = self.data.write();
            for i in 0..8u8 {
                let pin = port as usize * 8 + i as usize;
                if pin >= data.states.len() {
                    break;
                }
                let level = bits & (1 << i) != 0;
                data.states[pin].value = u16::from(level);

                if let Some(Some(registration)) = data.interrupts.get(pin) {
                    if registration.trigger.matches(level) {
                        triggered.push(registration.isr.clone());
                    }
                }
            }
        }
        // User code runs without any engine lock held.
        for isr in triggered {
            isr();
        }
        Ok(())
    }

    fn handle_firmware(&self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() < 2 {
            return Err(WireError::MessageTooShort {
                operation: "handle_firmware",
                expected: 2,
                received: payload.len(),
            }
            .into());
        }
        let name_bytes = unpack_7bit_pairs(&payload[2..]);
        let name = String::from_utf8_lossy(&name_bytes).replace('\0', "");
        {
            let mut data = self.data.write();
            data.firmware = Some(FirmwareIdentity {
                name,
                version: SemanticVersion {
                    major: payload[0],
                    minor: payload[1],
                    patch: 0,
                },
            });
            data.connected = true;
        }
        let signal = self.pendings.lock().attach.take();
        if let Some(signal) = signal {
            signal();
        }
        Ok(())
    }

    /// Folds a capability response into fresh caches, then chains into the
    /// analog mapping query.
    fn handle_capabilities(&self, payload: &[u8]) -> Result<(), Error> {
        let mut capabilities: Vec<PinCapability> = vec![];
        let mut current = PinCapability::default();
        let mut i = 0;
        while i < payload.len() {
            if payload[i] == SYSEX_REALTIME {
                capabilities.try_reserve(1)?;
                capabilities.push(current);
                current = PinCapability::default();
                i += 1;
                continue;
            }
            let resolution = *payload.get(i + 1).ok_or(WireError::MessageTooShort {
                operation: "handle_capabilities",
                expected: i + 2,
                received: payload.len(),
            })?;
            match payload[i] {
                PIN_MODE_ANALOG => {
                    current.supported |= PinCapability::ANALOG_READ;
                    current.analog_read_resolution = resolution;
                }
                PIN_MODE_PWM => {
                    current.supported |= PinCapability::ANALOG_WRITE;
                    current.analog_write_resolution = resolution;
                }
                PIN_MODE_INPUT => current.supported |= PinCapability::DIGITAL_READ,
                PIN_MODE_PULLUP => current.supported |= PinCapability::DIGITAL_READ_PULLUP,
                PIN_MODE_OUTPUT => current.supported |= PinCapability::DIGITAL_WRITE,
                other => trace!("capability mode {:#04x} ignored", other),
            }
            i += 2;
        }

        {
            let mut data = self.data.write();
            let count = capabilities.len();
            data.capabilities = capabilities;
            // Volatile state restarts from scratch for the surveyed layout.
            data.states = vec![Default::default(); count];
            if data.interrupts.len() < count {
                data.interrupts.resize(count, None);
            }
        }

        let mut transport = self.transport.lock();
        transport.write(&[START_SYSEX, ANALOG_MAPPING_QUERY, END_SYSEX])?;
        transport.flush()
    }

    /// Stores the channel assignments, then chains the pending survey into a
    /// refresh so the survey completes with fresh pin state.
    fn handle_analog_mapping(&self, payload: &[u8]) -> Result<(), Error> {
        {
            let mut data = self.data.write();
            for (pin, byte) in payload.iter().enumerate() {
                if let Some(capability) = data.capabilities.get_mut(pin) {
                    capability.channel = (*byte != SYSEX_REALTIME).then_some(*byte);
                }
            }
        }
        // The guard must drop before start_refresh re-locks pendings.
        let signal = self.pendings.lock().survey.take();
        match signal {
            Some(signal) => self.start_refresh(signal),
            None => self.start_refresh(Box::new(|| {})),
        }
    }

    fn handle_pin_state(&self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() < 3 {
            return Err(WireError::MessageTooShort {
                operation: "handle_pin_state",
                expected: 3,
                received: payload.len(),
            }
            .into());
        }
        let pin = payload[0];
        let mut frame: Vec<u8> = vec![];
        let mut last_pin = false;
        {
            let mut data = self.data.write();
            if pin as usize >= data.states.len() {
                return Err(Error::NoSuchPin { pin });
            }
            let report = data.report_on_query;
            // The report command only has 4 bits for the channel; a mapping
            // byte above 15 must not bleed into the command nibble.
            let channel = data
                .capability(pin)
                .ok()
                .and_then(|capability| capability.channel)
                .unwrap_or(pin)
                & 0x0F;
            let usage = match payload[1] {
                PIN_MODE_ANALOG => {
                    if report {
                        frame = vec![REPORT_ANALOG | channel, 1];
                        PinUsage::AnalogRead
                    } else {
                        frame = vec![REPORT_ANALOG | channel, 0];
                        PinUsage::Unset
                    }
                }
                PIN_MODE_INPUT => {
                    if report {
                        frame = vec![SET_PIN_MODE, pin, PIN_MODE_INPUT];
                        PinUsage::DigitalRead
                    } else {
                        frame = vec![REPORT_DIGITAL | (pin / 8), 0];
                        PinUsage::Unset
                    }
                }
                PIN_MODE_PULLUP => {
                    if report {
                        frame = vec![SET_PIN_MODE, pin, PIN_MODE_PULLUP];
                        PinUsage::DigitalReadPullup
                    } else {
                        frame = vec![REPORT_DIGITAL | (pin / 8), 0];
                        PinUsage::Unset
                    }
                }
                PIN_MODE_OUTPUT => PinUsage::DigitalWrite,
                PIN_MODE_PWM => PinUsage::AnalogWrite,
                value => {
                    warn!("{}", Error::from(WireError::UnknownMode { value }));
                    PinUsage::Unset
                }
            };

            let mut value: u16 = 0;
            for (i, byte) in payload[2..].iter().take(2).enumerate() {
                value |= ((byte & 0x7F) as u16) << (7 * i);
            }
            data.states[pin as usize].usage = usage;
            data.states[pin as usize].value = value;

            if pin as usize == data.states.len() - 1 {
                last_pin = true;
                data.report_on_query = false;
            }
        }
        if !frame.is_empty() {
            let mut transport = self.transport.lock();
            transport.write(&frame)?;
            transport.flush()?;
        }
        if last_pin {
            let signal = self.pendings.lock().refresh.take();
            self.refresh_gate.release();
            if let Some(signal) = signal {
                signal();
            }
        }
        Ok(())
    }

    // ########################################
    // Internals

    /// Takes the refresh gate and queries the state of every surveyed pin.
    ///
    /// Completion rides on the last pin's state response. With no surveyed
    /// pins there is nothing to wait for and the signal fires immediately.
    fn start_refresh(&self, signal: Signal) -> Result<(), Error> {
        self.refresh_gate.acquire(self.timeout);
        let pin_count = self.data.read().states.len();
        if pin_count == 0 {
            self.refresh_gate.release();
            signal();
            return Ok(());
        }
        self.pendings.lock().refresh = Some(signal);
        let mut frame = Vec::with_capacity(pin_count * 4);
        for pin in 0..pin_count {
            frame.extend_from_slice(&[START_SYSEX, PIN_STATE_QUERY, pin as u8, END_SYSEX]);
        }
        let mut transport = self.transport.lock();
        transport.write(&frame)?;
        transport.flush()
    }

    fn start_drain(&self) -> Result<(), Error> {
        let mut drain = self.drain.lock();
        if drain.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);
        let engine = self.clone();
        let handle = std::thread::Builder::new()
            .name(String::from("telewire-drain"))
            .spawn(move || {
                while engine.running.load(Ordering::SeqCst) {
                    if let Err(error) = engine.pump() {
                        warn!("drain loop error: {}", error);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            })?;
        *drain = Some(handle);
        Ok(())
    }

    fn stop_drain(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.drain.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// SET_PIN_MODE plus enabling reports for the pin's digital port.
fn input_frame(pin: u8, mode: u8) -> Vec<u8> {
    vec![SET_PIN_MODE, pin, mode, REPORT_DIGITAL | (pin / 8), 1]
}

/// Pin numbers above 127 cannot be expressed in a 7-bit wire byte.
fn validate_pin(pin: u8) -> Result<(), Error> {
    if pin > 0x7F {
        return Err(Error::InvalidArgument {
            info: format!("pin {} is out of the addressable range", pin),
        });
    }
    Ok(())
}

impl Debug for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("data", &self.data.read())
            .field("timeout", &self.timeout)
            .field("jit_input", &self.jit_input)
            .finish()
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let data = self.data.read();
        let firmware = data.firmware.clone().unwrap_or_default();
        write!(
            f,
            "Device [firmware={} {}, pins={}, transport={}]",
            firmware.name,
            firmware.version,
            data.states.len(),
            self.transport.lock()
        )
    }
}
