//! Firmata wire constants and the inbound byte decoder.
//!
//! The decoder is a push-driven state machine: the drain thread feeds it one
//! byte at a time and collects the [`Inbound`] events it produces. Sysex
//! payloads accumulate in a growable buffer; growth failure degrades to
//! truncating the in-flight payload rather than aborting the drain loop.

use log::{trace, warn};

use crate::errors::Error;

// ########################################
// Message command bytes (128-255/0x80-0xFF)

/// Send data for a digital port (collection of 8 pins)
pub const DIGITAL_MESSAGE: u8 = 0x90;
/// Send data for an analog pin (or PWM)
pub const ANALOG_MESSAGE: u8 = 0xE0;
/// Enable analog input by pin #
pub const REPORT_ANALOG: u8 = 0xC0;
/// Enable digital input by port pair
pub const REPORT_DIGITAL: u8 = 0xD0;
/// Digital message input range upper byte bound
pub const DIGITAL_MESSAGE_BOUND: u8 = 0x9F;
/// Analog message input range upper byte bound
pub const ANALOG_MESSAGE_BOUND: u8 = 0xEF;
/// Set a pin to INPUT/OUTPUT/PWM/etc
pub const SET_PIN_MODE: u8 = 0xF4;
/// Set value of an individual digital pin
pub const SET_DIGITAL_PIN_VALUE: u8 = 0xF5;
/// Report protocol version
pub const REPORT_VERSION: u8 = 0xF9;
/// Reset from MIDI
pub const SYSTEM_RESET: u8 = 0xFF;
/// Start a MIDI Sysex message
pub const START_SYSEX: u8 = 0xF0;
/// End a MIDI Sysex message
pub const END_SYSEX: u8 = 0xF7;

// Extended command set using sysex (0-127/0x00-0x7F)

/// Send an I2C read/write request
pub const I2C_REQUEST: u8 = 0x76;
/// Reply to an I2C read request
pub const I2C_REPLY: u8 = 0x77;
/// Config I2C settings such as delay times and power pins
pub const I2C_CONFIG: u8 = 0x78;
/// Report name and version of the firmware
pub const REPORT_FIRMWARE: u8 = 0x79;
/// Analog write (PWM, Servo, etc) to any pin
pub const EXTENDED_ANALOG: u8 = 0x6F;
/// Ask for a pin's current mode and value
pub const PIN_STATE_QUERY: u8 = 0x6D;
/// Reply with pin's current mode and value
pub const PIN_STATE_RESPONSE: u8 = 0x6E;
/// Ask for supported modes and resolution of all pins
pub const CAPABILITY_QUERY: u8 = 0x6B;
/// Reply with supported modes and resolution
pub const CAPABILITY_RESPONSE: u8 = 0x6C;
/// Ask for mapping of analog to pin numbers
pub const ANALOG_MAPPING_QUERY: u8 = 0x69;
/// Reply with mapping info
pub const ANALOG_MAPPING_RESPONSE: u8 = 0x6A;
/// Set the poll rate of the main loop
pub const SAMPLING_INTERVAL: u8 = 0x7A;
/// MIDI Reserved for realtime messages
pub const SYSEX_REALTIME: u8 = 0x7F;

// Pin mode bytes carried by SET_PIN_MODE and pin state responses.

pub const PIN_MODE_INPUT: u8 = 0x00;
pub const PIN_MODE_OUTPUT: u8 = 0x01;
pub const PIN_MODE_ANALOG: u8 = 0x02;
pub const PIN_MODE_PWM: u8 = 0x03;
pub const PIN_MODE_PULLUP: u8 = 0x0B;
pub const PIN_MODE_IGNORE: u8 = 0x7F;

// I2C additions.

pub const I2C_WRITE: u8 = 0x00;
pub const I2C_READ: u8 = 0x08;
pub const I2C_10BIT_ADDRESS_MODE_MASK: u8 = 0x20;
pub const I2C_RESTART_TX_MASK: u8 = 0x40;

/// Initial sysex payload buffer capacity; doubled on demand.
pub const INITIAL_BUFFER_CAPACITY: usize = 64;

/// A complete inbound message, produced by [`Decoder::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// REPORT_VERSION (0xF9).
    ProtocolVersion { major: u8, minor: u8 },
    /// ANALOG_MESSAGE: a 14-bit value for one analog channel.
    Analog { channel: u8, value: u16 },
    /// DIGITAL_MESSAGE: the low 8 bits of one digital port.
    DigitalPort { port: u8, bits: u8 },
    /// A sysex frame, command byte plus raw 7-bit payload.
    Sysex { command: u8, payload: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for a command byte.
    Idle,
    /// Collecting the two data bytes of a fixed-size message.
    Fixed { command: u8 },
    /// Collecting a sysex payload until END_SYSEX.
    Sysex,
}

/// Push-driven Firmata stream decoder.
#[derive(Debug)]
pub struct Decoder {
    phase: Phase,
    buffer: Vec<u8>,
    /// Set when the current sysex payload could not grow; later payload
    /// bytes are discarded and the frame is delivered truncated.
    truncating: bool,
}

impl Default for Decoder {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            buffer: Vec::with_capacity(INITIAL_BUFFER_CAPACITY),
            truncating: false,
        }
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one byte; returns a completed message when this byte ends one.
    ///
    /// Unknown command bytes and stray data bytes are logged and skipped so
    /// the stream resynchronizes on the next command byte.
    pub fn push(&mut self, byte: u8) -> Option<Inbound> {
        match self.phase {
            Phase::Idle => {
                self.accept_command(byte);
                None
            }
            Phase::Fixed { command } => {
                self.buffer.push(byte);
                if self.buffer.len() < 2 {
                    return None;
                }
                let (lsb, msb) = (self.buffer[0], self.buffer[1]);
                self.buffer.clear();
                self.phase = Phase::Idle;
                Some(Self::fixed_message(command, lsb, msb))
            }
            Phase::Sysex => {
                if byte == END_SYSEX {
                    self.truncating = false;
                    self.phase = Phase::Idle;
                    if self.buffer.is_empty() {
                        return None;
                    }
                    let command = self.buffer[0];
                    let payload = self.buffer.split_off(1);
                    self.buffer.clear();
                    return Some(Inbound::Sysex { command, payload });
                }
                if byte & 0x80 != 0 {
                    // A command byte inside a sysex frame: the frame was
                    // truncated on the wire. Resynchronize on it.
                    warn!("sysex frame interrupted by command byte {:#04x}", byte);
                    self.buffer.clear();
                    self.truncating = false;
                    self.phase = Phase::Idle;
                    self.accept_command(byte);
                    return None;
                }
                if !self.truncating {
                    if let Err(error) = self.reserve_for_push() {
                        warn!("sysex payload truncated: {}", error);
                        self.truncating = true;
                        return None;
                    }
                    self.buffer.push(byte);
                }
                None
            }
        }
    }

    fn accept_command(&mut self, byte: u8) {
        match byte {
            START_SYSEX => {
                self.buffer.clear();
                self.truncating = false;
                self.phase = Phase::Sysex;
            }
            REPORT_VERSION => self.phase = Phase::Fixed { command: byte },
            ANALOG_MESSAGE..=ANALOG_MESSAGE_BOUND => self.phase = Phase::Fixed { command: byte },
            DIGITAL_MESSAGE..=DIGITAL_MESSAGE_BOUND => self.phase = Phase::Fixed { command: byte },
            0x00..=0x7F => trace!("stray data byte {:#04x} skipped", byte),
            _ => warn!("unknown command byte {:#04x} skipped", byte),
        }
    }

    fn fixed_message(command: u8, lsb: u8, msb: u8) -> Inbound {
        match command {
            REPORT_VERSION => Inbound::ProtocolVersion {
                major: lsb,
                minor: msb,
            },
            ANALOG_MESSAGE..=ANALOG_MESSAGE_BOUND => Inbound::Analog {
                channel: command & 0x0F,
                value: unpack_14bit(lsb, msb),
            },
            _ => Inbound::DigitalPort {
                port: command & 0x0F,
                bits: (lsb & 0x7F) | ((msb & 0x01) << 7),
            },
        }
    }

    /// Doubles the payload buffer when it is full.
    fn reserve_for_push(&mut self) -> Result<(), Error> {
        if self.buffer.len() == self.buffer.capacity() {
            self.buffer.try_reserve(self.buffer.capacity().max(1))?;
        }
        Ok(())
    }
}

/// Reassembles a 14-bit value from its two 7-bit wire bytes.
pub fn unpack_14bit(lsb: u8, msb: u8) -> u16 {
    ((lsb & 0x7F) as u16) | (((msb & 0x7F) as u16) << 7)
}

/// Splits a value into its two 7-bit wire bytes (LSB first).
pub fn pack_14bit(value: u16) -> [u8; 2] {
    [(value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8]
}

/// Reassembles each pair of 7-bit payload bytes into one data byte.
pub fn unpack_7bit_pairs(payload: &[u8]) -> Vec<u8> {
    payload
        .chunks_exact(2)
        .map(|pair| (pair[0] & 0x7F) | ((pair[1] & 0x01) << 7))
        .collect()
}
