use crate::fields::*;
use crate::Error;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

// https://minimalmodbus.readthedocs.io/en/stable/serialcommunication.html#timing-of-the-serial-communications
// minimum delay 4ms by baud rate 9600
pub const MINIMUM_DELAY: std::time::Duration = std::time::Duration::from_millis(4);

pub const START_BYTE: u8 = 0xDD;
pub const STOP_BYTE: u8 = 0x77;
const READ_BYTE: u8 = 0xA5;
const READ_LENGTH: u8 = 0x00;

pub const REQUEST_LENGTH: usize = 7;
/// Start, register, status, length, two checksum bytes and stop.
pub const MIN_FRAME_LENGTH: usize = 7;
pub const MAX_FRAME_LENGTH: usize = MIN_FRAME_LENGTH + u8::MAX as usize;
/// Covers every fixed field of the pack status layout.
const PACK_STATUS_MIN_LENGTH: usize = 33;
const TEMPERATURES_OFFSET: usize = 27;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Register {
    PackStatus = 0x03,
    CellVoltages = 0x04,
}

impl Register {
    pub const ALL: [Register; 2] = [Register::PackStatus, Register::CellVoltages];

    pub const fn id(self) -> u8 {
        self as u8
    }

    pub const fn name(self) -> &'static str {
        match self {
            Register::PackStatus => "pack-status",
            Register::CellVoltages => "cell-voltages",
        }
    }

    pub fn request(self) -> [u8; REQUEST_LENGTH] {
        encode_read_request(self.id())
    }
}

impl TryFrom<u8> for Register {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            0x03 => Ok(Register::PackStatus),
            0x04 => Ok(Register::CellVoltages),
            other => Err(Error::UnsupportedRegister(other)),
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({:#04X})", self.name(), self.id())
    }
}

/// `0x10000 - (sum(payload) + length)`, truncated to 16 bits.
pub fn checksum(payload: &[u8], length: u8) -> u16 {
    let sum = payload
        .iter()
        .fold(u16::from(length), |acc, b| acc.wrapping_add(u16::from(*b)));
    0u16.wrapping_sub(sum)
}

/// Builds `[START, READ, register, 0, checksum_hi, checksum_lo, STOP]`.
///
/// The register id is not checked here.
pub fn encode_read_request(register_id: u8) -> [u8; REQUEST_LENGTH] {
    let [checksum_hi, checksum_lo] = checksum(&[register_id], READ_LENGTH).to_be_bytes();
    [
        START_BYTE,
        READ_BYTE,
        register_id,
        READ_LENGTH,
        checksum_hi,
        checksum_lo,
        STOP_BYTE,
    ]
}

/// Recomputes the checksum over `frame[4..len - 3]` with `frame[3]` as the
/// length and compares it with the two bytes before the stop byte.
pub fn validate_checksum(frame: &[u8]) -> bool {
    if frame.len() < MIN_FRAME_LENGTH {
        return false;
    }
    let len = frame.len();
    let expected = checksum(&frame[4..len - 3], frame[3]);
    expected.to_be_bytes() == [frame[len - 3], frame[len - 2]]
}

/// Structural checks every response has to pass before field decoding.
fn validate_frame(register: Register, frame: &[u8]) -> Result<(), Error> {
    let register_id = register.id();
    if frame.len() < MIN_FRAME_LENGTH {
        log::warn!(
            "Invalid frame size - required={} received={}",
            MIN_FRAME_LENGTH,
            frame.len()
        );
        return Err(Error::malformed(
            register_id,
            format!("{} bytes, at least {MIN_FRAME_LENGTH} required", frame.len()),
            frame,
        ));
    }
    if frame[0] != START_BYTE || frame[frame.len() - 1] != STOP_BYTE {
        return Err(Error::malformed(
            register_id,
            "missing start or stop byte",
            frame,
        ));
    }
    if !validate_checksum(frame) {
        log::warn!("Invalid checksum - frame={frame:02X?}");
        return Err(Error::ChecksumMismatch {
            register: register_id,
            frame: frame.to_vec(),
        });
    }
    let declared = usize::from(frame[3]);
    if frame.len() != declared + MIN_FRAME_LENGTH {
        return Err(Error::malformed(
            register_id,
            format!(
                "declared payload of {declared} bytes, received {}",
                frame.len() - MIN_FRAME_LENGTH
            ),
            frame,
        ));
    }
    if frame[1] != register_id {
        log::warn!(
            "Register mismatch - expected={:#04X} received={:#04X}",
            register_id,
            frame[1]
        );
        return Err(Error::malformed(
            register_id,
            format!("response echoes register {:#04X}", frame[1]),
            frame,
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PackStatus {
    pub voltage: f32,
    pub current: f32, // positive=charging, negative=discharging
    pub balance_capacity: f32,
    pub rated_capacity: f32,
    pub cycles: u16,
    pub production_date: ProductionDate,
    pub cell_count: u8,
    pub balance_low: Vec<bool>,
    pub balance_high: Vec<bool>,
    pub protection: ProtectionFlags,
    pub software_version: u8,
    pub soc_percent: u8,
    pub mosfet: MosfetStatus,
    pub temperature_sensors: u8,
    pub temperatures: Vec<f32>,
}

impl PackStatus {
    pub fn request() -> [u8; REQUEST_LENGTH] {
        Register::PackStatus.request()
    }

    pub fn decode(frame: &[u8]) -> Result<Self, Error> {
        let register = Register::PackStatus;
        validate_frame(register, frame)?;
        if frame.len() < PACK_STATUS_MIN_LENGTH {
            return Err(Error::malformed(
                register.id(),
                format!(
                    "{} bytes, at least {PACK_STATUS_MIN_LENGTH} required",
                    frame.len()
                ),
                frame,
            ));
        }

        let temperature_sensors = to_u8(frame[26]);
        let temperatures_end = TEMPERATURES_OFFSET + 2 * usize::from(temperature_sensors);
        // the readings must end before the checksum
        if temperatures_end > frame.len() - 3 {
            return Err(Error::malformed(
                register.id(),
                format!("{temperature_sensors} temperature sensors exceed the frame"),
                frame,
            ));
        }
        let temperatures = frame[TEMPERATURES_OFFSET..temperatures_end]
            .chunks_exact(2)
            .enumerate()
            .map(|(n, pair)| {
                let celsius = kelvin_to_celsius(to_u16(pair[0], pair[1]));
                log::trace!("NTC #{n} °C={celsius}");
                celsius
            })
            .collect();

        // cell count bounds the balance flags, read it first
        let cell_count = to_u8(frame[25]);

        Ok(Self {
            voltage: scaled(to_u16(frame[4], frame[5]), 0.01),
            current: scaled(to_s16(frame[6], frame[7]), 0.01),
            balance_capacity: scaled(to_u16(frame[8], frame[9]), 0.01),
            rated_capacity: scaled(to_u16(frame[10], frame[11]), 0.01),
            cycles: to_u16(frame[12], frame[13]),
            production_date: production_date(frame[14], frame[15]),
            cell_count,
            balance_low: balance_flags(frame[16], frame[17], cell_count),
            balance_high: balance_flags(frame[18], frame[19], cell_count),
            protection: protection_flags(frame[20], frame[21]),
            software_version: frame[22],
            soc_percent: to_u8(frame[23]),
            mosfet: mosfet_status(frame[24]),
            temperature_sensors,
            temperatures,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CellVoltage {
    pub index: usize,
    pub millivolts: u16,
    pub volts: f32,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CellVoltages {
    pub cells: Vec<CellVoltage>,
}

impl CellVoltages {
    pub fn request() -> [u8; REQUEST_LENGTH] {
        Register::CellVoltages.request()
    }

    pub fn decode(frame: &[u8]) -> Result<Self, Error> {
        let register = Register::CellVoltages;
        validate_frame(register, frame)?;
        let length = usize::from(frame[3]);
        if length % 2 != 0 {
            return Err(Error::malformed(
                register.id(),
                format!("odd payload length {length}"),
                frame,
            ));
        }

        let cells = frame[4..4 + length]
            .chunks_exact(2)
            .enumerate()
            .map(|(index, pair)| {
                let millivolts = to_u16(pair[0], pair[1]);
                log::trace!("Cell #{index} mV={millivolts}");
                CellVoltage {
                    index,
                    millivolts,
                    volts: scaled_with_precision(millivolts, 0.001, 3),
                }
            })
            .collect();
        Ok(Self { cells })
    }
}

/// A decoded register, one per successful request.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(untagged))]
pub enum Telemetry {
    PackStatus(PackStatus),
    CellVoltages(CellVoltages),
}

impl Telemetry {
    pub fn decode(register: Register, frame: &[u8]) -> Result<Self, Error> {
        match register {
            Register::PackStatus => PackStatus::decode(frame).map(Telemetry::PackStatus),
            Register::CellVoltages => CellVoltages::decode(frame).map(Telemetry::CellVoltages),
        }
    }

    pub fn register(&self) -> Register {
        match self {
            Telemetry::PackStatus(_) => Register::PackStatus,
            Telemetry::CellVoltages(_) => Register::CellVoltages,
        }
    }
}
