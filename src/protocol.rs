use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const START_BYTE: u8 = 0xDD;
pub const END_BYTE: u8 = 0x77;
const READ_MARKER: u8 = 0xA5;
const WRITE_MARKER: u8 = 0x5A;

/// Start byte, echoed command, status and length.
pub const HEADER_LENGTH: usize = 4;
/// Two checksum bytes plus the end byte.
pub const TRAILER_LENGTH: usize = 3;
/// Largest frame the protocol can describe with a one byte length field.
pub const MAX_FRAME_LENGTH: usize = HEADER_LENGTH + u8::MAX as usize + TRAILER_LENGTH;

pub const CMD_BASIC_INFO: u8 = 0x03;
pub const CMD_CELL_VOLTAGES: u8 = 0x04;
pub const CMD_MOSFET_CONTROL: u8 = 0xE1;

/// Computes the two byte checksum over a command, the data length and the data.
///
/// The value is `0x10000` minus the sum of all those bytes, truncated to 16 bits
/// and encoded big-endian.
pub fn checksum(command: u8, data: &[u8]) -> [u8; 2] {
    let sum = data
        .iter()
        .fold((command as u16).wrapping_add(data.len() as u16), |acc, b| {
            acc.wrapping_add(*b as u16)
        });
    0u16.wrapping_sub(sum).to_be_bytes()
}

/// Builds the 7 byte read request for `command`.
pub fn encode_read(command: u8) -> Vec<u8> {
    let [hi, lo] = checksum(command, &[]);
    vec![START_BYTE, READ_MARKER, command, 0x00, hi, lo, END_BYTE]
}

/// Builds a write request carrying `data` for `command`.
pub fn encode_write(command: u8, data: &[u8]) -> Result<Vec<u8>> {
    let length = u8::try_from(data.len()).map_err(|_| {
        Error::InvalidArgument(format!("write payload of {} bytes too long", data.len()))
    })?;
    let mut tx_buffer = Vec::with_capacity(HEADER_LENGTH + data.len() + TRAILER_LENGTH);
    tx_buffer.extend_from_slice(&[START_BYTE, WRITE_MARKER, command, length]);
    tx_buffer.extend_from_slice(data);
    tx_buffer.extend_from_slice(&checksum(command, data));
    tx_buffer.push(END_BYTE);
    Ok(tx_buffer)
}

/// Returns the payload of a complete response frame.
///
/// Checks only the structure: start byte, end byte and that the length field
/// agrees with the number of bytes received.
pub fn payload(frame: &[u8]) -> Result<&[u8]> {
    if frame.len() < HEADER_LENGTH + TRAILER_LENGTH {
        return Err(Error::MalformedFrame(format!(
            "frame of {} bytes is shorter than header and trailer",
            frame.len()
        )));
    }
    if frame[0] != START_BYTE || frame[frame.len() - 1] != END_BYTE {
        return Err(Error::MalformedFrame(format!(
            "frame not delimited by {START_BYTE:02X}..{END_BYTE:02X}: {frame:02X?}"
        )));
    }
    let length = frame[3] as usize;
    if frame.len() != HEADER_LENGTH + length + TRAILER_LENGTH {
        return Err(Error::MalformedFrame(format!(
            "length field says {length} payload bytes but frame has {} bytes",
            frame.len()
        )));
    }
    Ok(&frame[HEADER_LENGTH..HEADER_LENGTH + length])
}

/// Recomputes the checksum of a received frame and compares it with the embedded one.
///
/// The checksum covers the byte in the command position (byte 2), the length
/// and the payload, exactly as for outgoing frames.
pub fn verify(frame: &[u8]) -> Result<()> {
    let data = payload(frame)?;
    let expected = checksum(frame[2], data);
    let offset = HEADER_LENGTH + data.len();
    let received = [frame[offset], frame[offset + 1]];
    if expected != received {
        log::warn!(
            "Invalid checksum - calculated={expected:02X?} received={received:02X?} buffer={frame:02X?}"
        );
        return Err(Error::ChecksumMismatch { expected, received });
    }
    Ok(())
}

fn validate_len(payload: &[u8], required: usize, what: &str) -> Result<()> {
    if payload.len() < required {
        log::warn!(
            "Invalid {what} payload size - required={required} received={}",
            payload.len()
        );
        return Err(Error::MalformedFrame(format!(
            "{what} payload needs {required} bytes, got {}",
            payload.len()
        )));
    }
    Ok(())
}

fn read_u16(buffer: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buffer[offset], buffer[offset + 1]])
}

/// Which of the two power paths a switch command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Switch {
    Charge,
    Discharge,
}

impl FromStr for Switch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "charge" => Ok(Switch::Charge),
            "discharge" => Ok(Switch::Discharge),
            other => Err(Error::InvalidArgument(format!(
                "unknown switch '{other}', expected 'charge' or 'discharge'"
            ))),
        }
    }
}

impl fmt::Display for Switch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Switch::Charge => write!(f, "charge"),
            Switch::Discharge => write!(f, "discharge"),
        }
    }
}

/// State of the charge and discharge MOSFETs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SwitchState {
    pub charge: bool,
    pub discharge: bool,
}

impl SwitchState {
    /// Maps the MOS-state byte of the basic info response.
    pub fn from_mos_byte(mos_byte: u8) -> Self {
        Self {
            charge: mos_byte == 1 || mos_byte == 3,
            discharge: mos_byte == 2 || mos_byte == 3,
        }
    }

    /// The same state with one switch changed.
    pub fn with(self, switch: Switch, enabled: bool) -> Self {
        match switch {
            Switch::Charge => Self {
                charge: enabled,
                ..self
            },
            Switch::Discharge => Self {
                discharge: enabled,
                ..self
            },
        }
    }

    /// The MOSFET control byte that puts the device into this state.
    pub fn control_byte(self) -> u8 {
        match (self.charge, self.discharge) {
            (true, true) => 0x00,
            (false, true) => 0x01,
            (true, false) => 0x02,
            (false, false) => 0x03,
        }
    }
}

/// Computes the control byte for changing `switch` to `desired` starting from `current`.
///
/// An unknown switch name is rejected before anything else happens.
pub fn compute_control_byte(current: SwitchState, switch: &str, desired: bool) -> Result<u8> {
    let switch = Switch::from_str(switch)?;
    Ok(current.with(switch, desired).control_byte())
}

/// Decoded basic info (command 0x03) response.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BmsSample {
    /// Pack voltage in V
    pub voltage: f32,
    /// Pack current in A, positive while charging
    pub current: f32,
    /// Remaining charge in Ah
    pub charge: f32,
    /// Full capacity in Ah
    pub capacity: f32,
    /// State of charge in %
    pub soc: u8,
    pub cycles: u16,
    pub cells: u8,
    /// Temperature sensor readings in °C
    pub temperatures: Vec<f32>,
    pub switches: SwitchState,
}

pub struct BasicInfo;

impl BasicInfo {
    const SOC_OFFSET: usize = 19;
    const MOS_OFFSET: usize = 20;
    const CELLS_OFFSET: usize = 21;
    const TEMPERATURE_COUNT_OFFSET: usize = 22;
    const TEMPERATURES_OFFSET: usize = 23;

    pub fn request() -> Vec<u8> {
        encode_read(CMD_BASIC_INFO)
    }

    pub fn decode(rx_buffer: &[u8]) -> Result<BmsSample> {
        let buf = payload(rx_buffer)?;
        validate_len(buf, Self::TEMPERATURES_OFFSET, "basic info")?;
        let n_temperatures = buf[Self::TEMPERATURE_COUNT_OFFSET] as usize;
        validate_len(
            buf,
            Self::TEMPERATURES_OFFSET + n_temperatures * 2,
            "basic info",
        )?;

        Ok(BmsSample {
            voltage: read_u16(buf, 0) as f32 / 100.0,
            // The device reports discharge as positive, flip it so charging is positive
            current: -(i16::from_be_bytes([buf[2], buf[3]]) as f32) / 100.0,
            charge: read_u16(buf, 4) as f32 / 100.0,
            capacity: read_u16(buf, 6) as f32 / 100.0,
            cycles: read_u16(buf, 8),
            soc: buf[Self::SOC_OFFSET],
            cells: buf[Self::CELLS_OFFSET],
            // Temperatures are sent in 0.1 K
            temperatures: (0..n_temperatures)
                .map(|i| {
                    (read_u16(buf, Self::TEMPERATURES_OFFSET + i * 2) as f32 - 2731.0) / 10.0
                })
                .collect(),
            switches: SwitchState::from_mos_byte(buf[Self::MOS_OFFSET]),
        })
    }
}

/// Cell voltages in mV, in the order reported by the device.
pub type CellVoltageList = Vec<u16>;

pub struct CellVoltages;

impl CellVoltages {
    pub fn request() -> Vec<u8> {
        encode_read(CMD_CELL_VOLTAGES)
    }

    pub fn decode(rx_buffer: &[u8]) -> Result<CellVoltageList> {
        let buf = payload(rx_buffer)?;
        // Two bytes per cell, an odd trailing byte is ignored
        let n_cells = rx_buffer[3] as usize / 2;
        Ok((0..n_cells).map(|i| read_u16(buf, i * 2)).collect())
    }
}

pub struct MosfetControl;

impl MosfetControl {
    pub fn request(control_byte: u8) -> Result<Vec<u8>> {
        encode_write(CMD_MOSFET_CONTROL, &[0x00, control_byte])
    }

    /// The acknowledgement carries no payload worth keeping, only its structure is checked.
    pub fn decode(rx_buffer: &[u8]) -> Result<()> {
        payload(rx_buffer).map(|_| ())
    }
}
