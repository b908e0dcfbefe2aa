//! Wire frame model
//!
//! Records exchanged with the RS-485/TCP gateway and the commands that
//! produce them. Layout (multi-byte fields big-endian):
//!
//! ```text
//! [identify:2][0x00 0x00][length:2][0x55][slave:2][function:1]([address:2])[payload...]
//! ```
//!
//! The 2-byte register address is present only for function codes 3 and 6 and
//! is not counted by the declared length; `length = 3 + payload bytes`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Frame start code, first byte counted by the declared length
pub const START_CODE: u8 = 0x55;

/// Curtain control function code
pub const FC_CURTAIN: u8 = 0x01;
/// Read holding register(s) function code
pub const FC_READ_HOLDING: u8 = 0x03;
/// Write single register function code
pub const FC_WRITE_SINGLE: u8 = 0x06;

/// Holding register backing the wall-switch button states
pub const SWITCH_REGISTER: u16 = 0x1008;
/// Correlation value carried by all curtain traffic
pub const CURTAIN_IDENTIFY: u16 = 0x8C;
/// Switch register value before the first authoritative read
pub const DEFAULT_REGISTER_STATE: u16 = 256;

/// Bytes before the start code: identify(2) + reserved(2) + length(2)
pub(crate) const PREAMBLE_LEN: usize = 6;
/// Smallest declared length the decoder accepts
pub(crate) const MIN_DECLARED_LEN: u16 = 3;
/// Largest declared length the decoder accepts
pub(crate) const MAX_DECLARED_LEN: u16 = 255;

/// One parsed record from the bus.
///
/// Produced only by the decoder; immutable once constructed. `payload` holds
/// the bytes after the function code (and after the address field for
/// function codes 3/6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub identify: u16,
    pub slave_id: u16,
    pub function_code: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Declared length as it appeared on the wire (3 + payload bytes)
    pub fn declared_len(&self) -> u16 {
        self.payload.len() as u16 + 3
    }

    /// Trailing two payload bytes as a big-endian register value
    pub fn register_value(&self) -> Option<u16> {
        let n = self.payload.len();
        if n < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[n - 2], self.payload[n - 1]]))
    }

    /// Last payload byte
    pub fn trailing_byte(&self) -> Option<u8> {
        self.payload.last().copied()
    }
}

/// Curtain control operations (function code 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurtainAction {
    Open,
    Close,
    Stop,
    /// Target percentage open, 0 = closed, 100 = open
    SetPosition(u8),
    /// Status probe sent by the curtain watchdog
    Query,
}

impl CurtainAction {
    fn payload(self) -> Result<Vec<u8>, FrameError> {
        match self {
            CurtainAction::Open => Ok(vec![0x01]),
            CurtainAction::Close => Ok(vec![0x02]),
            CurtainAction::Stop => Ok(vec![0x03]),
            CurtainAction::SetPosition(target) => {
                if target > 100 {
                    return Err(FrameError::InvalidCommand(format!(
                        "curtain position out of range: {target}"
                    )));
                }
                // The panel takes percentage closed, not percentage open
                Ok(vec![0x04, 100 - target])
            },
            CurtainAction::Query => Ok(vec![0x02, 0x01]),
        }
    }
}

/// Operation selector for a [`Command`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Function 3: read `count` holding registers starting at `address`
    ReadRegisters { address: u16, count: u16 },
    /// Function 6: write `value` into the register at `address`
    WriteRegister { address: u16, value: u16 },
    /// Function 1: curtain control
    Curtain(CurtainAction),
}

impl CommandKind {
    fn function_code(self) -> u8 {
        match self {
            CommandKind::ReadRegisters { .. } => FC_READ_HOLDING,
            CommandKind::WriteRegister { .. } => FC_WRITE_SINGLE,
            CommandKind::Curtain(_) => FC_CURTAIN,
        }
    }

    fn address(self) -> Option<u16> {
        match self {
            CommandKind::ReadRegisters { address, .. } => Some(address),
            CommandKind::WriteRegister { address, .. } => Some(address),
            CommandKind::Curtain(_) => None,
        }
    }

    fn payload(self) -> Result<Vec<u8>, FrameError> {
        match self {
            CommandKind::ReadRegisters { count, .. } => Ok(count.to_be_bytes().to_vec()),
            CommandKind::WriteRegister { value, .. } => Ok(value.to_be_bytes().to_vec()),
            CommandKind::Curtain(action) => action.payload(),
        }
    }
}

/// A request to be rendered to wire bytes.
///
/// Transient: exists only long enough to produce a byte buffer for
/// [`crate::transport::BusTransport::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub slave_id: u16,
    pub identify: u16,
    pub kind: CommandKind,
}

impl Command {
    /// Read holding registers
    pub fn read_registers(slave_id: u16, identify: u16, address: u16, count: u16) -> Self {
        Self {
            slave_id,
            identify,
            kind: CommandKind::ReadRegisters { address, count },
        }
    }

    /// Write a single holding register
    pub fn write_register(slave_id: u16, identify: u16, address: u16, value: u16) -> Self {
        Self {
            slave_id,
            identify,
            kind: CommandKind::WriteRegister { address, value },
        }
    }

    /// Curtain control, correlated under [`CURTAIN_IDENTIFY`]
    pub fn curtain(slave_id: u16, action: CurtainAction) -> Self {
        Self {
            slave_id,
            identify: CURTAIN_IDENTIFY,
            kind: CommandKind::Curtain(action),
        }
    }

    /// Render the command to wire bytes
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let payload = self.kind.payload()?;
        let address = self.kind.address();
        let length = payload.len() as u16 + 3;

        let mut buf = BytesMut::with_capacity(PREAMBLE_LEN + 4 + 2 + payload.len());
        buf.put_u16(self.identify);
        buf.put_u16(0x0000);
        buf.put_u16(length);
        buf.put_u8(START_CODE);
        buf.put_u16(self.slave_id);
        buf.put_u8(self.kind.function_code());
        if let Some(address) = address {
            buf.put_u16(address);
        }
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }
}
