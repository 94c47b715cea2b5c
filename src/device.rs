use crate::value::{Value, ValueSet};
use core::fmt;
use serde::{Deserialize, Serialize};

/// Device state word announced with `S`. Bits outside a mask are always carried through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct DeviceStatus(pub u32);

impl DeviceStatus {
    pub const ERROR_MASK: u32 = 0x00ff_0000;
    pub const ERROR_HW: u32 = 0x0001_0000;
    pub const ERROR_KILL: u32 = 0x0002_0000;
    pub const NOT_READY: u32 = 0x0004_0000;

    pub const MOVE_MASK: u32 = 0x0000_0003;
    pub const MOVE_IDLE: u32 = 0x0000_0000;
    pub const MOVING: u32 = 0x0000_0001;

    pub const EXPOSURE_MASK: u32 = 0x0000_0001;
    pub const EXPOSING: u32 = 0x0000_0001;

    pub const SCRIPT_RUNNING: u32 = 0x0100_0000;

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Replace the bits under `mask` with `bits`, keeping everything else.
    #[must_use]
    pub fn with(self, mask: u32, bits: u32) -> Self {
        Self((self.0 & !mask) | (bits & mask))
    }

    pub fn masked(self, mask: u32) -> u32 {
        self.0 & mask
    }

    pub fn has_error(self) -> bool {
        self.0 & Self::ERROR_MASK != 0
    }

    pub fn is_ready(self) -> bool {
        self.0 & Self::NOT_READY == 0
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Outcome of an inbound command handled by a device back end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Ok,
    Failed { code: i32, reason: String },
    /// The peer should retry the command later.
    Requeue,
    Unknown,
}

/// Hardware back end hooked into a [`Block`](crate::Block).
///
/// Every hook has a default, so a back end only implements what its hardware does.
pub trait Device {
    /// A peer asked to change `old` to `new`. An error leaves `old` in place and is
    /// answered with a failure reply.
    fn set_value(&mut self, _old: &Value, _new: &Value) -> Result<(), String> {
        Ok(())
    }

    /// Refresh values before a full `info` dump.
    fn info(&mut self, _values: &mut ValueSet) -> Result<(), String> {
        Ok(())
    }

    fn command(&mut self, _opcode: &str, _params: &str, _values: &mut ValueSet) -> CommandOutcome {
        CommandOutcome::Unknown
    }

    /// Called once per reactor pass.
    fn idle(&mut self, _values: &mut ValueSet) {}

    /// Status bits the back end owns, as `(mask, bits)`. Polled after every idle pass.
    fn status(&self) -> Option<(u32, u32)> {
        None
    }
}
