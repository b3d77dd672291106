//! Register access and doorbells.
//!
//! The transport never assumes a physical register map: offsets come from
//! [`RegisterLayout`], supplied with the controller configuration. Access
//! goes through [`RegisterAccess`], implemented by the bus integration.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{MhiError, Result};
use crate::state::DeviceState;
use crate::sync::lock;

/// Value returned by reads on a bus that dropped off.
pub const PCI_INVALID_READ: u32 = 0xffff_ffff;

/// Bounded depth of the offload write queue.
pub const REG_WRITE_QUEUE_LEN: usize = 1024;

/// Device-state field in the control and status registers.
pub const STATE_MASK: u32 = 0xff00;
pub const STATE_SHIFT: u32 = 8;
/// System-error flag in the status register.
pub const STATUS_SYSERR: u32 = 1 << 2;

/// Bandwidth negotiation result written back to the device.
pub const BW_SCALE_NACK: u32 = 0xf;

pub fn bw_scale_result(status: u32, seq: u8) -> u32 {
    ((status & 0xf) << 8) | u32::from(seq)
}

/// Register offsets, relative to the controller's register window.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RegisterLayout {
    /// Host-written control register carrying the requested device state.
    pub ctrl: u32,
    /// Device-written status register.
    pub status: u32,
    /// Execution environment register.
    pub exec_env: u32,
    pub chan_db_base: u32,
    pub event_db_base: u32,
    pub cmd_db: u32,
    /// Stride between consecutive doorbell registers.
    pub db_stride: u32,
    pub wake_db: u32,
    pub bw_scale_db: u32,
    pub timesync_db: u32,
    /// 64-bit device time, low word first.
    pub timesync_time: u32,
}

impl Default for RegisterLayout {
    fn default() -> Self {
        Self {
            ctrl: 0x38,
            status: 0x48,
            exec_env: 0x128,
            chan_db_base: 0x400,
            event_db_base: 0x800,
            cmd_db: 0xc00,
            db_stride: 8,
            wake_db: 0xd00,
            bw_scale_db: 0xd08,
            timesync_db: 0xd10,
            timesync_time: 0xd18,
        }
    }
}

impl RegisterLayout {
    pub fn chan_db(&self, chan: u32) -> u32 {
        self.chan_db_base + chan * self.db_stride
    }

    pub fn event_db(&self, er: usize) -> u32 {
        self.event_db_base + er as u32 * self.db_stride
    }
}

/// 32-bit register window of the device.
pub trait RegisterAccess: Send + Sync {
    fn read_reg(&self, offset: u32) -> u32;
    fn write_reg(&self, offset: u32, value: u32);

    /// Queried after a read returned [`PCI_INVALID_READ`]: is the link down?
    fn link_down(&self) -> bool {
        false
    }
}

/// Register front end used by the rest of the crate.
///
/// Adds the checked read, the 64-bit doorbell write sequence and the offload
/// write queue on top of the integration's [`RegisterAccess`].
pub(crate) struct RegisterIo {
    access: Arc<dyn RegisterAccess>,
    pub(crate) layout: RegisterLayout,
    offload: bool,
    queue: Mutex<VecDeque<(u32, u32)>>,
}

impl RegisterIo {
    pub(crate) fn new(access: Arc<dyn RegisterAccess>, layout: RegisterLayout, offload: bool) -> Self {
        Self {
            access,
            layout,
            offload,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Reads a register, treating the invalid-read sentinel on a dead link as
    /// an I/O error.
    pub(crate) fn read(&self, offset: u32) -> Result<u32> {
        let value = self.access.read_reg(offset);
        if value == PCI_INVALID_READ && self.access.link_down() {
            return Err(MhiError::Io("register read returned the bus-down sentinel"));
        }
        Ok(value)
    }

    pub(crate) fn write(&self, offset: u32, value: u32) {
        if self.offload {
            self.enqueue(offset, value);
        } else {
            self.access.write_reg(offset, value);
        }
    }

    /// Rings a 64-bit doorbell: upper word first, then lower.
    pub(crate) fn write_db(&self, offset: u32, value: u64) {
        self.write(offset + 4, (value >> 32) as u32);
        self.write(offset, value as u32);
    }

    pub(crate) fn write_field(&self, offset: u32, mask: u32, shift: u32, value: u32) -> Result<()> {
        let cur = self.read(offset)?;
        self.write(offset, (cur & !mask) | ((value << shift) & mask));
        Ok(())
    }

    pub(crate) fn device_state(&self) -> Result<Option<DeviceState>> {
        let status = self.read(self.layout.status)?;
        if status & STATUS_SYSERR != 0 {
            return Ok(Some(DeviceState::SysErr));
        }
        Ok(DeviceState::from_raw(((status & STATE_MASK) >> STATE_SHIFT) as u8))
    }

    pub(crate) fn request_device_state(&self, state: DeviceState) -> Result<()> {
        self.write_field(
            self.layout.ctrl,
            STATE_MASK,
            STATE_SHIFT,
            u32::from(state.as_raw()),
        )
    }

    fn enqueue(&self, offset: u32, value: u32) {
        let mut q = lock(&self.queue);
        if q.len() == REG_WRITE_QUEUE_LEN {
            tracing::warn!(offset, "register write queue full, draining inline");
            for (off, val) in q.drain(..) {
                self.access.write_reg(off, val);
            }
        }
        q.push_back((offset, value));
    }

    /// Applies queued writes in submission order. Returns how many were
    /// written.
    pub(crate) fn flush(&self) -> usize {
        let pending: Vec<(u32, u32)> = lock(&self.queue).drain(..).collect();
        for &(off, val) in &pending {
            self.access.write_reg(off, val);
        }
        pending.len()
    }

    pub(crate) fn queued(&self) -> usize {
        lock(&self.queue).len()
    }
}
