//! Device-visible context records.
//!
//! Each channel, event ring and the command ring is described to the device
//! by a fixed-size record in a coherent context array. The device reads the
//! ring base/length and the host-owned pointer from it, and writes back its
//! own pointer.
//!
//! Record layout (all fields little endian):
//!
//! | offset | channel         | event ring        | command ring |
//! |--------|-----------------|-------------------|--------------|
//! | 0x00   | state/burst cfg | interrupt moderation | reserved  |
//! | 0x04   | channel type    | ring type         | reserved     |
//! | 0x08   | event ring idx  | msi vector        | reserved     |
//! | 0x10   | ring base       | ring base         | ring base    |
//! | 0x18   | ring length     | ring length       | ring length  |
//! | 0x20   | read pointer    | read pointer      | read pointer |
//! | 0x28   | write pointer   | write pointer     | write pointer |

use crate::dma::DmaBus;

pub const CONTEXT_SIZE: usize = 0x30;

pub const CTX_CFG: u64 = 0x00;
pub const CTX_TYPE: u64 = 0x04;
pub const CTX_INDEX: u64 = 0x08;
pub const CTX_RBASE: u64 = 0x10;
pub const CTX_RLEN: u64 = 0x18;
pub const CTX_RP: u64 = 0x20;
pub const CTX_WP: u64 = 0x28;

/// Channel state values written to `CTX_CFG[7:0]`.
pub mod chan_state {
    pub const DISABLED: u32 = 0;
    pub const ENABLED: u32 = 1;
    pub const RUNNING: u32 = 2;
}

/// Burst mode encodings for `CTX_CFG[9:8]`.
pub mod burst {
    pub const DISABLE: u32 = 2;
    pub const ENABLE: u32 = 3;
}

/// Address of the `idx`th record in a context array.
#[inline]
pub fn record_addr(array_base: u64, idx: usize) -> u64 {
    array_base + (idx * CONTEXT_SIZE) as u64
}

/// Programs the ring description shared by every record kind and resets
/// both pointers to the ring base.
pub fn write_ring_fields(bus: &dyn DmaBus, record: u64, ring_base: u64, ring_len: usize) {
    bus.write_u64(record + CTX_RBASE, ring_base);
    bus.write_u64(record + CTX_RLEN, ring_len as u64);
    bus.write_u64(record + CTX_RP, ring_base);
    bus.write_u64(record + CTX_WP, ring_base);
}

pub fn write_channel_record(
    bus: &dyn DmaBus,
    record: u64,
    state: u32,
    burst_mode: bool,
    chan_type: u32,
    er_index: u32,
) {
    let brst = if burst_mode {
        burst::ENABLE
    } else {
        burst::DISABLE
    };
    bus.write_u32(record + CTX_CFG, state | (brst << 8));
    bus.write_u32(record + CTX_TYPE, chan_type);
    bus.write_u32(record + CTX_INDEX, er_index);
}

pub fn set_channel_state(bus: &dyn DmaBus, record: u64, state: u32) {
    let cfg = bus.read_u32(record + CTX_CFG);
    bus.write_u32(record + CTX_CFG, (cfg & !0xff) | state);
}

pub fn clear_record(bus: &dyn DmaBus, record: u64) {
    bus.write_bytes(record, &[0u8; CONTEXT_SIZE]);
}
