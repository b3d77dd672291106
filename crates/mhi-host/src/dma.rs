//! DMA-visible memory as seen from the host.
//!
//! Rings, context records and client buffers all live in memory the device
//! can reach. The integration supplies a [`DmaBus`] that can allocate
//! coherent regions, map client buffers for streaming DMA and access both by
//! bus address.

use std::sync::atomic::{fence, Ordering};

/// Direction of a streaming DMA mapping, relative to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DmaDirection {
    /// Host memory is read by the device (uplink).
    ToDevice,
    /// Host memory is written by the device (downlink).
    FromDevice,
    Bidirectional,
    /// The client owns the channel context; the host never maps buffers.
    None,
}

/// Host view of device-reachable memory.
///
/// All accessors take `&self`: implementations are shared between the
/// submitting threads, the event processing context and the device.
pub trait DmaBus: Send + Sync {
    fn read_bytes(&self, paddr: u64, dst: &mut [u8]);
    fn write_bytes(&self, paddr: u64, src: &[u8]);

    /// Allocates `len` bytes of coherent memory aligned to `align`.
    fn alloc_coherent(&self, len: usize, align: usize) -> Option<u64>;
    fn free_coherent(&self, paddr: u64, len: usize);

    /// Maps a client buffer for streaming DMA and returns its bus address.
    fn map_single(&self, buf: &[u8], dir: DmaDirection) -> Option<u64>;

    /// Tears down a mapping created by [`DmaBus::map_single`]. For
    /// device-to-host mappings the received bytes land in `buf`.
    fn unmap_single(&self, paddr: u64, buf: &mut [u8], dir: DmaDirection);

    fn read_u32(&self, paddr: u64) -> u32 {
        let mut b = [0u8; 4];
        self.read_bytes(paddr, &mut b);
        u32::from_le_bytes(b)
    }

    fn write_u32(&self, paddr: u64, value: u32) {
        self.write_bytes(paddr, &value.to_le_bytes());
    }

    fn read_u64(&self, paddr: u64) -> u64 {
        let mut b = [0u8; 8];
        self.read_bytes(paddr, &mut b);
        u64::from_le_bytes(b)
    }

    fn write_u64(&self, paddr: u64, value: u64) {
        self.write_bytes(paddr, &value.to_le_bytes());
    }
}

/// How copy-through buffers reach the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MapStrategy {
    /// Map the client buffer in place.
    #[default]
    Direct,
    /// Copy through a coherent bounce region owned by the transport.
    Bounce,
}

/// Bus-side handle for a mapped copy-through buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Mapping {
    pub(crate) paddr: u64,
    pub(crate) bounce: bool,
}

pub(crate) fn map_buffer(
    bus: &dyn DmaBus,
    strategy: MapStrategy,
    buf: &[u8],
    len: usize,
    dir: DmaDirection,
) -> Option<Mapping> {
    match strategy {
        MapStrategy::Direct => bus.map_single(&buf[..len], dir).map(|paddr| Mapping {
            paddr,
            bounce: false,
        }),
        MapStrategy::Bounce => {
            let paddr = bus.alloc_coherent(len.max(1), 64)?;
            if dir != DmaDirection::FromDevice {
                bus.write_bytes(paddr, &buf[..len]);
            }
            // Descriptor publication must not overtake the bounce copy.
            fence(Ordering::Release);
            Some(Mapping {
                paddr,
                bounce: true,
            })
        }
    }
}

pub(crate) fn unmap_buffer(
    bus: &dyn DmaBus,
    mapping: Mapping,
    buf: &mut [u8],
    len: usize,
    dir: DmaDirection,
) {
    if mapping.bounce {
        if dir != DmaDirection::ToDevice {
            fence(Ordering::Acquire);
            bus.read_bytes(mapping.paddr, &mut buf[..len]);
        }
        bus.free_coherent(mapping.paddr, len.max(1));
    } else {
        bus.unmap_single(mapping.paddr, &mut buf[..len], dir);
    }
}
