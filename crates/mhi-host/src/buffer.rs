//! Host-side bookkeeping for queued buffers.
//!
//! Slot `i` of the registry describes descriptor `i` of the channel's
//! transfer ring. A slot is occupied ("used") from the moment the descriptor
//! is written until the buffer is handed back to the client.

use std::sync::Mutex;

use crate::client::TransferBuffer;
use crate::dma::{DmaDirection, Mapping};
use crate::sync::lock;

#[derive(Debug)]
pub(crate) struct BufferEntry {
    pub(crate) buf: TransferBuffer,
    /// Bus address written into the descriptor.
    pub(crate) paddr: u64,
    /// Transport-created mapping; `None` for client pre-mapped buffers.
    pub(crate) mapping: Option<Mapping>,
    pub(crate) len: usize,
    pub(crate) dir: DmaDirection,
}

#[derive(Debug)]
pub(crate) struct BufferRegistry {
    slots: Box<[Mutex<Option<BufferEntry>>]>,
}

impl BufferRegistry {
    pub(crate) fn new(elements: usize) -> Self {
        Self {
            slots: (0..elements).map(|_| Mutex::new(None)).collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Fills a free slot. Returns the entry back if the slot is still in use.
    pub(crate) fn insert(&self, idx: usize, entry: BufferEntry) -> Result<(), BufferEntry> {
        let mut slot = lock(&self.slots[idx]);
        if slot.is_some() {
            return Err(entry);
        }
        *slot = Some(entry);
        Ok(())
    }

    pub(crate) fn take(&self, idx: usize) -> Option<BufferEntry> {
        lock(&self.slots[idx]).take()
    }

    pub(crate) fn is_used(&self, idx: usize) -> bool {
        lock(&self.slots[idx]).is_some()
    }

    /// Empties every used slot, in index order.
    pub(crate) fn drain_used(&self) -> Vec<BufferEntry> {
        self.slots.iter().filter_map(|s| lock(s).take()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(byte: u8) -> BufferEntry {
        BufferEntry {
            buf: TransferBuffer::Bytes(vec![byte]),
            paddr: 0,
            mapping: None,
            len: 1,
            dir: DmaDirection::FromDevice,
        }
    }

    #[test]
    fn occupied_slot_rejects_second_entry() {
        let reg = BufferRegistry::new(4);
        reg.insert(2, entry(1)).unwrap();
        assert!(reg.is_used(2));
        let back = reg.insert(2, entry(2)).unwrap_err();
        assert_eq!(back.buf, TransferBuffer::Bytes(vec![2]));
        assert_eq!(reg.take(2).unwrap().buf, TransferBuffer::Bytes(vec![1]));
        assert!(!reg.is_used(2));
    }

    #[test]
    fn drain_returns_used_entries_in_slot_order() {
        let reg = BufferRegistry::new(4);
        reg.insert(3, entry(3)).unwrap();
        reg.insert(0, entry(0)).unwrap();
        let drained: Vec<_> = reg.drain_used().into_iter().map(|e| e.buf).collect();
        assert_eq!(
            drained,
            vec![TransferBuffer::Bytes(vec![0]), TransferBuffer::Bytes(vec![3])]
        );
        assert_eq!(reg.len(), 4);
        assert!(!reg.is_used(3));
    }
}
