//! Channels: lifecycle, descriptor generation and completion handling.
//!
//! A channel owns a transfer ring and its buffer registry while it is
//! prepared. Three producer strategies exist:
//!
//! - buffer (copy-through): the transport maps the client's bytes directly or
//!   through a bounce region and unmaps them on completion;
//! - pre-mapped (zero-copy): the client supplies bus addresses;
//! - credit (RSC): pre-mapped buffers addressed by a cookie equal to the
//!   registry slot. Completions arrive in any order; each one retires the
//!   oldest ring slot and frees the slot named by its cookie. This relies on
//!   the device caching descriptors in ring order, so ring occupancy stays
//!   correct even though the freed slot and the retired slot differ.
//!
//! Lock order: lifecycle mutex, event ring lock, link lock (read), channel
//! lock, producer mutex.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::buffer::{BufferEntry, BufferRegistry};
use crate::client::{TransferBuffer, TransferCallback, TransferResult, TransferStatus};
use crate::config::{ChannelConfig, TransferKind};
use crate::context::{self, chan_state};
use crate::controller::{ring_align, Controller, Delivery};
use crate::dma::{self, DmaDirection};
use crate::error::{MhiError, Result};
use crate::ring::Ring;
use crate::sync::{lock, read, write, Completion};
use crate::tre::{pkt, CommandKind, CompletionCode, Tre, TransferFlags, MAX_TRE_LEN, TRE_LEN};

/// Host-side lifecycle state of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Disabled,
    Enabled,
    /// Paused by [`Controller::pause_transfer`].
    Stopped,
}

impl ChannelState {
    pub fn is_active(self) -> bool {
        self == Self::Enabled
    }
}

#[derive(Debug)]
pub(crate) struct ChannelRings {
    pub(crate) tre: Ring,
    pub(crate) bufs: BufferRegistry,
    /// Coherent allocation backing `tre`.
    pub(crate) mem: u64,
}

#[derive(Debug)]
pub(crate) struct ChannelInner {
    pub(crate) state: ChannelState,
    pub(crate) rings: Option<ChannelRings>,
}

pub(crate) struct Channel {
    pub(crate) cfg: ChannelConfig,
    /// Context record address.
    pub(crate) ctxt: u64,
    pub(crate) lifecycle: Mutex<()>,
    pub(crate) inner: RwLock<ChannelInner>,
    /// Serializes descriptor producers.
    pub(crate) producer: Mutex<()>,
    pub(crate) completion: Completion,
    pub(crate) callback: RwLock<Option<Arc<dyn TransferCallback>>>,
    /// Burst mode: the device asked for a doorbell.
    pub(crate) db_mode: AtomicBool,
    pub(crate) db_val: AtomicU64,
}

impl Channel {
    pub(crate) fn new(cfg: ChannelConfig, ctxt: u64) -> Self {
        Self {
            cfg,
            ctxt,
            lifecycle: Mutex::new(()),
            inner: RwLock::new(ChannelInner {
                state: ChannelState::Disabled,
                rings: None,
            }),
            producer: Mutex::new(()),
            completion: Completion::default(),
            callback: RwLock::new(None),
            db_mode: AtomicBool::new(true),
            db_val: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> u32 {
        self.cfg.id
    }

    pub(crate) fn callback(&self) -> Option<Arc<dyn TransferCallback>> {
        read(&self.callback).clone()
    }

    fn chan_type(&self) -> u32 {
        match self.cfg.direction {
            DmaDirection::ToDevice => 1,
            DmaDirection::FromDevice => 2,
            DmaDirection::Bidirectional => 3,
            DmaDirection::None => 0,
        }
    }
}

fn alloc_rx_buffer(len: usize) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).ok()?;
    buf.resize(len, 0);
    Some(buf)
}

impl Controller {
    // ---- context setup -------------------------------------------------------------------------

    fn init_channel_context(&self, ch: &Channel, inner: &mut ChannelInner) -> Result<()> {
        let elements = ch.cfg.elements;
        let len = elements * TRE_LEN;
        let mem = self
            .dma
            .alloc_coherent(len, ring_align(len))
            .ok_or(MhiError::NoMemory)?;

        context::write_channel_record(
            &*self.dma,
            ch.ctxt,
            chan_state::ENABLED,
            ch.cfg.burst_mode,
            ch.chan_type(),
            ch.cfg.event_ring as u32,
        );
        context::write_ring_fields(&*self.dma, ch.ctxt, mem, len);

        ch.db_mode.store(true, Ordering::Release);
        ch.db_val.store(mem, Ordering::Release);
        inner.rings = Some(ChannelRings {
            tre: Ring::new(mem, elements, ch.ctxt),
            bufs: BufferRegistry::new(elements),
            mem,
        });
        tracing::trace!(chan = ch.id(), base = mem, elements, "channel context initialised");
        Ok(())
    }

    fn deinit_channel_context(&self, ch: &Channel, inner: &mut ChannelInner) {
        if let Some(rings) = inner.rings.take() {
            context::clear_record(&*self.dma, ch.ctxt);
            self.dma.free_coherent(rings.mem, rings.tre.len_bytes());
        }
    }

    // ---- transfer path -------------------------------------------------------------------------

    /// Queues one buffer on a channel.
    ///
    /// Copy-through channels take [`TransferBuffer::Bytes`]; pre-mapped and
    /// credit channels take [`TransferBuffer::Mapped`]. For receive channels
    /// `len` is the capacity offered to the device.
    pub fn queue(
        &self,
        chan: u32,
        buf: TransferBuffer,
        len: usize,
        flags: TransferFlags,
    ) -> Result<()> {
        let ch = self.channel(chan)?;
        if ch.cfg.offload {
            return Err(MhiError::InvalidArgument("channel is offloaded"));
        }
        match (ch.cfg.transfer, &buf) {
            (TransferKind::Buffer, TransferBuffer::Bytes(_))
            | (TransferKind::PreMapped | TransferKind::Rsc, TransferBuffer::Mapped(_)) => {}
            (TransferKind::ScatterList | TransferKind::Nop, _) => {
                return Err(MhiError::InvalidArgument("unsupported transfer kind"))
            }
            _ => {
                return Err(MhiError::InvalidArgument(
                    "buffer type does not match channel transfer kind",
                ))
            }
        }
        if len > buf.len() || len > MAX_TRE_LEN {
            return Err(MhiError::InvalidArgument("length exceeds buffer or descriptor"));
        }
        self.queue_on(ch, buf, len, flags)
    }

    pub(crate) fn queue_on(
        &self,
        ch: &Channel,
        buf: TransferBuffer,
        len: usize,
        flags: TransferFlags,
    ) -> Result<()> {
        let st = read(&self.link.state);
        if st.pm_state.in_error() {
            return Err(MhiError::Io("link in error state"));
        }
        let inner = read(&ch.inner);
        if inner.state != ChannelState::Enabled {
            return Err(MhiError::not_connected(ch.id(), "channel not enabled"));
        }
        let rings = inner
            .rings
            .as_ref()
            .ok_or_else(|| MhiError::not_connected(ch.id(), "channel has no ring"))?;

        let _producer = lock(&ch.producer);
        if rings.tre.is_full() {
            return Err(MhiError::Exhausted);
        }

        if st.pm_state.in_suspend() {
            self.trigger_resume();
        }
        self.wake_pulse(&st);

        let uplink = ch.cfg.direction == DmaDirection::ToDevice;
        if uplink {
            self.pending_inc();
        }
        if let Err(err) = self.gen_tre(ch, rings, buf, len, flags) {
            if uplink {
                self.pending_dec();
            }
            return Err(err);
        }

        if st.pm_state.db_access_valid() && self.credits_allow_doorbell(ch, rings) {
            self.ring_chan_db(ch, rings);
        }
        Ok(())
    }

    /// Writes one descriptor at the ring's write pointer and records the
    /// buffer in the matching registry slot. Caller holds the producer lock.
    fn gen_tre(
        &self,
        ch: &Channel,
        rings: &ChannelRings,
        buf: TransferBuffer,
        len: usize,
        flags: TransferFlags,
    ) -> Result<()> {
        let idx = rings.tre.wp();
        let dir = ch.cfg.direction;
        if rings.bufs.is_used(idx) {
            // Credit slot still owned by the device.
            tracing::warn!(chan = ch.id(), slot = idx, "buffer slot still in use");
            return Err(MhiError::Exhausted);
        }

        let (entry, tre) = match buf {
            TransferBuffer::Bytes(bytes) => {
                let mapping = dma::map_buffer(&*self.dma, ch.cfg.map, &bytes, len, dir)
                    .ok_or(MhiError::NoMemory)?;
                let tre = Tre::transfer(mapping.paddr, len, ch.cfg.bei, flags);
                let entry = BufferEntry {
                    buf: TransferBuffer::Bytes(bytes),
                    paddr: mapping.paddr,
                    mapping: Some(mapping),
                    len,
                    dir,
                };
                (entry, tre)
            }
            TransferBuffer::Mapped(handle) => {
                let tre = if ch.cfg.transfer == TransferKind::Rsc {
                    Tre::rsc(handle.paddr, len, idx as u32)
                } else {
                    Tre::transfer(handle.paddr, len, ch.cfg.bei, flags)
                };
                let entry = BufferEntry {
                    buf: TransferBuffer::Mapped(handle),
                    paddr: handle.paddr,
                    mapping: None,
                    len,
                    dir,
                };
                (entry, tre)
            }
        };

        if let Err(mut entry) = rings.bufs.insert(idx, entry) {
            self.unmap_entry(&mut entry);
            return Err(MhiError::Exhausted);
        }
        rings.tre.write_element(&*self.dma, idx, &tre);
        rings.tre.advance_write();
        tracing::trace!(chan = ch.id(), slot = idx, len, "queued descriptor");
        Ok(())
    }

    fn unmap_entry(&self, entry: &mut BufferEntry) {
        if let (Some(mapping), TransferBuffer::Bytes(bytes)) = (entry.mapping.take(), &mut entry.buf)
        {
            dma::unmap_buffer(&*self.dma, mapping, bytes, entry.len, entry.dir);
        }
    }

    /// Credit channels in burst mode keep the doorbell quiet until enough
    /// descriptors are queued.
    fn credits_allow_doorbell(&self, ch: &Channel, rings: &ChannelRings) -> bool {
        !(ch.cfg.transfer == TransferKind::Rsc
            && ch.db_mode.load(Ordering::Acquire)
            && rings.tre.occupied() < self.config.rsc_min_credits)
    }

    /// Publishes the write pointer and rings the channel doorbell, honouring
    /// burst mode. Caller holds the link lock with doorbell access valid.
    pub(crate) fn ring_chan_db(&self, ch: &Channel, rings: &ChannelRings) {
        let db = rings.tre.publish_wp(&*self.dma);
        ch.db_val.store(db, Ordering::Release);
        let offset = self.regs.layout.chan_db(ch.id());
        if ch.cfg.burst_mode {
            if ch.db_mode.swap(false, Ordering::AcqRel) {
                tracing::debug!(chan = ch.id(), db, "ringing channel doorbell (burst)");
                self.regs.write_db(offset, db);
            }
        } else {
            tracing::debug!(chan = ch.id(), db, "ringing channel doorbell");
            self.regs.write_db(offset, db);
        }
    }

    pub(crate) fn recycle_prealloc(&self, ch: &Channel) {
        let len = self.config.buffer_len;
        let Some(buf) = alloc_rx_buffer(len) else {
            tracing::error!(chan = ch.id(), len, "failed to allocate replacement receive buffer");
            return;
        };
        if let Err(err) = self.queue_on(ch, TransferBuffer::Bytes(buf), len, TransferFlags::EOT) {
            tracing::error!(chan = ch.id(), error = %err, "dropping replacement receive buffer");
        }
    }

    fn fill_prealloc(&self, ch: &Channel) -> Result<()> {
        let len = self.config.buffer_len;
        let st = read(&self.link.state);
        let inner = read(&ch.inner);
        let rings = inner
            .rings
            .as_ref()
            .ok_or_else(|| MhiError::not_connected(ch.id(), "channel has no ring"))?;
        let _producer = lock(&ch.producer);

        let n = rings.tre.slots_available();
        for _ in 0..n {
            let buf = alloc_rx_buffer(len).ok_or(MhiError::NoMemory)?;
            self.gen_tre(ch, rings, TransferBuffer::Bytes(buf), len, TransferFlags::EOT)?;
        }
        if st.pm_state.db_access_valid() {
            self.ring_chan_db(ch, rings);
        }
        tracing::debug!(chan = ch.id(), buffers = n, "pre-allocated receive buffers");
        Ok(())
    }

    // ---- completion handling -------------------------------------------------------------------

    /// Ordered completion: retires every descriptor up to and including the
    /// one the event points at.
    pub(crate) fn process_transfer_event(
        &self,
        ch: &Channel,
        tre_ptr: u64,
        len: usize,
        code: CompletionCode,
        out: &mut Vec<Delivery>,
    ) {
        match code {
            CompletionCode::Overflow | CompletionCode::Eot | CompletionCode::Eob => {
                let inner = read(&ch.inner);
                if inner.state == ChannelState::Disabled {
                    return;
                }
                let Some(rings) = inner.rings.as_ref() else {
                    return;
                };
                let Some(ev_idx) = rings.tre.to_local(tre_ptr) else {
                    tracing::error!(chan = ch.id(), tre_ptr, "transfer event outside channel ring");
                    return;
                };
                let dev_rp = rings.tre.next(ev_idx);
                let status = if code == CompletionCode::Overflow {
                    TransferStatus::Overflow
                } else {
                    TransferStatus::Success
                };

                let mut local_rp = rings.tre.rp();
                while local_rp != dev_rp {
                    if rings.tre.is_empty() {
                        tracing::warn!(chan = ch.id(), "transfer event beyond queued descriptors");
                        break;
                    }
                    let next = rings.tre.next(local_rp);
                    let Some(mut entry) = rings.bufs.take(local_rp) else {
                        tracing::warn!(chan = ch.id(), slot = local_rp, "descriptor without buffer");
                        break;
                    };
                    let bytes = if next == dev_rp { len } else { entry.len };
                    self.unmap_entry(&mut entry);
                    rings.tre.advance_read();
                    if entry.dir == DmaDirection::ToDevice {
                        self.pending_dec();
                    }
                    out.push(Delivery {
                        chan: ch.id(),
                        result: TransferResult {
                            buf: entry.buf,
                            bytes_transferred: bytes,
                            status,
                            dir: entry.dir,
                        },
                        recycle: ch.cfg.pre_alloc,
                    });
                    local_rp = next;
                }
            }
            CompletionCode::Oob | CompletionCode::DbMode => {
                let st = read(&self.link.state);
                let inner = write(&ch.inner);
                if inner.state == ChannelState::Disabled {
                    return;
                }
                ch.db_mode.store(true, Ordering::Release);
                let Some(rings) = inner.rings.as_ref() else {
                    return;
                };
                if !rings.tre.is_empty()
                    && st.pm_state.db_access_valid()
                    && self.credits_allow_doorbell(ch, rings)
                {
                    self.ring_chan_db(ch, rings);
                }
            }
            CompletionCode::BadTre => {
                tracing::error!(chan = ch.id(), tre_ptr, "device rejected descriptor");
                debug_assert!(false, "channel {}: bad descriptor at {tre_ptr:#x}", ch.id());
            }
            other => {
                tracing::error!(chan = ch.id(), code = ?other, "unexpected transfer completion code");
            }
        }
    }

    /// Credit completion addressed by cookie.
    ///
    /// # Panics
    ///
    /// Panics if the cookie does not name a registry slot: the device is
    /// corrupting host state and continuing would hand out foreign buffers.
    pub(crate) fn process_rsc_event(
        &self,
        ch: &Channel,
        cookie: u32,
        len: usize,
        code: CompletionCode,
        out: &mut Vec<Delivery>,
    ) {
        let inner = read(&ch.inner);
        if inner.state == ChannelState::Disabled {
            return;
        }
        let Some(rings) = inner.rings.as_ref() else {
            return;
        };
        let slot = cookie as usize;
        if slot >= rings.bufs.len() {
            tracing::error!(chan = ch.id(), cookie, "credit completion with invalid cookie");
            panic!(
                "channel {}: completion cookie {cookie:#x} outside buffer registry of {} slots",
                ch.id(),
                rings.bufs.len()
            );
        }
        let Some(entry) = rings.bufs.take(slot) else {
            tracing::warn!(chan = ch.id(), cookie, "credit completion for a free slot");
            return;
        };
        // Eagerly retire the oldest ring slot; the device consumed
        // descriptors in ring order.
        if !rings.tre.is_empty() {
            rings.tre.advance_read();
        }
        let status = if code == CompletionCode::Overflow {
            TransferStatus::Overflow
        } else {
            TransferStatus::Success
        };
        out.push(Delivery {
            chan: ch.id(),
            result: TransferResult {
                buf: entry.buf,
                bytes_transferred: len,
                status,
                dir: entry.dir,
            },
            recycle: false,
        });
    }

    // ---- reset ---------------------------------------------------------------------------------

    /// Rewrites this channel's unprocessed transfer events as stale so that a
    /// later prepare does not consume them.
    fn mark_stale_events(&self, ch: &Channel) {
        let Some(er) = self.event_rings.get(ch.cfg.event_ring) else {
            return;
        };
        let _guard = lock(&er.lock);
        let Some(dev_rp) = er.ring.device_rp(&*self.dma) else {
            return;
        };
        let mut idx = er.ring.rp();
        let mut marked = 0;
        while idx != dev_rp {
            let mut ev = er.ring.read_element(&*self.dma, idx);
            if matches!(ev.packet_type(), pkt::TX_EVENT | pkt::RSC_TX_EVENT) && ev.chid() == ch.id() {
                ev.set_packet_type(pkt::STALE_EVENT);
                er.ring.write_element(&*self.dma, idx, &ev);
                marked += 1;
            }
            idx = er.ring.next(idx);
        }
        if marked > 0 {
            tracing::debug!(chan = ch.id(), marked, "marked stale events");
        }
    }

    /// Returns every queued buffer with [`TransferStatus::NotConnected`].
    /// Pre-allocated buffers are freed instead.
    fn reset_channel(&self, ch: &Channel) -> Vec<Delivery> {
        self.mark_stale_events(ch);

        let inner = write(&ch.inner);
        let Some(rings) = inner.rings.as_ref() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let deliver = |entry: BufferEntry, out: &mut Vec<Delivery>| {
            if ch.cfg.pre_alloc {
                return;
            }
            out.push(Delivery {
                chan: ch.id(),
                result: TransferResult {
                    buf: entry.buf,
                    bytes_transferred: 0,
                    status: TransferStatus::NotConnected,
                    dir: entry.dir,
                },
                recycle: false,
            });
        };

        if ch.cfg.transfer == TransferKind::Rsc {
            for entry in rings.bufs.drain_used() {
                deliver(entry, &mut out);
            }
            let wp = rings.tre.wp();
            rings.tre.set_pointers(wp, wp);
        } else {
            while !rings.tre.is_empty() {
                let idx = rings.tre.rp();
                let entry = rings.bufs.take(idx);
                rings.tre.advance_read();
                let Some(mut entry) = entry else {
                    continue;
                };
                if entry.dir == DmaDirection::ToDevice {
                    self.pending_dec();
                }
                self.unmap_entry(&mut entry);
                deliver(entry, &mut out);
            }
        }
        tracing::debug!(chan = ch.id(), flushed = out.len(), "channel reset");
        out
    }

    /// Drains and disables a channel without talking to the device.
    pub(crate) fn flush_channel(&self, ch: &Channel) -> Vec<Delivery> {
        let out = self.reset_channel(ch);
        let mut inner = write(&ch.inner);
        inner.state = ChannelState::Disabled;
        self.deinit_channel_context(ch, &mut inner);
        out
    }

    // ---- lifecycle -----------------------------------------------------------------------------

    fn wait_command(&self, ch: &Channel) -> Result<()> {
        match ch.completion.wait_timeout(self.config.command_timeout()) {
            Some(code) if code == CompletionCode::Success.as_u8() => Ok(()),
            Some(code) => {
                tracing::error!(chan = ch.id(), code, "channel command failed");
                Err(MhiError::Io("channel command failed"))
            }
            None => {
                tracing::error!(chan = ch.id(), "channel command timed out");
                Err(MhiError::Io("channel command timed out"))
            }
        }
    }

    /// Sends a channel command with a packet vote held and waits for its
    /// completion.
    fn channel_command(&self, ch: &Channel, kind: CommandKind) -> Result<()> {
        ch.completion.reinit();
        self.command_get()?;
        let res = self
            .send_command(kind, ch.id())
            .and_then(|()| self.wait_command(ch));
        self.pending_dec();
        res
    }

    /// Starts a channel: allocates its ring, sends START and, for
    /// pre-allocated channels, fills the ring with receive buffers.
    pub fn prepare_channel(&self, chan: u32) -> Result<()> {
        let ch = self.channel(chan)?;
        let ee = self.exec_env();
        if ch.cfg.ee_mask_bits() & ee.mask_bit() == 0 {
            return Err(MhiError::not_connected(
                chan,
                "not available in the current execution environment",
            ));
        }

        let _lc = lock(&ch.lifecycle);
        {
            let mut inner = write(&ch.inner);
            if inner.state != ChannelState::Disabled {
                return Err(MhiError::Io("channel already prepared"));
            }
            if !ch.cfg.offload {
                self.init_channel_context(ch, &mut inner)?;
            }
        }

        if let Err(err) = self.channel_command(ch, CommandKind::Start) {
            let mut inner = write(&ch.inner);
            self.deinit_channel_context(ch, &mut inner);
            return Err(err);
        }

        {
            let mut inner = write(&ch.inner);
            inner.state = ChannelState::Enabled;
            if inner.rings.is_some() {
                context::set_channel_state(&*self.dma, ch.ctxt, chan_state::RUNNING);
            }
        }

        if ch.cfg.pre_alloc {
            if let Err(err) = self.fill_prealloc(ch) {
                tracing::error!(chan, error = %err, "failed to pre-allocate receive buffers");
                self.unprepare_locked(ch);
                return Err(err);
            }
        }
        tracing::info!(chan, name = %ch.cfg.name, "channel prepared");
        Ok(())
    }

    /// Resets a channel and hands every queued buffer back with
    /// [`TransferStatus::NotConnected`]. Idempotent.
    pub fn unprepare_channel(&self, chan: u32) -> Result<()> {
        let ch = self.channel(chan)?;
        let _lc = lock(&ch.lifecycle);
        self.unprepare_locked(ch);
        Ok(())
    }

    fn unprepare_locked(&self, ch: &Channel) {
        {
            let mut inner = write(&ch.inner);
            if inner.state == ChannelState::Disabled {
                return;
            }
            inner.state = ChannelState::Disabled;
        }

        if !self.pm_state().in_error() {
            if let Err(err) = self.channel_command(ch, CommandKind::Reset) {
                tracing::error!(chan = ch.id(), error = %err, "channel still resetting");
            }
        }

        let out = self.reset_channel(ch);
        {
            let mut inner = write(&ch.inner);
            self.deinit_channel_context(ch, &mut inner);
        }
        self.deliver(out);
        tracing::info!(chan = ch.id(), "channel unprepared");
    }

    fn update_channel_state(&self, ch: &Channel, kind: CommandKind) -> Result<()> {
        let (from, to) = match kind {
            CommandKind::Stop => (ChannelState::Enabled, ChannelState::Stopped),
            CommandKind::Start => (ChannelState::Stopped, ChannelState::Enabled),
            _ => return Err(MhiError::InvalidArgument("not a channel state command")),
        };

        let _lc = lock(&ch.lifecycle);
        if read(&ch.inner).state != from {
            return Err(MhiError::not_connected(
                ch.id(),
                "channel state does not permit the update",
            ));
        }
        self.channel_command(ch, kind)?;
        write(&ch.inner).state = to;
        tracing::debug!(chan = ch.id(), state = ?to, "channel state updated");
        Ok(())
    }

    /// Prepares both channels of a logical device. On failure the channels
    /// already prepared are reset again.
    pub fn prepare_for_transfer(&self, device: &str) -> Result<()> {
        let chans: Vec<u32> = self.device(device)?.channels().collect();
        for (i, &chan) in chans.iter().enumerate() {
            if let Err(err) = self.prepare_channel(chan) {
                for &done in &chans[..i] {
                    let _ = self.unprepare_channel(done);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn unprepare_from_transfer(&self, device: &str) -> Result<()> {
        let chans: Vec<u32> = self.device(device)?.channels().collect();
        for chan in chans {
            self.unprepare_channel(chan)?;
        }
        Ok(())
    }

    /// Stops every channel of a logical device, stopping at the first
    /// failure.
    pub fn pause_transfer(&self, device: &str) -> Result<()> {
        let chans: Vec<u32> = self.device(device)?.channels().collect();
        for chan in chans {
            self.update_channel_state(self.channel(chan)?, CommandKind::Stop)?;
        }
        Ok(())
    }

    pub fn resume_transfer(&self, device: &str) -> Result<()> {
        let chans: Vec<u32> = self.device(device)?.channels().collect();
        for chan in chans {
            self.update_channel_state(self.channel(chan)?, CommandKind::Start)?;
        }
        Ok(())
    }

    /// Free descriptor slots on a channel's transfer ring.
    pub fn get_no_free_descriptors(&self, chan: u32) -> Result<usize> {
        let ch = self.channel(chan)?;
        let inner = read(&ch.inner);
        Ok(inner
            .rings
            .as_ref()
            .map(|r| r.tre.slots_available())
            .unwrap_or(0))
    }
}
