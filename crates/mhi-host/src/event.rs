//! Event rings and the event dispatcher.
//!
//! Every event ring is drained by one context at a time under its lock. The
//! walk runs from the local read pointer to the device's write pointer (the
//! context record's read-pointer field), dispatching each record and handing
//! the slot straight back to the device.
//!
//! Control rings run to exhaustion. Data rings stop after `quota` events and
//! reschedule themselves. Timesync and bandwidth-scale rings have their own
//! policies.

use std::sync::Mutex;

use crate::client::LinkInfo;
use crate::config::{EventRingConfig, EventRingKind};
use crate::context::{self, CTX_CFG, CTX_INDEX, CTX_TYPE, CTX_WP};
use crate::controller::{Controller, Deferred, Delivery, StateTransition};
use crate::dma::DmaBus;
use crate::error::{MhiError, Result};
use crate::regs::{bw_scale_result, BW_SCALE_NACK};
use crate::ring::Ring;
use crate::state::{DeviceState, ExecEnv};
use crate::sync::{lock, read};
use crate::tre::{Event, TRE_LEN};

/// Ring type value marking a usable event ring context.
const ER_TYPE_VALID: u32 = 1;

#[derive(Debug)]
pub(crate) struct EventRing {
    pub(crate) index: usize,
    pub(crate) cfg: EventRingConfig,
    pub(crate) ring: Ring,
    pub(crate) lock: Mutex<()>,
}

impl EventRing {
    pub(crate) fn new(index: usize, cfg: EventRingConfig, base: u64, ctxt: u64) -> Self {
        Self {
            index,
            ring: Ring::new_event(base, cfg.elements, ctxt),
            cfg,
            lock: Mutex::new(()),
        }
    }

    /// The device wrote events the host has not consumed yet.
    pub(crate) fn has_pending(&self, bus: &dyn DmaBus) -> bool {
        self.ring
            .device_rp(bus)
            .is_some_and(|rp| rp != self.ring.rp())
    }
}

impl Controller {
    /// Programs every event ring context and hands all slots but one to the
    /// device.
    pub(crate) fn init_event_rings(&self) {
        for er in &self.event_rings {
            let _guard = lock(&er.lock);
            let ring = &er.ring;
            let record = ring.context();
            let n = ring.elements();
            self.dma.write_u32(record + CTX_CFG, er.cfg.intmod << 16);
            self.dma.write_u32(record + CTX_TYPE, ER_TYPE_VALID);
            self.dma.write_u32(record + CTX_INDEX, er.cfg.msi_vector);
            context::write_ring_fields(&*self.dma, record, ring.base(), n * TRE_LEN);
            self.dma.write_u64(record + CTX_WP, ring.to_device(n - 1));
            ring.set_pointers(0, n - 1);
        }
    }

    /// Tells the device how far it may write on an event ring.
    pub(crate) fn ring_er_db(&self, er: &EventRing) {
        if er.cfg.offload {
            return;
        }
        let db = er.ring.to_device(er.ring.wp());
        self.regs.write_db(self.regs.layout.event_db(er.index), db);
    }

    fn ring_er_db_if_valid(&self, er: &EventRing) {
        let st = read(&self.link.state);
        if st.pm_state.db_access_valid() {
            self.ring_er_db(er);
        }
    }

    /// Walks up to `quota` events, recycling each slot after `f` ran. Caller
    /// holds the ring lock.
    fn drain_events(&self, er: &EventRing, quota: usize, mut f: impl FnMut(Event)) -> usize {
        let Some(dev_rp) = er.ring.device_rp(&*self.dma) else {
            tracing::error!(er = er.index, "device event pointer outside ring");
            return 0;
        };
        let mut n = 0;
        while er.ring.rp() != dev_rp && n < quota {
            let ev = er.ring.read_element(&*self.dma, er.ring.rp());
            let ev = ev.decode_event();
            tracing::trace!(er = er.index, event = ?ev, "event");
            f(ev);
            er.ring.recycle_event(&*self.dma);
            n += 1;
        }
        n
    }

    /// Deferred-context entry point for one event ring. Returns the number
    /// of events processed.
    pub fn run_event_task(&self, er: usize) -> Result<usize> {
        let ring = self.event_ring(er)?;
        match ring.cfg.kind {
            EventRingKind::Control => self.control_event_task(ring),
            EventRingKind::Data => Ok(self.process_data_ring(ring, ring.cfg.quota, true)),
            EventRingKind::Timesync => Ok(self.process_timesync_ring(ring)),
            EventRingKind::BandwidthScale => self.process_bw_scale_ring(ring),
        }
    }

    /// Drains a client-managed ring on the client's schedule.
    pub fn poll(&self, chan: u32, budget: usize) -> Result<usize> {
        let ch = self.channel(chan)?;
        let ring = self.event_ring(ch.cfg.event_ring)?;
        if ring.cfg.kind != EventRingKind::Data {
            return Err(MhiError::InvalidArgument("channel's event ring is not a data ring"));
        }
        Ok(self.process_data_ring(ring, budget, false))
    }

    fn control_event_task(&self, er: &EventRing) -> Result<usize> {
        let pm = self.pm_state();
        if !pm.reg_access_valid() {
            if pm.in_suspend() {
                self.trigger_resume();
            }
            return Ok(0);
        }

        let n = self.process_control_ring(er);
        if n == 0 {
            // Nothing on the ring: the interrupt may have been a system
            // error the device could not post.
            match self.regs.device_state() {
                Ok(Some(DeviceState::SysErr)) => {
                    tracing::error!("device in system error with no event posted");
                    self.escalate_sys_err();
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %err, "device unreachable from control event task");
                    self.escalate_sys_err();
                    return Err(err);
                }
            }
        }
        Ok(n)
    }

    fn process_control_ring(&self, er: &EventRing) -> usize {
        let mut out = Vec::new();
        let mut deferred = Vec::new();
        let n = {
            let _guard = lock(&er.lock);
            if self.pm_state().event_access_invalid() {
                return 0;
            }
            let mut bw_request = None;
            let n = self.drain_events(er, er.cfg.quota, |ev| match ev {
                Event::StateChange { state } => self.on_state_change(state, &mut deferred),
                Event::CommandCompletion { cmd_ptr, code } => {
                    self.process_cmd_completion(cmd_ptr, code)
                }
                Event::ExecEnv { ee } => self.on_exec_env(ee, &mut deferred),
                Event::BandwidthRequest { speed, width, seq } => {
                    // Requests coalesce; only the latest one is answered.
                    bw_request = Some(LinkInfo {
                        target_link_speed: speed,
                        target_link_width: width,
                        sequence: seq,
                    });
                }
                ev => self.dispatch_transfer_event(ev, &mut out),
            });
            if let Some(link) = bw_request {
                deferred.push(Deferred::BandwidthScale(link));
            }
            self.ring_er_db_if_valid(er);
            self.deliver(out);
            n
        };
        self.run_deferred(deferred);
        n
    }

    fn on_state_change(&self, raw: u8, deferred: &mut Vec<Deferred>) {
        match DeviceState::from_raw(raw) {
            Some(DeviceState::M0) => self.on_m0(),
            Some(DeviceState::M1) => self.on_m1(deferred),
            Some(DeviceState::M3) => self.on_m3(),
            Some(DeviceState::SysErr) => {
                if self.exec_env() == ExecEnv::Rddm || self.config.rddm_supported {
                    tracing::info!("system error notification ignored, crash dump expected");
                } else {
                    tracing::error!("device posted system error");
                    deferred.push(Deferred::SysErr);
                }
            }
            other => tracing::warn!(state = raw, ?other, "unhandled state change event"),
        }
    }

    fn on_exec_env(&self, raw: u8, deferred: &mut Vec<Deferred>) {
        let ee = self.translate_ee(u32::from(raw));
        tracing::info!(?ee, "execution environment change");
        match ee {
            ExecEnv::Sbl => self.queue_transition(StateTransition::Sbl(ee)),
            ee if ee.is_mission_mode() => self.queue_transition(StateTransition::MissionMode(ee)),
            ExecEnv::Rddm => deferred.push(Deferred::Rddm),
            _ => {}
        }
    }

    fn dispatch_transfer_event(&self, ev: Event, out: &mut Vec<Delivery>) {
        match ev {
            Event::Transfer {
                chan,
                tre_ptr,
                len,
                code,
            } => match self.channels.get(&chan) {
                Some(ch) => self.process_transfer_event(ch, tre_ptr, len, code, out),
                None => tracing::warn!(chan, "transfer event for unknown channel"),
            },
            Event::RscTransfer {
                chan,
                cookie,
                len,
                code,
            } => match self.channels.get(&chan) {
                Some(ch) => self.process_rsc_event(ch, cookie, len, code, out),
                None => tracing::warn!(chan, "credit event for unknown channel"),
            },
            Event::Stale => {}
            other => tracing::warn!(event = ?other, "unexpected event type"),
        }
    }

    fn process_data_ring(&self, er: &EventRing, quota: usize, reschedule: bool) -> usize {
        let mut out = Vec::new();
        let _guard = lock(&er.lock);
        if self.pm_state().event_access_invalid() {
            return 0;
        }
        let n = self.drain_events(er, quota, |ev| self.dispatch_transfer_event(ev, &mut out));
        self.ring_er_db_if_valid(er);
        self.deliver(out);
        if reschedule && er.has_pending(&*self.dma) {
            self.reschedule(er.index);
        }
        n
    }

    // ---- timesync ------------------------------------------------------------------------------

    fn process_timesync_ring(&self, er: &EventRing) -> usize {
        let Some(ts) = &self.timesync else {
            return 0;
        };
        let mut ready = Vec::new();
        let n = {
            let _guard = lock(&er.lock);
            if self.pm_state().event_access_invalid() {
                return 0;
            }
            let n = self.drain_events(er, usize::MAX, |ev| match ev {
                Event::Timesync { seq, remote_time } => {
                    if let Some(done) = ts.match_response(seq, remote_time) {
                        ready.push(done);
                    }
                }
                other => tracing::warn!(event = ?other, "unexpected event on timesync ring"),
            });
            self.ring_er_db_if_valid(er);
            n
        };
        for (cb, sample) in ready {
            cb(sample);
        }
        n
    }

    // ---- bandwidth scaling ---------------------------------------------------------------------

    /// Answers the most recent request on a bandwidth-scale ring. Earlier
    /// requests that coalesced behind it are skipped.
    fn process_bw_scale_ring(&self, er: &EventRing) -> Result<usize> {
        if self.pm_state().event_access_invalid() {
            return Ok(0);
        }
        self.device_get_sync()?;
        let res = self.bw_scale_locked(er);
        self.device_put(false);
        res
    }

    fn bw_scale_locked(&self, er: &EventRing) -> Result<usize> {
        let _pm = lock(&self.pm_mutex);
        let (request, skipped) = {
            let _guard = lock(&er.lock);
            let Some(dev_rp) = er.ring.device_rp(&*self.dma) else {
                return Err(MhiError::Io("device event pointer outside ring"));
            };
            let rp = er.ring.rp();
            if dev_rp == rp {
                return Ok(0);
            }
            let last = er.ring.prev(dev_rp);
            let skipped = (last + er.ring.elements() - rp) % er.ring.elements();
            // Fast-forward so that `last` is the only element left to consume.
            er.ring.set_pointers(last, er.ring.prev(last));
            let ev = er.ring.read_element(&*self.dma, last).decode_event();
            er.ring.recycle_event(&*self.dma);
            self.ring_er_db_if_valid(er);
            (ev, skipped)
        };

        let Event::BandwidthRequest { speed, width, seq } = request else {
            tracing::warn!(event = ?request, "unexpected event on bandwidth ring");
            return Ok(skipped + 1);
        };
        if skipped > 0 {
            tracing::debug!(skipped, "coalesced bandwidth requests");
        }
        self.negotiate_and_ack(LinkInfo {
            target_link_speed: speed,
            target_link_width: width,
            sequence: seq,
        });
        Ok(skipped + 1)
    }

    pub(crate) fn apply_bw_scale(&self, link: LinkInfo) -> Result<()> {
        self.device_get_sync()?;
        {
            let _pm = lock(&self.pm_mutex);
            self.negotiate_and_ack(link);
        }
        self.device_put(false);
        Ok(())
    }

    fn negotiate_and_ack(&self, link: LinkInfo) {
        let accepted = self.client.negotiate_bandwidth(link);
        let status = if accepted {
            *lock(&self.link_info) = link;
            0
        } else {
            BW_SCALE_NACK
        };
        tracing::info!(
            speed = link.target_link_speed,
            width = link.target_link_width,
            seq = link.sequence,
            accepted,
            "bandwidth request"
        );
        let st = read(&self.link.state);
        if st.pm_state.db_access_valid() {
            self.regs.write(
                self.regs.layout.bw_scale_db,
                bw_scale_result(status, link.sequence),
            );
        }
    }
}
