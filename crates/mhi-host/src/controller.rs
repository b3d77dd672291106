//! The controller ties rings, channels, event processing and power
//! management together and is the crate's public entry point.
//!
//! Execution contexts are not owned by the controller. The integration calls:
//! - [`Controller::msi_handler`] from the interrupt handler of each event
//!   ring vector, then [`Controller::run_event_task`] (or
//!   [`Controller::run_pending_tasks`]) from deferred context when asked to;
//! - [`Controller::intvec_handler`] / [`Controller::intvec_threaded_handler`]
//!   for the state/error interrupt;
//! - [`Controller::process_state_transitions`] from a worker after
//!   execution-environment changes;
//! - [`Controller::housekeeping`] periodically.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::channel::{Channel, ChannelState};
use crate::client::{ControllerClient, LinkInfo, StatusEvent, TransferCallback, TransferResult};
use crate::command::CommandRing;
use crate::config::{ControllerConfig, EventPriority, LogicalDevice};
use crate::context::{record_addr, CONTEXT_SIZE};
use crate::dma::DmaBus;
use crate::error::{MhiError, Result};
use crate::event::EventRing;
use crate::pm::{Link, PmCounters};
use crate::regs::{RegisterAccess, RegisterIo};
use crate::state::{DeviceState, ExecEnv, PmState};
use crate::sync::{lock, read, write};
use crate::timesync::Timesync;
use crate::tre::TRE_LEN;
use crate::wake::WakeVote;

/// What the interrupt handler should do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqReturn {
    /// Nothing pending on this vector.
    None,
    /// Handled in interrupt context (client-managed ring notified).
    Handled,
    /// Run [`Controller::run_event_task`] for the ring from deferred context.
    ScheduleTask,
    /// Run [`Controller::intvec_threaded_handler`].
    WakeThread,
}

/// Work queued for [`Controller::process_state_transitions`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateTransition {
    Sbl(ExecEnv),
    MissionMode(ExecEnv),
    SysErr,
}

/// Identifies a ring for [`Controller::ring_snapshot`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingId {
    Command,
    Event(usize),
    Channel(u32),
}

/// Point-in-time view of a ring's host-side state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingSnapshot {
    pub base: u64,
    pub elements: usize,
    /// Bus address of the ring's context record.
    pub context: u64,
    pub rp: usize,
    pub wp: usize,
}

/// Transfer completion collected under the channel lock and delivered after
/// it is dropped.
pub(crate) struct Delivery {
    pub(crate) chan: u32,
    pub(crate) result: TransferResult,
    pub(crate) recycle: bool,
}

/// Side effects of control-ring processing that must run without the event
/// ring lock held.
pub(crate) enum Deferred {
    Status(StatusEvent),
    SysErr,
    Rddm,
    /// Most recent bandwidth request seen on the control ring.
    BandwidthScale(LinkInfo),
}

pub struct Controller {
    pub(crate) config: ControllerConfig,
    pub(crate) regs: RegisterIo,
    pub(crate) dma: Arc<dyn DmaBus>,
    pub(crate) client: Arc<dyn ControllerClient>,
    pub(crate) link: Link,
    pub(crate) wake: WakeVote,
    pub(crate) pending_pkts: AtomicUsize,
    /// Serializes host-driven power operations.
    pub(crate) pm_mutex: Mutex<()>,
    pub(crate) cmd: CommandRing,
    pub(crate) event_rings: Vec<EventRing>,
    pub(crate) channels: BTreeMap<u32, Channel>,
    pub(crate) devices: Vec<LogicalDevice>,
    created: Mutex<BTreeSet<String>>,
    pub(crate) timesync: Option<Timesync>,
    transitions: Mutex<VecDeque<StateTransition>>,
    pending_tasks: AtomicU64,
    pub(crate) link_info: Mutex<LinkInfo>,
    /// Coherent allocations owned for the controller's lifetime.
    static_mem: Vec<(u64, usize)>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        regs: Arc<dyn RegisterAccess>,
        dma: Arc<dyn DmaBus>,
        client: Arc<dyn ControllerClient>,
    ) -> Result<Self> {
        let devices = config.validate()?;
        if config.event_rings.len() > 64 {
            return Err(MhiError::InvalidArgument("at most 64 event rings are supported"));
        }

        let mut static_mem = Vec::new();
        let mut alloc = |len: usize, align: usize| -> Result<u64> {
            let paddr = dma.alloc_coherent(len, align).ok_or(MhiError::NoMemory)?;
            static_mem.push((paddr, len));
            Ok(paddr)
        };

        let chan_slots = config.channels.iter().map(|c| c.id as usize + 1).max().unwrap_or(0);
        let chan_ctxt = alloc((chan_slots.max(1)) * CONTEXT_SIZE, 64)?;
        let er_ctxt = alloc(config.event_rings.len() * CONTEXT_SIZE, 64)?;
        let cmd_ctxt = alloc(CONTEXT_SIZE, 64)?;

        let cmd_len = config.command_ring_elements * TRE_LEN;
        let cmd_base = alloc(cmd_len, ring_align(cmd_len))?;
        let cmd = CommandRing::new(cmd_base, config.command_ring_elements, cmd_ctxt);

        let mut event_rings = Vec::with_capacity(config.event_rings.len());
        for (index, er_cfg) in config.event_rings.iter().enumerate() {
            let len = er_cfg.elements * TRE_LEN;
            let base = alloc(len, ring_align(len))?;
            event_rings.push(EventRing::new(
                index,
                er_cfg.clone(),
                base,
                record_addr(er_ctxt, index),
            ));
        }

        let channels = config
            .channels
            .iter()
            .map(|c| {
                (
                    c.id,
                    Channel::new(c.clone(), record_addr(chan_ctxt, c.id as usize)),
                )
            })
            .collect();

        let timesync = config
            .timesync
            .as_ref()
            .map(|ts| Timesync::new(ts.event_ring));

        let ctrl = Self {
            regs: RegisterIo::new(regs, config.registers.clone(), config.offload_reg_writes),
            wake: WakeVote::new(config.wake_grace()),
            link: Link::new(),
            pending_pkts: AtomicUsize::new(0),
            pm_mutex: Mutex::new(()),
            cmd,
            event_rings,
            channels,
            devices,
            created: Mutex::new(BTreeSet::new()),
            timesync,
            transitions: Mutex::new(VecDeque::new()),
            pending_tasks: AtomicU64::new(0),
            link_info: Mutex::new(LinkInfo::default()),
            static_mem,
            dma,
            client,
            config,
        };
        ctrl.init_command_ring();
        ctrl.init_event_rings();
        tracing::info!(
            name = %ctrl.config.name,
            channels = ctrl.channels.len(),
            event_rings = ctrl.event_rings.len(),
            "controller registered"
        );
        Ok(ctrl)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub(crate) fn channel(&self, chan: u32) -> Result<&Channel> {
        self.channels.get(&chan).ok_or(MhiError::UnknownChannel(chan))
    }

    pub(crate) fn event_ring(&self, er: usize) -> Result<&EventRing> {
        self.event_rings
            .get(er)
            .ok_or(MhiError::InvalidArgument("unknown event ring"))
    }

    pub(crate) fn device(&self, name: &str) -> Result<&LogicalDevice> {
        self.devices
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| MhiError::UnknownDevice(name.to_string()))
    }

    pub fn devices(&self) -> &[LogicalDevice] {
        &self.devices
    }

    /// Installs the completion sink for a channel, replacing any previous one.
    pub fn register_transfer_callback(
        &self,
        chan: u32,
        cb: Arc<dyn TransferCallback>,
    ) -> Result<()> {
        let ch = self.channel(chan)?;
        *write(&ch.callback) = Some(cb);
        Ok(())
    }

    pub fn pm_state(&self) -> PmState {
        read(&self.link.state).pm_state
    }

    pub fn device_state(&self) -> DeviceState {
        read(&self.link.state).dev_state
    }

    pub fn exec_env(&self) -> ExecEnv {
        read(&self.link.state).ee
    }

    pub fn pm_counters(&self) -> PmCounters {
        read(&self.link.state).counters
    }

    pub fn pending_packets(&self) -> usize {
        self.pending_pkts.load(Ordering::Acquire)
    }

    pub fn wake_votes(&self) -> i32 {
        self.wake.votes()
    }

    /// Link parameters last accepted through bandwidth scaling.
    pub fn link_info(&self) -> LinkInfo {
        *lock(&self.link_info)
    }

    pub fn channel_state(&self, chan: u32) -> Result<ChannelState> {
        Ok(read(&self.channel(chan)?.inner).state)
    }

    pub fn ring_snapshot(&self, id: RingId) -> Option<RingSnapshot> {
        let snap = |r: &crate::ring::Ring| RingSnapshot {
            base: r.base(),
            elements: r.elements(),
            context: r.context(),
            rp: r.rp(),
            wp: r.wp(),
        };
        match id {
            RingId::Command => Some(snap(&self.cmd.ring)),
            RingId::Event(er) => self.event_rings.get(er).map(|e| snap(&e.ring)),
            RingId::Channel(chan) => {
                let ch = self.channels.get(&chan)?;
                let inner = read(&ch.inner);
                inner.rings.as_ref().map(|r| snap(&r.tre))
            }
        }
    }

    pub(crate) fn pending_inc(&self) {
        self.pending_pkts.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn pending_dec(&self) {
        let prev = self
            .pending_pkts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)))
            .unwrap_or(0);
        debug_assert!(prev > 0, "pending packet count underflow");
    }

    pub(crate) fn translate_ee(&self, raw: u32) -> ExecEnv {
        self.config
            .ee_table
            .get(raw as usize)
            .copied()
            .unwrap_or(ExecEnv::NotSupported)
    }

    // ---- interrupt entry points -------------------------------------------------------------

    /// Hard interrupt handler for an event ring vector.
    pub fn msi_handler(&self, er: usize) -> IrqReturn {
        let Some(ring) = self.event_rings.get(er) else {
            return IrqReturn::None;
        };
        if !ring.has_pending(&*self.dma) {
            return IrqReturn::None;
        }
        if ring.cfg.client_managed {
            if let Some(chan) = ring.cfg.channel {
                if let Some(cb) = self.channels.get(&chan).and_then(|c| c.callback()) {
                    cb.on_status(chan, StatusEvent::PendingData);
                }
            }
            return IrqReturn::Handled;
        }
        self.pending_tasks.fetch_or(1 << er, Ordering::AcqRel);
        IrqReturn::ScheduleTask
    }

    pub(crate) fn reschedule(&self, er: usize) {
        self.pending_tasks.fetch_or(1 << er, Ordering::AcqRel);
    }

    /// Runs every event task scheduled by [`Controller::msi_handler`],
    /// high-priority rings first. Returns the number of events handled.
    pub fn run_pending_tasks(&self) -> usize {
        let bits = self.pending_tasks.swap(0, Ordering::AcqRel);
        let mut order: Vec<usize> = (0..self.event_rings.len())
            .filter(|er| bits & (1 << er) != 0)
            .collect();
        order.sort_by_key(|&er| match self.event_rings[er].cfg.priority {
            EventPriority::High => 0,
            EventPriority::Normal => 1,
        });

        let mut total = 0;
        for er in order {
            match self.run_event_task(er) {
                Ok(n) => total += n,
                Err(err) => tracing::warn!(er, error = %err, "event task failed"),
            }
        }
        total
    }

    /// Hard interrupt handler for the state/error vector.
    pub fn intvec_handler(&self) -> IrqReturn {
        self.link.notify();
        IrqReturn::WakeThread
    }

    /// Threaded half of the state/error interrupt: samples the device state
    /// and escalates system errors.
    pub fn intvec_threaded_handler(&self) {
        if !self.pm_state().reg_access_valid() {
            return;
        }
        let state = self.regs.device_state();
        let ee = self.regs.read(self.regs.layout.exec_env);
        let (state, ee) = match (state, ee) {
            (Ok(s), Ok(ee)) => (s, self.translate_ee(ee)),
            (Err(err), _) | (_, Err(err)) => {
                tracing::error!(error = %err, "device unreachable from state interrupt");
                self.escalate_sys_err();
                return;
            }
        };

        if state == Some(DeviceState::SysErr) {
            if ee == ExecEnv::Rddm && self.config.rddm_supported {
                self.enter_rddm();
            } else {
                tracing::error!(?ee, "device reported system error");
                self.escalate_sys_err();
            }
        }
        self.link.notify();
    }

    // ---- state transition worker -------------------------------------------------------------

    pub(crate) fn queue_transition(&self, t: StateTransition) {
        tracing::debug!(transition = ?t, "queued state transition");
        lock(&self.transitions).push_back(t);
    }

    pub fn pending_transitions(&self) -> usize {
        lock(&self.transitions).len()
    }

    /// Drains the state transition queue. Returns how many were processed.
    pub fn process_state_transitions(&self) -> usize {
        let mut n = 0;
        loop {
            let Some(t) = lock(&self.transitions).pop_front() else {
                return n;
            };
            n += 1;
            match t {
                StateTransition::Sbl(ee) => {
                    write(&self.link.state).ee = ee;
                    tracing::info!("device entered secondary boot loader");
                    self.link.notify();
                }
                StateTransition::MissionMode(ee) => self.enter_mission_mode(ee),
                StateTransition::SysErr => self.escalate_sys_err(),
            }
        }
    }

    fn enter_mission_mode(&self, ee: ExecEnv) {
        {
            let mut st = write(&self.link.state);
            if st.pm_state.in_error() {
                return;
            }
            st.ee = ee;
        }
        self.link.notify();
        tracing::info!(?ee, "device in mission mode");
        self.client.status(StatusEvent::EeMissionMode);

        let fresh: Vec<String> = {
            let mut created = lock(&self.created);
            self.devices
                .iter()
                .filter(|d| d.ee_mask & ee.mask_bit() != 0)
                .filter(|d| created.insert(d.name.clone()))
                .map(|d| d.name.clone())
                .collect()
        };
        for name in fresh {
            self.client.status(StatusEvent::DeviceCreated(name));
        }
    }

    pub(crate) fn forget_created_devices(&self) {
        lock(&self.created).clear();
        lock(&self.transitions).clear();
    }

    /// Reports crash-dump entry and releases clients that asked to be told
    /// early.
    pub(crate) fn enter_rddm(&self) {
        write(&self.link.state).ee = ExecEnv::Rddm;
        tracing::warn!("device entered crash-dump environment");
        self.client.status(StatusEvent::EeRddm);
        for (&id, ch) in &self.channels {
            if !ch.cfg.early_notify {
                continue;
            }
            ch.completion.complete_all(crate::tre::CompletionCode::Invalid.as_u8());
            if let Some(cb) = ch.callback() {
                cb.on_status(id, StatusEvent::FatalError);
            }
        }
        self.link.notify();
    }

    // ---- delivery ----------------------------------------------------------------------------

    pub(crate) fn deliver(&self, out: Vec<Delivery>) {
        for d in out {
            let Some(ch) = self.channels.get(&d.chan) else {
                continue;
            };
            let recycle = d.recycle && d.result.status != crate::TransferStatus::NotConnected;
            match ch.callback() {
                Some(cb) => cb.on_complete(d.chan, d.result),
                None => tracing::trace!(chan = d.chan, "no transfer callback, dropping result"),
            }
            if recycle {
                self.recycle_prealloc(ch);
            }
        }
    }

    pub(crate) fn run_deferred(&self, deferred: Vec<Deferred>) {
        for d in deferred {
            match d {
                Deferred::Status(ev) => self.client.status(ev),
                Deferred::SysErr => self.escalate_sys_err(),
                Deferred::Rddm => self.enter_rddm(),
                Deferred::BandwidthScale(link) => {
                    if let Err(err) = self.apply_bw_scale(link) {
                        tracing::error!(error = %err, "bandwidth request not answered");
                    }
                }
            }
        }
    }

    // ---- maintenance -------------------------------------------------------------------------

    /// Periodic maintenance: completes deferred wake deasserts and drains
    /// the offload register write queue. Returns the number of register
    /// writes flushed.
    pub fn housekeeping(&self, now: Instant) -> usize {
        {
            let st = read(&self.link.state);
            let valid = st.pm_state.reg_access_valid();
            self.wake.flush_deferred(now, || {
                if valid {
                    self.regs.write_db(self.regs.layout.wake_db, 0);
                }
            });
        }
        self.flush_register_writes()
    }

    pub fn flush_register_writes(&self) -> usize {
        self.regs.flush()
    }

    pub fn queued_register_writes(&self) -> usize {
        self.regs.queued()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        for ch in self.channels.values() {
            let mut inner = write(&ch.inner);
            if let Some(rings) = inner.rings.take() {
                self.dma.free_coherent(rings.mem, rings.tre.len_bytes());
            }
        }
        for &(paddr, len) in &self.static_mem {
            self.dma.free_coherent(paddr, len);
        }
    }
}

/// Rings are aligned to their (power-of-two rounded) size.
pub(crate) fn ring_align(len: usize) -> usize {
    len.next_power_of_two().max(TRE_LEN)
}
