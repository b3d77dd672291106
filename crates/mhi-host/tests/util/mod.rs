#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mhi_host::{
    ChannelConfig, CommandKind, CompletionCode, Controller, ControllerClient, ControllerConfig,
    DmaBus, DmaDirection, EventRingConfig, EventRingKind, LinkInfo, PmState, RegisterAccess,
    RegisterLayout, RingId, StatusEvent, TransferCallback, TransferKind, TransferResult, Tre,
    CTX_RP, CTX_WP, PCI_INVALID_READ, TRE_LEN,
};

pub const MEM_SIZE: usize = 4 << 20;
const ALLOC_BASE: u64 = 0x1000;

/// Raw device state values as written to the control register.
pub const STATE_M0: u8 = 0x2;
pub const STATE_M1: u8 = 0x3;
pub const STATE_M2: u8 = 0x4;
pub const STATE_M3: u8 = 0x5;
pub const STATE_SYS_ERR: u8 = 0xff;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

// ---- memory ------------------------------------------------------------------------------------

/// Flat bus memory with a bump allocator. Streaming mappings copy the client
/// buffer in (host to device) and back out on unmap (device to host).
pub struct TestBus {
    mem: Mutex<Vec<u8>>,
    next: Mutex<u64>,
    coherent: Mutex<HashMap<u64, usize>>,
    mapped: Mutex<HashMap<u64, usize>>,
    pub fail_map: AtomicBool,
}

impl TestBus {
    pub fn new() -> Self {
        Self {
            mem: Mutex::new(vec![0; MEM_SIZE]),
            next: Mutex::new(ALLOC_BASE),
            coherent: Mutex::new(HashMap::new()),
            mapped: Mutex::new(HashMap::new()),
            fail_map: AtomicBool::new(false),
        }
    }

    fn bump(&self, len: usize, align: usize) -> Option<u64> {
        let mut next = self.next.lock().unwrap();
        let align = align.max(1) as u64;
        let paddr = (*next + align - 1) / align * align;
        let end = paddr + len as u64;
        if end > MEM_SIZE as u64 {
            return None;
        }
        *next = end;
        Some(paddr)
    }

    pub fn live_coherent(&self) -> usize {
        self.coherent.lock().unwrap().len()
    }

    pub fn live_mappings(&self) -> usize {
        self.mapped.lock().unwrap().len()
    }

    pub fn read_vec(&self, paddr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        self.read_bytes(paddr, &mut buf);
        buf
    }
}

impl DmaBus for TestBus {
    fn read_bytes(&self, paddr: u64, dst: &mut [u8]) {
        let mem = self.mem.lock().unwrap();
        let off = paddr as usize;
        dst.copy_from_slice(&mem[off..off + dst.len()]);
    }

    fn write_bytes(&self, paddr: u64, src: &[u8]) {
        let mut mem = self.mem.lock().unwrap();
        let off = paddr as usize;
        mem[off..off + src.len()].copy_from_slice(src);
    }

    fn alloc_coherent(&self, len: usize, align: usize) -> Option<u64> {
        let paddr = self.bump(len, align)?;
        self.coherent.lock().unwrap().insert(paddr, len);
        Some(paddr)
    }

    fn free_coherent(&self, paddr: u64, len: usize) {
        let old = self.coherent.lock().unwrap().remove(&paddr);
        assert_eq!(old, Some(len), "free of unknown coherent region {paddr:#x}");
    }

    fn map_single(&self, buf: &[u8], dir: DmaDirection) -> Option<u64> {
        if self.fail_map.load(Ordering::SeqCst) {
            return None;
        }
        let paddr = self.bump(buf.len().max(1), 64)?;
        if dir != DmaDirection::FromDevice {
            self.write_bytes(paddr, buf);
        }
        self.mapped.lock().unwrap().insert(paddr, buf.len());
        Some(paddr)
    }

    fn unmap_single(&self, paddr: u64, buf: &mut [u8], dir: DmaDirection) {
        let old = self.mapped.lock().unwrap().remove(&paddr);
        assert_eq!(old, Some(buf.len()), "unmap of unknown mapping {paddr:#x}");
        if dir != DmaDirection::ToDevice {
            self.read_bytes(paddr, buf);
        }
    }
}

// ---- registers ---------------------------------------------------------------------------------

enum SimMsg {
    Write(u32, u32),
    Stop,
}

/// Register file that logs every write and forwards it to the device model.
pub struct MockRegs {
    values: Mutex<HashMap<u32, u32>>,
    log: Mutex<Vec<(u32, u32)>>,
    pub dead: AtomicBool,
    sim: Mutex<Option<Sender<SimMsg>>>,
}

impl MockRegs {
    pub fn new() -> Self {
        let layout = RegisterLayout::default();
        let mut values = HashMap::new();
        // Mission mode.
        values.insert(layout.exec_env, 2);
        Self {
            values: Mutex::new(values),
            log: Mutex::new(Vec::new()),
            dead: AtomicBool::new(false),
            sim: Mutex::new(None),
        }
    }

    pub fn set(&self, offset: u32, value: u32) {
        self.values.lock().unwrap().insert(offset, value);
    }

    pub fn get(&self, offset: u32) -> u32 {
        self.values.lock().unwrap().get(&offset).copied().unwrap_or(0)
    }

    pub fn log(&self) -> Vec<(u32, u32)> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }

    pub fn writes_to(&self, offset: u32) -> Vec<u32> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(off, _)| *off == offset)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Position of the first logged write matching `pred`.
    pub fn position(&self, pred: impl Fn(u32, u32) -> bool) -> Option<usize> {
        self.log.lock().unwrap().iter().position(|&(o, v)| pred(o, v))
    }
}

impl RegisterAccess for MockRegs {
    fn read_reg(&self, offset: u32) -> u32 {
        if self.dead.load(Ordering::SeqCst) {
            return PCI_INVALID_READ;
        }
        self.get(offset)
    }

    fn write_reg(&self, offset: u32, value: u32) {
        self.values.lock().unwrap().insert(offset, value);
        self.log.lock().unwrap().push((offset, value));
        if let Some(tx) = self.sim.lock().unwrap().as_ref() {
            let _ = tx.send(SimMsg::Write(offset, value));
        }
    }

    fn link_down(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }
}

// ---- clients -----------------------------------------------------------------------------------

pub struct RecordingClient {
    pub statuses: Mutex<Vec<StatusEvent>>,
    pub resume_requests: AtomicUsize,
    /// Spawn a resume when the transport asks for one.
    pub auto_resume: AtomicBool,
    pub accept_bandwidth: AtomicBool,
    pub negotiated: Mutex<Vec<LinkInfo>>,
    pub clock: AtomicU64,
    pub lpm_disables: AtomicUsize,
    ctrl: OnceLock<Weak<Controller>>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self {
            statuses: Mutex::new(Vec::new()),
            resume_requests: AtomicUsize::new(0),
            auto_resume: AtomicBool::new(false),
            accept_bandwidth: AtomicBool::new(false),
            negotiated: Mutex::new(Vec::new()),
            clock: AtomicU64::new(1_000),
            lpm_disables: AtomicUsize::new(0),
            ctrl: OnceLock::new(),
        }
    }

    pub fn statuses(&self) -> Vec<StatusEvent> {
        self.statuses.lock().unwrap().clone()
    }
}

impl ControllerClient for RecordingClient {
    fn status(&self, event: StatusEvent) {
        self.statuses.lock().unwrap().push(event);
    }

    fn request_resume(&self) {
        self.resume_requests.fetch_add(1, Ordering::SeqCst);
        if !self.auto_resume.load(Ordering::SeqCst) {
            return;
        }
        if let Some(ctrl) = self.ctrl.get().and_then(Weak::upgrade) {
            thread::spawn(move || {
                let _ = ctrl.resume();
            });
        }
    }

    fn negotiate_bandwidth(&self, link: LinkInfo) -> bool {
        self.negotiated.lock().unwrap().push(link);
        self.accept_bandwidth.load(Ordering::SeqCst)
    }

    fn host_time(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    fn lpm_disable(&self) {
        self.lpm_disables.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingCallback {
    pub results: Mutex<Vec<(u32, TransferResult)>>,
    pub statuses: Mutex<Vec<(u32, StatusEvent)>>,
}

impl RecordingCallback {
    pub fn take(&self) -> Vec<(u32, TransferResult)> {
        std::mem::take(&mut *self.results.lock().unwrap())
    }

    pub fn count(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    pub fn statuses(&self) -> Vec<(u32, StatusEvent)> {
        self.statuses.lock().unwrap().clone()
    }
}

impl TransferCallback for RecordingCallback {
    fn on_complete(&self, chan: u32, result: TransferResult) {
        self.results.lock().unwrap().push((chan, result));
    }

    fn on_status(&self, chan: u32, event: StatusEvent) {
        self.statuses.lock().unwrap().push((chan, event));
    }
}

// ---- device model ------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandPolicy {
    Succeed,
    Fail,
    Ignore,
}

/// Device side of the rings: consumes commands, posts events and reacts to
/// power state requests.
pub struct DeviceModel {
    bus: Arc<TestBus>,
    post_lock: Mutex<()>,
    pub policy: Mutex<CommandPolicy>,
    pub commands: Mutex<Vec<(CommandKind, u32)>>,
    /// Answer M3/M0 requests with state-change events.
    pub ack_power: AtomicBool,
}

impl DeviceModel {
    fn new(bus: Arc<TestBus>) -> Self {
        Self {
            bus,
            post_lock: Mutex::new(()),
            policy: Mutex::new(CommandPolicy::Succeed),
            commands: Mutex::new(Vec::new()),
            ack_power: AtomicBool::new(true),
        }
    }

    pub fn set_policy(&self, policy: CommandPolicy) {
        *self.policy.lock().unwrap() = policy;
    }

    pub fn commands(&self) -> Vec<(CommandKind, u32)> {
        self.commands.lock().unwrap().clone()
    }

    /// Writes one event at the device's write position and publishes it.
    pub fn post(&self, ctrl: &Controller, er: usize, ev: Tre) {
        let _guard = self.post_lock.lock().unwrap();
        let snap = ctrl.ring_snapshot(RingId::Event(er)).expect("event ring");
        let dev_wp = self.bus.read_u64(snap.context + CTX_RP);
        let idx = ((dev_wp - snap.base) / TRE_LEN as u64) as usize;
        ev.write_to(&*self.bus, dev_wp);
        let next = (idx + 1) % snap.elements;
        self.bus
            .write_u64(snap.context + CTX_RP, snap.base + (next * TRE_LEN) as u64);
    }

    fn process_commands(&self, ctrl: &Controller) {
        let snap = ctrl.ring_snapshot(RingId::Command).expect("command ring");
        let mut rp = self.bus.read_u64(snap.context + CTX_RP);
        let wp = self.bus.read_u64(snap.context + CTX_WP);
        let policy = *self.policy.lock().unwrap();
        let mut posted = false;
        while rp != wp {
            let cmd = Tre::read_from(&*self.bus, rp);
            if let Some(kind) = cmd.command_kind() {
                self.commands.lock().unwrap().push((kind, cmd.chid()));
            }
            match policy {
                CommandPolicy::Succeed => {
                    self.post(ctrl, 0, Tre::command_completion_event(rp, CompletionCode::Success));
                    posted = true;
                }
                CommandPolicy::Fail => {
                    self.post(ctrl, 0, Tre::command_completion_event(rp, CompletionCode::UndefinedErr));
                    posted = true;
                }
                CommandPolicy::Ignore => {}
            }
            rp += TRE_LEN as u64;
            if rp == snap.base + (snap.elements * TRE_LEN) as u64 {
                rp = snap.base;
            }
        }
        self.bus.write_u64(snap.context + CTX_RP, rp);
        if posted {
            let _ = ctrl.run_event_task(0);
        }
    }

    fn on_write(&self, ctrl: &Controller, layout: &RegisterLayout, offset: u32, value: u32) {
        if offset == layout.cmd_db {
            self.process_commands(ctrl);
        } else if offset == layout.ctrl && self.ack_power.load(Ordering::SeqCst) {
            let state = ((value >> 8) & 0xff) as u8;
            if state == STATE_M3 || state == STATE_M0 {
                self.post(ctrl, 0, Tre::state_change_event(state));
                let _ = ctrl.run_event_task(0);
            }
        }
    }
}

// ---- harness -----------------------------------------------------------------------------------

pub struct Harness {
    pub ctrl: Arc<Controller>,
    pub bus: Arc<TestBus>,
    pub regs: Arc<MockRegs>,
    pub client: Arc<RecordingClient>,
    pub device: Arc<DeviceModel>,
    pub layout: RegisterLayout,
    sim: Option<JoinHandle<()>>,
    tx: Sender<SimMsg>,
}

impl Harness {
    pub fn new(config: ControllerConfig) -> Self {
        init_tracing();
        let bus = Arc::new(TestBus::new());
        let regs = Arc::new(MockRegs::new());
        let client = Arc::new(RecordingClient::new());
        let layout = config.registers.clone();
        let ctrl = Arc::new(
            Controller::new(config, regs.clone(), bus.clone(), client.clone())
                .expect("controller"),
        );
        let _ = client.ctrl.set(Arc::downgrade(&ctrl));
        let device = Arc::new(DeviceModel::new(bus.clone()));

        let (tx, rx) = mpsc::channel();
        *regs.sim.lock().unwrap() = Some(tx.clone());
        let sim = {
            let ctrl = Arc::downgrade(&ctrl);
            let device = device.clone();
            let layout = layout.clone();
            thread::spawn(move || {
                while let Ok(SimMsg::Write(offset, value)) = rx.recv() {
                    let Some(ctrl) = ctrl.upgrade() else {
                        return;
                    };
                    device.on_write(&ctrl, &layout, offset, value);
                }
            })
        };

        Self {
            ctrl,
            bus,
            regs,
            client,
            device,
            layout,
            sim: Some(sim),
            tx,
        }
    }

    /// Powers up and brings the link to M0 in mission mode.
    pub fn boot(config: ControllerConfig) -> Self {
        let h = Self::new(config);
        h.ctrl.power_up().expect("power up");
        h.post(0, Tre::state_change_event(STATE_M0));
        h.run(0);
        h.ctrl.process_state_transitions();
        assert_eq!(h.ctrl.pm_state(), PmState::M0);
        h
    }

    pub fn post(&self, er: usize, ev: Tre) {
        self.device.post(&self.ctrl, er, ev);
    }

    pub fn run(&self, er: usize) -> usize {
        self.ctrl.run_event_task(er).expect("event task")
    }

    pub fn callback(&self, chan: u32) -> Arc<RecordingCallback> {
        let cb = Arc::new(RecordingCallback::default());
        self.ctrl
            .register_transfer_callback(chan, cb.clone())
            .expect("callback");
        cb
    }

    /// Bus address of descriptor `idx` on a prepared channel.
    pub fn tre_addr(&self, chan: u32, idx: usize) -> u64 {
        let snap = self
            .ctrl
            .ring_snapshot(RingId::Channel(chan))
            .expect("channel ring");
        snap.base + (idx * TRE_LEN) as u64
    }

    pub fn tre(&self, chan: u32, idx: usize) -> Tre {
        Tre::read_from(&*self.bus, self.tre_addr(chan, idx))
    }

    pub fn chan_db_writes(&self, chan: u32) -> Vec<u32> {
        self.regs.writes_to(self.layout.chan_db(chan))
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.regs.sim.lock().unwrap().take();
        let _ = self.tx.send(SimMsg::Stop);
        if let Some(sim) = self.sim.take() {
            let _ = sim.join();
        }
    }
}

pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    pred()
}

// ---- configurations ----------------------------------------------------------------------------

pub fn control_ring() -> EventRingConfig {
    EventRingConfig {
        elements: 32,
        kind: EventRingKind::Control,
        quota: usize::MAX,
        ..EventRingConfig::default()
    }
}

pub fn data_ring() -> EventRingConfig {
    EventRingConfig {
        elements: 32,
        kind: EventRingKind::Data,
        quota: 16,
        msi_vector: 1,
        ..EventRingConfig::default()
    }
}

pub fn channel(id: u32, name: &str, direction: DmaDirection) -> ChannelConfig {
    ChannelConfig {
        id,
        name: name.to_string(),
        elements: 8,
        direction,
        transfer: TransferKind::Buffer,
        event_ring: 1,
        ..ChannelConfig::default()
    }
}

/// Control ring, one data ring, and a LOOPBACK pair on channels 0/1.
pub fn loopback_config() -> ControllerConfig {
    ControllerConfig {
        command_timeout_ms: 500,
        resume_timeout_ms: 500,
        wake_grace_ms: 0,
        command_ring_elements: 16,
        event_rings: vec![control_ring(), data_ring()],
        channels: vec![
            channel(0, "LOOPBACK", DmaDirection::ToDevice),
            channel(1, "LOOPBACK", DmaDirection::FromDevice),
        ],
        ..ControllerConfig::default()
    }
}
