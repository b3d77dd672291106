//! Link power management.
//!
//! The link lock (`Link::state`) guards the host PM state together with the
//! last known device state and execution environment. Ring and doorbell paths
//! hold it in read mode; transitions hold it in write mode. Threads that need
//! the link in a particular state block on the state event, which is
//! signalled after every transition and whenever an error state is entered.
//!
//! The state event must never be signalled with the link lock held.

use std::sync::{Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::client::StatusEvent;
use crate::controller::{Controller, Deferred, StateTransition};
use crate::error::{MhiError, Result};
use crate::state::{DeviceState, ExecEnv, PmState};
use crate::sync::{lock, read, write};
use crate::tre::CompletionCode;

/// Number of completed transitions into each low-power state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PmCounters {
    pub m0: u64,
    pub m2: u64,
    pub m3: u64,
}

#[derive(Debug)]
pub(crate) struct LinkState {
    pub(crate) pm_state: PmState,
    pub(crate) dev_state: DeviceState,
    pub(crate) ee: ExecEnv,
    pub(crate) counters: PmCounters,
}

impl LinkState {
    /// Moves to `next` if the transition table allows it.
    pub(crate) fn try_set(&mut self, next: PmState) -> Result<()> {
        if self.pm_state.can_transition_to(next) {
            tracing::debug!(from = %self.pm_state, to = %next, "pm transition");
            self.pm_state = next;
            Ok(())
        } else {
            tracing::debug!(from = %self.pm_state, to = %next, "rejected pm transition");
            Err(MhiError::IllegalTransition {
                from: self.pm_state,
                to: next,
            })
        }
    }
}

#[derive(Debug)]
pub(crate) struct Link {
    pub(crate) state: RwLock<LinkState>,
    generation: Mutex<u64>,
    event: Condvar,
}

impl Link {
    pub(crate) fn new() -> Self {
        Self {
            state: RwLock::new(LinkState {
                pm_state: PmState::Disabled,
                dev_state: DeviceState::Reset,
                ee: ExecEnv::DisableTransition,
                counters: PmCounters::default(),
            }),
            generation: Mutex::new(0),
            event: Condvar::new(),
        }
    }

    /// Wakes every thread blocked in [`Link::wait_for`].
    pub(crate) fn notify(&self) {
        let mut gen = lock(&self.generation);
        *gen = gen.wrapping_add(1);
        self.event.notify_all();
    }

    /// Blocks until `pred` holds or `timeout` elapses. Returns the final
    /// value of the predicate.
    pub(crate) fn wait_for(&self, timeout: Duration, pred: impl Fn(&LinkState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut gen = lock(&self.generation);
        loop {
            if pred(&read(&self.state)) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            gen = self
                .event
                .wait_timeout(gen, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }
}

impl Controller {
    // ---- wake votes ----------------------------------------------------------------------------

    pub(crate) fn wake_get(&self, st: &LinkState, force: bool) {
        let valid = st.pm_state.reg_access_valid();
        self.wake.toggle(force, || {
            if valid {
                self.regs.write_db(self.regs.layout.wake_db, 1);
            }
        });
    }

    pub(crate) fn wake_put(&self, st: &LinkState, defer: bool) {
        let valid = st.pm_state.reg_access_valid();
        self.wake.release(defer, || {
            if valid {
                self.regs.write_db(self.regs.layout.wake_db, 0);
            }
        });
    }

    pub(crate) fn wake_pulse(&self, st: &LinkState) {
        let valid = st.pm_state.reg_access_valid();
        let wake_db = self.regs.layout.wake_db;
        self.wake.pulse(
            || {
                if valid {
                    self.regs.write_db(wake_db, 1);
                }
            },
            || {
                if valid {
                    self.regs.write_db(wake_db, 0);
                }
            },
        );
    }

    /// Asks the integration to bring the link out of suspend.
    pub(crate) fn trigger_resume(&self) {
        tracing::debug!("requesting link resume");
        self.client.request_resume();
    }

    /// Takes a wake vote and waits until doorbells may be rung.
    pub(crate) fn device_get_sync(&self) -> Result<()> {
        {
            let st = read(&self.link.state);
            if st.pm_state.in_error() {
                return Err(MhiError::Io("link in error state"));
            }
            self.wake_get(&st, true);
            if st.pm_state.in_suspend() {
                self.trigger_resume();
            }
        }
        let ok = self.link.wait_for(self.config.resume_timeout(), |s| {
            s.pm_state.db_access_valid() || s.pm_state.in_error()
        });
        let st = read(&self.link.state);
        if !ok || !st.pm_state.db_access_valid() {
            self.wake_put(&st, false);
            return Err(MhiError::Io("timed out waiting for the link to resume"));
        }
        Ok(())
    }

    pub(crate) fn device_put(&self, defer: bool) {
        let st = read(&self.link.state);
        self.wake_put(&st, defer);
    }

    // ---- device-initiated transitions ----------------------------------------------------------

    pub(crate) fn on_m0(&self) {
        {
            let mut st = write(&self.link.state);
            if let Err(err) = st.try_set(PmState::M0) {
                tracing::error!(error = %err, "unexpected M0 event");
                return;
            }
            st.dev_state = DeviceState::M0;
            st.counters.m0 += 1;
        }

        {
            let st = read(&self.link.state);
            self.wake_get(&st, true);
            for er in &self.event_rings {
                self.ring_er_db(er);
            }
            self.ring_cmd_db_if_pending();
            for ch in self.channels.values() {
                let inner = read(&ch.inner);
                if let Some(rings) = inner.rings.as_ref() {
                    if inner.state.is_active() && !rings.tre.is_empty() {
                        self.ring_chan_db(ch, rings);
                    }
                }
            }
            self.wake_put(&st, false);
        }
        tracing::info!("link active (M0)");
        self.link.notify();
    }

    pub(crate) fn on_m1(&self, deferred: &mut Vec<Deferred>) {
        let mut st = write(&self.link.state);
        if let Err(err) = st.try_set(PmState::M1Enter) {
            tracing::error!(error = %err, "unexpected M1 event");
            return;
        }
        st.dev_state = DeviceState::M1;
        // M1Enter -> M1 is always legal.
        let _ = st.try_set(PmState::M1);

        let idle = self.pending_packets() == 0 && self.wake.votes() == 0;
        if idle && st.try_set(PmState::M2Enter).is_ok() {
            if let Err(err) = self.regs.request_device_state(DeviceState::M2) {
                tracing::error!(error = %err, "failed to request M2");
                drop(st);
                deferred.push(Deferred::SysErr);
                self.link.notify();
                return;
            }
            let _ = st.try_set(PmState::M2);
            st.dev_state = DeviceState::M2;
            st.counters.m2 += 1;
            drop(st);
            tracing::debug!("link entered M2");
            deferred.push(Deferred::Status(StatusEvent::Idle));
        } else {
            drop(st);
            let st = read(&self.link.state);
            self.wake_pulse(&st);
        }
        self.link.notify();
    }

    pub(crate) fn on_m3(&self) {
        {
            let mut st = write(&self.link.state);
            match st.try_set(PmState::M3) {
                Ok(()) => {
                    st.dev_state = DeviceState::M3;
                    st.counters.m3 += 1;
                }
                Err(err) => tracing::error!(error = %err, "unexpected M3 event"),
            }
        }
        self.link.notify();
    }

    // ---- host-initiated transitions ------------------------------------------------------------

    /// Suspends the link (M0 -> M3).
    ///
    /// Refused with [`MhiError::Busy`] while packets or wake votes are
    /// outstanding.
    pub fn suspend(&self) -> Result<()> {
        let _pm = lock(&self.pm_mutex);

        let pm = self.pm_state();
        if pm.in_error() {
            return Err(MhiError::Io("link in error state"));
        }
        if matches!(
            pm,
            PmState::M1Enter | PmState::M1 | PmState::M2Enter | PmState::M2
        ) {
            self.device_get_sync()?;
            self.device_put(false);
        }

        {
            let mut st = write(&self.link.state);
            if self.pending_packets() > 0 || self.wake.votes() > 0 {
                return Err(MhiError::Busy("transfers or wake votes outstanding"));
            }
            st.try_set(PmState::M3Enter)?;
        }
        self.notify_channels(StatusEvent::LpmEnter);

        if let Err(err) = self.regs.request_device_state(DeviceState::M3) {
            self.escalate_sys_err();
            return Err(err);
        }
        self.link.notify();

        let ok = self.link.wait_for(self.config.resume_timeout(), |s| {
            s.pm_state == PmState::M3 || s.pm_state.in_error()
        });
        if !ok || self.pm_state() != PmState::M3 {
            tracing::error!(pm_state = %self.pm_state(), "device did not enter M3");
            return Err(MhiError::Io("device did not acknowledge suspend"));
        }
        tracing::info!("link suspended (M3)");
        Ok(())
    }

    /// Resumes a suspended link (M3 -> M0).
    pub fn resume(&self) -> Result<()> {
        let _pm = lock(&self.pm_mutex);
        {
            let mut st = write(&self.link.state);
            match st.pm_state {
                PmState::M0 => return Ok(()),
                PmState::M3 | PmState::M3Enter => st.try_set(PmState::M3FastExit)?,
                s if s.in_error() => return Err(MhiError::Io("link in error state")),
                other => {
                    return Err(MhiError::IllegalTransition {
                        from: other,
                        to: PmState::M3FastExit,
                    })
                }
            }
        }

        if let Err(err) = self.regs.request_device_state(DeviceState::M0) {
            self.escalate_sys_err();
            return Err(err);
        }
        self.link.notify();

        let ok = self.link.wait_for(self.config.resume_timeout(), |s| {
            s.pm_state == PmState::M0 || s.pm_state.in_error()
        });
        if !ok || self.pm_state() != PmState::M0 {
            tracing::error!(pm_state = %self.pm_state(), "device did not return to M0");
            return Err(MhiError::Io("device did not acknowledge resume"));
        }
        self.notify_channels(StatusEvent::LpmExit);
        Ok(())
    }

    fn notify_channels(&self, ev: StatusEvent) {
        for (&id, ch) in &self.channels {
            if let Some(cb) = ch.callback() {
                cb.on_status(id, ev.clone());
            }
        }
    }

    // ---- power up / down -----------------------------------------------------------------------

    /// Brings the transport up: Disabled -> PowerOnReset, samples the
    /// device, re-arms the command and event rings.
    ///
    /// The link becomes usable when the device reports M0.
    pub fn power_up(&self) -> Result<()> {
        let _pm = lock(&self.pm_mutex);
        write(&self.link.state).try_set(PmState::PowerOnReset)?;

        let sampled = self
            .regs
            .read(self.regs.layout.exec_env)
            .and_then(|ee| Ok((ee, self.regs.device_state()?)));
        let (raw_ee, dev_state) = match sampled {
            Ok(v) => v,
            Err(err) => {
                let _ = write(&self.link.state).try_set(PmState::Disabled);
                return Err(err);
            }
        };
        let ee = self.translate_ee(raw_ee);

        self.init_command_ring();
        self.init_event_rings();
        {
            let mut st = write(&self.link.state);
            st.ee = ee;
            st.dev_state = dev_state.unwrap_or(DeviceState::Reset);
        }
        for er in &self.event_rings {
            self.ring_er_db(er);
        }
        tracing::info!(?ee, "powered up");

        if ee.is_mission_mode() {
            self.queue_transition(StateTransition::MissionMode(ee));
        }
        self.link.notify();
        Ok(())
    }

    /// Tears the transport down. Every queued buffer is returned with
    /// [`crate::TransferStatus::NotConnected`].
    pub fn power_down(&self) -> Result<()> {
        let _pm = lock(&self.pm_mutex);
        let graceful = {
            let mut st = write(&self.link.state);
            let cur = st.pm_state;
            match cur {
                PmState::Disabled => return Ok(()),
                PmState::NoAccess | PmState::LinkDown => false,
                _ if st.try_set(PmState::ShutdownProcess).is_ok() => true,
                // Suspended or already failing: skip the graceful handshake.
                _ => {
                    st.try_set(PmState::NoAccess)?;
                    false
                }
            }
        };
        self.link.notify();

        self.release_waiters();
        self.flush_all_channels();
        self.forget_created_devices();

        // A reachable device is told to reset; an unreachable one is left alone.
        if graceful {
            if let Err(err) = self.regs.request_device_state(DeviceState::Reset) {
                tracing::warn!(error = %err, "device reset request failed during power down");
            }
        }

        {
            let mut st = write(&self.link.state);
            if graceful {
                st.try_set(PmState::ShutdownDone)?;
            }
            st.try_set(PmState::Disabled)?;
            st.dev_state = DeviceState::Reset;
        }
        self.link.notify();
        tracing::info!("powered down");
        Ok(())
    }

    // ---- fatal errors --------------------------------------------------------------------------

    /// Moves the link to error-detected and runs fatal error handling.
    /// Repeated escalations collapse into the first one.
    pub(crate) fn escalate_sys_err(&self) {
        let detected = write(&self.link.state)
            .try_set(PmState::SysErrDetect)
            .is_ok();
        if detected {
            self.link.notify();
            self.process_sys_err();
        }
    }

    fn process_sys_err(&self) {
        if write(&self.link.state)
            .try_set(PmState::SysErrProcess)
            .is_err()
        {
            return;
        }
        self.link.notify();
        tracing::error!("processing device system error");
        self.client.status(StatusEvent::SysError);

        self.release_waiters();
        self.flush_all_channels();

        let _ = write(&self.link.state).try_set(PmState::NoAccess);
        self.link.notify();

        self.client.status(StatusEvent::FatalError);
        self.notify_channels(StatusEvent::FatalError);
    }

    /// Fails every outstanding command rendezvous.
    fn release_waiters(&self) {
        let invalid = CompletionCode::Invalid.as_u8();
        for ch in self.channels.values() {
            ch.completion.complete_all(invalid);
        }
        if let Some(ts) = &self.timesync {
            ts.completion.complete_all(invalid);
            ts.clear();
        }
    }

    fn flush_all_channels(&self) {
        for ch in self.channels.values() {
            let _lc = lock(&ch.lifecycle);
            let out = self.flush_channel(ch);
            self.deliver(out);
        }
    }
}
