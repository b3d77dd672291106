//! Command ring.
//!
//! Commands are submitted under the command lock and answered by
//! command-completion events on the control event ring. The device processes
//! commands in order, so a completion always refers to the oldest outstanding
//! element.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::context;
use crate::controller::Controller;
use crate::error::{MhiError, Result};
use crate::ring::Ring;
use crate::sync::{lock, read};
use crate::tre::{CommandKind, CompletionCode, Tre};

#[derive(Debug)]
pub(crate) struct CommandRing {
    pub(crate) ring: Ring,
    pub(crate) lock: Mutex<()>,
    /// Doorbell value last written, so a resumed link can tell whether
    /// commands were queued while doorbells were gated.
    last_db: AtomicU64,
}

impl CommandRing {
    pub(crate) fn new(base: u64, elements: usize, ctxt: u64) -> Self {
        Self {
            ring: Ring::new(base, elements, ctxt),
            lock: Mutex::new(()),
            last_db: AtomicU64::new(base),
        }
    }

    fn ring_db(&self, ctrl: &Controller) {
        let db = self.ring.publish_wp(&*ctrl.dma);
        self.last_db.store(db, Ordering::Release);
        tracing::debug!(db, "ringing command doorbell");
        ctrl.regs.write_db(ctrl.regs.layout.cmd_db, db);
    }
}

impl Controller {
    pub(crate) fn init_command_ring(&self) {
        let _guard = lock(&self.cmd.lock);
        let ring = &self.cmd.ring;
        context::write_ring_fields(&*self.dma, ring.context(), ring.base(), ring.len_bytes());
        ring.set_pointers(0, 0);
        self.cmd.last_db.store(ring.base(), Ordering::Release);
    }

    /// Keeps the device out of low power while a command is outstanding.
    /// Every successful call is paired with a `pending_dec`.
    pub(crate) fn command_get(&self) -> Result<()> {
        let st = read(&self.link.state);
        if st.pm_state.in_error() {
            return Err(MhiError::Io("link in error state"));
        }
        self.pending_inc();
        self.wake_pulse(&st);
        if st.pm_state.in_suspend() {
            self.trigger_resume();
        }
        Ok(())
    }

    /// Places a command on the command ring and rings the doorbell.
    ///
    /// If the link is suspended the command is written immediately and the
    /// doorbell is deferred until the link resumes, bounded by the resume
    /// timeout.
    pub(crate) fn send_command(&self, kind: CommandKind, target: u32) -> Result<()> {
        let rang = {
            let st = read(&self.link.state);
            if st.pm_state.in_error() {
                return Err(MhiError::Io("link in error state"));
            }
            let _guard = lock(&self.cmd.lock);
            let ring = &self.cmd.ring;
            if ring.is_full() {
                return Err(MhiError::Exhausted);
            }
            let idx = ring.wp();
            ring.write_element(&*self.dma, idx, &Tre::command(kind, target));
            ring.advance_write();
            tracing::debug!(?kind, target, slot = idx, "queued command");

            if st.pm_state.db_access_valid() {
                self.cmd.ring_db(self);
                true
            } else {
                false
            }
        };
        if rang {
            return Ok(());
        }

        self.trigger_resume();
        let ok = self.link.wait_for(self.config.resume_timeout(), |s| {
            s.pm_state.db_access_valid() || s.pm_state.in_error()
        });
        let st = read(&self.link.state);
        if !ok || !st.pm_state.db_access_valid() {
            tracing::error!(?kind, target, "link did not resume for command doorbell");
            return Err(MhiError::Io("link did not resume for command doorbell"));
        }
        self.ring_cmd_db_locked();
        Ok(())
    }

    /// Rings the command doorbell if commands were queued since it was last
    /// rung. Caller holds the link lock with doorbell access valid.
    pub(crate) fn ring_cmd_db_if_pending(&self) {
        self.ring_cmd_db_locked();
    }

    fn ring_cmd_db_locked(&self) {
        let _guard = lock(&self.cmd.lock);
        let ring = &self.cmd.ring;
        if ring.to_device(ring.wp()) != self.cmd.last_db.load(Ordering::Acquire) {
            self.cmd.ring_db(self);
        }
    }

    /// Handles a command-completion event: wakes the waiter and retires the
    /// oldest command.
    pub(crate) fn process_cmd_completion(&self, cmd_ptr: u64, code: CompletionCode) {
        let _guard = lock(&self.cmd.lock);
        let ring = &self.cmd.ring;
        let Some(idx) = ring.to_local(cmd_ptr) else {
            tracing::error!(cmd_ptr, "command completion outside command ring");
            return;
        };
        if ring.is_empty() {
            tracing::warn!(cmd_ptr, "command completion with no command outstanding");
            return;
        }
        debug_assert_eq!(idx, ring.rp(), "command completions must arrive in order");

        let cmd = ring.read_element(&*self.dma, idx);
        match cmd.command_kind() {
            Some(CommandKind::TimesyncConfig) => {
                if let Some(ts) = &self.timesync {
                    ts.completion.complete(code.as_u8());
                }
            }
            Some(kind) => match self.channels.get(&cmd.chid()) {
                Some(ch) => {
                    tracing::debug!(chan = ch.id(), ?kind, ?code, "command completed");
                    ch.completion.complete(code.as_u8());
                }
                None => tracing::warn!(chan = cmd.chid(), "completion for unknown channel"),
            },
            None => tracing::warn!(slot = idx, "completion for unrecognised command"),
        }
        ring.advance_read();
    }
}
