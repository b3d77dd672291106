//! Device time synchronisation.
//!
//! A request writes a sequence number to the timesync doorbell and records
//! the host time. The device answers on the timesync event ring with the
//! same sequence and its own clock. Responses are matched against the oldest
//! outstanding request; a request whose sequence does not match was
//! superseded and is dropped.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::controller::Controller;
use crate::error::{MhiError, Result};
use crate::sync::{lock, read, Completion};
use crate::tre::{CommandKind, CompletionCode};

/// Host and device clocks sampled for one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimesyncSample {
    pub sequence: u32,
    pub local_time: u64,
    pub remote_time: u64,
}

/// Result of a synchronous register read of the device clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeSample {
    pub local_time: u64,
    pub remote_time: u64,
}

pub(crate) type TimesyncCallback = Box<dyn FnOnce(TimesyncSample) + Send>;

struct TimesyncRequest {
    sequence: u32,
    local_time: u64,
    callback: TimesyncCallback,
}

pub(crate) struct Timesync {
    pub(crate) er_index: usize,
    requests: Mutex<VecDeque<TimesyncRequest>>,
    pub(crate) completion: Completion,
}

impl Timesync {
    pub(crate) fn new(er_index: usize) -> Self {
        Self {
            er_index,
            requests: Mutex::new(VecDeque::new()),
            completion: Completion::default(),
        }
    }

    /// Drops every outstanding request without calling it back.
    pub(crate) fn clear(&self) {
        let dropped = {
            let mut requests = lock(&self.requests);
            let n = requests.len();
            requests.clear();
            n
        };
        if dropped > 0 {
            tracing::debug!(dropped, "discarded timesync requests");
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Pairs a device response with the oldest request. Requests older than
    /// the matching one are discarded.
    pub(crate) fn match_response(
        &self,
        sequence: u32,
        remote_time: u64,
    ) -> Option<(TimesyncCallback, TimesyncSample)> {
        let mut requests = lock(&self.requests);
        while let Some(req) = requests.pop_front() {
            if req.sequence != sequence {
                tracing::debug!(
                    expected = req.sequence,
                    got = sequence,
                    "timesync request superseded"
                );
                continue;
            }
            let sample = TimesyncSample {
                sequence,
                local_time: req.local_time,
                remote_time,
            };
            return Some((req.callback, sample));
        }
        tracing::debug!(sequence, "timesync response without request");
        None
    }

    fn push(&self, req: TimesyncRequest) {
        lock(&self.requests).push_back(req);
    }
}

impl Controller {
    fn timesync_state(&self) -> Result<&Timesync> {
        self.timesync
            .as_ref()
            .ok_or(MhiError::InvalidArgument("time synchronisation not configured"))
    }

    /// Tells the device which event ring carries timesync responses.
    pub fn configure_timesync(&self) -> Result<()> {
        let ts = self.timesync_state()?;
        ts.completion.reinit();
        self.command_get()?;
        let res = self
            .send_command(CommandKind::TimesyncConfig, ts.er_index as u32)
            .and_then(|()| self.wait_timesync_config(ts));
        self.pending_dec();
        res
    }

    fn wait_timesync_config(&self, ts: &Timesync) -> Result<()> {
        match ts.completion.wait_timeout(self.config.command_timeout()) {
            Some(code) if code == CompletionCode::Success.as_u8() => {
                tracing::info!(er = ts.er_index, "timesync configured");
                Ok(())
            }
            Some(code) => {
                tracing::error!(code, "timesync configuration failed");
                Err(MhiError::Io("timesync configuration failed"))
            }
            None => Err(MhiError::Io("timesync configuration timed out")),
        }
    }

    /// Requests a device timestamp. `callback` runs from the timesync event
    /// task once the device answers with the same sequence number.
    pub fn get_remote_time(
        &self,
        sequence: u32,
        callback: impl FnOnce(TimesyncSample) + Send + 'static,
    ) -> Result<()> {
        let ts = self.timesync_state()?;
        self.device_get_sync()?;

        let res = {
            // Fatal error handling clears the queue, so the request must not
            // be pushed once the link has left the doorbell states.
            let st = read(&self.link.state);
            if st.pm_state.in_error() || !st.pm_state.db_access_valid() {
                Err(MhiError::Io("link not available for time synchronisation"))
            } else {
                // Low-power modes would skew the host/device sample pair.
                self.client.lpm_disable();
                ts.push(TimesyncRequest {
                    sequence,
                    local_time: self.client.host_time(),
                    callback: Box::new(callback),
                });
                self.regs
                    .write_db(self.regs.layout.timesync_db, u64::from(sequence));
                self.client.lpm_enable();
                Ok(())
            }
        };

        self.device_put(true);
        res
    }

    /// Reads the device clock directly from its registers. A dead bus is
    /// treated as a device system error.
    pub fn get_remote_time_sync(&self) -> Result<TimeSample> {
        self.timesync_state()?;
        self.device_get_sync()?;

        let sample = {
            let st = read(&self.link.state);
            if st.pm_state.reg_access_valid() {
                self.client.lpm_disable();
                let local_time = self.client.host_time();
                let remote = self.read_remote_time();
                self.client.lpm_enable();
                Some((local_time, remote))
            } else {
                None
            }
        };
        self.device_put(true);

        let Some((local_time, remote)) = sample else {
            return Err(MhiError::Io("link not available for time synchronisation"));
        };
        match remote {
            Ok(remote_time) => Ok(TimeSample {
                local_time,
                remote_time,
            }),
            Err(err) => {
                tracing::error!(error = %err, "device time read failed");
                self.escalate_sys_err();
                Err(err)
            }
        }
    }

    fn read_remote_time(&self) -> Result<u64> {
        let lo = self.regs.read(self.regs.layout.timesync_time)?;
        let hi = self.regs.read(self.regs.layout.timesync_time + 4)?;
        Ok((u64::from(hi) << 32) | u64::from(lo))
    }

    /// Timesync requests still waiting for the device.
    pub fn pending_timesync_requests(&self) -> usize {
        self.timesync.as_ref().map_or(0, Timesync::outstanding)
    }
}
