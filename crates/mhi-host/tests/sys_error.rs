mod util;

use std::sync::atomic::Ordering;

use mhi_host::{
    ExecEnv, MhiError, PmState, StatusEvent, TransferBuffer, TransferFlags, TransferStatus, Tre,
};
use util::{loopback_config, Harness, STATE_SYS_ERR};

/// Status register system-error flag.
const STATUS_SYSERR: u32 = 1 << 2;

#[test]
fn sys_error_event_flushes_every_channel() {
    let h = Harness::boot(loopback_config());
    let ul = h.callback(0);
    let dl = h.callback(1);
    h.ctrl.prepare_for_transfer("LOOPBACK").unwrap();
    for _ in 0..2 {
        h.ctrl
            .queue(0, TransferBuffer::Bytes(vec![1; 8]), 8, TransferFlags::EOT)
            .unwrap();
    }
    h.ctrl
        .queue(1, TransferBuffer::Bytes(vec![0; 8]), 8, TransferFlags::EOT)
        .unwrap();

    h.post(0, Tre::state_change_event(STATE_SYS_ERR));
    h.run(0);

    let ul_results = ul.take();
    let dl_results = dl.take();
    assert_eq!(ul_results.len(), 2);
    assert_eq!(dl_results.len(), 1);
    assert!(ul_results
        .iter()
        .chain(dl_results.iter())
        .all(|(_, r)| r.status == TransferStatus::NotConnected && r.bytes_transferred == 0));
    assert_eq!(h.ctrl.pending_packets(), 0);
    assert_eq!(h.bus.live_mappings(), 0);

    assert_eq!(h.ctrl.pm_state(), PmState::NoAccess);
    let statuses = h.client.statuses();
    let sys = statuses.iter().position(|s| *s == StatusEvent::SysError);
    let fatal = statuses.iter().position(|s| *s == StatusEvent::FatalError);
    assert!(sys.is_some() && sys < fatal);
    assert!(ul.statuses().contains(&(0, StatusEvent::FatalError)));

    assert!(matches!(
        h.ctrl
            .queue(0, TransferBuffer::Bytes(vec![1; 8]), 8, TransferFlags::EOT),
        Err(MhiError::Io(_))
    ));
    assert!(matches!(h.ctrl.prepare_channel(0), Err(MhiError::Io(_))));
}

#[test]
fn bus_down_sentinel_escalates() {
    let h = Harness::boot(loopback_config());
    h.regs.dead.store(true, Ordering::SeqCst);

    // Interrupt with nothing on the ring: the status read hits the sentinel.
    let err = h.ctrl.run_event_task(0).unwrap_err();
    assert!(matches!(err, MhiError::Io(_)));
    assert_eq!(h.ctrl.pm_state(), PmState::NoAccess);
    assert!(h.client.statuses().contains(&StatusEvent::FatalError));
}

#[test]
fn status_register_sys_error_escalates_from_state_interrupt() {
    let h = Harness::boot(loopback_config());
    h.regs.set(h.layout.status, STATUS_SYSERR);

    assert_eq!(h.ctrl.intvec_handler(), mhi_host::IrqReturn::WakeThread);
    h.ctrl.intvec_threaded_handler();
    assert_eq!(h.ctrl.pm_state(), PmState::NoAccess);
}

#[test]
fn sys_error_ignored_when_crash_dump_supported() {
    let mut cfg = loopback_config();
    cfg.rddm_supported = true;
    cfg.channels[1].early_notify = true;
    let h = Harness::boot(cfg);
    let dl = h.callback(1);

    h.post(0, Tre::state_change_event(STATE_SYS_ERR));
    h.run(0);
    assert_eq!(h.ctrl.pm_state(), PmState::M0);

    // Crash-dump entry is reported straight away.
    h.post(0, Tre::ee_event(3));
    h.run(0);
    assert_eq!(h.ctrl.exec_env(), ExecEnv::Rddm);
    assert!(h.client.statuses().contains(&StatusEvent::EeRddm));
    assert_eq!(dl.statuses(), vec![(1, StatusEvent::FatalError)]);
    assert_eq!(h.ctrl.pending_transitions(), 0);
}

#[test]
fn power_cycle_recovers_from_fatal_error() {
    let h = Harness::boot(loopback_config());
    h.post(0, Tre::state_change_event(STATE_SYS_ERR));
    h.run(0);
    assert_eq!(h.ctrl.pm_state(), PmState::NoAccess);

    h.ctrl.power_down().unwrap();
    assert_eq!(h.ctrl.pm_state(), PmState::Disabled);

    h.ctrl.power_up().unwrap();
    h.post(0, Tre::state_change_event(util::STATE_M0));
    h.run(0);
    assert_eq!(h.ctrl.pm_state(), PmState::M0);
    h.ctrl.prepare_channel(0).unwrap();
}
