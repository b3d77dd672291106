mod util;

use std::sync::Arc;

use mhi_host::{
    ConfigError, Controller, ControllerConfig, DmaDirection, EventPriority, ExecEnv, MapStrategy,
    MhiError, PmState, TransferKind,
};
use util::{channel, loopback_config, Harness, MockRegs, RecordingClient, TestBus};

const FIXTURE: &str = include_str!("fixtures/sdx_modem.json");

fn fixture() -> ControllerConfig {
    serde_json::from_str(FIXTURE).expect("fixture parses")
}

#[test]
fn fixture_parses_with_defaults_filled_in() {
    let cfg = fixture();
    assert_eq!(cfg.name, "sdx-modem");
    assert_eq!(cfg.event_rings.len(), 5);
    assert_eq!(cfg.event_rings[2].priority, EventPriority::High);
    assert_eq!(cfg.event_rings[2].intmod, 5);
    // Omitted fields fall back to their defaults.
    assert_eq!(cfg.event_rings[2].quota, 128);
    assert_eq!(cfg.rsc_min_credits, ControllerConfig::default().rsc_min_credits);
    assert_eq!(cfg.registers, ControllerConfig::default().registers);

    let ip = cfg.channels.iter().find(|c| c.id == 100).unwrap();
    assert_eq!(ip.map, MapStrategy::Bounce);
    let rsc = cfg.channels.iter().find(|c| c.id == 101).unwrap();
    assert_eq!(rsc.transfer, TransferKind::Rsc);
    assert!(rsc.burst_mode);
    assert_eq!(rsc.ee_mask, vec![ExecEnv::Amss]);
}

#[test]
fn fixture_pairs_channels_into_devices() {
    let devices = fixture().validate().unwrap();
    let summary: Vec<_> = devices
        .iter()
        .map(|d| (d.name.as_str(), d.ul_chan, d.dl_chan))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("LOOPBACK", Some(0), Some(1)),
            ("DIAG", Some(4), Some(5)),
            ("MBIM", Some(12), Some(13)),
            ("IP_HW0", Some(100), Some(101)),
        ]
    );
    let mbim = &devices[2];
    assert_eq!(
        mbim.ee_mask,
        ExecEnv::Sbl.mask_bit() | ExecEnv::Amss.mask_bit()
    );
    assert_eq!(mbim.channels().collect::<Vec<_>>(), vec![12, 13]);
}

#[test]
fn fixture_drives_a_controller() {
    let h = Harness::boot(fixture());
    assert_eq!(h.ctrl.devices().len(), 4);

    h.ctrl.prepare_for_transfer("DIAG").unwrap();
    // Receive half is filled with transport buffers.
    assert_eq!(h.ctrl.get_no_free_descriptors(5).unwrap(), 0);
    assert_eq!(h.bus.live_mappings(), 15);

    h.ctrl.prepare_for_transfer("IP_HW0").unwrap();
    assert_eq!(h.ctrl.get_no_free_descriptors(101).unwrap(), 127);

    h.ctrl.power_down().unwrap();
    assert_eq!(h.ctrl.pm_state(), PmState::Disabled);
    assert_eq!(h.bus.live_mappings(), 0);
}

#[test]
fn unpaired_channels_fail_controller_construction() {
    let mut cfg = loopback_config();
    cfg.channels = vec![
        channel(0, "A", DmaDirection::FromDevice),
        channel(1, "A", DmaDirection::FromDevice),
    ];
    let err = Controller::new(
        cfg,
        Arc::new(MockRegs::new()),
        Arc::new(TestBus::new()),
        Arc::new(RecordingClient::new()),
    )
    .err()
    .expect("construction must fail");
    assert!(matches!(
        err,
        MhiError::Config(ConfigError::Unpaired { chan: 1, .. })
    ));
}

#[test]
fn timesync_must_reference_a_timesync_ring() {
    let mut cfg = loopback_config();
    cfg.timesync = Some(mhi_host::TimesyncConfig { event_ring: 1 });
    assert!(matches!(
        cfg.validate(),
        Err(ConfigError::InvalidEventRing { index: 1, .. })
    ));
}

#[test]
fn duplicate_channel_ids_are_rejected() {
    let mut cfg = loopback_config();
    cfg.channels.push(channel(1, "OTHER", DmaDirection::ToDevice));
    assert_eq!(cfg.validate(), Err(ConfigError::DuplicateChannel(1)));
}

#[test]
fn credit_channel_must_receive() {
    let mut cfg = loopback_config();
    cfg.channels[0].transfer = TransferKind::Rsc;
    assert!(matches!(
        cfg.validate(),
        Err(ConfigError::InvalidChannel { chan: 0, .. })
    ));
}

#[test]
fn channel_ids_must_fit_the_channel_field() {
    let mut cfg = loopback_config();
    cfg.channels = vec![
        channel(254, "WIDE", DmaDirection::ToDevice),
        channel(255, "WIDE", DmaDirection::FromDevice),
    ];
    assert_eq!(cfg.validate().unwrap().len(), 1);

    cfg.channels = vec![
        channel(300, "WIDE", DmaDirection::ToDevice),
        channel(301, "WIDE", DmaDirection::FromDevice),
    ];
    assert!(matches!(
        cfg.validate(),
        Err(ConfigError::InvalidChannel { chan: 300, .. })
    ));
    let err = Controller::new(
        cfg,
        Arc::new(MockRegs::new()),
        Arc::new(TestBus::new()),
        Arc::new(RecordingClient::new()),
    )
    .err()
    .expect("construction must fail");
    assert!(matches!(
        err,
        MhiError::Config(ConfigError::InvalidChannel { chan: 300, .. })
    ));
}

#[test]
fn timesync_ring_index_must_fit_a_command() {
    let mut cfg = loopback_config();
    cfg.timesync = Some(mhi_host::TimesyncConfig { event_ring: 256 });
    assert!(matches!(
        cfg.validate(),
        Err(ConfigError::InvalidEventRing { index: 256, reason }) if reason.contains("fit")
    ));
}
