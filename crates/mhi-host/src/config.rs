//! Controller configuration.
//!
//! The configuration is plain data (`serde::Deserialize`) so integrations can
//! keep it in JSON/TOML next to their board description. [`ControllerConfig::validate`]
//! checks cross references and derives the logical devices from channel pairs.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dma::{DmaDirection, MapStrategy};
use crate::regs::RegisterLayout;
use crate::state::{ExecEnv, DEFAULT_EE_TABLE};
use crate::tre::MAX_CHANNEL_ID;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("duplicate channel id {0}")]
    DuplicateChannel(u32),

    #[error("channel {chan}: {reason}")]
    InvalidChannel { chan: u32, reason: &'static str },

    #[error("event ring {index}: {reason}")]
    InvalidEventRing { index: usize, reason: &'static str },

    #[error("channel {chan} references missing event ring {er}")]
    MissingEventRing { chan: u32, er: usize },

    #[error("channel {chan} ({name:?}) cannot be paired: {reason}")]
    Unpaired {
        chan: u32,
        name: String,
        reason: &'static str,
    },

    #[error("exactly one control event ring is required, found {0}")]
    ControlRing(usize),

    #[error("invalid controller setting: {0}")]
    Invalid(&'static str),
}

/// How descriptors of a channel are produced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    /// Client byte buffers mapped (or bounced) by the transport.
    #[default]
    Buffer,
    /// Buffers the client already mapped for DMA.
    PreMapped,
    /// Credit-based receive coalescing: pre-mapped buffers addressed by
    /// cookie, completed out of order.
    Rsc,
    ScatterList,
    Nop,
}

/// Role of an event ring in the dispatcher.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventRingKind {
    /// State changes, command completions, execution-environment changes.
    Control,
    #[default]
    Data,
    Timesync,
    BandwidthScale,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    #[default]
    Normal,
    High,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EventRingConfig {
    pub elements: usize,
    pub kind: EventRingKind,
    pub priority: EventPriority,
    pub msi_vector: u32,
    /// Interrupt moderation timer, written to the context record.
    pub intmod: u32,
    /// Events handled per data-ring invocation.
    pub quota: usize,
    /// The client polls this ring itself; interrupts only notify it.
    pub client_managed: bool,
    /// Channel bound to a client-managed ring.
    pub channel: Option<u32>,
    /// The event ring context is owned by another agent; the host never
    /// rings its doorbell.
    pub offload: bool,
}

impl Default for EventRingConfig {
    fn default() -> Self {
        Self {
            elements: 64,
            kind: EventRingKind::Data,
            priority: EventPriority::Normal,
            msi_vector: 0,
            intmod: 0,
            quota: 128,
            client_managed: false,
            channel: None,
            offload: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub id: u32,
    pub name: String,
    pub elements: usize,
    pub direction: DmaDirection,
    pub transfer: TransferKind,
    pub map: MapStrategy,
    pub event_ring: usize,
    /// Transport allocates and recycles receive buffers.
    pub pre_alloc: bool,
    /// Doorbells are suppressed until the device asks for one.
    pub burst_mode: bool,
    /// Block event interrupts for this channel's descriptors.
    pub bei: bool,
    /// Execution environments in which the channel may be started.
    pub ee_mask: Vec<ExecEnv>,
    /// Notify the client before crash-dump collection tears the link down.
    pub early_notify: bool,
    /// The channel context is owned by another agent.
    pub offload: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            elements: 64,
            direction: DmaDirection::ToDevice,
            transfer: TransferKind::Buffer,
            map: MapStrategy::Direct,
            event_ring: 1,
            pre_alloc: false,
            burst_mode: false,
            bei: false,
            ee_mask: vec![ExecEnv::Amss],
            early_notify: false,
            offload: false,
        }
    }
}

impl ChannelConfig {
    pub fn ee_mask_bits(&self) -> u32 {
        self.ee_mask.iter().fold(0, |m, ee| m | ee.mask_bit())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct TimesyncConfig {
    /// Event ring carrying timesync responses.
    pub event_ring: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub name: String,
    /// Channel command round trip bound, in milliseconds.
    pub command_timeout_ms: u64,
    /// Bound on waiting for the link to become usable, in milliseconds.
    pub resume_timeout_ms: u64,
    /// Receive buffer size for pre-allocated channels.
    pub buffer_len: usize,
    /// Credit channels in burst mode keep their doorbell quiet until this
    /// many descriptors are queued.
    pub rsc_min_credits: usize,
    /// Delay before a released wake vote deasserts the wake line.
    pub wake_grace_ms: u64,
    /// The device supports crash-dump collection.
    pub rddm_supported: bool,
    /// Route register writes through the deferred write queue.
    pub offload_reg_writes: bool,
    pub command_ring_elements: usize,
    /// Device execution-environment values, indexed by the raw value.
    pub ee_table: Vec<ExecEnv>,
    pub registers: RegisterLayout,
    pub event_rings: Vec<EventRingConfig>,
    pub channels: Vec<ChannelConfig>,
    pub timesync: Option<TimesyncConfig>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "mhi0".to_string(),
            command_timeout_ms: 2_000,
            resume_timeout_ms: 1_000,
            buffer_len: 0x4000,
            rsc_min_credits: 8,
            wake_grace_ms: 10,
            rddm_supported: false,
            offload_reg_writes: false,
            command_ring_elements: 64,
            ee_table: DEFAULT_EE_TABLE.to_vec(),
            registers: RegisterLayout::default(),
            event_rings: vec![
                EventRingConfig {
                    kind: EventRingKind::Control,
                    quota: usize::MAX,
                    ..EventRingConfig::default()
                },
                EventRingConfig::default(),
            ],
            channels: Vec::new(),
            timesync: None,
        }
    }
}

/// Pair of channels sharing a name, exposed to clients as one device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalDevice {
    pub name: String,
    pub ul_chan: Option<u32>,
    pub dl_chan: Option<u32>,
    /// Union of the channels' execution-environment masks.
    pub ee_mask: u32,
}

impl LogicalDevice {
    pub fn channels(&self) -> impl Iterator<Item = u32> + '_ {
        let ul = self.ul_chan;
        ul.into_iter().chain(self.dl_chan.filter(move |&dl| Some(dl) != ul))
    }
}

impl ControllerConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn resume_timeout(&self) -> Duration {
        Duration::from_millis(self.resume_timeout_ms)
    }

    pub fn wake_grace(&self) -> Duration {
        Duration::from_millis(self.wake_grace_ms)
    }

    /// Validates cross references and returns the logical devices in
    /// channel-id order.
    pub fn validate(&self) -> Result<Vec<LogicalDevice>, ConfigError> {
        if self.command_ring_elements < 2 {
            return Err(ConfigError::Invalid("command ring needs at least two elements"));
        }
        if self.ee_table.is_empty() {
            return Err(ConfigError::Invalid("empty execution environment table"));
        }

        let controls = self
            .event_rings
            .iter()
            .filter(|er| er.kind == EventRingKind::Control)
            .count();
        if controls != 1 {
            return Err(ConfigError::ControlRing(controls));
        }

        for (index, er) in self.event_rings.iter().enumerate() {
            if er.elements < 2 {
                return Err(ConfigError::InvalidEventRing {
                    index,
                    reason: "needs at least two elements",
                });
            }
            if er.quota == 0 {
                return Err(ConfigError::InvalidEventRing {
                    index,
                    reason: "zero quota",
                });
            }
            if er.client_managed && er.channel.is_none() {
                return Err(ConfigError::InvalidEventRing {
                    index,
                    reason: "client-managed ring without a channel",
                });
            }
        }

        if let Some(ts) = &self.timesync {
            if ts.event_ring > MAX_CHANNEL_ID as usize {
                return Err(ConfigError::InvalidEventRing {
                    index: ts.event_ring,
                    reason: "timesync ring index does not fit a command",
                });
            }
            match self.event_rings.get(ts.event_ring) {
                Some(er) if er.kind == EventRingKind::Timesync => {}
                _ => {
                    return Err(ConfigError::InvalidEventRing {
                        index: ts.event_ring,
                        reason: "timesync must reference a timesync event ring",
                    })
                }
            }
        }

        let mut ids = BTreeSet::new();
        for ch in &self.channels {
            if !ids.insert(ch.id) {
                return Err(ConfigError::DuplicateChannel(ch.id));
            }
            self.validate_channel(ch)?;
        }

        for (index, er) in self.event_rings.iter().enumerate() {
            if let Some(chan) = er.channel {
                if !ids.contains(&chan) {
                    return Err(ConfigError::InvalidEventRing {
                        index,
                        reason: "bound to an unknown channel",
                    });
                }
            }
        }

        self.pair_channels()
    }

    fn validate_channel(&self, ch: &ChannelConfig) -> Result<(), ConfigError> {
        let invalid = |reason| ConfigError::InvalidChannel { chan: ch.id, reason };

        if ch.id > MAX_CHANNEL_ID {
            return Err(invalid("id does not fit the 8-bit channel field"));
        }
        if ch.name.is_empty() {
            return Err(invalid("empty name"));
        }
        if ch.elements < 2 {
            return Err(invalid("needs at least two elements"));
        }
        let er = self
            .event_rings
            .get(ch.event_ring)
            .ok_or(ConfigError::MissingEventRing {
                chan: ch.id,
                er: ch.event_ring,
            })?;
        if matches!(er.kind, EventRingKind::Timesync | EventRingKind::BandwidthScale) {
            return Err(invalid("bound to a dedicated event ring"));
        }
        if ch.pre_alloc {
            if ch.direction != DmaDirection::FromDevice {
                return Err(invalid("pre-allocation requires a receive channel"));
            }
            if ch.transfer != TransferKind::Buffer {
                return Err(invalid("pre-allocation requires buffer transfers"));
            }
            if self.buffer_len == 0 {
                return Err(ConfigError::Invalid("zero pre-allocation buffer length"));
            }
        }
        if ch.transfer == TransferKind::Rsc && ch.direction != DmaDirection::FromDevice {
            return Err(invalid("credit channels must receive"));
        }
        if ch.direction == DmaDirection::None && !ch.offload {
            return Err(invalid("direction none is reserved for offloaded channels"));
        }
        Ok(())
    }

    /// Groups same-named channels into logical devices.
    ///
    /// Channels are walked in id order. A name may cover at most two
    /// adjacent channels with opposite directions; anything else is reported
    /// instead of guessed.
    fn pair_channels(&self) -> Result<Vec<LogicalDevice>, ConfigError> {
        let mut sorted: Vec<&ChannelConfig> = self.channels.iter().collect();
        sorted.sort_by_key(|c| c.id);

        let mut devices: Vec<LogicalDevice> = Vec::new();
        let mut i = 0;
        while i < sorted.len() {
            let first = sorted[i];
            let mut dev = LogicalDevice {
                name: first.name.clone(),
                ul_chan: None,
                dl_chan: None,
                ee_mask: first.ee_mask_bits(),
            };
            assign(&mut dev, first);

            if let Some(second) = sorted.get(i + 1).filter(|c| c.name == first.name) {
                let same_dir = matches!(
                    (first.direction, second.direction),
                    (DmaDirection::ToDevice, DmaDirection::ToDevice)
                        | (DmaDirection::FromDevice, DmaDirection::FromDevice)
                );
                if same_dir {
                    return Err(ConfigError::Unpaired {
                        chan: second.id,
                        name: second.name.clone(),
                        reason: "both channels have the same direction",
                    });
                }
                if dev.ul_chan.is_some() && dev.dl_chan.is_some() {
                    return Err(ConfigError::Unpaired {
                        chan: second.id,
                        name: second.name.clone(),
                        reason: "first channel already covers both directions",
                    });
                }
                assign(&mut dev, second);
                dev.ee_mask |= second.ee_mask_bits();
                i += 1;
            }

            if devices.iter().any(|d| d.name == dev.name) {
                return Err(ConfigError::Unpaired {
                    chan: first.id,
                    name: first.name.clone(),
                    reason: "name already used by a non-adjacent channel",
                });
            }
            devices.push(dev);
            i += 1;
        }
        Ok(devices)
    }
}

fn assign(dev: &mut LogicalDevice, ch: &ChannelConfig) {
    match ch.direction {
        DmaDirection::ToDevice => dev.ul_chan = Some(ch.id),
        // Bidirectional and offloaded channels are reached through the
        // downlink slot and also answer for uplink.
        DmaDirection::FromDevice => dev.dl_chan = Some(ch.id),
        DmaDirection::Bidirectional | DmaDirection::None => {
            dev.ul_chan = Some(ch.id);
            dev.dl_chan = Some(ch.id);
        }
    }
}
