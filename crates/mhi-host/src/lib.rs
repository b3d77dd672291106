//! Host-side transport engine for the modem host interface (MHI).
//!
//! The host and the device exchange work through rings in shared memory:
//! per-channel transfer rings carry buffer descriptors to the device, a
//! command ring carries channel commands, and event rings carry completions
//! and state notifications back. This crate owns the host half of that
//! contract:
//!
//! - [`Controller`]: configuration, rings and the public operations
//!   (`queue`, `prepare_channel`, `suspend`, `power_up`, ...)
//! - the event dispatcher, driven from the integration's interrupt and
//!   deferred contexts ([`Controller::msi_handler`],
//!   [`Controller::run_event_task`])
//! - the link power state machine ([`PmState`]) and wake/doorbell gating
//!   ([`WakeVote`])
//!
//! Bus access is abstracted by [`RegisterAccess`] and [`DmaBus`]; the
//! integration also supplies a [`ControllerClient`] for status reporting and
//! resume requests.

#![forbid(unsafe_code)]

mod buffer;
mod channel;
mod client;
mod command;
mod config;
mod context;
mod controller;
mod dma;
mod error;
mod event;
mod pm;
mod regs;
mod ring;
mod state;
mod sync;
mod timesync;
mod tre;
mod wake;

pub use channel::ChannelState;
pub use client::{
    ControllerClient, DmaHandle, LinkInfo, StatusEvent, TransferBuffer, TransferCallback,
    TransferResult, TransferStatus,
};
pub use config::{
    ChannelConfig, ConfigError, ControllerConfig, EventPriority, EventRingConfig, EventRingKind,
    LogicalDevice, TimesyncConfig, TransferKind,
};
pub use context::{CONTEXT_SIZE, CTX_RP, CTX_WP};
pub use controller::{Controller, IrqReturn, RingId, RingSnapshot, StateTransition};
pub use dma::{DmaBus, DmaDirection, MapStrategy};
pub use error::{MhiError, Result};
pub use pm::PmCounters;
pub use regs::{bw_scale_result, RegisterAccess, RegisterLayout, BW_SCALE_NACK, PCI_INVALID_READ};
pub use ring::Ring;
pub use state::{DeviceState, ExecEnv, PmState, PmStates};
pub use timesync::{TimeSample, TimesyncSample};
pub use tre::{
    pkt, CommandKind, CompletionCode, Event, TransferFlags, Tre, MAX_CHANNEL_ID, MAX_TRE_LEN,
    TRE_LEN,
};
pub use wake::WakeVote;

#[cfg(test)]
mod proptests;
