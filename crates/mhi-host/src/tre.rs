//! Transfer ring element (TRE) and event record encodings.
//!
//! Every ring element is 16 bytes: a 64-bit pointer word followed by two
//! 32-bit control words. Transfer descriptors, command descriptors and event
//! records share that shape and differ only in how the words are packed.

use crate::dma::DmaBus;

/// Size of one ring element in bytes.
pub const TRE_LEN: usize = 16;

/// Largest length a single transfer descriptor can describe.
pub const MAX_TRE_LEN: usize = 0xffff;

/// Largest channel id (or event ring index) the 8-bit `dword1[31:24]` field
/// of commands and events can carry.
pub const MAX_CHANNEL_ID: u32 = 0xff;

pub mod pkt {
    //! Packet type field values (`dword1[23:16]`).
    pub const TRANSFER: u8 = 0x02;
    pub const COALESCING: u8 = 0x08;
    pub const RESET_CHAN_CMD: u8 = 0x10;
    pub const STOP_CHAN_CMD: u8 = 0x11;
    pub const START_CHAN_CMD: u8 = 0x12;
    pub const TSYNC_CFG_CMD: u8 = 0x14;
    pub const STATE_CHANGE_EVENT: u8 = 0x20;
    pub const CMD_COMPLETION_EVENT: u8 = 0x21;
    pub const TX_EVENT: u8 = 0x22;
    pub const RSC_TX_EVENT: u8 = 0x28;
    pub const STALE_EVENT: u8 = 0x30;
    pub const EE_EVENT: u8 = 0x40;
    pub const TSYNC_EVENT: u8 = 0x48;
    pub const BW_REQ_EVENT: u8 = 0x49;
}

/// Event completion codes (`dword0[31:24]` of transfer and command events).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum CompletionCode {
    Invalid = 0x00,
    Success = 0x01,
    Eot = 0x02,
    Overflow = 0x03,
    Eob = 0x04,
    Oob = 0x05,
    DbMode = 0x06,
    UndefinedErr = 0x10,
    BadTre = 0x11,
}

impl CompletionCode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x01 => Self::Success,
            0x02 => Self::Eot,
            0x03 => Self::Overflow,
            0x04 => Self::Eob,
            0x05 => Self::Oob,
            0x06 => Self::DbMode,
            0x10 => Self::UndefinedErr,
            0x11 => Self::BadTre,
            _ => Self::Invalid,
        }
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

bitflags::bitflags! {
    /// Per-descriptor interrupt and chaining flags supplied by the client.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TransferFlags: u32 {
        /// Interrupt on end of block.
        const EOB = 1 << 8;
        /// Interrupt on end of transfer.
        const EOT = 1 << 9;
        /// The next descriptor continues this transfer.
        const CHAIN = 1 << 0;
    }
}

/// Kind of command placed on the command ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    Reset,
    Stop,
    Start,
    TimesyncConfig,
}

impl CommandKind {
    pub const fn packet_type(self) -> u8 {
        match self {
            Self::Reset => pkt::RESET_CHAN_CMD,
            Self::Stop => pkt::STOP_CHAN_CMD,
            Self::Start => pkt::START_CHAN_CMD,
            Self::TimesyncConfig => pkt::TSYNC_CFG_CMD,
        }
    }
}

/// Raw 16-byte ring element.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tre {
    pub ptr: u64,
    pub dword0: u32,
    pub dword1: u32,
}

impl Tre {
    pub fn read_from(bus: &dyn DmaBus, paddr: u64) -> Self {
        Self {
            ptr: bus.read_u64(paddr),
            dword0: bus.read_u32(paddr + 8),
            dword1: bus.read_u32(paddr + 12),
        }
    }

    /// Writes the control words before the pointer word so a device that
    /// samples the element mid-update never sees a stale type with a new
    /// pointer.
    pub fn write_to(&self, bus: &dyn DmaBus, paddr: u64) {
        bus.write_u32(paddr + 12, self.dword1);
        bus.write_u32(paddr + 8, self.dword0);
        bus.write_u64(paddr, self.ptr);
    }

    pub fn transfer(addr: u64, len: usize, bei: bool, flags: TransferFlags) -> Self {
        let mut dword1 = u32::from(pkt::TRANSFER) << 16;
        if bei {
            dword1 |= 1 << 10;
        }
        dword1 |= flags.bits();
        Self {
            ptr: addr,
            dword0: (len & MAX_TRE_LEN) as u32,
            dword1,
        }
    }

    pub fn rsc(addr: u64, len: usize, cookie: u32) -> Self {
        Self {
            ptr: (((len & MAX_TRE_LEN) as u64) << 48) | (addr & 0x0000_ffff_ffff_ffff),
            dword0: cookie,
            dword1: u32::from(pkt::COALESCING) << 16,
        }
    }

    /// `target` is the channel id, or the event ring index for a timesync
    /// configuration command.
    pub fn command(kind: CommandKind, target: u32) -> Self {
        debug_assert!(target <= MAX_CHANNEL_ID, "command target {target} does not fit");
        Self {
            ptr: 0,
            dword0: 0,
            dword1: (target << 24) | (u32::from(kind.packet_type()) << 16),
        }
    }

    #[inline]
    pub fn packet_type(&self) -> u8 {
        ((self.dword1 >> 16) & 0xff) as u8
    }

    #[inline]
    pub fn set_packet_type(&mut self, ty: u8) {
        self.dword1 = (self.dword1 & !0x00ff_0000) | (u32::from(ty) << 16);
    }

    #[inline]
    pub fn chid(&self) -> u32 {
        self.dword1 >> 24
    }

    #[inline]
    pub fn code_raw(&self) -> u8 {
        (self.dword0 >> 24) as u8
    }

    #[inline]
    pub fn code(&self) -> CompletionCode {
        CompletionCode::from_raw(self.code_raw())
    }

    #[inline]
    pub fn event_len(&self) -> usize {
        (self.dword0 & 0xffff) as usize
    }

    #[inline]
    pub fn cookie(&self) -> u32 {
        self.ptr as u32
    }

    pub fn command_kind(&self) -> Option<CommandKind> {
        match self.packet_type() {
            pkt::RESET_CHAN_CMD => Some(CommandKind::Reset),
            pkt::STOP_CHAN_CMD => Some(CommandKind::Stop),
            pkt::START_CHAN_CMD => Some(CommandKind::Start),
            pkt::TSYNC_CFG_CMD => Some(CommandKind::TimesyncConfig),
            _ => None,
        }
    }

    pub fn decode_event(&self) -> Event {
        match self.packet_type() {
            pkt::STATE_CHANGE_EVENT => Event::StateChange {
                state: self.code_raw(),
            },
            pkt::CMD_COMPLETION_EVENT => Event::CommandCompletion {
                cmd_ptr: self.ptr,
                code: self.code(),
            },
            pkt::TX_EVENT => Event::Transfer {
                chan: self.chid(),
                tre_ptr: self.ptr,
                len: self.event_len(),
                code: self.code(),
            },
            pkt::RSC_TX_EVENT => Event::RscTransfer {
                chan: self.chid(),
                cookie: self.cookie(),
                len: self.event_len(),
                code: self.code(),
            },
            pkt::STALE_EVENT => Event::Stale,
            pkt::EE_EVENT => Event::ExecEnv { ee: self.code_raw() },
            pkt::TSYNC_EVENT => Event::Timesync {
                seq: self.dword0,
                remote_time: self.ptr,
            },
            pkt::BW_REQ_EVENT => Event::BandwidthRequest {
                speed: ((self.ptr >> 24) & 0xff) as u8,
                width: ((self.ptr >> 40) & 0xff) as u8,
                seq: (self.dword0 & 0xff) as u8,
            },
            other => Event::Unknown { ty: other },
        }
    }
}

/// Decoded event record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    StateChange { state: u8 },
    CommandCompletion { cmd_ptr: u64, code: CompletionCode },
    Transfer { chan: u32, tre_ptr: u64, len: usize, code: CompletionCode },
    RscTransfer { chan: u32, cookie: u32, len: usize, code: CompletionCode },
    Stale,
    ExecEnv { ee: u8 },
    Timesync { seq: u32, remote_time: u64 },
    BandwidthRequest { speed: u8, width: u8, seq: u8 },
    Unknown { ty: u8 },
}

/// Event builders, used by device models and tests.
impl Tre {
    pub fn state_change_event(state: u8) -> Self {
        Self {
            ptr: 0,
            dword0: u32::from(state) << 24,
            dword1: u32::from(pkt::STATE_CHANGE_EVENT) << 16,
        }
    }

    pub fn command_completion_event(cmd_ptr: u64, code: CompletionCode) -> Self {
        Self {
            ptr: cmd_ptr,
            dword0: u32::from(code.as_u8()) << 24,
            dword1: u32::from(pkt::CMD_COMPLETION_EVENT) << 16,
        }
    }

    pub fn transfer_event(chan: u32, tre_ptr: u64, len: usize, code: CompletionCode) -> Self {
        Self {
            ptr: tre_ptr,
            dword0: (u32::from(code.as_u8()) << 24) | (len & 0xffff) as u32,
            dword1: (chan << 24) | (u32::from(pkt::TX_EVENT) << 16),
        }
    }

    pub fn rsc_transfer_event(chan: u32, cookie: u32, len: usize, code: CompletionCode) -> Self {
        Self {
            ptr: u64::from(cookie),
            dword0: (u32::from(code.as_u8()) << 24) | (len & 0xffff) as u32,
            dword1: (chan << 24) | (u32::from(pkt::RSC_TX_EVENT) << 16),
        }
    }

    pub fn ee_event(ee: u8) -> Self {
        Self {
            ptr: 0,
            dword0: u32::from(ee) << 24,
            dword1: u32::from(pkt::EE_EVENT) << 16,
        }
    }

    pub fn timesync_event(seq: u32, remote_time: u64) -> Self {
        Self {
            ptr: remote_time,
            dword0: seq,
            dword1: u32::from(pkt::TSYNC_EVENT) << 16,
        }
    }

    pub fn bandwidth_request_event(speed: u8, width: u8, seq: u8) -> Self {
        Self {
            ptr: (u64::from(speed) << 24) | (u64::from(width) << 40),
            dword0: u32::from(seq),
            dword1: u32::from(pkt::BW_REQ_EVENT) << 16,
        }
    }
}
