//! Device states, host power-management states and execution environments.

use std::fmt;

/// Power/protocol state as reported by the device status register or a
/// state-change event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Reset,
    Ready,
    M0,
    M1,
    M2,
    M3,
    M3Fast,
    Bhi,
    SysErr,
}

impl DeviceState {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x0 => Self::Reset,
            0x1 => Self::Ready,
            0x2 => Self::M0,
            0x3 => Self::M1,
            0x4 => Self::M2,
            0x5 => Self::M3,
            0x6 => Self::M3Fast,
            0x7 => Self::Bhi,
            0xff => Self::SysErr,
            _ => return None,
        })
    }

    pub const fn as_raw(self) -> u8 {
        match self {
            Self::Reset => 0x0,
            Self::Ready => 0x1,
            Self::M0 => 0x2,
            Self::M1 => 0x3,
            Self::M2 => 0x4,
            Self::M3 => 0x5,
            Self::M3Fast => 0x6,
            Self::Bhi => 0x7,
            Self::SysErr => 0xff,
        }
    }
}

/// Firmware execution environment running on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecEnv {
    /// Primary boot loader.
    Pbl,
    /// Secondary boot loader.
    Sbl,
    /// Mission mode.
    Amss,
    /// RAM dump (crash collection).
    Rddm,
    /// WLAN firmware.
    Wfw,
    /// Pass-through.
    Pthru,
    /// Emergency download.
    Edl,
    DisableTransition,
    NotSupported,
}

impl ExecEnv {
    pub const fn is_mission_mode(self) -> bool {
        matches!(self, Self::Amss | Self::Wfw)
    }

    /// Bit used in per-channel execution-environment masks.
    pub const fn mask_bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Default device-value to host-environment translation.
pub const DEFAULT_EE_TABLE: [ExecEnv; 7] = [
    ExecEnv::Pbl,
    ExecEnv::Sbl,
    ExecEnv::Amss,
    ExecEnv::Rddm,
    ExecEnv::Wfw,
    ExecEnv::Pthru,
    ExecEnv::Edl,
];

/// Host-side link power-management state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PmState {
    Disabled,
    PowerOnReset,
    /// Active; rings and doorbells usable.
    M0,
    /// Entering sleep 1 (device-initiated).
    M1Enter,
    M1,
    /// Entering sleep 2.
    M2Enter,
    M2,
    /// Host-initiated suspend in progress.
    M3Enter,
    /// Suspended.
    M3,
    /// Leaving suspend.
    M3FastExit,
    /// System error detected; fatal error handling pending.
    SysErrDetect,
    SysErrProcess,
    ShutdownProcess,
    ShutdownDone,
    FatalError,
    /// Link permanently inaccessible until a full reset.
    NoAccess,
    LinkDown,
}

bitflags::bitflags! {
    /// Set of [`PmState`]s.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PmStates: u32 {
        const DISABLED = 1 << 0;
        const POR = 1 << 1;
        const M0 = 1 << 2;
        const M1_ENTER = 1 << 3;
        const M1 = 1 << 4;
        const M2_ENTER = 1 << 5;
        const M2 = 1 << 6;
        const M3_ENTER = 1 << 7;
        const M3 = 1 << 8;
        const M3_FAST_EXIT = 1 << 9;
        const SYS_ERR_DETECT = 1 << 10;
        const SYS_ERR_PROCESS = 1 << 11;
        const SHUTDOWN_PROCESS = 1 << 12;
        const SHUTDOWN_DONE = 1 << 13;
        const FATAL_ERROR = 1 << 14;
        const NO_ACCESS = 1 << 15;
        const LINK_DOWN = 1 << 16;

        const ERRORS = Self::SYS_ERR_DETECT.bits()
            | Self::SYS_ERR_PROCESS.bits()
            | Self::SHUTDOWN_PROCESS.bits()
            | Self::SHUTDOWN_DONE.bits()
            | Self::FATAL_ERROR.bits()
            | Self::NO_ACCESS.bits()
            | Self::LINK_DOWN.bits();

        /// Error escapes reachable from every operational state.
        const ESCAPES = Self::SYS_ERR_DETECT.bits()
            | Self::SHUTDOWN_PROCESS.bits()
            | Self::FATAL_ERROR.bits()
            | Self::NO_ACCESS.bits()
            | Self::LINK_DOWN.bits();
    }
}

impl PmState {
    pub const fn bit(self) -> PmStates {
        match self {
            Self::Disabled => PmStates::DISABLED,
            Self::PowerOnReset => PmStates::POR,
            Self::M0 => PmStates::M0,
            Self::M1Enter => PmStates::M1_ENTER,
            Self::M1 => PmStates::M1,
            Self::M2Enter => PmStates::M2_ENTER,
            Self::M2 => PmStates::M2,
            Self::M3Enter => PmStates::M3_ENTER,
            Self::M3 => PmStates::M3,
            Self::M3FastExit => PmStates::M3_FAST_EXIT,
            Self::SysErrDetect => PmStates::SYS_ERR_DETECT,
            Self::SysErrProcess => PmStates::SYS_ERR_PROCESS,
            Self::ShutdownProcess => PmStates::SHUTDOWN_PROCESS,
            Self::ShutdownDone => PmStates::SHUTDOWN_DONE,
            Self::FatalError => PmStates::FATAL_ERROR,
            Self::NoAccess => PmStates::NO_ACCESS,
            Self::LinkDown => PmStates::LINK_DOWN,
        }
    }

    /// States reachable from `self` in one step.
    pub const fn allowed_next(self) -> PmStates {
        use PmStates as S;
        match self {
            Self::Disabled => S::POR,
            Self::PowerOnReset => S::POR.union(S::DISABLED).union(S::M0).union(S::ESCAPES),
            Self::M0 => S::M0
                .union(S::M1_ENTER)
                .union(S::M2_ENTER)
                .union(S::M3_ENTER)
                .union(S::ESCAPES),
            Self::M1Enter => S::M1.union(S::M0).union(S::ESCAPES),
            Self::M1 => S::M2_ENTER.union(S::M0).union(S::ESCAPES),
            Self::M2Enter => S::M2.union(S::M0).union(S::ESCAPES),
            Self::M2 => S::M0.union(S::ESCAPES),
            Self::M3Enter => S::M3.union(S::M3_FAST_EXIT).union(S::ESCAPES),
            Self::M3 => S::M3_FAST_EXIT
                .union(S::SYS_ERR_DETECT)
                .union(S::FATAL_ERROR)
                .union(S::NO_ACCESS)
                .union(S::LINK_DOWN),
            Self::M3FastExit => S::M0.union(S::ESCAPES),
            Self::SysErrDetect => S::SYS_ERR_PROCESS
                .union(S::SHUTDOWN_PROCESS)
                .union(S::FATAL_ERROR)
                .union(S::NO_ACCESS)
                .union(S::LINK_DOWN),
            Self::SysErrProcess => S::POR
                .union(S::SHUTDOWN_PROCESS)
                .union(S::FATAL_ERROR)
                .union(S::NO_ACCESS)
                .union(S::LINK_DOWN),
            Self::ShutdownProcess => S::SHUTDOWN_DONE
                .union(S::FATAL_ERROR)
                .union(S::NO_ACCESS)
                .union(S::LINK_DOWN),
            Self::ShutdownDone => S::DISABLED,
            Self::FatalError => S::FATAL_ERROR.union(S::NO_ACCESS),
            Self::NoAccess => S::DISABLED,
            Self::LinkDown => S::NO_ACCESS.union(S::DISABLED),
        }
    }

    pub const fn can_transition_to(self, next: PmState) -> bool {
        self.allowed_next().contains(next.bit())
    }

    pub const fn in_error(self) -> bool {
        PmStates::ERRORS.contains(self.bit())
    }

    pub const fn in_suspend(self) -> bool {
        matches!(self, Self::M3Enter | Self::M3)
    }

    pub const fn db_access_valid(self) -> bool {
        matches!(self, Self::M0 | Self::M2)
    }

    pub const fn reg_access_valid(self) -> bool {
        !matches!(
            self,
            Self::Disabled
                | Self::M3
                | Self::ShutdownDone
                | Self::FatalError
                | Self::NoAccess
                | Self::LinkDown
        )
    }

    pub const fn event_access_invalid(self) -> bool {
        matches!(self, Self::Disabled) || self.in_error()
    }
}

impl fmt::Display for PmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disabled => "DISABLE",
            Self::PowerOnReset => "POR",
            Self::M0 => "M0",
            Self::M1Enter => "M?->M1",
            Self::M1 => "M1",
            Self::M2Enter => "M1->M2",
            Self::M2 => "M2",
            Self::M3Enter => "M?->M3",
            Self::M3 => "M3",
            Self::M3FastExit => "M3->M0",
            Self::SysErrDetect => "SYS_ERR Detect",
            Self::SysErrProcess => "SYS_ERR Process",
            Self::ShutdownProcess => "SHUTDOWN Process",
            Self::ShutdownDone => "SHUTDOWN Done",
            Self::FatalError => "LD or Error Fatal Detect",
            Self::NoAccess => "SHUTDOWN No Access",
            Self::LinkDown => "Link Down",
        };
        f.write_str(s)
    }
}
