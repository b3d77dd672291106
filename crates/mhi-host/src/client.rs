//! Types and traits at the boundary with protocol clients and the bus
//! integration.

use crate::dma::DmaDirection;

/// Notifications delivered through [`ControllerClient::status`] and, for
/// channel-scoped ones, [`TransferCallback::on_status`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusEvent {
    /// The device entered sleep 2 with nothing outstanding.
    Idle,
    /// A client-managed event ring has events to poll.
    PendingData,
    LpmEnter,
    LpmExit,
    /// The device entered the crash-dump environment.
    EeRddm,
    EeMissionMode,
    /// The device reported a system error.
    SysError,
    /// The link is unusable until it is powered down and up again.
    FatalError,
    /// A logical device became available in the current environment.
    DeviceCreated(String),
}

/// Buffer exchanged with the transport.
#[derive(Debug, PartialEq, Eq)]
pub enum TransferBuffer {
    /// Host bytes. For receive channels the length of the vector is the
    /// receive capacity.
    Bytes(Vec<u8>),
    /// Memory the client already mapped for DMA.
    Mapped(DmaHandle),
}

impl TransferBuffer {
    pub fn len(&self) -> usize {
        match self {
            Self::Bytes(b) => b.len(),
            Self::Mapped(h) => h.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Self::Bytes(b) => Some(b),
            Self::Mapped(_) => None,
        }
    }
}

/// Client-owned DMA mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaHandle {
    pub paddr: u64,
    pub len: usize,
    /// Opaque client value handed back on completion.
    pub token: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    /// The device had more data than the buffer could hold.
    Overflow,
    /// The channel was reset with the buffer still queued.
    NotConnected,
}

/// Outcome of one queued buffer, handed back to the client.
#[derive(Debug)]
pub struct TransferResult {
    pub buf: TransferBuffer,
    pub bytes_transferred: usize,
    pub status: TransferStatus,
    pub dir: DmaDirection,
}

/// Per-channel completion sink.
///
/// Called from the event processing context after the transport dropped its
/// link and channel locks. Implementations must not call
/// [`crate::Controller::poll`] for the ring that is delivering.
pub trait TransferCallback: Send + Sync {
    fn on_complete(&self, chan: u32, result: TransferResult);

    fn on_status(&self, _chan: u32, _event: StatusEvent) {}
}

/// Link parameters requested by the device for bandwidth scaling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkInfo {
    pub target_link_speed: u8,
    pub target_link_width: u8,
    pub sequence: u8,
}

/// Services the transport needs from the integration.
pub trait ControllerClient: Send + Sync {
    fn status(&self, _event: StatusEvent) {}

    /// Asks for the link to be resumed. Must not block: the transport may be
    /// holding the link lock, and the resume itself is expected to call
    /// [`crate::Controller::resume`] from another context.
    fn request_resume(&self) {}

    /// Renegotiates link speed/width. Returns true on success.
    fn negotiate_bandwidth(&self, _link: LinkInfo) -> bool {
        false
    }

    /// Host clock used for time synchronisation.
    fn host_time(&self) -> u64;

    fn lpm_disable(&self) {}

    fn lpm_enable(&self) {}
}
