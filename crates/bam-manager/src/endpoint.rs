//! Client-side connection end points.

use alloc::sync::Arc;
use core::num::NonZeroU32;

use bitflags::bitflags;
use embassy_sync::blocking_mutex::raw::RawMutex;
use portable_atomic::{AtomicU32, Ordering};

use crate::device::Device;
use crate::handle::DeviceHandle;
use crate::props::MemBuffer;

/// Value of [`ConnectConfig::lock_group`] meaning "no pipe lock group".
pub const LOCK_GROUP_UNSET: u32 = 0xcccc_cccc;

/// Highest pipe lock group a connection may request.
pub const MAX_LOCK_GROUP: u32 = 31;

/// Identity of an endpoint, used by pipe-ownership tables and connection maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointId(NonZeroU32);

impl EndpointId {
    pub const fn new(raw: NonZeroU32) -> Self {
        Self(raw)
    }

    pub const fn get(&self) -> u32 {
        self.0.get()
    }
}

/// Direction of an endpoint within its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PipeMode {
    /// The endpoint's device is the data producer.
    #[default]
    Source,
    /// The endpoint's device is the data consumer.
    Destination,
}

/// Connection state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PipeState {
    #[default]
    Disconnected,
    /// Resources are reserved but the pipe is not configured yet.
    Allocated,
    Connected,
}

bitflags! {
    /// Per-connection option bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConnectOptions: u32 {
        /// Notify on each completed descriptor.
        const DESC_DONE = 1 << 0;
        /// Notify when a descriptor with EOT completes.
        const EOT = 1 << 1;
        /// Notify when the descriptor FIFO runs dry.
        const OUT_OF_DESC = 1 << 2;
        /// Notify on pipe errors.
        const ERROR = 1 << 3;
        /// Notify when the pipe goes inactive.
        const INACTIVE = 1 << 4;
        /// Wake the system on pipe events.
        const WAKEUP = 1 << 5;
        /// Enable the pipe as part of connecting it.
        const AUTO_ENABLE = 1 << 6;
        /// Completions are polled, no interrupts.
        const POLL = 1 << 7;
        /// Do not queue completion events.
        const NO_Q = 1 << 8;
        /// Start with the pipe halted.
        const FLOWOFF = 1 << 9;
        /// Producer writes descriptors without NWD.
        const WRITE_NWD = 1 << 10;
        /// Do not synchronize with the peer endpoint on disconnect.
        const NO_EP_SYNC = 1 << 11;
        /// Acknowledge each transfer to the peer.
        const ACK_TRANSFERS = 1 << 12;
        /// Leave the pipe enabled on disconnect.
        const NO_DISABLE = 1 << 13;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ConnectOptions {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "ConnectOptions({=u32:#x})", self.bits())
    }
}

/// Connection descriptor supplied to
/// [`Driver::connect`](crate::Driver::connect).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectConfig {
    pub mode: PipeMode,
    pub source: DeviceHandle,
    pub src_pipe_index: u32,
    pub destination: DeviceHandle,
    pub dest_pipe_index: u32,
    pub options: ConnectOptions,
    /// Pipe lock group, or [`LOCK_GROUP_UNSET`].
    pub lock_group: u32,
    /// Descriptor FIFO memory.
    pub desc: MemBuffer,
    /// Data FIFO memory (bam-to-bam only).
    pub data: MemBuffer,
    pub event_thresh: u32,
}

impl ConnectConfig {
    /// The descriptor of an endpoint that was never connected.
    pub const fn unconfigured() -> Self {
        Self {
            mode: PipeMode::Source,
            source: DeviceHandle::INVALID,
            src_pipe_index: 0,
            destination: DeviceHandle::INVALID,
            dest_pipe_index: 0,
            options: ConnectOptions::empty(),
            lock_group: LOCK_GROUP_UNSET,
            desc: MemBuffer { phys_base: 0, base: 0, size: 0 },
            data: MemBuffer { phys_base: 0, base: 0, size: 0 },
            event_thresh: 0,
        }
    }

    /// The device this endpoint attaches to, chosen by mode.
    pub fn target(&self) -> DeviceHandle {
        match self.mode {
            PipeMode::Source => self.source,
            PipeMode::Destination => self.destination,
        }
    }

    pub(crate) fn lock_group_valid(&self) -> bool {
        self.lock_group == LOCK_GROUP_UNSET
            || self.lock_group <= MAX_LOCK_GROUP
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self::unconfigured()
    }
}

/// One end of a configured connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PipeAddr {
    pub bam_phys: u64,
    pub pipe_index: u32,
}

/// Record of a configured connection, owned by the resource manager.
///
/// Each role (source, destination) is held by at most one endpoint. The core
/// cross-checks an endpoint against this record before tearing it down.
#[derive(Debug)]
pub struct ConnectionMap {
    pub src: PipeAddr,
    pub dest: PipeAddr,
    client_src: AtomicU32,
    client_dest: AtomicU32,
}

impl ConnectionMap {
    pub const fn new(src: PipeAddr, dest: PipeAddr) -> Self {
        Self {
            src,
            dest,
            client_src: AtomicU32::new(0),
            client_dest: AtomicU32::new(0),
        }
    }

    fn slot(&self, mode: PipeMode) -> &AtomicU32 {
        match mode {
            PipeMode::Source => &self.client_src,
            PipeMode::Destination => &self.client_dest,
        }
    }

    /// Record `id` as the endpoint holding `mode`.
    pub fn bind(&self, mode: PipeMode, id: EndpointId) {
        self.slot(mode).store(id.get(), Ordering::Release);
    }

    /// Clear `mode` if it is held by `id`. Returns whether it was.
    pub fn unbind(&self, mode: PipeMode, id: EndpointId) -> bool {
        self.slot(mode)
            .compare_exchange(id.get(), 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The endpoint currently holding `mode`.
    pub fn client(&self, mode: PipeMode) -> Option<EndpointId> {
        NonZeroU32::new(self.slot(mode).load(Ordering::Acquire))
            .map(EndpointId::new)
    }

    /// The pipe address for `mode`.
    pub fn end(&self, mode: PipeMode) -> PipeAddr {
        match mode {
            PipeMode::Source => self.src,
            PipeMode::Destination => self.dest,
        }
    }
}

/// The part of an endpoint the resource manager reads and fills in.
#[derive(Debug)]
pub struct Connection {
    id: EndpointId,
    pub config: ConnectConfig,
    /// Pipe index assigned by the resource manager at allocation.
    pub pipe_index: u32,
    /// Map record assigned by the resource manager at allocation.
    pub map: Option<Arc<ConnectionMap>>,
}

impl Connection {
    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn mode(&self) -> PipeMode {
        self.config.mode
    }
}

/// A client connection end point.
///
/// Endpoints are created by
/// [`Driver::alloc_endpoint`](crate::Driver::alloc_endpoint)
/// independently of any device, and may be connected and disconnected many
/// times. The device back-reference is present exactly while the endpoint is
/// allocated or connected.
pub struct Endpoint<M: RawMutex> {
    conn: Connection,
    state: PipeState,
    device: Option<Arc<Device<M>>>,
}

impl<M: RawMutex> Endpoint<M> {
    pub(crate) fn new(id: EndpointId, config: ConnectConfig) -> Self {
        Self {
            conn: Connection { id, config, pipe_index: 0, map: None },
            state: PipeState::Disconnected,
            device: None,
        }
    }

    pub fn id(&self) -> EndpointId {
        self.conn.id
    }

    pub fn state(&self) -> PipeState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == PipeState::Connected
    }

    pub fn pipe_index(&self) -> u32 {
        self.conn.pipe_index
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.conn.config
    }

    /// Handle of the device this endpoint is attached to.
    pub fn device_handle(&self) -> Option<DeviceHandle> {
        self.device.as_ref().map(|d| d.handle())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Mutable access to the connection record.
    ///
    /// Changing the pipe index of an attached endpoint does not move its
    /// ownership; pipe access through a mismatched index is rejected.
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub(crate) fn device(&self) -> Option<&Arc<Device<M>>> {
        self.device.as_ref()
    }

    pub(crate) fn attach(&mut self, device: Arc<Device<M>>, state: PipeState) {
        debug_assert!(state != PipeState::Disconnected);
        self.device = Some(device);
        self.state = state;
    }

    pub(crate) fn set_state(&mut self, state: PipeState) {
        debug_assert!(self.device.is_some());
        self.state = state;
    }

    pub(crate) fn detach(&mut self) {
        self.device = None;
        self.conn.map = None;
        self.state = PipeState::Disconnected;
    }
}

impl<M: RawMutex> core::fmt::Debug for Endpoint<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.conn.id)
            .field("state", &self.state)
            .field("pipe_index", &self.conn.pipe_index)
            .field("device", &self.device_handle())
            .finish()
    }
}
