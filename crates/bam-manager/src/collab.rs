//! Interfaces of the collaborators the driver delegates to.
//!
//! The driver owns ordering, locking and ownership checks. Everything that
//! touches hardware registers, picks physical pipes or maps memory lives
//! behind these traits and is supplied by the integrator as one
//! [`Platform`] value.

use core::fmt;

use bitflags::bitflags;

use crate::dump::DumpAction;
use crate::endpoint::{ConnectConfig, ConnectOptions, Connection, PipeState};
use crate::error::BamError;
use crate::iovec::{Iovec, IovecFlags};
use crate::props::{BamBase, BamProperties};

bitflags! {
    /// Events a client may subscribe to on a pipe.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventOptions: u32 {
        const DESC_DONE = 1 << 0;
        const EOT = 1 << 1;
        const OUT_OF_DESC = 1 << 2;
        const ERROR = 1 << 3;
        const INACTIVE = 1 << 4;
        const WAKEUP = 1 << 5;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for EventOptions {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "EventOptions({=u32:#x})", self.bits())
    }
}

/// Event subscription for a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RegisterEvent {
    pub options: EventOptions,
    /// Opaque value handed back with every notification.
    pub user: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventKind {
    DescDone,
    Eot,
    OutOfDesc,
    Error,
    Inactive,
    Wakeup,
}

/// A completion or status event read from a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EventNotify {
    pub kind: EventKind,
    pub iovec: Iovec,
    pub user: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerOp {
    Config { timeout_ms: u32, periodic: bool },
    Start,
    Stop,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimerResult {
    pub current_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlowOffMode {
    #[default]
    Graceful,
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Owner {
    Local,
    Remote,
}

/// Connection details handed to the processor that takes over a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SatelliteInfo {
    pub bam_phys: u64,
    pub pipe_index: u32,
}

/// Identifier of a diagnostic log channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LogChannelId(pub u32);

/// Low-level per-pipe and per-device hardware operations.
///
/// Pipe methods are called with the owning device's fast lock held and must
/// neither block nor allocate.
pub trait PipeEngine {
    /// Bring up a device. Returns the number of pipes the hardware exposes.
    fn device_init(
        &self,
        base: &BamBase,
        props: &BamProperties,
    ) -> Result<u32, BamError>;
    fn device_deinit(&self, base: &BamBase);
    fn reset_device(&self, base: &BamBase) -> Result<(), BamError>;
    /// Service pending interrupt work without an interrupt.
    fn check_irq(&self, base: &BamBase) -> Result<(), BamError>;
    /// Bring up the BAM-DMA engine attached to this device.
    fn dma_attach(&self, base: &BamBase) -> Result<(), BamError>;
    fn dma_detach(&self, base: &BamBase);
    /// Free the descriptor cache retained for a pipe, if any.
    fn release_desc_cache(&self, base: &BamBase, pipe: u32);

    fn transfer(
        &self,
        base: &BamBase,
        pipe: u32,
        batch: &[Iovec],
    ) -> Result<(), BamError>;
    fn transfer_one(
        &self,
        base: &BamBase,
        pipe: u32,
        addr: u64,
        size: u32,
        user: usize,
        flags: IovecFlags,
    ) -> Result<(), BamError>;
    fn get_event(
        &self,
        base: &BamBase,
        pipe: u32,
    ) -> Result<Option<EventNotify>, BamError>;
    fn get_iovec(
        &self,
        base: &BamBase,
        pipe: u32,
    ) -> Result<Option<Iovec>, BamError>;
    fn reg_event(
        &self,
        base: &BamBase,
        pipe: u32,
        reg: &RegisterEvent,
    ) -> Result<(), BamError>;
    fn halt(&self, base: &BamBase, pipe: u32, halt: bool);
    fn reset(&self, base: &BamBase, pipe: u32) -> Result<(), BamError>;
    fn disable(&self, base: &BamBase, pipe: u32) -> Result<(), BamError>;
    fn set_params(
        &self,
        base: &BamBase,
        pipe: u32,
        options: ConnectOptions,
    ) -> Result<(), BamError>;
    fn set_satellite(&self, base: &BamBase, pipe: u32) -> Result<(), BamError>;
    fn timer_ctrl(
        &self,
        base: &BamBase,
        pipe: u32,
        op: &TimerOp,
    ) -> Result<TimerResult, BamError>;
    fn pending_desc(&self, base: &BamBase, pipe: u32) -> Result<bool, BamError>;
    fn is_empty(&self, base: &BamBase, pipe: u32) -> Result<bool, BamError>;
    fn free_count(&self, base: &BamBase, pipe: u32) -> Result<u32, BamError>;
    fn unused_desc_count(
        &self,
        base: &BamBase,
        pipe: u32,
    ) -> Result<u32, BamError>;
    /// Queue a zero-length transfer with EOT on a producer pipe.
    fn inject_zlt(&self, base: &BamBase, pipe: u32) -> Result<(), BamError>;

    /// Perform one register or FIFO dump.
    fn dump(&self, base: &BamBase, action: &DumpAction);
}

/// Physical pipe allocation and configuration for logical connections.
pub trait ResourceManager {
    fn init(&self, options: u32) -> Result<(), BamError>;

    /// Drive a connection to `target`.
    ///
    /// Moving to [`PipeState::Allocated`] assigns `conn.pipe_index` and
    /// `conn.map`, and binds the connection's role in the map to
    /// `conn.id()`. Moving to [`PipeState::Disconnected`] unbinds it. On
    /// failure the connection must be left as it was found.
    fn state_change(
        &self,
        base: &BamBase,
        conn: &mut Connection,
        target: PipeState,
    ) -> Result<(), BamError>;

    /// Reset a descriptor to its unconnected default.
    fn config_init(&self, config: &mut ConnectConfig) {
        *config = ConnectConfig::unconfigured();
    }
}

/// Physical memory mapping and pipe-memory allocation.
pub trait MemoryAllocator {
    fn map_physical(&self, phys: u64, size: u32) -> Result<usize, BamError>;
    fn unmap(&self, virt: usize, size: u32);
    /// Reserve `size` bytes of pipe memory. Returns the physical base.
    fn alloc_region(&self, size: u32) -> Result<u64, BamError>;
    fn free_region(&self, phys: u64, size: u32);
    /// Virtual address of a pipe-memory physical address.
    fn region_ptr(&self, phys: u64) -> usize;
}

/// Append-only diagnostic log channels.
///
/// Writes are best effort and may happen with a fast lock held.
pub trait LogSink {
    fn create(&self, name: &str) -> Option<LogChannelId>;
    fn destroy(&self, id: LogChannelId);
    fn write(&self, id: LogChannelId, args: fmt::Arguments<'_>);
}

/// Everything the driver needs from its environment.
pub trait Platform:
    PipeEngine + ResourceManager + MemoryAllocator + LogSink
{
}

impl<T> Platform for T where
    T: PipeEngine + ResourceManager + MemoryAllocator + LogSink
{
}
