//! Device properties and the flag sets that describe them.

use bitflags::bitflags;

/// Upper bound on the number of pipes a single BAM may expose.
pub const BAM_MAX_PIPES: usize = 31;

/// Number of diagnostic log channels created per device (and per driver).
pub const IPC_LOG_CHANNELS: usize = 5;

/// Highest per-device log level. Levels above this disable channel logging.
pub const IPC_MAX_LOGLEVEL: u32 = 3;

/// Log level used when the properties do not request one.
pub const IPC_DEFAULT_LOGLEVEL: u32 = 3;

/// Channel index that receives register and FIFO dumps.
pub const IPC_DUMP_CHANNEL: usize = 4;

bitflags! {
    /// Which parts of the BAM are managed by the local processor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ManageFlags: u32 {
        /// BAM global configuration is done by a remote processor.
        const DEVICE_REMOTE = 1 << 0;
        /// BAM is shared between several execution environments.
        const MULTI_EE = 1 << 1;
        /// Pipes are not allocated by the local processor.
        const PIPE_NO_ALLOC = 1 << 2;
        /// Pipes are not configured by the local processor.
        const PIPE_NO_CONFIG = 1 << 3;
        /// Pipes are not controlled by the local processor.
        const PIPE_NO_CTRL = 1 << 4;
        /// No local register access at all.
        const NONE = Self::DEVICE_REMOTE.bits()
            | Self::PIPE_NO_ALLOC.bits()
            | Self::PIPE_NO_CONFIG.bits()
            | Self::PIPE_NO_CTRL.bits();
    }
}

impl ManageFlags {
    /// Bits that decide whether the local processor touches registers.
    pub const ACCESS_MASK: Self = Self::NONE;

    /// `true` when some register access is performed locally.
    pub fn has_local_access(&self) -> bool {
        self.intersection(Self::ACCESS_MASK) != Self::NONE
    }
}

bitflags! {
    /// Device option bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BamOptions: u32 {
        /// Enable the BAM as soon as it is initialized.
        const ENABLE_AT_BOOT = 1 << 0;
        /// Do not use the BAM interrupt; callers poll instead.
        const IRQ_DISABLED = 1 << 1;
        /// The BAM is attached to a BAM-DMA engine.
        const BAMDMA = 1 << 2;
        /// The BAM interrupt may wake the system.
        const IRQ_WAKEUP = 1 << 3;
        /// Keep descriptor-cache memory until the device is deregistered.
        const HOLD_MEM = 1 << 4;
        /// Skip hardware reset during device init.
        const NO_RESET = 1 << 5;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ManageFlags {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "ManageFlags({=u32:#x})", self.bits())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for BamOptions {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "BamOptions({=u32:#x})", self.bits())
    }
}

/// Properties supplied by the client when registering a BAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BamProperties {
    /// Physical base address. The unique key of a registered device.
    pub phys_addr: u64,
    /// Virtual base address, if the client already mapped the registers.
    pub virt_addr: Option<usize>,
    /// Size of the register window to map.
    pub virt_size: u32,
    pub irq: u32,
    /// Number of pipes. Zero lets the pipe engine report the hardware count.
    pub num_pipes: u32,
    /// Execution environment index used for the selected register dump.
    pub ee: u32,
    pub manage: ManageFlags,
    pub options: BamOptions,
    pub summing_threshold: u32,
    pub event_threshold: u32,
    /// Bitmask of pipes reserved for other execution environments.
    pub restricted_pipes: u32,
    /// Initial per-device log level. Zero selects the default.
    pub ipc_loglevel: u32,
}

/// Register window of a registered device, as seen by the pipe engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BamBase {
    pub phys_addr: u64,
    pub virt_addr: usize,
    pub virt_size: u32,
    pub num_pipes: u32,
    pub ee: u32,
}

/// A region of pipe memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MemBuffer {
    pub phys_base: u64,
    /// Virtual address of the region, zero when not mapped.
    pub base: usize,
    pub size: u32,
}

impl MemBuffer {
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }
}
