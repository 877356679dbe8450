use core::cell::RefCell;
use core::fmt;

use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, RawMutex};
use embassy_sync::blocking_mutex::Mutex;
use portable_atomic::{AtomicBool, AtomicU32, Ordering};

use crate::collab::{LogChannelId, LogSink};
use crate::endpoint::EndpointId;
use crate::error::BamError;
use crate::handle::DeviceHandle;
use crate::props::{
    BamBase, BamOptions, BamProperties, BAM_MAX_PIPES, IPC_LOG_CHANNELS,
};

/// Pipe index to owning endpoint. Only mutated under the fast lock.
pub(crate) struct PipeTable {
    owners: [Option<EndpointId>; BAM_MAX_PIPES],
    capacity: u32,
}

impl PipeTable {
    fn new(capacity: u32) -> Self {
        Self { owners: [None; BAM_MAX_PIPES], capacity }
    }

    pub(crate) fn is_owner(&self, pipe: u32, id: EndpointId) -> bool {
        pipe < self.capacity && self.owners[pipe as usize] == Some(id)
    }

    /// Record `id` as the owner of `pipe`.
    pub(crate) fn claim(
        &mut self,
        pipe: u32,
        id: EndpointId,
    ) -> Result<(), BamError> {
        if pipe >= self.capacity {
            return Err(BamError::InvalidArgument);
        }
        match &mut self.owners[pipe as usize] {
            Some(other) if *other != id => Err(BamError::OwnershipViolation),
            slot => {
                *slot = Some(id);
                Ok(())
            }
        }
    }

    /// Clear `pipe` if it is owned by `id`.
    pub(crate) fn release(&mut self, pipe: u32, id: EndpointId) -> bool {
        if self.is_owner(pipe, id) {
            self.owners[pipe as usize] = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn owned(&self) -> usize {
        self.owners.iter().filter(|o| o.is_some()).count()
    }

    fn clear(&mut self) {
        self.owners = [None; BAM_MAX_PIPES];
    }
}

/// Device-level configuration guarded by the device sleep lock.
pub(crate) struct DeviceConfig {
    pub(crate) options: BamOptions,
}

/// A registered BAM.
///
/// Lock order is registry lock, then [`Device::with_config`], then
/// [`Device::with_pipes`]. The pipe table lock is a critical section and
/// must stay a leaf.
pub(crate) struct Device<M: RawMutex> {
    handle: DeviceHandle,
    base: BamBase,
    props: BamProperties,
    /// Virtual mapping created at registration, to be undone at teardown.
    mapped: Option<usize>,
    config: Mutex<M, RefCell<DeviceConfig>>,
    pipes: Mutex<CriticalSectionRawMutex, RefCell<PipeTable>>,
    channels: [Option<LogChannelId>; IPC_LOG_CHANNELS],
    log_level: AtomicU32,
    retired: AtomicBool,
}

impl<M: RawMutex> Device<M> {
    pub(crate) fn new(
        handle: DeviceHandle,
        base: BamBase,
        props: BamProperties,
        mapped: Option<usize>,
        channels: [Option<LogChannelId>; IPC_LOG_CHANNELS],
        log_level: u32,
    ) -> Self {
        Self {
            handle,
            base,
            props,
            mapped,
            config: Mutex::new(RefCell::new(DeviceConfig {
                options: props.options,
            })),
            pipes: Mutex::new(RefCell::new(PipeTable::new(base.num_pipes))),
            channels,
            log_level: AtomicU32::new(log_level),
            retired: AtomicBool::new(false),
        }
    }

    pub(crate) fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub(crate) fn base(&self) -> &BamBase {
        &self.base
    }

    pub(crate) fn props(&self) -> &BamProperties {
        &self.props
    }

    pub(crate) fn phys_addr(&self) -> u64 {
        self.base.phys_addr
    }

    pub(crate) fn mapped(&self) -> Option<usize> {
        self.mapped
    }

    pub(crate) fn channels(&self) -> &[Option<LogChannelId>; IPC_LOG_CHANNELS] {
        &self.channels
    }

    /// Run `f` under the device sleep lock.
    pub(crate) fn with_config<R>(
        &self,
        f: impl FnOnce(&mut DeviceConfig) -> R,
    ) -> R {
        self.config.lock(|c| f(&mut c.borrow_mut()))
    }

    /// Run `f` under the device fast lock.
    pub(crate) fn with_pipes<R>(
        &self,
        f: impl FnOnce(&mut PipeTable) -> R,
    ) -> R {
        self.pipes.lock(|t| f(&mut t.borrow_mut()))
    }

    pub(crate) fn log_level(&self) -> u32 {
        self.log_level.load(Ordering::Relaxed)
    }

    pub(crate) fn set_log_level(&self, level: u32) {
        self.log_level.store(level, Ordering::Relaxed);
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Mark the device as removed and drop all pipe ownership.
    ///
    /// Returns how many pipes were still owned.
    pub(crate) fn retire(&self) -> usize {
        self.retired.store(true, Ordering::Release);
        self.with_pipes(|t| {
            let owned = t.owned();
            t.clear();
            owned
        })
    }

    /// Write to the device channel for `level` if the device log level
    /// lets it through.
    pub(crate) fn log(
        &self,
        sink: &impl LogSink,
        level: usize,
        args: fmt::Arguments<'_>,
    ) {
        if (level as u32) < self.log_level() {
            return;
        }
        if let Some(Some(id)) = self.channels.get(level) {
            sink.write(*id, args);
        }
    }
}
